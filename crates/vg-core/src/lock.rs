//! App lock
//!
//! A short numeric PIN protects up to two UI surfaces. The PIN is stored as a
//! single record in the credential store: a random salt followed by
//! `SHA-256(salt || pin)`.
//!
//! # Lockout
//!
//! Every wrong PIN increments a failure counter. When the counter reaches
//! `max_attempts` a cooldown window starts; while it is active every unlock
//! attempt is rejected before the PIN is even hashed. The counter resets when
//! the window expires. Expiry is evaluated under the same mutex that guards
//! `set_pin` and `remove_pin`, so the reset cannot race a PIN change.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LockConfig;
use crate::credentials::CredentialStore;
use crate::error::LockError;

/// Length of the random salt in a PIN record
const SALT_LEN: usize = 16;

/// Length of a PIN record (salt + SHA-256 digest)
const RECORD_LEN: usize = SALT_LEN + 32;

/// Number of digits in a PIN
const PIN_DIGITS: usize = 4;

/// A UI surface that can be locked independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    /// The main dashboard window
    Window,
    /// The menu bar popover
    MenuBar,
}

impl Surface {
    fn index(self) -> usize {
        match self {
            Surface::Window => 0,
            Surface::MenuBar => 1,
        }
    }
}

/// Which surfaces require the PIN.
///
/// Stored as a number: 0 = none, 1 = window, 2 = menu bar, 3 = both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LockScope {
    #[default]
    None,
    Window,
    MenuBar,
    Both,
}

impl LockScope {
    /// Whether the scope includes `surface`
    pub fn covers(self, surface: Surface) -> bool {
        matches!(
            (self, surface),
            (LockScope::Both, _)
                | (LockScope::Window, Surface::Window)
                | (LockScope::MenuBar, Surface::MenuBar)
        )
    }
}

impl TryFrom<u8> for LockScope {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LockScope::None),
            1 => Ok(LockScope::Window),
            2 => Ok(LockScope::MenuBar),
            3 => Ok(LockScope::Both),
            other => Err(format!("invalid lock scope {}", other)),
        }
    }
}

impl From<LockScope> for u8 {
    fn from(scope: LockScope) -> Self {
        match scope {
            LockScope::None => 0,
            LockScope::Window => 1,
            LockScope::MenuBar => 2,
            LockScope::Both => 3,
        }
    }
}

/// Result of an unlock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// PIN matched; the surface is unlocked
    Unlocked,
    /// PIN did not match
    WrongPin { attempts_remaining: u32 },
    /// Too many failures; try again after `remaining`
    LockedOut { remaining: Duration },
    /// No PIN has been set
    NoPinSet,
}

#[derive(Debug)]
struct LockState {
    scope: LockScope,
    pin_set: bool,
    locked: [bool; 2],
    failed_attempts: u32,
    cooldown_until: Option<Instant>,
}

impl LockState {
    /// Clear an expired cooldown together with the failure counter
    fn expire_cooldown(&mut self, now: Instant) {
        if let Some(until) = self.cooldown_until {
            if now >= until {
                self.cooldown_until = None;
                self.failed_attempts = 0;
            }
        }
    }

    fn lock_scoped(&mut self) {
        for surface in [Surface::Window, Surface::MenuBar] {
            if self.scope.covers(surface) && self.pin_set {
                self.locked[surface.index()] = true;
            }
        }
    }
}

/// Tracks the PIN, lock state per surface and failed attempts
pub struct LockManager {
    store: CredentialStore,
    config: LockConfig,
    state: Mutex<LockState>,
}

impl LockManager {
    /// Create a lock manager. Surfaces covered by the configured scope start
    /// locked when a PIN is already stored.
    pub fn new(store: CredentialStore, config: LockConfig) -> Result<Self, LockError> {
        let pin_set = store.pin_record()?.is_some();
        let mut state = LockState {
            scope: config.scope,
            pin_set,
            locked: [false; 2],
            failed_attempts: 0,
            cooldown_until: None,
        };
        state.lock_scoped();

        Ok(Self {
            store,
            config,
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        // A panic while holding the guard leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a PIN record exists
    pub fn is_pin_set(&self) -> bool {
        self.state().pin_set
    }

    /// Current scope
    pub fn scope(&self) -> LockScope {
        self.state().scope
    }

    /// Change the scope. Newly covered surfaces lock, uncovered ones unlock.
    pub fn set_scope(&self, scope: LockScope) {
        let mut state = self.state();
        state.scope = scope;
        for surface in [Surface::Window, Surface::MenuBar] {
            if !scope.covers(surface) {
                state.locked[surface.index()] = false;
            }
        }
        state.lock_scoped();
    }

    /// Inactivity period after which all surfaces lock
    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }

    /// Set or replace the PIN and re-lock every scoped surface
    pub fn set_pin(&self, pin: &str) -> Result<(), LockError> {
        validate_pin(pin)?;

        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill(&mut salt);
        let mut record = Vec::with_capacity(RECORD_LEN);
        record.extend_from_slice(&salt);
        record.extend_from_slice(&hash_pin(&salt, pin));

        let mut state = self.state();
        self.store.save_pin_record(&record)?;
        state.pin_set = true;
        state.failed_attempts = 0;
        state.cooldown_until = None;
        state.lock_scoped();

        tracing::info!("App lock PIN updated");
        Ok(())
    }

    /// Remove the PIN, unlock everything and reset the failure state
    pub fn remove_pin(&self) -> Result<(), LockError> {
        let mut state = self.state();
        self.store.delete_pin_record()?;
        state.pin_set = false;
        state.locked = [false; 2];
        state.failed_attempts = 0;
        state.cooldown_until = None;

        tracing::info!("App lock PIN removed");
        Ok(())
    }

    /// Check a PIN against the stored record.
    ///
    /// Returns `false` when no PIN is set; use [`is_pin_set`](Self::is_pin_set)
    /// to tell the two cases apart.
    pub fn verify_pin(&self, pin: &str) -> Result<bool, LockError> {
        let Some(record) = self.store.pin_record()? else {
            return Ok(false);
        };
        if record.len() != RECORD_LEN {
            return Err(LockError::CorruptRecord);
        }
        let (salt, expected) = record.split_at(SALT_LEN);
        Ok(constant_time_eq(&hash_pin(salt, pin), expected))
    }

    /// Attempt to unlock one surface
    pub fn try_unlock(&self, surface: Surface, pin: &str) -> Result<UnlockOutcome, LockError> {
        let now = Instant::now();
        let mut state = self.state();

        state.expire_cooldown(now);
        if let Some(until) = state.cooldown_until {
            return Ok(UnlockOutcome::LockedOut {
                remaining: until - now,
            });
        }

        if !state.pin_set {
            return Ok(UnlockOutcome::NoPinSet);
        }

        if self.verify_pin(pin)? {
            state.failed_attempts = 0;
            state.locked[surface.index()] = false;
            tracing::debug!("Unlocked {:?}", surface);
            return Ok(UnlockOutcome::Unlocked);
        }

        state.failed_attempts += 1;
        if state.failed_attempts >= self.config.max_attempts {
            state.cooldown_until = Some(now + self.config.cooldown);
            tracing::warn!(
                "{} failed PIN attempts, locked out for {:?}",
                state.failed_attempts,
                self.config.cooldown
            );
            return Ok(UnlockOutcome::LockedOut {
                remaining: self.config.cooldown,
            });
        }

        Ok(UnlockOutcome::WrongPin {
            attempts_remaining: self.config.max_attempts - state.failed_attempts,
        })
    }

    /// Attempt to unlock one surface; `true` only when the PIN matched
    pub fn unlock(&self, surface: Surface, pin: &str) -> bool {
        match self.try_unlock(surface, pin) {
            Ok(outcome) => outcome == UnlockOutcome::Unlocked,
            Err(e) => {
                tracing::error!("Unlock failed: {}", e);
                false
            }
        }
    }

    /// Lock a surface if the scope covers it
    pub fn lock(&self, surface: Surface) {
        let mut state = self.state();
        if state.scope.covers(surface) && state.pin_set {
            state.locked[surface.index()] = true;
        }
    }

    /// Lock every surface the scope covers (dismissal, idle, system sleep)
    pub fn lock_all_surfaces(&self) {
        self.state().lock_scoped();
    }

    /// Whether a surface currently requires the PIN
    pub fn is_locked(&self, surface: Surface) -> bool {
        self.state().locked[surface.index()]
    }

    /// Consecutive failed attempts since the last success or cooldown expiry
    pub fn failed_attempts(&self) -> u32 {
        let mut state = self.state();
        state.expire_cooldown(Instant::now());
        state.failed_attempts
    }

    /// Time left in the current cooldown, for a live countdown
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state();
        state.expire_cooldown(now);
        state.cooldown_until.map(|until| until - now)
    }
}

/// Lock all surfaces after a period without activity.
///
/// Every value sent on `activity` re-arms the timer. Returns when `cancel`
/// fires or the activity sender is dropped.
pub async fn run_idle_lock(
    manager: Arc<LockManager>,
    mut activity: watch::Receiver<()>,
    cancel: CancellationToken,
) {
    let idle = manager.idle_timeout();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep(idle) => {
                tracing::info!("Idle for {:?}, locking", idle);
                manager.lock_all_surfaces();
                // Stay locked until the user does something.
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = activity.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn validate_pin(pin: &str) -> Result<(), LockError> {
    if pin.len() == PIN_DIGITS && pin.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(LockError::InvalidPin)
    }
}

fn hash_pin(salt: &[u8], pin: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
