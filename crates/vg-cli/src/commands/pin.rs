//! App lock PIN commands

use anyhow::{bail, Context, Result};

use vg_core::config;
use vg_core::{LockScope, Surface, UnlockOutcome};

use crate::context::AppContext;
use crate::output::{print_info, print_success, print_warning};
use crate::prompt;

/// Set or replace the PIN
pub fn pin_set(ctx: &AppContext) -> Result<()> {
    let lock = ctx.lock_manager()?;
    if lock.is_pin_set() {
        let current = prompt::read_secret("Current PIN: ")?;
        if !lock.verify_pin(&current)? {
            bail!("Incorrect PIN");
        }
    }

    let pin = prompt::read_secret("New PIN (4 digits): ")?;
    let confirm = prompt::read_secret("Repeat PIN: ")?;
    if pin != confirm {
        bail!("The PINs do not match");
    }
    lock.set_pin(&pin)?;
    print_success("PIN set");
    if lock.scope() == LockScope::None {
        print_info("No surface is locked yet; choose one with 'vigil pin scope <1|2|3>'");
    }
    Ok(())
}

/// Remove the PIN after confirming it
pub fn pin_remove(ctx: &AppContext) -> Result<()> {
    let lock = ctx.lock_manager()?;
    if !lock.is_pin_set() {
        print_warning("No PIN is set");
        return Ok(());
    }
    let current = prompt::read_secret("Current PIN: ")?;
    if !lock.verify_pin(&current)? {
        bail!("Incorrect PIN");
    }
    lock.remove_pin()?;
    print_success("PIN removed");
    Ok(())
}

/// Check a PIN the way the window unlock does, prompting until it matches
/// or the attempts run out
pub fn pin_verify(ctx: &AppContext) -> Result<()> {
    let lock = ctx.lock_manager()?;
    loop {
        let pin = prompt::read_secret("PIN: ")?;
        match lock.try_unlock(Surface::Window, &pin)? {
            UnlockOutcome::Unlocked => {
                print_success("PIN is correct");
                return Ok(());
            }
            UnlockOutcome::NoPinSet => {
                print_warning("No PIN is set");
                return Ok(());
            }
            UnlockOutcome::WrongPin { attempts_remaining } => {
                print_warning(&format!(
                    "Incorrect PIN, {} attempts remaining",
                    attempts_remaining
                ));
            }
            UnlockOutcome::LockedOut { remaining } => {
                bail!("Too many attempts, try again in {}s", remaining.as_secs())
            }
        }
    }
}

/// Show whether a PIN is set and what it protects
pub fn pin_status(ctx: &AppContext) -> Result<()> {
    let lock = ctx.lock_manager()?;
    println!("PIN set:      {}", if lock.is_pin_set() { "yes" } else { "no" });
    println!("Scope:        {}", describe_scope(lock.scope()));
    println!("Idle timeout: {}s", lock.idle_timeout().as_secs());
    Ok(())
}

/// Choose which surfaces require the PIN and save it to the config file
pub fn pin_scope(ctx: &AppContext, value: u8) -> Result<()> {
    let scope = LockScope::try_from(value).map_err(anyhow::Error::msg)?;
    let mut updated = ctx.config.clone();
    updated.lock.scope = scope;
    config::save_config(&ctx.config_path, &updated)
        .with_context(|| format!("Failed to write {:?}", ctx.config_path))?;
    print_success(&format!("Lock scope set to {}", describe_scope(scope)));
    Ok(())
}

fn describe_scope(scope: LockScope) -> &'static str {
    match scope {
        LockScope::None => "none",
        LockScope::Window => "window",
        LockScope::MenuBar => "menu bar",
        LockScope::Both => "window and menu bar",
    }
}
