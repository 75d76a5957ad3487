//! Client key generation and installation
//!
//! Each server gets its own Ed25519 key. Only the 32-byte seed is stored; the
//! signing key is rebuilt from it whenever a connection needs it.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BufMut;
use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use rand::RngCore;

use vg_core::SessionError;

use crate::transport::RemoteSession;

/// SSH algorithm name of the generated keys
pub const KEY_TYPE: &str = "ssh-ed25519";

/// A freshly generated client key
pub struct ClientKey {
    signing_key: SigningKey,
    authorized_key_line: String,
}

impl ClientKey {
    /// Generate a key from the OS random source
    pub fn generate(comment: &str) -> Self {
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        let authorized_key_line = authorized_key_line(&signing_key.verifying_key(), comment);
        Self {
            signing_key,
            authorized_key_line,
        }
    }

    /// The 32-byte seed, which is what gets persisted
    pub fn seed(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// `ssh-ed25519 <base64> <comment>`
    pub fn authorized_key_line(&self) -> &str {
        &self.authorized_key_line
    }
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKey")
            .field("public", &self.authorized_key_line)
            .finish_non_exhaustive()
    }
}

/// Rebuild a signing key from stored seed bytes
pub fn reconstruct(bytes: &[u8]) -> Result<SigningKey, SessionError> {
    let seed: [u8; SECRET_KEY_LENGTH] = bytes.try_into().map_err(|_| {
        SessionError::InvalidKeyMaterial(format!(
            "expected {} bytes, found {}",
            SECRET_KEY_LENGTH,
            bytes.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// SSH wire encoding of an Ed25519 public key, base64 encoded
pub fn public_key_blob(public: &VerifyingKey) -> String {
    let mut blob = Vec::with_capacity(4 + KEY_TYPE.len() + 4 + 32);
    blob.put_u32(KEY_TYPE.len() as u32);
    blob.put_slice(KEY_TYPE.as_bytes());
    blob.put_u32(32);
    blob.put_slice(public.as_bytes());
    STANDARD.encode(blob)
}

/// One-line OpenSSH `authorized_keys` entry
pub fn authorized_key_line(public: &VerifyingKey, comment: &str) -> String {
    format!("{} {} {}", KEY_TYPE, public_key_blob(public), comment)
}

/// Quote `value` as a single POSIX shell word
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shell command that appends `line` to `~/.ssh/authorized_keys` unless the
/// file already contains it as a literal substring. Directory and file permissions are set to
/// 700 and 600.
pub fn install_command(line: &str) -> String {
    let quoted = shell_quote(line);
    format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && touch ~/.ssh/authorized_keys && \
         chmod 600 ~/.ssh/authorized_keys && \
         {{ grep -qF -- {quoted} ~/.ssh/authorized_keys || printf '%s\\n' {quoted} >> ~/.ssh/authorized_keys; }}"
    )
}

/// Install `line` on the host behind `session`
pub async fn install_public_key(
    session: &dyn RemoteSession,
    line: &str,
) -> Result<(), SessionError> {
    let output = session.exec(&install_command(line)).await?;
    output.into_result()?;
    tracing::debug!("Installed public key");
    Ok(())
}
