//! NF-016: Sealing secret values for the state file, masking for logs.
//!
//! Sealed form: `secret:v1:<base64(age ciphertext)>`. With
//! `NEONFORM_PASSPHRASE` set, values are sealed to an age scrypt
//! (passphrase) recipient; otherwise to the X25519 identity kept in the
//! stack's key file.

use super::types::Fields;
use age::secrecy::{ExposeSecret, SecretString};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SEALED_PREFIX: &str = "secret:v1:";

/// Rendered in place of secret values in logs and CLI output.
pub const MASK: &str = "[secret]";

pub const PASSPHRASE_ENV: &str = "NEONFORM_PASSPHRASE";

enum KeyKind {
    Passphrase(SecretString),
    Identity(age::x25519::Identity),
}

/// Key for sealing state secrets.
#[derive(Clone)]
pub struct SecretKey {
    kind: Arc<KeyKind>,
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey([secret])")
    }
}

impl SecretKey {
    fn new(kind: KeyKind) -> Self {
        Self { kind: Arc::new(kind) }
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(KeyKind::Passphrase(SecretString::from(passphrase.to_string())))
    }

    /// A fresh random X25519 identity.
    pub fn generate() -> Self {
        Self::new(KeyKind::Identity(age::x25519::Identity::generate()))
    }

    /// Key from the environment or an existing key file. Never creates one.
    pub fn load(state_dir: &Path, stack: &str) -> Result<Option<Self>, String> {
        if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
            if !passphrase.is_empty() {
                return Ok(Some(Self::from_passphrase(&passphrase)));
            }
        }
        let path = key_file_path(state_dir, stack);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let identity = text
            .trim()
            .parse::<age::x25519::Identity>()
            .map_err(|e| format!("invalid key file {}: {}", path.display(), e))?;
        Ok(Some(Self::new(KeyKind::Identity(identity))))
    }

    /// Like [`SecretKey::load`], but writes `<state_dir>/<stack>/secrets.key`
    /// with a new identity when there is none.
    pub fn load_or_create(state_dir: &Path, stack: &str) -> Result<Self, String> {
        if let Some(key) = Self::load(state_dir, stack)? {
            return Ok(key);
        }
        let path = key_file_path(state_dir, stack);
        let identity = age::x25519::Identity::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
        }
        std::fs::write(&path, format!("{}\n", identity.to_string().expose_secret()))
            .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| format!("cannot restrict {}: {}", path.display(), e))?;
        }
        Ok(Self::new(KeyKind::Identity(identity)))
    }

    /// Seal a value into its opaque string form.
    pub fn seal(&self, value: &Value) -> Result<String, String> {
        let plaintext = value.to_string();
        let ciphertext = match self.kind.as_ref() {
            KeyKind::Passphrase(passphrase) => {
                let recipient = age::scrypt::Recipient::new(reveal(passphrase));
                age::encrypt(&recipient, plaintext.as_bytes())
            }
            KeyKind::Identity(identity) => age::encrypt(&identity.to_public(), plaintext.as_bytes()),
        }
        .map_err(|e| format!("cannot seal value: {}", e))?;
        Ok(format!("{}{}", SEALED_PREFIX, STANDARD.encode(ciphertext)))
    }

    /// Recover a sealed value. Fails on tampering or a wrong key.
    pub fn unseal(&self, sealed: &str) -> Result<Value, String> {
        let encoded = sealed
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| "value is not sealed".to_string())?;
        let ciphertext = STANDARD
            .decode(encoded)
            .map_err(|e| format!("corrupt sealed value: {}", e))?;
        let plaintext = match self.kind.as_ref() {
            KeyKind::Passphrase(passphrase) => {
                let identity = age::scrypt::Identity::new(reveal(passphrase));
                age::decrypt(&identity, &ciphertext)
            }
            KeyKind::Identity(identity) => age::decrypt(identity, &ciphertext),
        }
        .map_err(|e| format!("cannot unseal value (wrong key?): {}", e))?;
        serde_json::from_slice(&plaintext).map_err(|e| format!("corrupt sealed value: {}", e))
    }
}

fn reveal(passphrase: &SecretString) -> SecretString {
    SecretString::from(passphrase.expose_secret().to_string())
}

pub fn key_file_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join("secrets.key")
}

pub fn is_sealed(value: &Value) -> bool {
    value.as_str().is_some_and(|s| s.starts_with(SEALED_PREFIX))
}

/// Copy of `fields` with every secret value replaced by [`MASK`].
pub fn masked(fields: &Fields, secret: &BTreeSet<String>) -> Fields {
    fields
        .iter()
        .map(|(k, v)| {
            if secret.contains(k) {
                (k.clone(), Value::String(MASK.to_string()))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

/// One-line `k=v` rendering of masked fields for log lines.
pub fn render_masked(fields: &Fields, secret: &BTreeSet<String>) -> String {
    masked(fields, secret)
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
