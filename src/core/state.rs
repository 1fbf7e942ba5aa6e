//! NF-013: State file management (atomic load/save, secret sealing).
//!
//! Secret fields are sealed on the way to disk and unsealed on the way back,
//! so the in-memory lock always holds clear values and the file never does.

use super::secrets::{self, SecretKey};
use super::types::{Fields, StateLock};
use std::path::{Path, PathBuf};

/// Derive the lock file path for a stack within the state directory.
pub fn lock_file_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join("state.lock.yaml")
}

/// Load a lock file for a stack. Returns None if the file doesn't exist.
/// Values come back exactly as stored (sealed secrets stay sealed).
pub fn load_lock(state_dir: &Path, stack: &str) -> Result<Option<StateLock>, String> {
    let path = lock_file_path(state_dir, stack);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let lock: StateLock = serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid lock file {}: {}", path.display(), e))?;
    Ok(Some(lock))
}

/// Save a lock file atomically (write to temp, then rename).
pub fn save_lock(state_dir: &Path, lock: &StateLock) -> Result<(), String> {
    let path = lock_file_path(state_dir, &lock.stack);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }

    let yaml = serde_yaml_ng::to_string(lock).map_err(|e| format!("serialize error: {}", e))?;

    // Atomic write: temp file + rename
    let tmp_path = path.with_extension("lock.yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| {
        format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;

    Ok(())
}

/// Create a new empty StateLock for a stack.
pub fn new_lock(stack: &str) -> StateLock {
    use crate::tripwire::eventlog::now_iso8601;
    StateLock {
        schema: "1.0".to_string(),
        stack: stack.to_string(),
        generated_at: now_iso8601(),
        generator: format!("neonform {}", env!("CARGO_PKG_VERSION")),
        resources: indexmap::IndexMap::new(),
    }
}

fn map_secret_fields(
    fields: &mut Fields,
    names: &std::collections::BTreeSet<String>,
    mut f: impl FnMut(&serde_json::Value) -> Result<serde_json::Value, String>,
) -> Result<(), String> {
    for name in names {
        if let Some(value) = fields.get_mut(name) {
            if !value.is_null() {
                *value = f(value)?;
            }
        }
    }
    Ok(())
}

/// Copy of `lock` with every secret field sealed.
pub fn seal_lock(lock: &StateLock, key: &SecretKey) -> Result<StateLock, String> {
    let mut sealed = lock.clone();
    for (name, record) in sealed.resources.iter_mut() {
        let names = record.secret_fields.clone();
        for fields in [&mut record.inputs, &mut record.outputs] {
            map_secret_fields(fields, &names, |v| {
                if secrets::is_sealed(v) {
                    return Ok(v.clone());
                }
                key.seal(v)
                    .map(serde_json::Value::String)
                    .map_err(|e| format!("resource '{}': {}", name, e))
            })?;
        }
    }
    Ok(sealed)
}

/// True if any field in `lock` is still sealed.
pub fn has_sealed(lock: &StateLock) -> bool {
    lock.resources.values().any(|r| {
        r.inputs
            .values()
            .chain(r.outputs.values())
            .any(secrets::is_sealed)
    })
}

/// Copy of `lock` with every sealed field restored to its clear value.
pub fn unseal_lock(lock: &StateLock, key: &SecretKey) -> Result<StateLock, String> {
    let mut clear = lock.clone();
    for (name, record) in clear.resources.iter_mut() {
        let names = record.secret_fields.clone();
        for fields in [&mut record.inputs, &mut record.outputs] {
            map_secret_fields(fields, &names, |v| match v.as_str() {
                Some(s) if secrets::is_sealed(v) => key
                    .unseal(s)
                    .map_err(|e| format!("resource '{}': {}", name, e)),
                _ => Ok(v.clone()),
            })?;
        }
    }
    Ok(clear)
}

/// Load and unseal a stack's state.
pub fn load_state(state_dir: &Path, stack: &str, key: &SecretKey) -> Result<Option<StateLock>, String> {
    match load_lock(state_dir, stack)? {
        Some(lock) => unseal_lock(&lock, key).map(Some),
        None => Ok(None),
    }
}

/// Seal and save a stack's state.
pub fn save_state(state_dir: &Path, lock: &StateLock, key: &SecretKey) -> Result<(), String> {
    save_lock(state_dir, &seal_lock(lock, key)?)
}
