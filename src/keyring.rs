//! Signing-key persistence for the node's local account identity.
//!
//! Production stores the raw Ed25519 seed in a single OS keyring entry;
//! test/system-test mode stores it in a file under the config directory
//! instead.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::SigningKey;
use keyring::Entry;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const KEYRING_SERVICE: &str = "meshctl";
const KEYRING_ENTRY: &str = "signing-key";

fn should_skip_keyring() -> bool {
    #[cfg(test)]
    {
        true
    }
    #[cfg(not(test))]
    {
        crate::env::should_skip_keyring()
    }
}

fn file_path(config_dir: &Path) -> std::path::PathBuf {
    config_dir.join("signing_key")
}

/// Load the persisted signing key, if any.
pub fn load(config_dir: &Path) -> Result<Option<SigningKey>> {
    let encoded = if should_skip_keyring() {
        let path = file_path(config_dir);
        if !path.exists() {
            return Ok(None);
        }
        Some(fs::read_to_string(&path).context("failed to read signing key file")?)
    } else {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_ENTRY)
            .map_err(|e| anyhow::anyhow!("failed to open keyring entry: {e:?}"))?;
        entry.get_password().ok()
    };

    let Some(encoded) = encoded else {
        return Ok(None);
    };
    let bytes = BASE64
        .decode(encoded.trim())
        .context("invalid signing key encoding")?;
    let key_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("signing key has wrong length"))?;
    Ok(Some(SigningKey::from_bytes(&key_bytes)))
}

/// Persist `key` for future loads.
pub fn store(config_dir: &Path, key: &SigningKey) -> Result<()> {
    let encoded = BASE64.encode(key.to_bytes());

    if should_skip_keyring() {
        fs::create_dir_all(config_dir).context("failed to create config directory")?;
        let path = file_path(config_dir);
        fs::write(&path, &encoded).context("failed to write signing key file")?;
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .context("failed to set signing key file permissions")?;
        log::info!("stored signing key in file (test mode, keyring skipped)");
        return Ok(());
    }

    let entry = Entry::new(KEYRING_SERVICE, KEYRING_ENTRY)
        .map_err(|e| anyhow::anyhow!("failed to open keyring entry: {e:?}"))?;
    entry
        .set_password(&encoded)
        .map_err(|e| anyhow::anyhow!("failed to store signing key in keyring: {e:?}"))?;
    log::info!("stored signing key in OS keyring");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_store_and_load_roundtrip_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let key = SigningKey::from_bytes(&seed);

        store(dir.path(), &key).unwrap();
        let loaded = load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.to_bytes(), key.to_bytes());
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }
}
