//! AccountManager holds the node's single signing identity.
//!
//! Expressed as an explicit, constructible context object rather than a
//! global.

use crate::account::{Account, Address};
use crate::error::ChannelError;
use ed25519_dalek::{Signature, SigningKey};
use std::path::Path;

/// Holds the node's local signing account.
#[derive(Debug)]
pub struct AccountManager {
    local: Account,
}

impl AccountManager {
    /// Wrap an already-constructed local account.
    #[must_use]
    pub fn new(local: Account) -> Self {
        Self { local }
    }

    /// Load the signing key from `config_dir` (keyring in production, file
    /// in test mode), generating and persisting one on first run.
    pub fn load_or_create(config_dir: &Path) -> anyhow::Result<Self> {
        let signing_key = match crate::keyring::load(config_dir)? {
            Some(key) => key,
            None => {
                use rand::RngCore;
                let mut seed = [0u8; 32];
                rand::rng().fill_bytes(&mut seed);
                let key = SigningKey::from_bytes(&seed);
                crate::keyring::store(config_dir, &key)?;
                key
            }
        };
        let address = Address::from_verifying_key(&signing_key.verifying_key());
        log::info!("local signing identity: {address}");
        Ok(Self::new(Account::Local {
            address,
            signing_key: Some(signing_key),
            mnemonic_index: None,
        }))
    }

    /// The local node's address.
    #[must_use]
    pub fn address(&self) -> &Address {
        self.local.address()
    }

    /// `true` if `addr` is the local node's own signing address.
    #[must_use]
    pub fn is_signer(&self, addr: &Address) -> bool {
        self.local.address() == addr
    }

    /// Sign `data` with the local account.
    pub fn sign(&self, data: &[u8]) -> Result<Signature, ChannelError> {
        self.local.sign(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_create_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let first = AccountManager::load_or_create(dir.path()).unwrap();
        let second = AccountManager::load_or_create(dir.path()).unwrap();
        assert_eq!(first.address(), second.address());
    }

    #[test]
    fn test_is_signer_matches_own_address() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = AccountManager::load_or_create(dir.path()).unwrap();
        assert!(mgr.is_signer(mgr.address()));

        let other = crate::account::Address::parse(&"f".repeat(40)).unwrap();
        assert!(!mgr.is_signer(&other));
    }
}
