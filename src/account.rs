//! Address and account identity types.
//!
//! Ed25519 identity handling addressed by a 40-hex-digit `Address`, with
//! `Account` distinguishing a locally-held signing identity from a remote
//! peer known only by address.

use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// A 40-hex-digit peer/account identifier.
///
/// The all-zero address (`"0".repeat(40)`) is the well-known empty sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Address(String);

impl Address {
    /// The empty-address sentinel: forty ASCII zeros.
    #[must_use]
    pub fn empty() -> Self {
        Self("0".repeat(40))
    }

    /// Wrap a 40-hex-digit string as an address.
    ///
    /// Does not validate hex-digit-ness or length; callers that parse
    /// untrusted wire data should validate first via [`Address::parse`].
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Parse a 40-hex-digit address, rejecting malformed input.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim_start_matches("0x");
        if trimmed.len() != 40 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("not a 40-hex-digit address: {raw}"));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// `true` if this is the all-zero sentinel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }

    /// Derive the address for an Ed25519 verifying key: the last 40 hex
    /// digits of `SHA256(verifying_key)`.
    #[must_use]
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Self(hex[hex.len() - 40..].to_string())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The literal string marking a counterpart as a node rather than a user
/// account, case-insensitively, per the envelope `account` field rule.
pub const NODE_ACCOUNT_MARKER: &str = "node";

/// `true` if `account` is the case-insensitive `"node"` marker.
#[must_use]
pub fn is_node_marker(account: &str) -> bool {
    account.eq_ignore_ascii_case(NODE_ACCOUNT_MARKER)
}

/// An identity the node can address, receive from, or sign as.
#[derive(Debug)]
pub enum Account {
    /// An address this node owns, with its signing material (if unsealed).
    Local {
        /// The owned address.
        address: Address,
        /// Sealed signing key; `None` once `lock()`ed.
        signing_key: Option<SigningKey>,
        /// Mnemonic-derivation index, when this key was derived from a seed
        /// phrase rather than generated directly.
        mnemonic_index: Option<u32>,
    },
    /// An address this node does not own.
    External {
        /// The external address.
        address: Address,
    },
    /// An external address with an on-chain display name.
    Registered {
        /// The registered address.
        address: Address,
        /// Display name associated with the on-chain registration.
        name: String,
    },
}

impl Account {
    /// The address of this account, regardless of variant.
    #[must_use]
    pub fn address(&self) -> &Address {
        match self {
            Self::Local { address, .. } | Self::External { address } | Self::Registered { address, .. } => address,
        }
    }

    /// Zeroize the held signing key, if any. Idempotent.
    pub fn lock(&mut self) {
        if let Self::Local { signing_key, .. } = self {
            if let Some(key) = signing_key.take() {
                let mut bytes = key.to_bytes();
                bytes.zeroize();
            }
        }
    }

    /// Sign `data`, failing if this is not an unlocked `Local` account.
    ///
    /// # Errors
    /// Returns an error if the account has no signing key available (not a
    /// `Local` account, or already `lock()`ed).
    pub fn sign(&self, data: &[u8]) -> Result<Signature, crate::error::ChannelError> {
        match self {
            Self::Local { signing_key: Some(key), .. } => Ok(key.sign(data)),
            Self::Local { signing_key: None, .. } => Err(crate::error::ChannelError::InternalPrecondition(
                "signing key is locked".to_string(),
            )),
            Self::External { .. } | Self::Registered { .. } => Err(
                crate::error::ChannelError::InternalPrecondition("account has no signing key".to_string()),
            ),
        }
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for Account {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_address_is_forty_zeros() {
        assert_eq!(Address::empty().to_string(), "0".repeat(40));
        assert!(Address::empty().is_empty());
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(Address::parse("abc").is_err());
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        let bad = format!("{}zz", "1".repeat(38));
        assert!(Address::parse(&bad).is_err());
    }

    #[test]
    fn test_parse_accepts_0x_prefix() {
        let addr = Address::parse(&format!("0x{}", "a".repeat(40))).unwrap();
        assert_eq!(addr.to_string(), "a".repeat(40));
    }

    #[test]
    fn test_node_marker_is_case_insensitive() {
        assert!(is_node_marker("Node"));
        assert!(is_node_marker("NODE"));
        assert!(!is_node_marker("account"));
    }

    #[test]
    fn test_accounts_compare_by_address() {
        let addr = Address::parse(&"a".repeat(40)).unwrap();
        let a = Account::External { address: addr.clone() };
        let b = Account::Registered { address: addr, name: "x".to_string() };
        assert_eq!(a, b);
    }

    #[test]
    fn test_local_account_signs_and_locks() {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        let address = Address::from_verifying_key(&signing_key.verifying_key());
        let mut account = Account::Local { address, signing_key: Some(signing_key), mnemonic_index: None };

        assert!(account.sign(b"hello").is_ok());
        account.lock();
        assert!(account.sign(b"hello").is_err());
    }
}
