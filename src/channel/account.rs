//! AccountChannel: the node-to-user-account specialization.
//!
//! Addresses the counterpart as `{account:<registered addr>, signer:<device
//! addr>}` and admits inbound envelopes against the expected account/signer
//! pair plus expiry. Signature verification against on-chain key material is
//! an out-of-core predicate (`AdmissionPredicate`), stubbed here.

use super::base::{ChannelAddressing, ChannelHandle, ChannelTuning};
use super::{ChannelKey, Initiation, Politeness};
use crate::account::Address;
use crate::envelope::{Envelope, Party};
use crate::error::ChannelError;
use crate::logging::LogContext;
use crate::signalling::SignallingTransport;
use std::sync::Arc;

/// Out-of-core verification of an envelope's signature against on-chain
/// account key material. The blockchain client itself is a Non-goal; this
/// trait is the extension point a real client would implement.
pub trait AdmissionPredicate: Send + Sync + std::fmt::Debug {
    /// `true` if `envelope.signature` is valid for `envelope.sender`.
    fn verify_signature(&self, envelope: &Envelope) -> bool;
}

/// Accepts every envelope. Placeholder until on-chain verification lands.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubAdmissionPredicate;

impl AdmissionPredicate for StubAdmissionPredicate {
    fn verify_signature(&self, _envelope: &Envelope) -> bool {
        true
    }
}

#[derive(Debug)]
struct AccountAddressing {
    local_signer: Address,
    account: Address,
    remote_signer: Address,
    predicate: Arc<dyn AdmissionPredicate>,
}

impl ChannelAddressing for AccountAddressing {
    fn local_party(&self) -> Party {
        Party { account: self.account.to_string(), signer: self.local_signer.to_string() }
    }

    fn remote_party(&self) -> Party {
        Party { account: self.account.to_string(), signer: self.remote_signer.to_string() }
    }

    fn admit(&self, envelope: &Envelope, local_signer: &Address) -> Result<(), ChannelError> {
        if envelope.sender.account != self.account.to_string() {
            return Err(ChannelError::AdmissionRejected(format!(
                "expected sender.account {}, got {}",
                self.account, envelope.sender.account
            )));
        }
        if envelope.sender.signer != self.remote_signer.to_string() {
            return Err(ChannelError::AdmissionRejected(format!(
                "expected sender.signer {}, got {}",
                self.remote_signer, envelope.sender.signer
            )));
        }
        if envelope.receiver.signer != local_signer.to_string() {
            return Err(ChannelError::AdmissionRejected(format!(
                "receiver.signer {} does not match local signer {local_signer}",
                envelope.receiver.signer
            )));
        }
        if envelope.is_expired(unix_now()) {
            return Err(ChannelError::AdmissionRejected("envelope expired".to_string()));
        }
        if !self.predicate.verify_signature(envelope) {
            return Err(ChannelError::AdmissionRejected("signature verification failed".to_string()));
        }
        Ok(())
    }

    fn log_context(&self) -> LogContext {
        LogContext::new()
            .with("type", "account")
            .with("origin", &self.local_signer)
            .with("destination", &self.remote_signer)
            .with("destination_account", &self.account)
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A channel to one device (signer) of a registered on-chain account.
#[derive(Debug)]
pub struct AccountChannel {
    handle: Arc<ChannelHandle>,
    account: Address,
    remote_signer: Address,
}

impl AccountChannel {
    /// Construct an account channel. Negotiation is not started — call
    /// `start_peer_connection` then `open_async`/`accept_async`.
    #[must_use]
    pub fn new(
        local_signer: Address,
        account: Address,
        remote_signer: Address,
        signalling: Arc<dyn SignallingTransport>,
        politeness: Politeness,
        initiation: Initiation,
        tuning: ChannelTuning,
    ) -> Self {
        Self::with_predicate(
            local_signer,
            account,
            remote_signer,
            signalling,
            politeness,
            initiation,
            tuning,
            Arc::new(StubAdmissionPredicate),
        )
    }

    /// Construct an account channel with an explicit signature-verification
    /// predicate, for callers that have a real on-chain client.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn with_predicate(
        local_signer: Address,
        account: Address,
        remote_signer: Address,
        signalling: Arc<dyn SignallingTransport>,
        politeness: Politeness,
        initiation: Initiation,
        tuning: ChannelTuning,
        predicate: Arc<dyn AdmissionPredicate>,
    ) -> Self {
        let addressing = Arc::new(AccountAddressing {
            local_signer: local_signer.clone(),
            account: account.clone(),
            remote_signer: remote_signer.clone(),
            predicate,
        });
        let handle = ChannelHandle::new(addressing, signalling, local_signer, politeness, initiation, tuning);
        Self { handle, account, remote_signer }
    }

    /// The registry key this channel is stored under.
    #[must_use]
    pub fn key(&self) -> ChannelKey {
        ChannelKey::Account(self.account.clone(), self.remote_signer.clone())
    }

    /// The on-chain account address this channel reaches.
    #[must_use]
    pub fn account(&self) -> &Address {
        &self.account
    }

    /// The specific device (signer) of the account this channel reaches.
    #[must_use]
    pub fn remote_signer(&self) -> &Address {
        &self.remote_signer
    }

    /// The underlying state machine.
    #[must_use]
    pub fn handle(&self) -> &Arc<ChannelHandle> {
        &self.handle
    }
}

impl std::ops::Deref for AccountChannel {
    type Target = ChannelHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Message;
    use crate::signalling::LoopbackSignalling;

    fn addr(ch: char) -> Address {
        Address::parse(&ch.to_string().repeat(40)).unwrap()
    }

    fn sample_envelope(sender_account: &Address, sender_signer: &Address, receiver_signer: &Address, timestamp: i64) -> Envelope {
        Envelope {
            timestamp,
            max_age: 60,
            priority: 0,
            sequence: 0,
            sender: Party { account: sender_account.to_string(), signer: sender_signer.to_string() },
            receiver: Party { account: sender_account.to_string(), signer: receiver_signer.to_string() },
            payload: Message::Rejection {},
            signature: "sig".to_string(),
        }
    }

    #[test]
    fn test_admission_rejects_account_mismatch() {
        let addressing = AccountAddressing {
            local_signer: addr('a'),
            account: addr('x'),
            remote_signer: addr('b'),
            predicate: Arc::new(StubAdmissionPredicate),
        };
        let envelope = sample_envelope(&addr('y'), &addr('b'), &addr('a'), unix_now());
        assert!(addressing.admit(&envelope, &addr('a')).is_err());
    }

    #[test]
    fn test_admission_rejects_expired_envelope() {
        let addressing = AccountAddressing {
            local_signer: addr('a'),
            account: addr('x'),
            remote_signer: addr('b'),
            predicate: Arc::new(StubAdmissionPredicate),
        };
        let envelope = sample_envelope(&addr('x'), &addr('b'), &addr('a'), 0);
        assert!(addressing.admit(&envelope, &addr('a')).is_err());
    }

    #[test]
    fn test_admission_accepts_fresh_matching_envelope() {
        let addressing = AccountAddressing {
            local_signer: addr('a'),
            account: addr('x'),
            remote_signer: addr('b'),
            predicate: Arc::new(StubAdmissionPredicate),
        };
        let envelope = sample_envelope(&addr('x'), &addr('b'), &addr('a'), unix_now());
        assert!(addressing.admit(&envelope, &addr('a')).is_ok());
    }

    #[test]
    fn test_key_is_account_and_signer_pair() {
        let (a, _b) = LoopbackSignalling::pair();
        let channel = AccountChannel::new(
            addr('a'),
            addr('x'),
            addr('b'),
            a,
            Politeness::Polite,
            Initiation::InitiatedByPeer,
            ChannelTuning::default(),
        );
        assert_eq!(channel.key(), ChannelKey::Account(addr('x'), addr('b')));
    }
}
