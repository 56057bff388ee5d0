//! NodeChannel: the node-to-node specialization.
//!
//! Addresses the counterpart as `{account:"Node", signer:<address>}` and
//! admits inbound envelopes whose `sender.signer`/`receiver.signer` match the
//! expected peer and local signer respectively.

use super::base::{ChannelAddressing, ChannelHandle, ChannelTuning};
use super::{ChannelKey, Initiation, Politeness};
use crate::account::{Address, NODE_ACCOUNT_MARKER};
use crate::envelope::{Envelope, Party};
use crate::error::ChannelError;
use crate::logging::LogContext;
use crate::signalling::SignallingTransport;
use std::sync::Arc;

#[derive(Debug)]
struct NodeAddressing {
    local_signer: Address,
    remote_signer: Address,
}

impl ChannelAddressing for NodeAddressing {
    fn local_party(&self) -> Party {
        Party { account: NODE_ACCOUNT_MARKER.to_string(), signer: self.local_signer.to_string() }
    }

    fn remote_party(&self) -> Party {
        Party { account: NODE_ACCOUNT_MARKER.to_string(), signer: self.remote_signer.to_string() }
    }

    fn admit(&self, envelope: &Envelope, local_signer: &Address) -> Result<(), ChannelError> {
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
        Ok(())
    }

    fn log_context(&self) -> LogContext {
        LogContext::new().with("type", "node").with("origin", &self.local_signer).with("destination", &self.remote_signer)
    }
}

/// A channel to another mesh node, keyed by the remote signer address alone.
#[derive(Debug)]
pub struct NodeChannel {
    handle: Arc<ChannelHandle>,
    remote_signer: Address,
}

impl NodeChannel {
    /// Construct a node channel. Negotiation is not started — call
    /// `start_peer_connection` then `open_async`/`accept_async`.
    #[must_use]
    pub fn new(
        local_signer: Address,
        remote_signer: Address,
        signalling: Arc<dyn SignallingTransport>,
        politeness: Politeness,
        initiation: Initiation,
        tuning: ChannelTuning,
    ) -> Self {
        let addressing =
            Arc::new(NodeAddressing { local_signer: local_signer.clone(), remote_signer: remote_signer.clone() });
        let handle = ChannelHandle::new(addressing, signalling, local_signer, politeness, initiation, tuning);
        Self { handle, remote_signer }
    }

    /// The registry key this channel is stored under.
    #[must_use]
    pub fn key(&self) -> ChannelKey {
        ChannelKey::Node(self.remote_signer.clone())
    }

    /// The remote node's signer address.
    #[must_use]
    pub fn remote_signer(&self) -> &Address {
        &self.remote_signer
    }

    /// The underlying state machine, for callers that need full access
    /// (subscribing to events, calling negotiation operations).
    #[must_use]
    pub fn handle(&self) -> &Arc<ChannelHandle> {
        &self.handle
    }
}

impl std::ops::Deref for NodeChannel {
    type Target = ChannelHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::envelope::Message;
    use crate::signalling::LoopbackSignalling;

    fn addr(ch: char) -> Address {
        Address::parse(&ch.to_string().repeat(40)).unwrap()
    }

    fn sample_envelope(sender: &Address, receiver: &Address, payload: Message) -> Envelope {
        Envelope {
            timestamp: 0,
            max_age: 60,
            priority: 0,
            sequence: 0,
            sender: Party { account: "node".to_string(), signer: sender.to_string() },
            receiver: Party { account: "node".to_string(), signer: receiver.to_string() },
            payload,
            signature: "sig".to_string(),
        }
    }

    #[test]
    fn test_local_party_uses_node_marker() {
        let (a, _b) = LoopbackSignalling::pair();
        let channel = NodeChannel::new(addr('a'), addr('b'), a, Politeness::Polite, Initiation::InitiatedByPeer, ChannelTuning::default());
        assert_eq!(channel.key(), ChannelKey::Node(addr('b')));
    }

    #[test]
    fn test_admission_rejects_sender_mismatch() {
        let addressing = NodeAddressing { local_signer: addr('a'), remote_signer: addr('b') };
        let envelope = sample_envelope(&addr('c'), &addr('a'), Message::Rejection {});
        assert!(addressing.admit(&envelope, &addr('a')).is_err());
    }

    #[test]
    fn test_admission_rejects_receiver_mismatch() {
        let addressing = NodeAddressing { local_signer: addr('a'), remote_signer: addr('b') };
        let envelope = sample_envelope(&addr('b'), &addr('z'), Message::Rejection {});
        assert!(addressing.admit(&envelope, &addr('a')).is_err());
    }

    #[test]
    fn test_admission_accepts_matching_envelope() {
        let addressing = NodeAddressing { local_signer: addr('a'), remote_signer: addr('b') };
        let envelope = sample_envelope(&addr('b'), &addr('a'), Message::Rejection {});
        assert!(addressing.admit(&envelope, &addr('a')).is_ok());
    }

    #[tokio::test]
    async fn test_fresh_channel_starts_initiating() {
        let (a, _b) = LoopbackSignalling::pair();
        let channel = NodeChannel::new(addr('a'), addr('b'), a, Politeness::Impolite, Initiation::InitiatedByUs, ChannelTuning::default());
        assert_eq!(channel.state(), ChannelState::Initiating);
    }
}
