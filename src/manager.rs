//! ChannelManager.
//!
//! A process-wide registry of node and account channels, keyed by peer
//! identity. Owns every channel's lifecycle, demultiplexes inbound
//! `Broadcast`/`Relay` payloads, and removes channels from its registries on
//! `Timeout` (with a best-effort dispose) or `Dispose`.
//!
//! Held by the rest of the process as an explicit `Arc<ChannelManager>`
//! rather than a global, per the process-wide-singleton guidance. A channel
//! never holds a strong reference back to its manager — event routing is
//! wired at construction time via a spawned task holding a `Weak`.

use crate::account::{is_node_marker, Address};
use crate::channel::{
    AccountChannel, AdmissionPredicate, ChannelEvent, ChannelKey, ChannelTuning, Initiation, ManagedChannel,
    NodeChannel, Politeness,
};
use crate::envelope::{Envelope, Message};
use crate::error::ChannelError;
use crate::signalling::SignallingTransport;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::Mutex as AsyncMutex;

/// Stock STUN-only ICE configuration used for every channel the manager
/// creates.
fn stock_ice_tuning() -> ChannelTuning {
    ChannelTuning::default()
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

struct Registries {
    node_channels: RwLock<HashMap<Address, Arc<NodeChannel>>>,
    account_channels: RwLock<HashMap<Address, HashMap<Address, Arc<AccountChannel>>>>,
    key_locks: RwLock<HashMap<ChannelKey, Arc<AsyncMutex<()>>>>,
}

/// Concurrent registry and lifecycle owner for every channel this node
/// maintains.
pub struct ChannelManager {
    local_signer: Address,
    registries: Arc<Registries>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("local_signer", &self.local_signer)
            .field("node_channels", &self.get_node_channels().len())
            .field("account_channels", &self.get_account_channels().len())
            .finish()
    }
}

impl ChannelManager {
    /// Construct an empty manager for the given local signer identity.
    #[must_use]
    pub fn new(local_signer: Address) -> Arc<Self> {
        Arc::new(Self {
            local_signer,
            registries: Arc::new(Registries {
                node_channels: RwLock::new(HashMap::new()),
                account_channels: RwLock::new(HashMap::new()),
                key_locks: RwLock::new(HashMap::new()),
            }),
        })
    }

    fn lock_for(&self, key: &ChannelKey) -> Arc<AsyncMutex<()>> {
        if let Some(existing) =
            self.registries.key_locks.read().unwrap_or_else(std::sync::PoisonError::into_inner).get(key)
        {
            return Arc::clone(existing);
        }
        let mut locks = self.registries.key_locks.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
    }

    // -----------------------------------------------------------------
    // Node channels
    // -----------------------------------------------------------------

    /// `true` if a node channel is registered for `signer`.
    #[must_use]
    pub fn is_known_node(&self, signer: &Address) -> bool {
        self.registries.node_channels.read().unwrap_or_else(std::sync::PoisonError::into_inner).contains_key(signer)
    }

    /// The node channel registered for `signer`, if any.
    #[must_use]
    pub fn get_node_channel(&self, signer: &Address) -> Option<Arc<NodeChannel>> {
        self.registries.node_channels.read().unwrap_or_else(std::sync::PoisonError::into_inner).get(signer).cloned()
    }

    /// A snapshot copy of every registered node channel.
    #[must_use]
    pub fn get_node_channels(&self) -> Vec<Arc<NodeChannel>> {
        self.registries.node_channels.read().unwrap_or_else(std::sync::PoisonError::into_inner).values().cloned().collect()
    }

    /// Create, register, and return a node channel for `signer`. Serialized
    /// per key: concurrent callers for the same `signer` observe the first
    /// channel created rather than racing to overwrite each other.
    pub async fn create_node_channel(
        self: &Arc<Self>,
        signer: Address,
        signalling: Arc<dyn SignallingTransport>,
    ) -> Arc<NodeChannel> {
        let key = ChannelKey::Node(signer.clone());
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if let Some(existing) = self.get_node_channel(&signer) {
            return existing;
        }

        let channel = Arc::new(NodeChannel::new(
            self.local_signer.clone(),
            signer.clone(),
            signalling,
            Politeness::Polite,
            Initiation::InitiatedByPeer,
            stock_ice_tuning(),
        ));

        self.spawn_routing(Arc::clone(&channel) as Arc<dyn ManagedChannel>);
        self.registries.node_channels.write().unwrap_or_else(std::sync::PoisonError::into_inner).insert(signer, Arc::clone(&channel));
        channel
    }

    fn remove_node_channel(&self, signer: &Address) {
        self.registries.node_channels.write().unwrap_or_else(std::sync::PoisonError::into_inner).remove(signer);
    }

    // -----------------------------------------------------------------
    // Account channels
    // -----------------------------------------------------------------

    /// `true` if any device of `account` has a registered channel.
    #[must_use]
    pub fn is_known_account(&self, account: &Address) -> bool {
        self.registries
            .account_channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(account)
            .is_some_and(|devices| !devices.is_empty())
    }

    /// `true` if `account`'s specific `signer` device has a registered
    /// channel.
    #[must_use]
    pub fn is_known_account_signer(&self, account: &Address, signer: &Address) -> bool {
        self.registries
            .account_channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(account)
            .is_some_and(|devices| devices.contains_key(signer))
    }

    /// The channel to `account`'s `signer` device, if any.
    #[must_use]
    pub fn get_account_channel(&self, account: &Address, signer: &Address) -> Option<Arc<AccountChannel>> {
        self.registries
            .account_channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(account)
            .and_then(|devices| devices.get(signer))
            .cloned()
    }

    /// A snapshot copy of every registered account channel.
    #[must_use]
    pub fn get_account_channels(&self) -> Vec<Arc<AccountChannel>> {
        self.registries
            .account_channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .flat_map(|devices| devices.values().cloned())
            .collect()
    }

    /// Create, register, and return an account channel for `(account,
    /// signer)`. Serialized per key.
    pub async fn create_account_channel(
        self: &Arc<Self>,
        account: Address,
        signer: Address,
        signalling: Arc<dyn SignallingTransport>,
    ) -> Arc<AccountChannel> {
        let key = ChannelKey::Account(account.clone(), signer.clone());
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if let Some(existing) = self.get_account_channel(&account, &signer) {
            return existing;
        }

        let channel = Arc::new(AccountChannel::new(
            self.local_signer.clone(),
            account.clone(),
            signer.clone(),
            signalling,
            Politeness::Polite,
            Initiation::InitiatedByPeer,
            stock_ice_tuning(),
        ));

        self.spawn_routing(Arc::clone(&channel) as Arc<dyn ManagedChannel>);
        self.registries
            .account_channels
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(account)
            .or_default()
            .insert(signer, Arc::clone(&channel));
        channel
    }

    fn remove_account_channel(&self, account: &Address, signer: &Address) {
        let mut accounts = self.registries.account_channels.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(devices) = accounts.get_mut(account) {
            devices.remove(signer);
            if devices.is_empty() {
                accounts.remove(account);
            }
        }
    }

    // -----------------------------------------------------------------
    // Event routing: Broadcast/Relay dispatch, registry cleanup on
    // Timeout/Dispose.
    // -----------------------------------------------------------------

    fn spawn_routing(self: &Arc<Self>, channel: Arc<dyn ManagedChannel>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let handle = Arc::clone(channel.handle());
        let key = channel.key();
        let mut events = handle.subscribe();

        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else { break };
                match event {
                    ChannelEvent::Message(envelope) => manager.route_message(&key, &envelope).await,
                    ChannelEvent::Timeout => {
                        manager.remove_by_key(&key);
                        let handle = Arc::clone(&handle);
                        tokio::spawn(async move { handle.dispose().await });
                    }
                    ChannelEvent::Dispose => {
                        manager.remove_by_key(&key);
                        break;
                    }
                    ChannelEvent::Open
                    | ChannelEvent::Stable
                    | ChannelEvent::StateChange(_)
                    | ChannelEvent::Latency(_)
                    | ChannelEvent::HighLatency(_) => {}
                }
            }
        });
    }

    fn remove_by_key(&self, key: &ChannelKey) {
        match key {
            ChannelKey::Node(signer) => self.remove_node_channel(signer),
            ChannelKey::Account(account, signer) => self.remove_account_channel(account, signer),
        }
    }

    async fn route_message(&self, origin: &ChannelKey, envelope: &Envelope) {
        match &envelope.payload {
            Message::Relay { receiver, text } => {
                log::info!("relay to {receiver} stubbed: {} bytes", text.len());
            }
            Message::Broadcast { .. } => {
                let origin_account = match origin {
                    ChannelKey::Account(account, _) => Some(account.clone()),
                    ChannelKey::Node(_) => None,
                };
                let serialized = match envelope.serialize() {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("broadcast envelope failed to serialize: {e}");
                        return;
                    }
                };
                for channel in self.get_account_channels() {
                    if Some(channel.account().clone()) == origin_account {
                        continue;
                    }
                    if let Err(e) = channel.send(&serialized).await {
                        log::warn!("broadcast delivery failed for {}: {e}", channel.account());
                    }
                }
            }
            Message::Offer { .. } | Message::Answer { .. } | Message::Rejection {} | Message::Candidate { .. } => {}
        }
    }

    // -----------------------------------------------------------------
    // Admission of inbound offers
    // -----------------------------------------------------------------

    /// Admit an inbound `Offer` envelope received over `signalling`: checks
    /// the envelope is well-formed and unexpired, that `receiver.signer`
    /// matches the local signer, classifies the sender as a node or account
    /// counterpart, validates against `predicate`, then creates the
    /// appropriate channel and calls `acceptAsync(offer)` on it.
    ///
    /// Nothing in this crate currently listens on a socket and calls this —
    /// it is the host integration point a signalling-server listener would
    /// invoke per received frame.
    pub async fn handle_inbound_offer(
        self: &Arc<Self>,
        envelope: &Envelope,
        signalling: Arc<dyn SignallingTransport>,
        predicate: Arc<dyn AdmissionPredicate>,
    ) -> Result<(), ChannelError> {
        let Message::Offer { sdp } = &envelope.payload else {
            return Err(ChannelError::ProtocolViolation("expected an Offer payload".to_string()));
        };

        if envelope.signature.is_empty() {
            return Err(ChannelError::AdmissionRejected("envelope has no signature".to_string()));
        }
        if envelope.is_expired(unix_now()) {
            return Err(ChannelError::AdmissionRejected("envelope expired".to_string()));
        }
        if envelope.receiver.signer != self.local_signer.to_string() {
            return Err(ChannelError::AdmissionRejected(format!(
                "receiver.signer {} does not match local signer {}",
                envelope.receiver.signer, self.local_signer
            )));
        }

        let sender_signer = Address::parse(&envelope.sender.signer)
            .map_err(|e| ChannelError::ProtocolViolation(format!("invalid sender.signer: {e}")))?;

        if !predicate.verify_signature(envelope) {
            return Err(ChannelError::AdmissionRejected("signature verification failed".to_string()));
        }

        if is_node_marker(&envelope.sender.account) {
            let channel = self.create_node_channel(sender_signer, signalling).await;
            channel.start_peer_connection()?;
            channel.handle().accept_async(sdp).await
        } else {
            let account = Address::parse(&envelope.sender.account)
                .map_err(|e| ChannelError::ProtocolViolation(format!("invalid sender.account: {e}")))?;
            let channel = self.create_account_channel(account, sender_signer, signalling).await;
            channel.start_peer_connection()?;
            channel.handle().accept_async(sdp).await
        }
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Dispose every registered channel (best-effort; failures are logged)
    /// and clear both registries.
    pub async fn dispose(&self) {
        let nodes = self.get_node_channels();
        let accounts = self.get_account_channels();

        for channel in nodes {
            channel.handle().dispose().await;
        }
        for channel in accounts {
            channel.handle().dispose().await;
        }

        self.registries.node_channels.write().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
        self.registries.account_channels.write().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StubAdmissionPredicate;
    use crate::envelope::Party;
    use crate::signalling::LoopbackSignalling;

    fn addr(ch: char) -> Address {
        Address::parse(&ch.to_string().repeat(40)).unwrap()
    }

    #[tokio::test]
    async fn test_create_node_channel_registers_it() {
        let manager = ChannelManager::new(addr('a'));
        let (signalling, _peer) = LoopbackSignalling::pair();
        let channel = manager.create_node_channel(addr('b'), signalling).await;
        assert!(manager.is_known_node(&addr('b')));
        assert_eq!(manager.get_node_channel(&addr('b')).unwrap().remote_signer(), channel.remote_signer());
    }

    #[tokio::test]
    async fn test_create_node_channel_is_idempotent_per_key() {
        let manager = ChannelManager::new(addr('a'));
        let (s1, _p1) = LoopbackSignalling::pair();
        let (s2, _p2) = LoopbackSignalling::pair();
        let first = manager.create_node_channel(addr('b'), s1).await;
        let second = manager.create_node_channel(addr('b'), s2).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_snapshot_does_not_affect_manager() {
        let manager = ChannelManager::new(addr('a'));
        let (signalling, _peer) = LoopbackSignalling::pair();
        manager.create_node_channel(addr('b'), signalling).await;

        let mut snapshot = manager.get_node_channels();
        snapshot.clear();

        assert_eq!(manager.get_node_channels().len(), 1);
    }

    #[tokio::test]
    async fn test_create_account_channel_registers_under_account_and_signer() {
        let manager = ChannelManager::new(addr('a'));
        let (signalling, _peer) = LoopbackSignalling::pair();
        manager.create_account_channel(addr('x'), addr('b'), signalling).await;
        assert!(manager.is_known_account(&addr('x')));
        assert!(manager.is_known_account_signer(&addr('x'), &addr('b')));
        assert!(!manager.is_known_account_signer(&addr('x'), &addr('c')));
    }

    #[tokio::test]
    async fn test_dispose_clears_registries() {
        let manager = ChannelManager::new(addr('a'));
        let (signalling, _peer) = LoopbackSignalling::pair();
        manager.create_node_channel(addr('b'), signalling).await;
        manager.dispose().await;
        assert!(manager.get_node_channels().is_empty());
    }

    #[derive(Debug, Clone, Copy)]
    struct RejectingPredicate;

    impl AdmissionPredicate for RejectingPredicate {
        fn verify_signature(&self, _envelope: &Envelope) -> bool {
            false
        }
    }

    fn sample_offer(sender_account: &str, sender_signer: &Address, receiver_signer: &Address, timestamp: i64) -> Envelope {
        Envelope {
            timestamp,
            max_age: 60,
            priority: 0,
            sequence: 0,
            sender: Party { account: sender_account.to_string(), signer: sender_signer.to_string() },
            receiver: Party { account: "node".to_string(), signer: receiver_signer.to_string() },
            payload: Message::Offer { sdp: "v=0".to_string() },
            signature: "sig".to_string(),
        }
    }

    #[tokio::test]
    async fn test_inbound_offer_rejects_non_offer_payload() {
        let manager = ChannelManager::new(addr('a'));
        let (signalling, _peer) = LoopbackSignalling::pair();
        let mut envelope = sample_offer("node", &addr('b'), &addr('a'), unix_now());
        envelope.payload = Message::Rejection {};

        let result =
            manager.handle_inbound_offer(&envelope, signalling, Arc::new(StubAdmissionPredicate)).await;
        assert!(matches!(result, Err(ChannelError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_inbound_offer_rejects_unsigned_envelope() {
        let manager = ChannelManager::new(addr('a'));
        let (signalling, _peer) = LoopbackSignalling::pair();
        let mut envelope = sample_offer("node", &addr('b'), &addr('a'), unix_now());
        envelope.signature.clear();

        let result =
            manager.handle_inbound_offer(&envelope, signalling, Arc::new(StubAdmissionPredicate)).await;
        assert!(matches!(result, Err(ChannelError::AdmissionRejected(_))));
    }

    #[tokio::test]
    async fn test_inbound_offer_rejects_expired_envelope() {
        let manager = ChannelManager::new(addr('a'));
        let (signalling, _peer) = LoopbackSignalling::pair();
        let envelope = sample_offer("node", &addr('b'), &addr('a'), 0);

        let result =
            manager.handle_inbound_offer(&envelope, signalling, Arc::new(StubAdmissionPredicate)).await;
        assert!(matches!(result, Err(ChannelError::AdmissionRejected(_))));
    }

    #[tokio::test]
    async fn test_inbound_offer_rejects_receiver_mismatch() {
        let manager = ChannelManager::new(addr('a'));
        let (signalling, _peer) = LoopbackSignalling::pair();
        let envelope = sample_offer("node", &addr('b'), &addr('z'), unix_now());

        let result =
            manager.handle_inbound_offer(&envelope, signalling, Arc::new(StubAdmissionPredicate)).await;
        assert!(matches!(result, Err(ChannelError::AdmissionRejected(_))));
    }

    #[tokio::test]
    async fn test_inbound_offer_rejects_failed_predicate() {
        let manager = ChannelManager::new(addr('a'));
        let (signalling, _peer) = LoopbackSignalling::pair();
        let envelope = sample_offer("node", &addr('b'), &addr('a'), unix_now());

        let result = manager.handle_inbound_offer(&envelope, signalling, Arc::new(RejectingPredicate)).await;
        assert!(matches!(result, Err(ChannelError::AdmissionRejected(_))));
    }
}
