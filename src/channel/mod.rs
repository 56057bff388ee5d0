//! The channel subsystem: per-peer WebRTC negotiation, supervision, and the
//! two specializations (node vs account) built on top of a shared state
//! machine.

pub mod account;
pub mod base;
pub mod node;

pub use account::{AccountChannel, AdmissionPredicate, StubAdmissionPredicate};
pub use base::{ChannelEvent, ChannelHandle, ChannelTuning};
pub use node::NodeChannel;

use crate::account::Address;
use std::sync::Arc;

/// Common surface [`crate::manager::ChannelManager`] needs from either
/// channel kind: its registry key and its underlying state machine.
pub trait ManagedChannel: Send + Sync + std::fmt::Debug {
    /// The registry key this channel is stored under.
    fn key(&self) -> ChannelKey;
    /// The underlying state machine.
    fn handle(&self) -> &Arc<ChannelHandle>;
}

impl ManagedChannel for NodeChannel {
    fn key(&self) -> ChannelKey {
        Self::key(self)
    }
    fn handle(&self) -> &Arc<ChannelHandle> {
        Self::handle(self)
    }
}

impl ManagedChannel for AccountChannel {
    fn key(&self) -> ChannelKey {
        Self::key(self)
    }
    fn handle(&self) -> &Arc<ChannelHandle> {
        Self::handle(self)
    }
}

/// Key a channel is registered under in the [`crate::manager::ChannelManager`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    /// Node channels are keyed by the remote signer address alone.
    Node(Address),
    /// Account channels are keyed by `(account, signer)` — one account may
    /// be reachable through multiple devices.
    Account(Address, Address),
}

/// The channel's finite state, per the data model's state graph.
///
/// `Initiating → Connecting → Signalling → {Rejected, Failed, Open}`;
/// `Open → {Closing → Closed, Failed}`; any non-terminal → `Disposing →
/// Disposed`. `Closed` may be reopened (re-enters `Connecting`). `Disposed`
/// is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Freshly constructed; negotiation has not started.
    Initiating,
    /// Signalling transport is being connected.
    Connecting,
    /// Signalling transport is open; SDP/ICE exchange in progress.
    Signalling,
    /// The offer was rejected by the remote side.
    Rejected,
    /// Negotiation or a transport failed.
    Failed,
    /// Stable: command open, ICE connected, data open.
    Open,
    /// Graceful shutdown in progress.
    Closing,
    /// Gracefully shut down; may be reopened.
    Closed,
    /// Hard teardown in progress.
    Disposing,
    /// Terminal: all resources released.
    Disposed,
}

impl ChannelState {
    /// `true` for `Failed`, `Disposed` — states from which no further
    /// transition may occur except (for `Failed`) via explicit reopen logic
    /// handled by the caller, and (for `Disposed`) never.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disposed)
    }

    /// `true` if this state is reachable only via `dispose()`'s path.
    #[must_use]
    pub fn is_disposing_or_disposed(self) -> bool {
        matches!(self, Self::Disposing | Self::Disposed)
    }
}

/// Whether a channel prefers to yield in negotiation glare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Politeness {
    /// Yields to the remote offer in simultaneous-offer glare.
    Polite,
    /// Does not yield.
    Impolite,
}

/// Whether this side generated the original offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiation {
    /// This side called `openAsync()`.
    InitiatedByUs,
    /// The remote side sent the original offer; this side `acceptAsync`s.
    InitiatedByPeer,
}
