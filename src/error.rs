//! Domain error taxonomy for the channel subsystem.
//!
//! Mirrors the surrounding plumbing's split between a precise, hand-written
//! error enum for the core (this module) and `anyhow::Result` with
//! `.context(...)` chains for ambient concerns (config, keyring, CLI).

use crate::account::Address;
use crate::channel::ChannelState;

/// Errors surfaced by the channel state machine, signalling transport, and
/// manager.
#[derive(Debug)]
pub enum ChannelError {
    /// Envelope failed to decode, an unknown payload tag was seen, or a
    /// signature/expiry check failed.
    ProtocolViolation(String),
    /// Sender/receiver mismatch, receiver is not the local signer, or the
    /// sender was classified as invalid.
    AdmissionRejected(String),
    /// SDP/ICE operation failed, signalling timed out, or the handshake
    /// observed an unexpected state.
    NegotiationFailed(String),
    /// The underlying data or command channel surfaced a transport error.
    TransportError(String),
    /// The buffer auditor rejected the current buffered amount.
    StallDetected,
    /// The remote peer failed to `Pong` within the heartbeat timeout.
    HeartbeatTimeout,
    /// Caller invoked `reopen`/`closeAsync`/`dispose` in a state where it is
    /// not permitted.
    InvalidStateTransition {
        /// The state the channel was in when the call was made.
        state: ChannelState,
        /// The operation that was rejected.
        operation: &'static str,
    },
    /// Missing peer connection, double initialization, or an otherwise
    /// unreachable internal state.
    InternalPrecondition(String),
    /// No channel is registered for the given address.
    NoSession(Address),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::AdmissionRejected(msg) => write!(f, "admission rejected: {msg}"),
            Self::NegotiationFailed(msg) => write!(f, "negotiation failed: {msg}"),
            Self::TransportError(msg) => write!(f, "transport error: {msg}"),
            Self::StallDetected => write!(f, "transport buffer stalled"),
            Self::HeartbeatTimeout => write!(f, "heartbeat timed out"),
            Self::InvalidStateTransition { state, operation } => {
                write!(f, "cannot {operation} while channel is {state:?}")
            }
            Self::InternalPrecondition(msg) => write!(f, "internal precondition violated: {msg}"),
            Self::NoSession(addr) => write!(f, "no channel for {addr}"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Codec-level decode failures for the envelope wire format.
#[derive(Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Input was not valid JSON, or lacked the fields an envelope requires.
    BadFormat(String),
    /// `payload.type` did not match any known `Message` variant.
    UnknownKind(String),
    /// Input was well-formed JSON but had no `payload.type` field at all.
    MissingPayload,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadFormat(msg) => write!(f, "bad envelope format: {msg}"),
            Self::UnknownKind(kind) => write!(f, "unknown payload kind: {kind}"),
            Self::MissingPayload => write!(f, "envelope is missing payload.type"),
        }
    }
}

impl std::error::Error for EnvelopeError {}
