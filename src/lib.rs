//! meshctl: a peer node for a decentralized WebRTC mesh.
//!
//! The channel subsystem (`channel`, `manager`) negotiates and supervises
//! per-peer WebRTC sessions; everything else is ambient plumbing (identity,
//! signalling transport, config, logging) that the core depends on.

pub mod account;
pub mod account_manager;
pub mod buffer_auditor;
pub mod cancellable_delay;
pub mod channel;
pub mod config;
pub mod constants;
pub mod env;
pub mod envelope;
pub mod error;
pub mod keyring;
pub mod logging;
pub mod manager;
pub mod signalling;
pub mod ws;

pub use account::{Account, Address};
pub use account_manager::AccountManager;
pub use channel::{AccountChannel, ChannelKey, ChannelState, NodeChannel};
pub use config::Config;
pub use envelope::Envelope;
pub use error::ChannelError;
pub use manager::ChannelManager;
