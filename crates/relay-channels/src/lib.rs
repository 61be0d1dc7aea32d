//! `relay-channels` — the Channel Plugin Framework (§4.6/§4.7): the
//! `Channel` adapter trait, the `ChannelManager` that owns every registered
//! adapter's lifecycle and bridges inbound traffic into the Agent Runtime,
//! and the DM pairing allow-list gating unsolicited direct messages.

pub mod channel;
pub mod error;
pub mod manager;
pub mod pairing;
pub mod types;

pub use channel::Channel;
pub use error::ChannelError;
pub use manager::ChannelManager;
pub use pairing::PairingStore;
pub use types::{ChannelHealth, InboundMessage, MediaAttachment, MessageFormat, OutboundMessage};
