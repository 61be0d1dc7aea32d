//! `relay-core` — shared data model, error taxonomy, and configuration for
//! the gateway workspace. Every other crate in the workspace depends on this
//! one; it depends on nothing else in the workspace.

pub mod config;
pub mod error;
pub mod persist;
pub mod types;

pub use error::{RelayError, Result};
pub use types::{
    ChannelState, Event, EventType, Importance, Message, PermissionClass, Role, Scope,
    SessionId, SideEffects,
};
