//! `relay-sessions` — the Session Store (§4.2): per-session append-only
//! message logs, debounced JSON persistence, and context-budget compaction.

pub mod compact;
pub mod error;
pub mod store;
pub mod types;

pub use compact::{compact, CompactedView, CompactionBudget, Summarizer};
pub use error::SessionError;
pub use store::SessionStore;
pub use types::Session;
