//! `relay-runtime` — the Agent Runtime (§4.5): system prompt assembly,
//! context-budget compaction, provider streaming, and the tool-call loop
//! that together drive one turn from user input to a persisted response.

pub mod estimator;
pub mod prompt;
pub mod turn;

pub use estimator::{CharHeuristicEstimator, TokenEstimator};
pub use prompt::{PromptBuilder, SessionInfo, SystemPrompt};
pub use turn::{AgentRuntime, TurnConfig, TurnOutcome};
