//! `relay-scheduler` — the Cron Service (§4.8): schedule types, the pure
//! next-fire computation, JSON-file persistence for jobs and run history,
//! and the tick loop that dispatches `SystemEvent`/`AgentTurn`/`ChannelSend`
//! actions without depending on the Agent Runtime or Channel Manager crates
//! directly (see `TurnDispatcher`/`ChannelDispatcher`/`ChannelAccessor`).

pub mod engine;
pub mod error;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{ChannelAccessor, ChannelDispatcher, SchedulerEngine, SchedulerHandle, TurnDispatcher};
pub use error::{Result, SchedulerError};
pub use schedule::compute_next_run;
pub use store::CronStore;
pub use types::{Action, CronJob, OverlapPolicy, RunRecord, RunResult, RunStatus, Schedule};
