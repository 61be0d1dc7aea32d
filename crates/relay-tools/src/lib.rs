//! `relay-tools` — the Tool Registry (spec §4.3): a catalog of callable
//! tools with schemas, an ordered permission-policy chain, and invocation.

pub mod approvals;
pub mod policy;
pub mod registry;
pub mod tools;

pub use approvals::{ApprovalError, ApprovalStore, PendingApproval};
pub use policy::{PolicyChain, PolicyDecision};
pub use registry::{
    GeneratedFile, Tool, ToolContext, ToolDescriptor, ToolError, ToolRegistry, ToolResult,
};
