use serde::Serialize;

/// One increment of a streamed chat response (§4.4). The sequence is finite
/// and not restartable — callers that need to replay a turn cache the
/// deltas they received, they don't re-open the stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatDelta {
    TextChunk { text: String },
    ToolCallStart { id: String, name: String },
    ToolCallArg { id: String, json_fragment: String },
    ToolCallEnd { id: String },
    UsageReport { tokens_in: u32, tokens_out: u32 },
    ProviderError { kind: ProviderErrorKind },
}

/// Classification carried by a mid-stream `ChatDelta::ProviderError`, distinct
/// from the top-level [`crate::provider::ProviderError`] a `send_stream` call
/// returns for failures discovered before any delta is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    Overloaded,
    Auth,
    Transport,
    Parse,
    Cancelled,
}
