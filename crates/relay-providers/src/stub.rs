//! An in-memory provider with no network calls. Concrete LLM provider SDKs
//! are explicitly out of scope (spec §1): the real integration lives behind
//! this crate's [`LlmProvider`] trait in a deployment's own adapter crate.
//! `EchoProvider` exists so the rest of the system — the router, the turn
//! loop, the Gateway's bootstrap — has something to run against without one.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::delta::ChatDelta;
use crate::provider::{ChatRequest, LlmProvider, ProviderError};

/// Echoes the last user message back as a single text chunk. Never calls
/// out to a network, never errors, never produces tool calls.
pub struct EchoProvider {
    name: String,
}

impl EchoProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_chat(&self, req: &ChatRequest, tx: mpsc::Sender<ChatDelta>) -> Result<(), ProviderError> {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::provider::Role::User))
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let _ = tx.send(ChatDelta::TextChunk { text: format!("echo: {last_user}") }).await;
        let _ = tx.send(ChatDelta::UsageReport { tokens_in: 0, tokens_out: 0 }).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatOptions, Message, Role, SystemContent};

    #[tokio::test]
    async fn echoes_the_last_user_message() {
        let provider = EchoProvider::new("echo");
        let req = ChatRequest {
            system: SystemContent::Plain(String::new()),
            messages: vec![Message { role: Role::User, content: "hello".to_string() }],
            tools: vec![],
            options: ChatOptions { model: "echo-1".to_string(), max_tokens: 64, temperature: None, thinking: false },
        };
        let (tx, mut rx) = mpsc::channel(4);
        provider.stream_chat(&req, tx).await.unwrap();

        match rx.recv().await.unwrap() {
            ChatDelta::TextChunk { text } => assert_eq!(text, "echo: hello"),
            other => panic!("unexpected delta: {other:?}"),
        }
    }
}
