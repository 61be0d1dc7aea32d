use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::delta::ChatDelta;
use crate::provider::{ChatRequest, LlmProvider, ProviderError};

/// One credential available to a [`ModelRoute`], in priority order. A
/// credential that fails with a non-retryable error is put on cool-down
/// rather than retried on the very next call.
struct CredentialSlot {
    provider: Box<dyn LlmProvider>,
    cooldown_until: Mutex<Option<Instant>>,
}

impl CredentialSlot {
    fn is_cooling_down(&self) -> bool {
        match *self.cooldown_until.lock().expect("cooldown mutex poisoned") {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    fn cool_down(&self, for_secs: u64) {
        *self.cooldown_until.lock().expect("cooldown mutex poisoned") =
            Some(Instant::now() + Duration::from_secs(for_secs));
    }
}

/// A model and its priority-ordered credentials (auth rotation, §4.4).
pub struct ModelRoute {
    model: String,
    credentials: Vec<CredentialSlot>,
}

impl ModelRoute {
    pub fn new(model: impl Into<String>, providers: Vec<Box<dyn LlmProvider>>) -> Self {
        assert!(!providers.is_empty(), "ModelRoute requires at least one credential");
        Self {
            model: model.into(),
            credentials: providers
                .into_iter()
                .map(|provider| CredentialSlot { provider, cooldown_until: Mutex::new(None) })
                .collect(),
        }
    }
}

/// Outcome metadata returned alongside a successful `stream_chat` call so the
/// Runtime can publish `AGENT_ERROR{recovered: true}` when model fallback
/// kicked in (§4.4, §4.5).
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub model: String,
    pub used_fallback: bool,
}

/// Routes a turn across a primary model and its credentials, falling back to
/// one configured alternate model on overload or credential exhaustion
/// (§4.4 "Model fallback"). Credential cool-down defaults to 5 minutes.
pub struct ProviderRouter {
    primary: ModelRoute,
    fallback: Option<ModelRoute>,
    cooldown_secs: u64,
}

impl ProviderRouter {
    pub fn new(primary: ModelRoute, fallback: Option<ModelRoute>) -> Self {
        Self { primary, fallback, cooldown_secs: 300 }
    }

    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub async fn stream_chat(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<ChatDelta>,
    ) -> Result<RouteOutcome, ProviderError> {
        match self.try_route(&self.primary, req, tx.clone()).await {
            Ok(()) => Ok(RouteOutcome { model: self.primary.model.clone(), used_fallback: false }),
            Err(primary_err) => {
                let Some(fallback) = &self.fallback else {
                    return Err(primary_err);
                };
                warn!(
                    model = %self.primary.model,
                    fallback_model = %fallback.model,
                    err = %primary_err,
                    "falling back to alternate model"
                );
                self.try_route(fallback, req, tx)
                    .await
                    .map(|()| RouteOutcome { model: fallback.model.clone(), used_fallback: true })
            }
        }
    }

    async fn try_route(
        &self,
        route: &ModelRoute,
        req: &ChatRequest,
        tx: mpsc::Sender<ChatDelta>,
    ) -> Result<(), ProviderError> {
        let mut last_err: Option<ProviderError> = None;

        for slot in &route.credentials {
            if slot.is_cooling_down() {
                continue;
            }

            match slot.provider.stream_chat(req, tx.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(provider = slot.provider.name(), model = %route.model, err = %e, "credential failed");
                    if !e.retryable() {
                        slot.cool_down(self.cooldown_secs);
                    }
                    last_err = Some(e);
                }
            }
        }

        info!(model = %route.model, "all credentials exhausted for model");
        Err(last_err.unwrap_or_else(|| ProviderError::Unavailable("no usable credential".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatOptions, ChatRequest, Message, Role, SystemContent};
    use async_trait::async_trait;

    fn dummy_request() -> ChatRequest {
        ChatRequest {
            system: SystemContent::Plain("you are a test".to_string()),
            messages: vec![Message { role: Role::User, content: "hi".to_string() }],
            tools: Vec::new(),
            options: ChatOptions { model: "test-model".to_string(), max_tokens: 64, temperature: None, thinking: false },
        }
    }

    struct AlwaysFail(&'static str);

    #[async_trait]
    impl LlmProvider for AlwaysFail {
        fn name(&self) -> &str {
            self.0
        }
        async fn stream_chat(&self, _req: &ChatRequest, _tx: mpsc::Sender<ChatDelta>) -> Result<(), ProviderError> {
            Err(ProviderError::Unavailable("intentional failure".to_string()))
        }
    }

    struct AlwaysOk(&'static str);

    #[async_trait]
    impl LlmProvider for AlwaysOk {
        fn name(&self) -> &str {
            self.0
        }
        async fn stream_chat(&self, _req: &ChatRequest, tx: mpsc::Sender<ChatDelta>) -> Result<(), ProviderError> {
            let _ = tx.send(ChatDelta::TextChunk { text: "ok".to_string() }).await;
            Ok(())
        }
    }

    struct AlwaysAuthFail(&'static str);

    #[async_trait]
    impl LlmProvider for AlwaysAuthFail {
        fn name(&self) -> &str {
            self.0
        }
        async fn stream_chat(&self, _req: &ChatRequest, _tx: mpsc::Sender<ChatDelta>) -> Result<(), ProviderError> {
            Err(ProviderError::Auth("expired credential".to_string()))
        }
    }

    #[tokio::test]
    async fn rotates_to_next_credential_on_failure() {
        let route = ModelRoute::new("primary", vec![Box::new(AlwaysFail("key-a")), Box::new(AlwaysOk("key-b"))]);
        let router = ProviderRouter::new(route, None);
        let (tx, mut rx) = mpsc::channel(8);

        let outcome = router.stream_chat(&dummy_request(), tx).await.unwrap();
        assert_eq!(outcome.model, "primary");
        assert!(!outcome.used_fallback);
        assert!(matches!(rx.recv().await, Some(ChatDelta::TextChunk { .. })));
    }

    #[tokio::test]
    async fn falls_back_to_alternate_model_once() {
        let primary = ModelRoute::new("primary", vec![Box::new(AlwaysFail("key-a"))]);
        let fallback = ModelRoute::new("fallback", vec![Box::new(AlwaysOk("key-b"))]);
        let router = ProviderRouter::new(primary, Some(fallback));
        let (tx, _rx) = mpsc::channel(8);

        let outcome = router.stream_chat(&dummy_request(), tx).await.unwrap();
        assert_eq!(outcome.model, "fallback");
        assert!(outcome.used_fallback);
    }

    #[tokio::test]
    async fn errors_when_primary_and_fallback_exhausted() {
        let primary = ModelRoute::new("primary", vec![Box::new(AlwaysFail("a"))]);
        let fallback = ModelRoute::new("fallback", vec![Box::new(AlwaysFail("b"))]);
        let router = ProviderRouter::new(primary, Some(fallback));
        let (tx, _rx) = mpsc::channel(8);

        assert!(router.stream_chat(&dummy_request(), tx).await.is_err());
    }

    #[tokio::test]
    async fn auth_failure_puts_credential_on_cooldown() {
        let route = ModelRoute::new("primary", vec![Box::new(AlwaysAuthFail("key-a")), Box::new(AlwaysOk("key-b"))]);
        let router = ProviderRouter::new(route, None).with_cooldown_secs(60);
        let (tx, _rx) = mpsc::channel(8);

        router.stream_chat(&dummy_request(), tx).await.unwrap();
        assert!(router.primary.credentials[0].is_cooling_down());
        assert!(!router.primary.credentials[1].is_cooling_down());
    }
}
