//! Pipeline controller
//!
//! Drives one request through the state machine:
//! RECEIVED → CLASSIFIED → CONTEXT_GATHERED → GENERATING → DELIVERED,
//! with ERRORED reachable from any non-terminal state. Context gathering
//! runs all provider calls concurrently and joins before generation; a
//! single provider failure degrades that slot instead of aborting the
//! request, and every error path still produces a user-visible fallback.

use crate::cache::{cache_key, ContextCache};
use crate::classifier::{classify, Classification};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::generator::{Generator, PromptContext};
use crate::models::{
    ContextBundle, OutboundMessage, ProviderOutcome, Request, RequestState, Response,
    RetrievedPassage,
};
use crate::providers::{ProviderRegistry, DOCS, MARKET_DATA, NEWS, SANDBOX};
use crate::retrieval::RetrievalStore;
use crate::session::SessionRegistry;
use crate::Result;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-request orchestrator. One instance serves the whole process; every
/// request runs through it as an independently suspendable unit of work.
pub struct PipelineController {
    config: PipelineConfig,
    cache: Arc<ContextCache>,
    retrieval: Arc<dyn RetrievalStore>,
    providers: Arc<ProviderRegistry>,
    generator: Arc<dyn Generator>,
    sessions: Arc<SessionRegistry>,
}

impl PipelineController {
    pub fn new(
        config: PipelineConfig,
        cache: Arc<ContextCache>,
        retrieval: Arc<dyn RetrievalStore>,
        providers: Arc<ProviderRegistry>,
        generator: Arc<dyn Generator>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            cache,
            retrieval,
            providers,
            generator,
            sessions,
        }
    }

    /// Run one request end to end and deliver exactly one outbound message
    /// for it: the generated reply, or a fallback when anything errored or
    /// the overall deadline elapsed. Outstanding sub-calls past the
    /// deadline are abandoned, not awaited.
    pub async fn handle(&self, request: Request) {
        let client_id = request.client_id;
        let request_id = request.request_id;

        let outcome =
            tokio::time::timeout(self.config.request_deadline, self.process(&request)).await;

        let (message, errored) = match outcome {
            Ok(Ok(response)) => (OutboundMessage::reply(response), false),
            Ok(Err(error)) => {
                warn!(%request_id, error = %error, "request errored, synthesizing fallback");
                (
                    OutboundMessage::failure(request_id, fallback_text(&error)),
                    true,
                )
            }
            Err(_) => {
                warn!(%request_id, "request deadline exceeded, abandoning outstanding calls");
                (
                    OutboundMessage::failure(request_id, fallback_text(&PipelineError::RequestTimeout)),
                    true,
                )
            }
        };

        match self.sessions.send(client_id, message).await {
            Ok(()) if !errored => {
                info!(%request_id, state = %RequestState::Delivered, "response delivered");
            }
            Ok(()) => {
                info!(%request_id, state = %RequestState::Errored, "fallback delivered");
            }
            Err(_) => {
                // Nobody left to show anything to; drop without retry.
                warn!(%request_id, state = %RequestState::Errored, "client gone, response dropped");
            }
        }

        self.sessions.complete_request(client_id).await;
    }

    /// The pipeline up to (and including) generation. Delivery is the
    /// caller's concern, which keeps this path reusable for the REST
    /// endpoint and directly testable.
    pub async fn process(&self, request: &Request) -> Result<Response> {
        let request_id = request.request_id;
        debug!(%request_id, state = %RequestState::Received, text = %request.raw_text, "request accepted");

        let classification = classify(&request.raw_text);
        debug!(
            %request_id,
            state = %RequestState::Classified,
            intent = ?classification.intent,
            providers = ?classification.providers,
            retrieval = classification.use_retrieval,
            "intent classified"
        );

        // Providers and retrieval all settle before generation starts.
        let (outcomes, passages) = tokio::join!(
            self.gather_context(request, &classification),
            self.retrieve_passages(request, &classification),
        );

        let fetched = outcomes.iter().filter(|o| o.bundle().is_some()).count();
        debug!(
            %request_id,
            state = %RequestState::ContextGathered,
            fetched,
            degraded = outcomes.len() - fetched,
            passages = passages.len(),
            "context gathered"
        );

        let mut prompt = PromptContext::new(request.raw_text.clone());
        prompt.set_passages(passages);
        for outcome in &outcomes {
            if let Some(bundle) = outcome.bundle() {
                prompt.push_bundle(bundle.clone());
            }
        }

        debug!(%request_id, state = %RequestState::Generating, "invoking generator");
        let reply = tokio::time::timeout(
            self.config.generation_deadline,
            self.generator.generate(&prompt),
        )
        .await
        .map_err(|_| PipelineError::GenerationTimeout(self.config.generation_deadline.as_secs()))??;

        Ok(Response::new(
            request_id,
            reply.text,
            reply.structured_fields,
        ))
    }

    /// Issue every provider call for this request concurrently and collect
    /// outcomes in fetch-issue order. Each slot degrades independently.
    async fn gather_context(
        &self,
        request: &Request,
        classification: &Classification,
    ) -> Vec<ProviderOutcome> {
        let calls = provider_requests(request, classification);
        join_all(
            calls
                .into_iter()
                .map(|(name, params)| self.fetch_one(name, params)),
        )
        .await
    }

    async fn fetch_one(&self, name: &'static str, params: Value) -> ProviderOutcome {
        let Some(provider) = self.providers.get(name) else {
            warn!(provider = name, "provider not registered, context unavailable");
            return ProviderOutcome::Unavailable;
        };

        let ttl = provider.cache_ttl();
        let key = cache_key(name, &params);

        if !ttl.is_zero() {
            match self.cache.get(&key).await {
                Ok(Some(value)) => {
                    debug!(provider = name, "context cache hit");
                    return ProviderOutcome::Fetched(ContextBundle::new(name, value, ttl));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(provider = name, error = %e, "cache lookup failed, fetching directly");
                }
            }
        }

        match tokio::time::timeout(self.config.provider_deadline, provider.fetch(&params)).await {
            Ok(Ok(value)) => {
                if !ttl.is_zero() {
                    if let Err(e) = self.cache.put(&key, value.clone(), ttl).await {
                        warn!(provider = name, error = %e, "cache write failed");
                    }
                }
                ProviderOutcome::Fetched(ContextBundle::new(name, value, ttl))
            }
            Ok(Err(e)) => {
                warn!(provider = name, error = %e, "provider call failed, degrading context");
                ProviderOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    provider = name,
                    deadline_secs = self.config.provider_deadline.as_secs(),
                    "provider call timed out, degrading context"
                );
                ProviderOutcome::Unavailable
            }
        }
    }

    /// Retrieval failures (including an empty corpus) degrade to an empty
    /// passage list instead of aborting.
    async fn retrieve_passages(
        &self,
        request: &Request,
        classification: &Classification,
    ) -> Vec<RetrievedPassage> {
        if !classification.use_retrieval {
            return Vec::new();
        }

        match self
            .retrieval
            .search(&request.raw_text, self.config.retrieval_k)
            .await
        {
            Ok(passages) => passages,
            Err(e) => {
                warn!(error = %e, "retrieval degraded to no passages");
                Vec::new()
            }
        }
    }
}

/// Build the per-provider query parameters, preserving the classifier's
/// fetch-issue order.
fn provider_requests(
    request: &Request,
    classification: &Classification,
) -> Vec<(&'static str, Value)> {
    classification
        .providers
        .iter()
        .map(|&name| {
            let params = match name {
                MARKET_DATA => json!({
                    "symbol": classification.symbol.clone().unwrap_or_default()
                }),
                NEWS => json!({
                    "query": classification
                        .symbol
                        .clone()
                        .unwrap_or_else(|| request.raw_text.clone())
                }),
                DOCS => json!({ "query": request.raw_text.clone() }),
                SANDBOX => json!({
                    "source": request.raw_text.clone(),
                    "language": "python"
                }),
                _ => json!({ "query": request.raw_text.clone() }),
            };
            (name, params)
        })
        .collect()
}

fn fallback_text(error: &PipelineError) -> &'static str {
    match error {
        PipelineError::RequestTimeout | PipelineError::GenerationTimeout(_) => {
            "The request took too long to process. Please try again."
        }
        _ => "Unable to process your request right now. Please try again.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{GeneratedReply, MockGenerator};
    use crate::providers::{ContextProvider, StaticProvider};
    use crate::retrieval::InMemoryRetrievalStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    struct FailingProvider(&'static str);

    #[async_trait]
    impl ContextProvider for FailingProvider {
        fn name(&self) -> &'static str {
            self.0
        }
        fn cache_ttl(&self) -> Duration {
            Duration::from_secs(30)
        }
        async fn fetch(&self, _params: &Value) -> Result<Value> {
            Err(PipelineError::ProviderUnavailable("upstream 503".into()))
        }
    }

    struct HangingProvider(&'static str);

    #[async_trait]
    impl ContextProvider for HangingProvider {
        fn name(&self) -> &'static str {
            self.0
        }
        fn cache_ttl(&self) -> Duration {
            Duration::from_secs(30)
        }
        async fn fetch(&self, _params: &Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(json!({}))
        }
    }

    struct CountingProvider {
        name: &'static str,
        calls: AtomicUsize,
        payload: Value,
    }

    #[async_trait]
    impl ContextProvider for CountingProvider {
        fn name(&self) -> &'static str {
            self.name
        }
        fn cache_ttl(&self) -> Duration {
            Duration::from_secs(60)
        }
        async fn fetch(&self, _params: &Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.payload.clone())
        }
    }

    struct RecordingGenerator {
        prompts: Mutex<Vec<String>>,
    }

    impl RecordingGenerator {
        fn new() -> Self {
            Self {
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Generator for RecordingGenerator {
        async fn generate(&self, prompt: &PromptContext) -> Result<GeneratedReply> {
            self.prompts.lock().unwrap().push(prompt.render());
            Ok(GeneratedReply {
                text: "recorded".to_string(),
                structured_fields: None,
            })
        }
    }

    struct HangingGenerator;

    #[async_trait]
    impl Generator for HangingGenerator {
        async fn generate(&self, _prompt: &PromptContext) -> Result<GeneratedReply> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(GeneratedReply {
                text: "too late".to_string(),
                structured_fields: None,
            })
        }
    }

    fn controller_with(
        config: PipelineConfig,
        providers: ProviderRegistry,
        generator: Arc<dyn Generator>,
    ) -> (PipelineController, Arc<SessionRegistry>) {
        let sessions = Arc::new(SessionRegistry::new(16, 8));
        let controller = PipelineController::new(
            config,
            Arc::new(ContextCache::new(0)),
            Arc::new(InMemoryRetrievalStore::with_default_corpus()),
            Arc::new(providers),
            generator,
            sessions.clone(),
        );
        (controller, sessions)
    }

    fn market_registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StaticProvider::new(
            MARKET_DATA,
            Duration::from_secs(30),
            json!({ "symbol": "AAPL", "price": 190.12 }),
        )));
        registry
    }

    async fn connect(sessions: &SessionRegistry) -> (Uuid, tokio::sync::mpsc::Receiver<OutboundMessage>) {
        let client_id = Uuid::new_v4();
        let rx = sessions.connect(client_id).await.unwrap();
        sessions.mark_open(client_id).await;
        (client_id, rx)
    }

    #[tokio::test]
    async fn test_quote_request_end_to_end() {
        let (controller, _sessions) = controller_with(
            PipelineConfig::default(),
            market_registry(),
            Arc::new(MockGenerator),
        );

        let request = Request::new(Uuid::new_v4(), "price of AAPL");
        let response = controller.process(&request).await.unwrap();

        assert!(response.text.contains("190.12"));
        let fields = response.structured_fields.unwrap();
        assert_eq!(fields["symbol"], "AAPL");
        assert_eq!(fields["price"], 190.12);
    }

    #[tokio::test]
    async fn test_partial_provider_failure_still_generates() {
        let mut registry = market_registry();
        registry.register(Arc::new(FailingProvider(NEWS)));

        let generator = Arc::new(RecordingGenerator::new());
        let (controller, _sessions) = controller_with(
            PipelineConfig::default(),
            registry,
            generator.clone(),
        );

        // Recommendation intent queries market_data and news concurrently.
        let request = Request::new(Uuid::new_v4(), "should I buy AAPL?");
        let response = controller.process(&request).await;
        assert!(response.is_ok());

        let prompts = generator.prompts.lock().unwrap();
        let prompt = prompts.first().unwrap();
        assert!(prompt.contains("Context from market_data"));
        assert!(!prompt.contains("Context from news"));
        assert!(!prompt.to_lowercase().contains("unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_provider_degrades_within_deadline() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(HangingProvider(MARKET_DATA)));

        let config = PipelineConfig {
            provider_deadline: Duration::from_secs(2),
            ..PipelineConfig::default()
        };
        let (controller, sessions) = controller_with(config, registry, Arc::new(MockGenerator));
        let (client_id, mut rx) = connect(&sessions).await;

        let request = Request::new(client_id, "price of AAPL");
        assert!(sessions.begin_request(client_id).await);
        controller.handle(request).await;

        // A real (fallback-quality) reply arrives, not an error frame, and
        // well inside the overall request deadline.
        let message = rx.recv().await.unwrap();
        match message {
            OutboundMessage::Reply { text, structured_fields, .. } => {
                assert!(text.contains("price of AAPL"));
                assert!(structured_fields.is_none());
            }
            other => panic!("expected reply, got {:?}", other),
        }
        assert_eq!(sessions.in_flight(client_id).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_timeout_delivers_single_fallback() {
        let config = PipelineConfig {
            generation_deadline: Duration::from_secs(1),
            ..PipelineConfig::default()
        };
        let (controller, sessions) =
            controller_with(config, market_registry(), Arc::new(HangingGenerator));
        let (client_id, mut rx) = connect(&sessions).await;

        let request = Request::new(client_id, "price of AAPL");
        assert!(sessions.begin_request(client_id).await);
        controller.handle(request).await;

        let message = rx.recv().await.unwrap();
        match message {
            OutboundMessage::Error { text, .. } => {
                assert!(text.contains("too long"));
            }
            other => panic!("expected error frame, got {:?}", other),
        }

        // Exactly one delivery per request.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_deadline_forces_timeout_fallback() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(HangingProvider(MARKET_DATA)));

        let config = PipelineConfig {
            request_deadline: Duration::from_secs(1),
            provider_deadline: Duration::from_secs(10),
            ..PipelineConfig::default()
        };
        let (controller, sessions) = controller_with(config, registry, Arc::new(MockGenerator));
        let (client_id, mut rx) = connect(&sessions).await;

        let request = Request::new(client_id, "price of AAPL");
        assert!(sessions.begin_request(client_id).await);
        controller.handle(request).await;

        let message = rx.recv().await.unwrap();
        assert!(matches!(message, OutboundMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_client_gone_drops_response_silently() {
        let (controller, sessions) = controller_with(
            PipelineConfig::default(),
            market_registry(),
            Arc::new(MockGenerator),
        );
        let (client_id, rx) = connect(&sessions).await;

        assert!(sessions.begin_request(client_id).await);
        sessions.disconnect(client_id).await;
        drop(rx);

        let request = Request::new(client_id, "price of AAPL");
        controller.handle(request).await;

        // The drained session is fully removed; nothing was queued anywhere.
        assert_eq!(sessions.channel_state(client_id).await, None);
    }

    #[tokio::test]
    async fn test_second_request_hits_cache() {
        let counting = Arc::new(CountingProvider {
            name: MARKET_DATA,
            calls: AtomicUsize::new(0),
            payload: json!({ "symbol": "MSFT", "price": 420.5 }),
        });
        let mut registry = ProviderRegistry::new();
        registry.register(counting.clone());

        let (controller, _sessions) = controller_with(
            PipelineConfig::default(),
            registry,
            Arc::new(MockGenerator),
        );

        let first = Request::new(Uuid::new_v4(), "price of MSFT");
        let second = Request::new(Uuid::new_v4(), "price of MSFT");

        controller.process(&first).await.unwrap();
        let response = controller.process(&second).await.unwrap();

        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert!(response.text.contains("420.5"));
    }

    #[tokio::test]
    async fn test_generic_request_needs_no_context() {
        let (controller, _sessions) = controller_with(
            PipelineConfig::default(),
            ProviderRegistry::new(),
            Arc::new(MockGenerator),
        );

        let request = Request::new(Uuid::new_v4(), "thanks!");
        let response = controller.process(&request).await.unwrap();
        assert!(response.text.contains("thanks!"));
        assert!(response.structured_fields.is_none());
    }

    #[tokio::test]
    async fn test_doc_lookup_grounds_on_passages() {
        let generator = Arc::new(RecordingGenerator::new());
        let (controller, _sessions) = controller_with(
            PipelineConfig::default(),
            ProviderRegistry::new(),
            generator.clone(),
        );

        let request = Request::new(Uuid::new_v4(), "explain the refund policy");
        controller.process(&request).await.unwrap();

        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts.first().unwrap().contains("[policy-refunds]"));
    }
}
