use assistant_response_orchestrator::{
    api::start_server,
    cache::ContextCache,
    config::PipelineConfig,
    generator::{Generator, LlmGenerator, MockGenerator},
    pipeline::PipelineController,
    providers::{
        DocsProvider, MarketDataProvider, NewsProvider, ProviderHttpClient, ProviderRegistry,
        SandboxProvider,
    },
    retrieval::InMemoryRetrievalStore,
    session::SessionRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = PipelineConfig::from_env();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Assistant Response Orchestrator - API server");
    info!("Port: {}", api_port);

    // Providers: registered only when a gateway base URL is configured.
    let mut registry = ProviderRegistry::new();
    match std::env::var("PROVIDER_API_BASE_URL") {
        Ok(base_url) => {
            let http = ProviderHttpClient::new(base_url)?;
            registry.register(Arc::new(MarketDataProvider::new(
                http.clone(),
                Duration::from_secs(30),
            )));
            registry.register(Arc::new(NewsProvider::new(
                http.clone(),
                Duration::from_secs(300),
            )));
            registry.register(Arc::new(DocsProvider::new(
                http.clone(),
                Duration::from_secs(3600),
            )));
            registry.register(Arc::new(SandboxProvider::new(http)));
        }
        Err(_) => {
            warn!("PROVIDER_API_BASE_URL not set; requests will run without provider context");
        }
    }

    let generator: Arc<dyn Generator> = match std::env::var("LLM_API_KEY") {
        Ok(api_key) if !api_key.trim().is_empty() => Arc::new(LlmGenerator::new(
            api_key,
            config.generation_deadline,
        )?),
        _ => {
            warn!("LLM_API_KEY not set; falling back to the deterministic mock generator");
            Arc::new(MockGenerator)
        }
    };

    let sessions = Arc::new(SessionRegistry::new(
        config.max_clients,
        config.max_in_flight_per_client,
    ));
    let pipeline = Arc::new(PipelineController::new(
        config.clone(),
        Arc::new(ContextCache::new(config.cache_max_entries)),
        Arc::new(InMemoryRetrievalStore::with_default_corpus()),
        Arc::new(registry),
        generator,
        sessions.clone(),
    ));

    info!("Pipeline initialized");
    info!("Starting API server...");

    start_server(pipeline, sessions, api_port).await?;

    Ok(())
}
