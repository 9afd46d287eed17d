use assistant_response_orchestrator::{
    cache::ContextCache,
    config::PipelineConfig,
    generator::MockGenerator,
    models::{OutboundMessage, Request},
    pipeline::PipelineController,
    providers::create_demo_registry,
    retrieval::InMemoryRetrievalStore,
    session::SessionRegistry,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Assistant Response Orchestrator demo starting");

    // Create components
    let config = PipelineConfig::default();
    let sessions = Arc::new(SessionRegistry::new(
        config.max_clients,
        config.max_in_flight_per_client,
    ));
    let pipeline = PipelineController::new(
        config.clone(),
        Arc::new(ContextCache::new(config.cache_max_entries)),
        Arc::new(InMemoryRetrievalStore::with_default_corpus()),
        Arc::new(create_demo_registry()),
        Arc::new(MockGenerator),
        sessions.clone(),
    );

    // Attach a local demo client directly to the session layer
    let client_id = Uuid::new_v4();
    let mut rx = sessions
        .connect(client_id)
        .await
        .expect("demo client rejected");
    sessions.mark_open(client_id).await;

    let messages = [
        "price of AAPL",
        "should I buy AAPL?",
        "explain the refund policy",
        "thanks!",
    ];

    for text in messages {
        let request = Request::new(client_id, text);
        info!(request_id = %request.request_id, text, "submitting request");

        sessions.begin_request(client_id).await;
        pipeline.handle(request).await;

        match rx.recv().await {
            Some(OutboundMessage::Reply {
                text,
                structured_fields,
                ..
            }) => {
                println!("\n>>> {}", text);
                if let Some(fields) = structured_fields {
                    println!("    structured: {}", fields);
                }
            }
            Some(OutboundMessage::Error { text, .. }) => println!("\n!!! {}", text),
            Some(OutboundMessage::SystemNotice { text, .. }) => println!("\n--- {}", text),
            None => break,
        }
    }

    sessions.disconnect(client_id).await;
    Ok(())
}
