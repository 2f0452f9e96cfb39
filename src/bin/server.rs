// orcaforge server binary
// Boots the runtime and its thin HTTP surface. Run with: cargo run --bin server

//! Boots the runtime's shared state — message bus, agent registry,
//! persistence adapter, LLM adapter — wraps them in a `WorkflowEngine`, and
//! serves the inbound HTTP surface from spec.md §6 over Axum.

use std::env;
use std::sync::Arc;

use dotenv::dotenv;
use tracing::info;

use orcaforge::config::RuntimeConfig;
use orcaforge::llm::{HttpLlmAdapter, LlmAdapter, StubLlmAdapter};
use orcaforge::persistence::{PersistenceAdapter, SqlitePersistence};
use orcaforge::registry::AgentRegistry;
use orcaforge::{bus::MessageBus, WorkflowEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: could not load .env file: {}", e);
        eprintln!("Environment variables must be set manually or via system configuration");
    }

    tracing_subscriber::fmt::init();

    info!("Starting orcaforge server...");

    let config = Arc::new(RuntimeConfig::load()?);
    info!(
        host = %config.server_host,
        port = config.server_port,
        max_parallel_workflows = config.max_parallel_workflows,
        "runtime configuration loaded"
    );

    let bus = Arc::new(MessageBus::new(config.inbox_capacity));

    let registry = Arc::new(AgentRegistry::new(bus.clone(), config.heartbeat_timeout()));
    registry.spawn_reaper(std::time::Duration::from_secs(config.heartbeat_timeout_secs));

    let persistence: Arc<dyn PersistenceAdapter> =
        Arc::new(SqlitePersistence::connect(&config.database_path).await?);
    info!(database_path = %config.database_path, "persistence adapter connected");

    let llm: Arc<dyn LlmAdapter> = match env::var("ORCAFORGE_LLM_ENDPOINT") {
        Ok(endpoint) => {
            let api_key = env::var("ORCAFORGE_LLM_API_KEY").unwrap_or_default();
            let model = env::var("ORCAFORGE_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
            info!(%endpoint, %model, "using HTTP LLM adapter");
            Arc::new(HttpLlmAdapter::new(endpoint, api_key, model, config.llm_timeout()))
        }
        Err(_) => {
            info!("ORCAFORGE_LLM_ENDPOINT not set, falling back to the stub LLM adapter");
            Arc::new(StubLlmAdapter::default())
        }
    };

    let engine = WorkflowEngine::new(config.clone(), bus, registry, persistence, llm);
    let app = orcaforge::api::router(engine);

    let addr: std::net::SocketAddr =
        format!("{}:{}", config.server_host, config.server_port).parse()?;
    info!(%addr, "listening");

    axum::Server::bind(&addr).serve(app.into_make_service()).await?;

    Ok(())
}
