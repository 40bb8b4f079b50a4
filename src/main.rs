use std::sync::Arc;
use tracing::info;

mod attachments;
mod bus;
mod chat;
mod completion;
mod config;
mod grouping;
mod server;
mod session_store;
mod store;
mod topic;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("PineAI starting...");

    let config = config::Config::from_env()?;

    let bus = Arc::new(bus::EventBus::new());

    let persistence: Arc<dyn store::Persistence> = if config.in_memory() {
        info!("Keeping chat history in memory only");
        Arc::new(store::MemoryStore::new())
    } else {
        info!("Initializing store at {}", config.db_path.display());
        let store = store::SqliteStore::new(&config.db_path).await?;
        store.init().await?;
        Arc::new(store)
    };

    info!(
        "Using completion endpoint {} (model {})",
        config.completion_url, config.completion_model
    );
    let completion = completion::OpenAiCompletion::new(
        config.completion_url.clone(),
        config.completion_model.clone(),
        config.api_key.clone(),
        config.system_prompt.clone(),
    );

    let sessions = session_store::SessionStore::load(
        persistence,
        Arc::new(completion),
        bus.clone(),
    )
    .await?;

    let state = Arc::new(server::AppState::new(Arc::new(sessions), bus));
    let app = server::router(state);

    info!("Starting HTTP server on port {}", config.port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                info!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
