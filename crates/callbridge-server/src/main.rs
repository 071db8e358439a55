//! Call bridge server binary.
//!
//! Starts an axum HTTP server with structured logging, tenant store
//! initialization, the session sweep task, and graceful shutdown on
//! SIGTERM/SIGINT.

use callbridge_server::background::start_sweep_task;
use callbridge_server::resolver::SqliteTenantResolver;
use callbridge_server::registry::SessionRegistry;
use callbridge_server::{app, config, AppState, EVENT_CHANNEL_CAPACITY};
use callbridge_voice::{
    ActionSink, LoggingActionSink, RealtimeConnector, TemplatePromptBuilder, WebhookActionSink,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("CALLBRIDGE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration: the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize tenant store
    let pool = callbridge_db::create_pool(
        &config.database.path,
        callbridge_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
            acquire_timeout_ms: config.database.acquire_timeout_ms,
        },
    )
    .expect("failed to create database pool: check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied =
            callbridge_db::run_migrations(&conn).expect("failed to run database migrations");
        let schema = callbridge_db::applied_migrations(&conn)
            .expect("failed to read migration history");
        tracing::info!(
            applied_now = applied,
            schema_version = schema.last().map(String::as_str).unwrap_or("none"),
            "tenant store ready"
        );
    }

    // Collaborators
    if config.backend.api_key.is_empty() {
        tracing::warn!("backend.api_key is empty; AI backend connections will likely be refused");
    }
    let connector = RealtimeConnector::new(config.backend.clone())
        .expect("invalid [backend] configuration");

    let actions: Arc<dyn ActionSink> = match &config.actions.webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "delivering side-channel actions to webhook");
            Arc::new(
                WebhookActionSink::new(
                    url.clone(),
                    Duration::from_millis(config.actions.webhook_timeout_ms),
                )
                .expect("failed to build action webhook client"),
            )
        }
        None => Arc::new(LoggingActionSink),
    };

    let settings = config
        .bridge_settings()
        .expect("invalid [bridge] configuration");
    let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let state = AppState {
        resolver: Arc::new(SqliteTenantResolver::new(pool)),
        registry: SessionRegistry::new(),
        connector: Arc::new(connector),
        prompts: Arc::new(TemplatePromptBuilder),
        actions,
        settings,
        events_tx,
    };

    tokio::spawn(start_sweep_task(Arc::new(state.clone())));

    // Build application
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting call bridge server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address: is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    tracing::info!("call bridge server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
