use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use shoplist_server::auth;
use shoplist_server::config::{generate_config_template, Config};
use shoplist_server::hub::Hub;
use shoplist_server::{routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("shoplist_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!(
        "Shopping list real-time server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let jwt_secret = auth::jwt::resolve_jwt_secret(&config.jwt_secret, &config.data_dir)?;

    let hub = Hub::start(config.hub.clone());
    tracing::info!(
        queue_capacity = config.hub.queue_capacity,
        max_connections = config.hub.max_connections,
        max_connections_per_user = config.hub.max_connections_per_user,
        "Hub started"
    );

    let app_state = state::AppState {
        hub: hub.clone(),
        jwt_secret,
    };
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, after closing every live connection so the
/// WebSocket sessions wind down with the server.
async fn shutdown_signal(hub: Arc<Hub>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    hub.shutdown();
}
