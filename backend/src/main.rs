use backend::{app, AppState, Config};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Honor RUST_LOG if provided.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(2);
        }
    };
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config).await;

    info!(%bind_addr, "starting server");
    axum::serve(
        tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("bind"),
        app(state),
    )
    .await
    .expect("server error");
}
