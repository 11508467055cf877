use chat_stream_relay::config::RelayConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chat_stream_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(path) = dotenv {
        info!(path = %path.display(), "loaded environment file");
    }

    let config = RelayConfig::from_env();
    let addr = config.bind_addr;
    let state = chat_stream_relay::build_state(config)?;
    let app = chat_stream_relay::build_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "relay listening");

    axum::serve(listener, app).await?;
    Ok(())
}
