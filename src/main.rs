use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wizard_stream_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = wizard_stream_relay::build_state()?;
    let addr = state.config.listen_addr;
    let app = wizard_stream_relay::build_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "stream relay listening");

    axum::serve(listener, app).await?;
    Ok(())
}
