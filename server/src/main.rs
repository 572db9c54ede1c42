use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syncjam_server::config::Config;
use syncjam_server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncjam_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(?config, "starting room server");

    let state = AppState::build(&config).await;
    syncjam_server::run(config.port, state).await
}
