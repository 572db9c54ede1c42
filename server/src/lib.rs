pub mod app_state;
pub mod config;
pub mod coordinator;
pub mod handlers;
pub mod registry;
pub mod resolver;
pub mod routes;
pub mod snapshot;
pub mod stream;

use std::net::SocketAddr;

pub use app_state::AppState;

pub async fn run(port: u16, state: app_state::SharedState) -> anyhow::Result<()> {
    let app = routes::create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
