//! boardcache-web - HTTP surface for boardcache using Axum

pub mod error;
pub mod router;

pub use error::ApiError;
pub use router::create_router;

use anyhow::{Context, Result};
use boardcache_core::DatabaseOrchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Run the web server until the process is stopped
pub async fn run(
    orchestrator: Arc<DatabaseOrchestrator>,
    addr: SocketAddr,
    allowed_origins: &[String],
) -> Result<()> {
    let router = create_router(orchestrator, allowed_origins);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Web server listening on http://{}", addr);

    axum::serve(listener, router).await?;

    Ok(())
}
