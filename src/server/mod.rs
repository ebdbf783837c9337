pub mod api;

use anyhow::Result;

/// Run the broadcast relay on `0.0.0.0:port` until the task is dropped.
pub async fn start(port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    api::serve(listener).await
}
