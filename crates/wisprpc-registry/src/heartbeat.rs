//! Client-side heartbeat helper for servers registering themselves.

use std::time::Duration;
use tracing::{debug, warn};

use wisprpc_common::protocol::REGISTRY_SERVER_HEADER;
use wisprpc_common::{Result, RpcError};

use crate::registry::DEFAULT_TTL;

/// Registers `addr` with the registry at `registry` and keeps it alive.
///
/// The first heartbeat is sent before returning, so a misconfigured registry
/// URL surfaces immediately. A background task then repeats the send every
/// `period` (default: registry TTL minus one minute) and stops on the first
/// failure.
pub async fn heartbeat(registry: &str, addr: &str, period: Option<Duration>) -> Result<()> {
    let period = period.unwrap_or(DEFAULT_TTL - Duration::from_secs(60));
    let client = reqwest::Client::new();
    send_heartbeat(&client, registry, addr).await?;

    let registry = registry.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The interval fires immediately once; that beat was already sent.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&client, &registry, &addr).await {
                warn!(%registry, %addr, "heartbeat failed, stopping: {}", e);
                return;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(client: &reqwest::Client, registry: &str, addr: &str) -> Result<()> {
    debug!(%addr, %registry, "send heartbeat to registry");
    let response = client
        .post(registry)
        .header(REGISTRY_SERVER_HEADER, addr)
        .send()
        .await
        .map_err(|e| RpcError::Registry(format!("heartbeat to {} failed: {}", registry, e)))?;
    if !response.status().is_success() {
        return Err(RpcError::Registry(format!(
            "heartbeat to {} rejected: {}",
            registry,
            response.status()
        )));
    }
    Ok(())
}
