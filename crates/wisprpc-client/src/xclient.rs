//! Extended client: discovery-backed endpoint selection, a per-endpoint
//! client cache, and unicast/broadcast dispatch.

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use wisprpc_common::{Options, Result, RpcError};

use crate::client::Client;
use crate::discovery::{Discovery, SelectMode};
use crate::http::xdial;

/// A client over many endpoints. Picks one per call through its
/// [`Discovery`], keeps one cached [`Client`] per endpoint address, and can
/// fan a call out to every endpoint at once.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    options: Options,
    clients: Mutex<HashMap<String, Client>>,
}

impl<D: Discovery> XClient<D> {
    pub fn new(discovery: D, mode: SelectMode, options: Options) -> Self {
        XClient {
            discovery,
            mode,
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached client for `rpc_addr` when it is still available;
    /// otherwise drops the stale one and redials through [`xdial`].
    async fn dial(&self, rpc_addr: &str) -> Result<Client> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            debug!(addr = rpc_addr, "dropping unavailable cached client");
            if let Some(stale) = clients.remove(rpc_addr) {
                let _ = stale.close().await;
            }
        }
        let client = xdial(rpc_addr, self.options.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr<A, R>(&self, rpc_addr: &str, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let client = self.dial(rpc_addr).await?;
        client.call(service_method, args).await
    }

    /// Unicast call on one endpoint chosen by the discovery's selection mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, service_method, args).await
    }

    /// Calls every known endpoint concurrently.
    ///
    /// The first successful reply becomes the return value; later successes
    /// are dropped. The first error wins the returned `Result` and cancels
    /// the endpoints still in flight; a failed endpoint never contributes
    /// reply data. An empty endpoint set reports
    /// [`RpcError::NoAvailableServers`].
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send,
    {
        let servers = self.discovery.get_all().await?;
        let token = CancellationToken::new();
        let state: StdMutex<(Option<RpcError>, Option<R>)> = StdMutex::new((None, None));

        let calls = servers.iter().map(|rpc_addr| {
            let token = token.clone();
            let state = &state;
            async move {
                let result = tokio::select! {
                    _ = token.cancelled() => Err(RpcError::Cancelled),
                    result = self.call_addr::<A, R>(rpc_addr, service_method, args) => result,
                };
                let mut state = state.lock().unwrap();
                match result {
                    Ok(reply) => {
                        if state.1.is_none() {
                            state.1 = Some(reply);
                        }
                    }
                    Err(e) => {
                        if state.0.is_none() {
                            debug!(addr = %rpc_addr, "broadcast call failed: {}", e);
                            state.0 = Some(e);
                            token.cancel();
                        }
                    }
                }
            }
        });
        join_all(calls).await;

        let (first_err, first_reply) = state.into_inner().unwrap();
        match first_err {
            Some(e) => Err(e),
            None => first_reply.ok_or(RpcError::NoAvailableServers),
        }
    }

    /// Closes and removes every cached client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
    }
}
