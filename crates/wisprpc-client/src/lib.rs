//! wisp-rpc Client
//!
//! The calling half of the framework: a multiplexing [`Client`] that
//! pipelines concurrent calls over one connection, dialers for plain TCP,
//! unix sockets and the HTTP-CONNECT tunnel, a [`Discovery`] layer over the
//! heartbeat registry, and the extended [`XClient`] combining discovery,
//! per-endpoint connection caching, and unicast/broadcast dispatch.
//!
//! # Example
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use wisprpc_client::Client;
//! use wisprpc_common::Options;
//!
//! #[derive(Serialize, Deserialize)]
//! struct SumArgs { num1: i64, num2: i64 }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::dial("127.0.0.1:9999", Options::default()).await?;
//! let sum: i64 = client.call("Arith.Sum", &SumArgs { num1: 1, num2: 3 }).await?;
//! assert_eq!(sum, 4);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod discovery;
pub mod http;
pub mod xclient;

pub use client::{CallHandle, Client};
pub use discovery::{Discovery, MultiServerDiscovery, RegistryDiscovery, SelectMode};
pub use http::{dial_http, xdial};
pub use xclient::XClient;
