//! wisp-rpc Server
//!
//! The serving half of the framework: a catalog of named services exposing
//! typed method handlers, a connection server that performs the handshake and
//! dispatches framed requests to handler tasks, and an HTTP acceptor that
//! tunnels the byte-stream protocol through an HTTP CONNECT.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use wisprpc_server::{Server, Service};
//!
//! #[derive(Deserialize, Serialize)]
//! struct SumArgs { num1: i64, num2: i64 }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = Service::builder("Arith")
//!     .method("Sum", |args: SumArgs| async move { Ok(args.num1 + args.num2) })
//!     .build();
//!
//! let server = Arc::new(Server::new());
//! server.register(service)?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! server.serve(listener).await;
//! # Ok(())
//! # }
//! ```

pub mod http;
pub mod server;
pub mod service;

pub use http::serve_http;
pub use server::Server;
pub use service::{Method, Service, ServiceBuilder};
