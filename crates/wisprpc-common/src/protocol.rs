//! Protocol data model: the per-message header, the handshake record and the
//! wire constants shared by client, server and registry.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol-identity constant. The first record on every connection carries
/// it; a listener that reads anything else closes the connection.
pub const MAGIC_NUMBER: i32 = 0x3bef5c;

/// Content-type tag of the binary codec (the default).
pub const BINARY_CONTENT_TYPE: &str = "application/postcard";

/// Content-type tag of the JSON codec.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Path the HTTP acceptor tunnels RPC connections on.
pub const DEFAULT_RPC_PATH: &str = "/_geeprc_";

/// Path of the HTML debug page listing services and call counts.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/geerpc";

/// Path the registry service mounts its heartbeat endpoint on.
pub const DEFAULT_REGISTRY_PATH: &str = "/_geerpc_/registry";

/// Request header carrying one endpoint address on a registry POST.
pub const REGISTRY_SERVER_HEADER: &str = "X-Geerpc-Server";

/// Response header carrying the comma-separated alive endpoints on a GET.
pub const REGISTRY_SERVERS_HEADER: &str = "X-Geerpc-Servers";

/// Status line body the HTTP acceptor answers a CONNECT with. The dialer
/// checks for it verbatim before starting the RPC handshake.
pub const CONNECTED_STATUS: &str = "200 Connected to Gee RPC";

/// Default bound on dial-plus-handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-message header.
///
/// A request and its response share the same `seq`; the client assigns it and
/// uses it to match responses read off the connection back to in-flight
/// calls. `error` is empty on requests and on successful responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    /// Dotted `"Service.Method"` identifier selecting the handler.
    pub service_method: String,
    /// Client-assigned sequence number, starting at 1.
    pub seq: u64,
    /// Error reported by the server, empty when the call succeeded.
    pub error: String,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Header {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }
}

/// Handshake record written as one JSON line at the head of every new
/// connection, before the negotiated codec touches the stream.
///
/// Durations travel as integer milliseconds; zero disables the respective
/// timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    /// Must equal [`MAGIC_NUMBER`] or the listener rejects the connection.
    pub magic_number: i32,
    /// Content-type tag selecting the codec, e.g. `"application/postcard"`.
    pub codec_type: String,
    /// Client-side bound on dial-plus-handshake, in milliseconds (0 = none).
    #[serde(rename = "ConnectTimeout")]
    pub connect_timeout_ms: u64,
    /// Server-side bound on handling one request, in milliseconds (0 = none).
    #[serde(rename = "HandleTimeout")]
    pub handle_timeout_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            magic_number: MAGIC_NUMBER,
            codec_type: BINARY_CONTENT_TYPE.to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            handle_timeout_ms: 0,
        }
    }
}

impl Options {
    /// Options selecting the JSON codec instead of the binary default.
    pub fn json() -> Self {
        Options {
            codec_type: JSON_CONTENT_TYPE.to_string(),
            ..Options::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handle_timeout(&self) -> Duration {
        Duration::from_millis(self.handle_timeout_ms)
    }
}
