//! Dialers: the HTTP-CONNECT tunnel and the `proto@addr` front door.

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use wisprpc_common::protocol::{CONNECTED_STATUS, DEFAULT_RPC_PATH};
use wisprpc_common::{Options, Result, RpcError};

use crate::client::{finish_dial, Client};

/// Upper bound on the tunnel's HTTP response head (8 KB).
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Dials an RPC server reached through its HTTP acceptor.
///
/// Writes a literal `CONNECT` request, verifies the
/// `200 Connected to Gee RPC` status line, then runs the normal handshake on
/// the tunneled stream. Bounded by the options' connect-timeout like every
/// other dialer.
pub async fn dial_http(addr: &str, options: Options) -> Result<Client> {
    let timeout = options.connect_timeout();
    finish_dial(
        async move {
            let mut stream = TcpStream::connect(addr).await.map_err(|e| {
                RpcError::Connection(format!("failed to connect to {}: {}", addr, e))
            })?;
            let request = format!(
                "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n",
                DEFAULT_RPC_PATH, addr
            );
            stream.write_all(request.as_bytes()).await?;

            let head = read_response_head(&mut stream).await?;
            let status_line = head.lines().next().unwrap_or("");
            if !status_line.contains(CONNECTED_STATUS) {
                return Err(RpcError::Connection(format!(
                    "unexpected HTTP response: {}",
                    status_line
                )));
            }
            Client::connect(stream, options).await
        },
        timeout,
    )
    .await
}

/// Dials an endpoint in `"proto@addr"` form: `http` goes through the
/// CONNECT tunnel, `unix` over a unix socket, anything else over plain TCP.
pub async fn xdial(rpc_addr: &str, options: Options) -> Result<Client> {
    let (protocol, addr) = rpc_addr.split_once('@').ok_or_else(|| {
        RpcError::InvalidAddress(format!("wrong format '{}', expect protocol@addr", rpc_addr))
    })?;
    match protocol {
        "http" => dial_http(addr, options).await,
        #[cfg(unix)]
        "unix" => Client::dial_unix(addr, options).await,
        _ => Client::dial(addr, options).await,
    }
}

/// Reads the HTTP response head byte by byte up to the blank line, leaving
/// the tunneled stream exactly at the first RPC byte.
async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        head.push(byte);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(RpcError::Connection(format!(
                "http response head exceeds {} bytes",
                MAX_HEAD_BYTES
            )));
        }
    }
    String::from_utf8(head)
        .map_err(|e| RpcError::Connection(format!("invalid response head: {}", e)))
}
