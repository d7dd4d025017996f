//! HTTP acceptor: tunnels the RPC byte-stream protocol through an HTTP
//! CONNECT and serves the debug page.
//!
//! The CONNECT reply is the fixed status line
//! `HTTP/1.0 200 Connected to Gee RPC` that dialers check verbatim, so the
//! request head is parsed off the raw stream here instead of going through an
//! HTTP framework; after the reply the stream is handed to the normal serve
//! routine unchanged.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use wisprpc_common::protocol::{CONNECTED_STATUS, DEFAULT_DEBUG_PATH};
use wisprpc_common::{Result, RpcError};

use crate::server::Server;

/// Upper bound on an HTTP request head (8 KB).
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Accepts HTTP connections until the listener fails.
///
/// `CONNECT` requests are hijacked into RPC connections; `GET` on the debug
/// path renders the service table; anything else gets a `405`.
pub async fn serve_http(server: Arc<Server>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("http accept error: {}", e);
                return;
            }
        };
        debug!(%peer, "http connection established");
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = handle_http(server, stream).await {
                warn!("http connection error: {}", e);
            }
        });
    }
}

async fn handle_http(server: Arc<Server>, mut stream: TcpStream) -> Result<()> {
    let head = read_request_head(&mut stream).await?;
    let request_line = head.lines().next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    match method {
        "CONNECT" => {
            let reply = format!("HTTP/1.0 {}\r\n\r\n", CONNECTED_STATUS);
            stream.write_all(reply.as_bytes()).await?;
            server.serve_stream(stream).await;
            Ok(())
        }
        "GET" if path == DEFAULT_DEBUG_PATH => {
            let body = debug_page(&server);
            write_response(&mut stream, "200 OK", "text/html; charset=utf-8", &body).await
        }
        _ => {
            write_response(
                &mut stream,
                "405 Method Not Allowed",
                "text/plain; charset=utf-8",
                "405 must CONNECT\n",
            )
            .await
        }
    }
}

/// Reads the request head byte by byte up to the blank line, so no payload
/// bytes past the head are consumed.
async fn read_request_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        head.push(byte);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(RpcError::Connection(format!(
                "http request head exceeds {} bytes",
                MAX_HEAD_BYTES
            )));
        }
    }
    String::from_utf8(head).map_err(|e| RpcError::Connection(format!("invalid request head: {}", e)))
}

async fn write_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &str,
) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Renders the registered services and their call counts as HTML.
fn debug_page(server: &Server) -> String {
    let mut page = String::from(
        "<html><head><title>wisp-rpc services</title></head><body>\n<h1>Services</h1>\n",
    );
    for service in server.services() {
        page.push_str(&format!("<h2>{}</h2>\n", service.name()));
        page.push_str("<table border=\"1\">\n<tr><th>Method</th><th>Calls</th></tr>\n");
        for method in service.methods() {
            page.push_str(&format!(
                "<tr><td>{}.{}</td><td>{}</td></tr>\n",
                service.name(),
                method.name(),
                method.num_calls()
            ));
        }
        page.push_str("</table>\n");
    }
    page.push_str("</body></html>\n");
    page
}
