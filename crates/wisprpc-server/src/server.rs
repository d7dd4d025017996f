//! Connection server: accept loop, handshake, request dispatch.
//!
//! Each accepted connection runs in its own task. After the handshake the
//! serve loop reads `(header, body)` pairs and spawns one handler task per
//! request; a shared write mutex keeps response frames contiguous on the
//! wire, and the loop drains outstanding handlers before the connection
//! closes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use wisprpc_common::codec::{self, CodecKind, FrameReader, FrameWriter};
use wisprpc_common::protocol::MAGIC_NUMBER;
use wisprpc_common::{Header, Result, RpcError};

use crate::service::{Method, Service};

/// The RPC server: a concurrent map of registered services plus the default
/// handle-timeout applied when a client's handshake does not set one.
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
    handle_timeout: Duration,
}

impl Server {
    pub fn new() -> Self {
        Server {
            services: RwLock::new(HashMap::new()),
            handle_timeout: Duration::ZERO,
        }
    }

    /// A server whose requests are bounded by `timeout` whenever the client's
    /// handshake leaves the handle-timeout at zero.
    pub fn with_handle_timeout(timeout: Duration) -> Self {
        Server {
            services: RwLock::new(HashMap::new()),
            handle_timeout: timeout,
        }
    }

    /// Registers a service under its name.
    ///
    /// The name must start with an uppercase letter (the exported-name rule)
    /// and must not already be registered.
    pub fn register(&self, service: Service) -> Result<()> {
        if !service
            .name()
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase())
        {
            return Err(RpcError::InvalidServiceName(service.name().to_string()));
        }
        let mut services = self.services.write().unwrap();
        if services.contains_key(service.name()) {
            return Err(RpcError::DuplicateService(service.name().to_string()));
        }
        debug!(service = service.name(), "registered service");
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Snapshot of the registered services, sorted by name.
    pub fn services(&self) -> Vec<Arc<Service>> {
        let services = self.services.read().unwrap();
        let mut all: Vec<_> = services.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Resolves a dotted `"Service.Method"` identifier.
    fn find(&self, service_method: &str) -> Result<(Arc<Service>, Arc<Method>)> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| RpcError::InvalidServiceMethod(service_method.to_string()))?;
        let service = {
            let services = self.services.read().unwrap();
            services
                .get(service_name)
                .cloned()
                .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?
        };
        let method = service
            .method(method_name)
            .ok_or_else(|| RpcError::MethodNotFound {
                service: service_name.to_string(),
                method: method_name.to_string(),
            })?;
        Ok((service, method))
    }

    /// Accepts connections until the listener fails, serving each one in its
    /// own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept error: {}", e);
                    return;
                }
            };
            debug!(%peer, "connection established");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.serve_stream(stream).await;
            });
        }
    }

    /// Serves one established duplex stream: handshake, then the request
    /// loop. Any handshake failure closes the connection after logging; the
    /// stream is dropped (and so closed) on every exit path.
    pub async fn serve_stream<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let options = match codec::read_handshake(&mut reader).await {
            Ok(options) => options,
            Err(e) => {
                warn!("options error: {}", e);
                return;
            }
        };
        if options.magic_number != MAGIC_NUMBER {
            warn!("magic number error: {:#x}", options.magic_number);
            return;
        }
        let Some(kind) = CodecKind::from_content_type(&options.codec_type) else {
            warn!("invalid codec type {}", options.codec_type);
            return;
        };

        let handle_timeout = if options.handle_timeout().is_zero() {
            self.handle_timeout
        } else {
            options.handle_timeout()
        };

        let reader = FrameReader::from_buffered(reader, kind);
        let writer = Arc::new(Mutex::new(FrameWriter::new(write_half, kind)));
        self.serve_codec(reader, writer, handle_timeout).await;
    }

    /// The request loop. Reads one `(header, raw body)` pair at a time,
    /// resolves the target and spawns a handler task for it. Reading stays
    /// single-threaded per connection; responses go through the shared write
    /// mutex in whatever order handlers finish.
    async fn serve_codec<R, W>(
        self: Arc<Self>,
        mut reader: FrameReader<R>,
        writer: Arc<Mutex<FrameWriter<W>>>,
        handle_timeout: Duration,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let kind = writer.lock().await.kind();
        let mut handlers = JoinSet::new();
        loop {
            let mut header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) => {
                    if !is_disconnect(&e) {
                        warn!("read header error: {}", e);
                    }
                    break;
                }
            };
            // The body frame is consumed before resolution so a lookup
            // failure never leaves the stream mis-framed.
            let body = match reader.read_body_bytes().await {
                Ok(body) => body,
                Err(e) => {
                    warn!("read body error: {}", e);
                    break;
                }
            };
            let (_, method) = match self.find(&header.service_method) {
                Ok(found) => found,
                Err(e) => {
                    header.error = e.to_string();
                    send_response(&writer, &header, &placeholder(kind)).await;
                    continue;
                }
            };
            let writer = Arc::clone(&writer);
            handlers.spawn(handle_request(
                method,
                header,
                body,
                writer,
                kind,
                handle_timeout,
            ));
        }
        // Outstanding handlers still own responses; wait for them before the
        // write half goes away.
        while handlers.join_next().await.is_some() {}
        let mut writer = writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles a single request and sends its response.
///
/// The method future runs in its own spawned task so a timeout can be
/// observed even while the handler is busy. Only this racing task ever sends
/// the response, so a late handler completion cannot overwrite a timeout
/// response; the detached task keeps running and its result is dropped.
async fn handle_request<W>(
    method: Arc<Method>,
    mut header: Header,
    body: Vec<u8>,
    writer: Arc<Mutex<FrameWriter<W>>>,
    kind: CodecKind,
    timeout: Duration,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let call = {
        let method = Arc::clone(&method);
        tokio::spawn(async move { method.call(kind, body).await })
    };

    let outcome = if timeout.is_zero() {
        Some(call.await)
    } else {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => None,
            result = call => Some(result),
        }
    };

    match outcome {
        None => {
            header.error = format!("request handle timeout: expect within {:?}", timeout);
            send_response(&writer, &header, &placeholder(kind)).await;
        }
        Some(Ok(Ok(reply))) => {
            send_response(&writer, &header, &reply).await;
        }
        Some(Ok(Err(e))) => {
            debug!(
                method = %header.service_method,
                "method returned error: {}", e
            );
            header.error = e.to_string();
            send_response(&writer, &header, &placeholder(kind)).await;
        }
        Some(Err(join_err)) => {
            header.error = format!("method {} aborted: {}", header.service_method, join_err);
            send_response(&writer, &header, &placeholder(kind)).await;
        }
    }
}

/// Body stand-in for responses that only carry a header error.
fn placeholder(kind: CodecKind) -> Vec<u8> {
    kind.encode(&()).unwrap_or_default()
}

async fn send_response<W>(writer: &Mutex<FrameWriter<W>>, header: &Header, body: &[u8])
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_raw(header, body).await {
        warn!("write response error: {}", e);
    }
}

fn is_disconnect(e: &RpcError) -> bool {
    matches!(
        e,
        RpcError::Io(io) if matches!(
            io.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        )
    )
}
