//! The multiplexing RPC client.
//!
//! One connection carries any number of concurrent calls: the client assigns
//! each outbound request a strictly increasing sequence number, keeps the
//! in-flight calls in a pending map, and a dedicated receive task matches
//! responses back by sequence. Two locks guard the shared state: the send
//! mutex serializes codec writes, the status mutex protects the pending map
//! and the lifecycle flags. When both are needed they are taken in
//! send-then-status order everywhere, including the terminate path.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use wisprpc_common::codec::{self, CodecKind, FrameReader, FrameWriter};
use wisprpc_common::{Header, Options, Result, RpcError};

type BoxReader = FrameReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Either the encoded reply bytes or the error that ended the call.
type CallOutcome = Result<Vec<u8>>;

struct ClientState {
    /// Next sequence number to assign; starts at 1, never reused.
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<CallOutcome>>,
    /// Set by `close`.
    closing: bool,
    /// Set when the transport failed underneath us.
    shutdown: bool,
}

struct ClientCore {
    /// Send mutex; held across the whole codec write.
    writer: Mutex<BoxWriter>,
    /// Status mutex.
    state: StdMutex<ClientState>,
    kind: CodecKind,
}

impl ClientCore {
    fn register_call(&self) -> Result<(u64, oneshot::Receiver<CallOutcome>)> {
        let mut state = self.state.lock().unwrap();
        if state.closing || state.shutdown {
            return Err(RpcError::Shutdown);
        }
        let seq = state.seq;
        state.seq += 1;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(seq, tx);
        Ok((seq, rx))
    }

    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<CallOutcome>> {
        self.state.lock().unwrap().pending.remove(&seq)
    }

    /// Fails every in-flight call and marks the transport dead. Takes the
    /// send mutex before the status mutex, the one ordering used everywhere.
    async fn terminate_calls(&self, err: RpcError) {
        let _sending = self.writer.lock().await;
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        let msg = err.to_string();
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(RpcError::Connection(msg.clone())));
        }
    }
}

/// A connection to one RPC server, cheap to clone and safe to share across
/// tasks.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    /// Wraps an established duplex stream: validates the codec choice, writes
    /// the handshake record, and starts the receive task.
    pub async fn connect<S>(stream: S, options: Options) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let kind = CodecKind::from_content_type(&options.codec_type)
            .ok_or_else(|| RpcError::UnknownCodec(options.codec_type.clone()))?;

        let (read_half, mut write_half) = tokio::io::split(stream);
        codec::write_handshake(&mut write_half, &options).await?;

        let reader = FrameReader::new(
            Box::new(read_half) as Box<dyn AsyncRead + Send + Unpin>,
            kind,
        );
        let writer = FrameWriter::new(
            Box::new(write_half) as Box<dyn AsyncWrite + Send + Unpin>,
            kind,
        );
        let core = Arc::new(ClientCore {
            writer: Mutex::new(writer),
            state: StdMutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            kind,
        });
        tokio::spawn(receive(reader, Arc::downgrade(&core)));
        Ok(Client { core })
    }

    /// Dials a TCP endpoint and performs the handshake, bounded by the
    /// options' connect-timeout (0 = unlimited).
    pub async fn dial(addr: &str, options: Options) -> Result<Client> {
        let timeout = options.connect_timeout();
        finish_dial(
            async move {
                let stream = TcpStream::connect(addr).await.map_err(|e| {
                    RpcError::Connection(format!("failed to connect to {}: {}", addr, e))
                })?;
                Client::connect(stream, options).await
            },
            timeout,
        )
        .await
    }

    /// Dials a unix-socket endpoint, with the same timeout handling as
    /// [`Client::dial`].
    #[cfg(unix)]
    pub async fn dial_unix(path: &str, options: Options) -> Result<Client> {
        let timeout = options.connect_timeout();
        finish_dial(
            async move {
                let stream = tokio::net::UnixStream::connect(path).await.map_err(|e| {
                    RpcError::Connection(format!("failed to connect to {}: {}", path, e))
                })?;
                Client::connect(stream, options).await
            },
            timeout,
        )
        .await
    }

    /// Starts an asynchronous call. The returned handle resolves to the
    /// typed reply; dropping it before completion deregisters the call, so a
    /// caller that gives up stops occupying the pending map and any late
    /// response is drained on arrival.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> Result<CallHandle<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = self.core.kind.encode(args)?;

        let mut writer = self.core.writer.lock().await;
        let (seq, rx) = self.core.register_call()?;
        let header = Header::request(service_method, seq);
        if let Err(e) = writer.write_raw(&header, &body).await {
            self.core.remove_call(seq);
            return Err(e);
        }
        drop(writer);

        Ok(CallHandle {
            seq,
            rx,
            core: Arc::clone(&self.core),
            finished: false,
            _reply: PhantomData,
        })
    }

    /// Synchronous call: sends the request and waits for its completion.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await?.recv().await
    }

    /// Like [`Client::call`] but gives up after `timeout` (0 = no limit).
    /// On expiry the pending entry is removed and the connection stays
    /// usable; the server may still finish work nobody observes.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let handle = self.go(service_method, args).await?;
        if timeout.is_zero() {
            return handle.recv().await;
        }
        match tokio::time::timeout(timeout, handle.recv()).await {
            Ok(result) => result,
            // The timed-out future owned the handle; dropping it removed the
            // pending entry.
            Err(_) => Err(RpcError::CallTimeout),
        }
    }

    /// True while the client is neither user-closed nor transport-shutdown.
    pub fn is_available(&self) -> bool {
        let state = self.core.state.lock().unwrap();
        !state.closing && !state.shutdown
    }

    /// Closes the connection. Further submissions fail with
    /// [`RpcError::Shutdown`]; calling close again reports the same error.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.core.state.lock().unwrap();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        debug!("client closing");
        let mut writer = self.core.writer.lock().await;
        writer.shutdown().await
    }
}

/// Runs `dial` to completion, bounded by `timeout` unless it is zero. On
/// expiry the in-flight dial future is dropped, which closes any nascent
/// connection.
pub(crate) async fn finish_dial<F>(dial: F, timeout: Duration) -> Result<Client>
where
    F: Future<Output = Result<Client>>,
{
    if timeout.is_zero() {
        return dial.await;
    }
    match tokio::time::timeout(timeout, dial).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::ConnectTimeout(timeout.as_millis() as u64)),
    }
}

/// An in-flight call. Resolves to the typed reply via
/// [`recv`](CallHandle::recv); dropping it unresolved cancels the call
/// client-side.
pub struct CallHandle<R> {
    seq: u64,
    rx: oneshot::Receiver<CallOutcome>,
    core: Arc<ClientCore>,
    finished: bool,
    _reply: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> CallHandle<R> {
    /// The sequence number this call was sent under.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Waits for the response and decodes it.
    pub async fn recv(mut self) -> Result<R> {
        let outcome = (&mut self.rx).await;
        self.finished = true;
        match outcome {
            Ok(Ok(bytes)) => self.core.kind.decode(&bytes),
            Ok(Err(e)) => Err(e),
            // The sender side only disappears when the core is torn down.
            Err(_) => Err(RpcError::Shutdown),
        }
    }
}

impl<R> Drop for CallHandle<R> {
    fn drop(&mut self) {
        if !self.finished {
            self.core.remove_call(self.seq);
        }
    }
}

/// The receive task: reads responses until the transport fails, then fails
/// every remaining pending call. Holds only a weak reference to the client
/// core so an abandoned client tears the connection down.
async fn receive(mut reader: BoxReader, core: Weak<ClientCore>) {
    let err = loop {
        let header = match reader.read_header().await {
            Ok(header) => header,
            Err(e) => break e,
        };
        let Some(core) = core.upgrade() else { return };
        let tx = core.remove_call(header.seq);
        match tx {
            // Already removed: the caller cancelled or timed out. The body
            // must still be consumed or the stream would be mis-framed.
            None => {
                debug!(seq = header.seq, "dropping response for removed call");
                if let Err(e) = reader.discard_body().await {
                    break e;
                }
            }
            Some(tx) if !header.error.is_empty() => {
                let result = reader.discard_body().await;
                let _ = tx.send(Err(RpcError::Remote(header.error)));
                if let Err(e) = result {
                    break e;
                }
            }
            Some(tx) => match reader.read_body_bytes().await {
                Ok(bytes) => {
                    let _ = tx.send(Ok(bytes));
                }
                Err(e) => {
                    let _ = tx.send(Err(RpcError::Connection(format!("reading body: {}", e))));
                    break e;
                }
            },
        }
    };
    if let Some(core) = core.upgrade() {
        let closing = core.state.lock().unwrap().closing;
        if !closing {
            warn!("receive loop ended: {}", err);
        }
        core.terminate_calls(err).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    /// A hand-rolled peer that answers `Echo.Ping` with its own argument and
    /// anything else with a header error.
    async fn echo_peer<S>(stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut buffered = BufReader::new(read_half);
        let options = codec::read_handshake(&mut buffered).await.unwrap();
        let kind = CodecKind::from_content_type(&options.codec_type).unwrap();
        let mut reader = FrameReader::from_buffered(buffered, kind);
        let mut writer = FrameWriter::new(write_half, kind);

        loop {
            let mut header = match reader.read_header().await {
                Ok(header) => header,
                Err(_) => return,
            };
            let body = reader.read_body_bytes().await.unwrap();
            if header.service_method == "Echo.Ping" {
                writer.write_raw(&header, &body).await.unwrap();
            } else {
                header.error = format!("can't find {}", header.service_method);
                let placeholder = kind.encode(&()).unwrap();
                writer.write_raw(&header, &placeholder).await.unwrap();
            }
        }
    }

    async fn echo_client() -> Client {
        let (client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(echo_peer(server_side));
        Client::connect(client_side, Options::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let client = echo_client().await;
        let reply: u64 = client.call("Echo.Ping", &17u64).await.unwrap();
        assert_eq!(reply, 17);
    }

    #[tokio::test]
    async fn test_remote_error_surfaces() {
        let client = echo_client().await;
        let err = client.call::<u64, u64>("Echo.Nope", &1).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(_)));
        assert!(err.to_string().contains("Echo.Nope"));
    }

    #[tokio::test]
    async fn test_seq_is_unique_and_monotonic() {
        let client = echo_client().await;
        let mut last = 0;
        for _ in 0..10 {
            let handle = client.go::<u64, u64>("Echo.Ping", &1).await.unwrap();
            assert!(handle.seq() > last);
            last = handle.seq();
            handle.recv().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_rejects_new_calls() {
        let client = echo_client().await;
        client.close().await.unwrap();
        assert!(!client.is_available());
        assert!(matches!(
            client.call::<u64, u64>("Echo.Ping", &1).await,
            Err(RpcError::Shutdown)
        ));
        // A second close reports shutdown as well.
        assert!(matches!(client.close().await, Err(RpcError::Shutdown)));
    }

    #[tokio::test]
    async fn test_peer_failure_terminates_pending_calls() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        // A peer that reads the handshake and hangs up without answering.
        tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(server_side);
            let mut buffered = BufReader::new(read_half);
            let _ = codec::read_handshake(&mut buffered).await;
            drop((buffered, write_half));
        });
        let client = Client::connect(client_side, Options::default()).await.unwrap();

        let err = client.call::<u64, u64>("Echo.Ping", &1).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Connection(_) | RpcError::Io(_) | RpcError::Shutdown
        ));
        // The receive task notices the dead transport and marks the client
        // unavailable.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!client.is_available());
    }

    #[tokio::test]
    async fn test_connect_timeout_bounds_slow_dials() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let client = echo_client().await;
            Ok(client)
        };
        match finish_dial(slow, Duration::from_millis(50)).await {
            Err(RpcError::ConnectTimeout(ms)) => assert_eq!(ms, 50),
            other => panic!("expected ConnectTimeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_zero_connect_timeout_means_no_limit() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(echo_client().await)
        };
        assert!(finish_dial(slow, Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_handle_deregisters_and_late_reply_is_drained() {
        let client = echo_client().await;
        let handle = client.go::<u64, u64>("Echo.Ping", &5).await.unwrap();
        drop(handle);
        // The echoed response for the dropped call must be drained without
        // disturbing the next call on the same connection.
        let reply: u64 = client.call("Echo.Ping", &6).await.unwrap();
        assert_eq!(reply, 6);
    }

    #[tokio::test]
    async fn test_unknown_codec_type_fails_fast() {
        let (client_side, _server_side) = tokio::io::duplex(64);
        let options = Options {
            codec_type: "application/gob".to_string(),
            ..Options::default()
        };
        assert!(matches!(
            Client::connect(client_side, options).await,
            Err(RpcError::UnknownCodec(_))
        ));
    }
}
