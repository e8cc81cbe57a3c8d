#![forbid(unsafe_code)]

//! IPC Transport (C4, spec.md §4.4): line-delimited JSON over a local stream socket.
//! Unix builds use `tokio::net::UnixListener`/`UnixStream`; the equivalent on Windows
//! is a named pipe, which `tokio::net` does not expose today, so that target is a
//! documented stub (spec.md Non-goals do not require Windows parity, only that the
//! host not silently corrupt state there).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

use kb_core::error::ErrorEnvelope;
use kb_core::protocol::{encode_line, AdapterCallKind, AdapterCallRequest, AdapterCallResponse};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("call timed out after {0}ms")]
    Timeout(u64),
    #[error("transport closed")]
    Closed,
    #[error("remote error: {0:?}")]
    Remote(ErrorEnvelope),
}

/// Default per-call timeout, spec.md §4.4.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

#[cfg(unix)]
mod unix_io {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};

    pub type Socket = UnixStream;

    pub async fn connect(path: &std::path::Path) -> std::io::Result<Socket> {
        UnixStream::connect(path).await
    }

    pub async fn bind(path: &std::path::Path) -> std::io::Result<UnixListener> {
        let _ = std::fs::remove_file(path);
        UnixListener::bind(path)
    }

    pub fn split(socket: Socket) -> (BufReader<tokio::net::unix::OwnedReadHalf>, tokio::net::unix::OwnedWriteHalf) {
        let (read, write) = socket.into_split();
        (BufReader::new(read), write)
    }

    pub use tokio::io::AsyncWriteExt as WriteExt;
    pub use AsyncBufReadExt as ReadExt;
}

#[cfg(not(unix))]
mod unix_io {
    //! Windows has no `tokio::net::UnixListener` equivalent wired up here; a real
    //! deployment needs `tokio::net::windows::named_pipe`. Left unimplemented rather
    //! than silently degraded, so a Windows build fails loudly instead of hanging.
    pub async fn connect(_path: &std::path::Path) -> std::io::Result<std::convert::Infallible> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "kb-sandbox IPC transport requires named pipes on Windows"))
    }
}

/// Client (child side): request multiplexing over a single socket (spec.md §4.4).
pub struct IpcClient {
    #[cfg(unix)]
    writer: Mutex<tokio::net::unix::OwnedWriteHalf>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<AdapterCallResponse>>>>,
    counter: AtomicU64,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(unix)]
impl IpcClient {
    pub async fn connect(socket_path: &std::path::Path) -> Result<Self, TransportError> {
        use tokio::io::AsyncBufReadExt;

        let socket = unix_io::connect(socket_path).await?;
        let (mut reader, writer) = unix_io::split(socket);
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<AdapterCallResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let pending_reader = pending.clone();
        let closed_reader = closed.clone();
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        // Ignore lines that do not parse (spec.md §4.4 framing rule).
                        if let Ok(resp) = serde_json::from_str::<AdapterCallResponse>(line.trim_end()) {
                            if let Some(tx) = pending_reader.lock().await.remove(&resp.request_id) {
                                let _ = tx.send(resp);
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            closed_reader.store(true, Ordering::SeqCst);
            // A dropped socket fails all pending calls (spec.md §4.4).
            let mut map = pending_reader.lock().await;
            for (_, tx) in map.drain() {
                drop(tx);
            }
        });

        Ok(Self { writer: Mutex::new(writer), pending, counter: AtomicU64::new(0), closed })
    }

    /// `requestId` is globally unique per client (spec.md §4.4).
    fn next_request_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        AdapterCallRequest::new_id(n)
    }

    pub async fn call(
        &self,
        adapter: &str,
        method: &str,
        args: Vec<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let request_id = self.next_request_id();
        let timeout_ms = timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS);
        let request = AdapterCallRequest {
            kind: AdapterCallKind::Call,
            request_id: request_id.clone(),
            adapter: adapter.to_string(),
            method: method.to_string(),
            args,
            timeout: Some(timeout_ms),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        let line = encode_line(&request).map_err(|e| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        {
            use tokio::io::AsyncWriteExt;
            let mut w = self.writer.lock().await;
            if let Err(e) = w.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&request_id);
                return Err(TransportError::Io(e));
            }
        }

        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(resp)) => match resp.error {
                Some(envelope) => Err(TransportError::Remote(envelope)),
                None => Ok(resp.result.unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(TransportError::Timeout(timeout_ms))
            }
        }
    }

    /// Fails all outstanding pending entries with a cancellation error and releases
    /// the socket (spec.md §4.4 `close()`).
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut map = self.pending.lock().await;
        for (_, tx) in map.drain() {
            drop(tx);
        }
    }
}

/// Server (host side): dispatches `adapter` to a registered service and `method` to a
/// member; preserves `requestId` on the response (spec.md §4.4).
#[async_trait::async_trait]
pub trait AdapterService: Send + Sync {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ErrorEnvelope>;
}

#[derive(Default)]
pub struct IpcServer {
    services: HashMap<String, Arc<dyn AdapterService>>,
}

impl IpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: impl Into<String>, service: Arc<dyn AdapterService>) {
        self.services.insert(adapter.into(), service);
    }

    /// Dispatch one decoded request to its registered service, synthesising an
    /// `error` response from any service failure (spec.md §4.4).
    pub async fn dispatch(&self, request: AdapterCallRequest) -> AdapterCallResponse {
        use kb_core::protocol::AdapterResponseKind;

        let outcome = match self.services.get(&request.adapter) {
            Some(service) => service.call(&request.method, request.args).await,
            None => Err(ErrorEnvelope {
                name: "Error".to_string(),
                message: format!("no adapter registered for '{}'", request.adapter),
                code: "INTERNAL_ERROR".to_string(),
                details: None,
                stack: None,
            }),
        };
        match outcome {
            Ok(result) => AdapterCallResponse {
                kind: AdapterResponseKind::Response,
                request_id: request.request_id,
                result: Some(result),
                error: None,
            },
            Err(error) => AdapterCallResponse {
                kind: AdapterResponseKind::Response,
                request_id: request.request_id,
                result: None,
                error: Some(error),
            },
        }
    }

    #[cfg(unix)]
    pub async fn serve_unix(self: Arc<Self>, path: &std::path::Path) -> Result<(), TransportError> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let listener = unix_io::bind(path).await?;
        loop {
            let (socket, _addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut reader = BufReader::new(read);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let Ok(request) = serde_json::from_str::<AdapterCallRequest>(line.trim_end()) else {
                                continue;
                            };
                            let response = server.dispatch(request).await;
                            if let Ok(out) = encode_line(&response) {
                                if write.write_all(out.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            });
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct EchoService;

    #[async_trait::async_trait]
    impl AdapterService for EchoService {
        async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ErrorEnvelope> {
            if method == "fail" {
                return Err(ErrorEnvelope {
                    name: "Error".into(),
                    message: "boom".into(),
                    code: "INTERNAL_ERROR".into(),
                    details: None,
                    stack: None,
                });
            }
            Ok(serde_json::json!({ "method": method, "args": args }))
        }
    }

    #[tokio::test]
    async fn client_server_round_trip() {
        let dir = tempdir().expect("tempdir");
        let socket_path = dir.path().join("kb-test.sock");

        let mut server = IpcServer::new();
        server.register("echo", Arc::new(EchoService));
        let server = Arc::new(server);
        let serve_path = socket_path.clone();
        let server_clone = server.clone();
        tokio::spawn(async move {
            let _ = server_clone.serve_unix(&serve_path).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = IpcClient::connect(&socket_path).await.expect("connect");
        let result = client.call("echo", "ping", vec![serde_json::json!(1)], None).await.expect("call");
        assert_eq!(result["method"], "ping");
    }

    #[tokio::test]
    async fn client_surfaces_remote_error() {
        let dir = tempdir().expect("tempdir");
        let socket_path = dir.path().join("kb-test-err.sock");

        let mut server = IpcServer::new();
        server.register("echo", Arc::new(EchoService));
        let server = Arc::new(server);
        let serve_path = socket_path.clone();
        tokio::spawn(async move {
            let _ = server.serve_unix(&serve_path).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = IpcClient::connect(&socket_path).await.expect("connect");
        let err = client.call("echo", "fail", vec![], None).await.unwrap_err();
        assert!(matches!(err, TransportError::Remote(_)));
    }

    #[tokio::test]
    async fn close_fails_pending_calls() {
        let dir = tempdir().expect("tempdir");
        let socket_path = dir.path().join("kb-test-close.sock");
        let mut server = IpcServer::new();
        server.register("echo", Arc::new(EchoService));
        let server = Arc::new(server);
        let serve_path = socket_path.clone();
        tokio::spawn(async move {
            let _ = server.serve_unix(&serve_path).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = Arc::new(IpcClient::connect(&socket_path).await.expect("connect"));
        client.close().await;
        let err = client.call("echo", "ping", vec![], None).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
