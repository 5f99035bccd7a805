use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};
use tracksync_core::{Error, Result};

use crate::wire::{Request, Response};

/// Maximum accepted frame length, in bytes.
pub const MAX_FRAME: usize = 8 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// One live connection to a plugin.
///
/// Once the connection is gone every call fails with
/// `Error::TransportShutdown`.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

/// Opens new connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Arc<dyn RpcClient>>;
}

/// Dials a plugin over TCP.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    address: String,
}

impl TcpDialer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<Arc<dyn RpcClient>> {
        let client = LineClient::connect(&self.address).await?;
        Ok(Arc::new(client))
    }
}

// ---------------------------------------------------------------------------
// LineClient
// ---------------------------------------------------------------------------

type Waiter = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, Waiter>,
}

impl Pending {
    fn shut_down(&mut self) {
        self.closed = true;
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(Error::TransportShutdown));
        }
    }
}

/// A multiplexed newline-delimited JSON connection.
///
/// A writer task drains outgoing frames and a reader task routes replies
/// to their callers by request id.
pub struct LineClient {
    next_id: AtomicU64,
    outbound: mpsc::Sender<String>,
    pending: Arc<Mutex<Pending>>,
    tasks: [JoinHandle<()>; 2],
}

impl LineClient {
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::Transport(format!("connect {address}: {e}")))?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME));
        let (mut sink, mut frames) = framed.split();
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (outbound, mut rx) = mpsc::channel::<String>(64);

        let writer = {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    if let Err(e) = sink.send(line).await {
                        warn!(error = %e, "plugin connection write failed");
                        break;
                    }
                }
                if let Ok(mut p) = pending.lock() {
                    p.shut_down();
                }
            })
        };

        let reader = {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                while let Some(frame) = frames.next().await {
                    let line = match frame {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(error = %e, "plugin connection read failed");
                            break;
                        }
                    };
                    let resp: Response = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(error = %e, "discarding malformed plugin frame");
                            continue;
                        }
                    };
                    let waiter = pending.lock().ok().and_then(|mut p| p.waiters.remove(&resp.id));
                    match waiter {
                        Some(w) => {
                            let _ = w.send(resp.into_result());
                        }
                        None => debug!(id = resp.id, "reply for unknown request"),
                    }
                }
                if let Ok(mut p) = pending.lock() {
                    p.shut_down();
                }
            })
        };

        Self {
            next_id: AtomicU64::new(1),
            outbound,
            pending,
            tasks: [writer, reader],
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut p) = self.pending.lock() {
            p.waiters.remove(&id);
        }
    }
}

#[async_trait]
impl RpcClient for LineClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&Request {
            id,
            method: method.to_string(),
            params,
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut p = self.pending.lock().map_err(|_| Error::TransportShutdown)?;
            if p.closed {
                return Err(Error::TransportShutdown);
            }
            p.waiters.insert(id, tx);
        }

        debug!(id, method, "plugin call");
        if self.outbound.send(line).await.is_err() {
            self.forget(id);
            return Err(Error::TransportShutdown);
        }
        rx.await.unwrap_or(Err(Error::TransportShutdown))
    }
}

impl Drop for LineClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WireError;
    use tokio::net::TcpListener;

    async fn peer() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn replies_are_routed_by_id() {
        let (listener, addr) = peer().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());
            let mut reqs = Vec::new();
            for _ in 0..2 {
                let line = framed.next().await.unwrap().unwrap();
                reqs.push(serde_json::from_str::<Request>(&line).unwrap());
            }
            // answer out of order
            for req in reqs.into_iter().rev() {
                let resp = if req.method == "t.Fail" {
                    Response {
                        id: req.id,
                        result: None,
                        error: Some(WireError::new(crate::wire::ErrorCode::NotFound, "x")),
                    }
                } else {
                    Response::ok(req.id, req.params)
                };
                framed.send(serde_json::to_string(&resp).unwrap()).await.unwrap();
            }
        });

        let client = LineClient::connect(&addr).await.unwrap();
        let (ok, err) = tokio::join!(
            client.call("t.Echo", Value::from("hello")),
            client.call("t.Fail", Value::Null),
        );
        assert_eq!(ok.unwrap(), Value::from("hello"));
        assert!(err.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn eof_fails_pending_and_later_calls() {
        let (listener, addr) = peer().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());
            let _ = framed.next().await;
            drop(framed);
        });

        let client = LineClient::connect(&addr).await.unwrap();
        let err = client.call("t.Call", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::TransportShutdown), "{err:?}");
        let err = client.call("t.Call", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::TransportShutdown), "{err:?}");
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let (listener, addr) = peer().await;
        drop(listener);
        let err = TcpDialer::new(addr).dial().await.err().unwrap();
        assert!(matches!(err, Error::Transport(_)), "{err:?}");
    }
}
