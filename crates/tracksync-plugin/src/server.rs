//! Plugin side of the wire protocol.
//!
//! A plugin binary wraps its [`Tracker`] implementation with [`serve`] and
//! the engine reaches it through [`crate::PluginTracker`].

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracksync_core::tracker::{CallRequest, SubscribeRequest, Tracker};
use tracksync_core::{Error, Result};

use crate::client::MAX_FRAME;
use crate::wire::{self, Request, Response, UnsubscribeParams, WebhookParams};

/// Serve `tracker` under `name` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    name: &str,
    tracker: Arc<dyn Tracker>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(tracker = name, addr = ?listener.local_addr().ok(), "plugin serving");
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        debug!(%peer, "engine connected");
        let conn = Connection {
            name: name.to_string(),
            tracker: Arc::clone(&tracker),
            cancel: cancel.child_token(),
        };
        tokio::spawn(async move {
            conn.run(stream).await;
            debug!(%peer, "engine disconnected");
        });
    }
    info!(tracker = name, "plugin stopped");
    Ok(())
}

struct Connection {
    name: String,
    tracker: Arc<dyn Tracker>,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(self, stream: TcpStream) {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME));
        let (mut sink, mut frames) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Response>(64);

        let writer = tokio::spawn(async move {
            while let Some(resp) = rx.recv().await {
                let line = match serde_json::to_string(&resp) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(error = %e, "cannot encode response");
                        continue;
                    }
                };
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        let this = Arc::new(self);
        loop {
            let frame = tokio::select! {
                _ = this.cancel.cancelled() => break,
                f = frames.next() => f,
            };
            let line = match frame {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!(error = %e, "bad frame from engine");
                    break;
                }
                None => break,
            };
            let req: Request = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "discarding malformed request");
                    continue;
                }
            };
            let conn = Arc::clone(&this);
            let tx = tx.clone();
            tokio::spawn(async move {
                let resp = match conn.dispatch(&req.method, req.params).await {
                    Ok(v) => Response::ok(req.id, v),
                    Err(e) => {
                        debug!(method = %req.method, error = %e, "request failed");
                        Response::err(req.id, &e)
                    }
                };
                let _ = tx.send(resp).await;
            });
        }
        drop(tx);
        let _ = writer.await;
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        let (target, op) =
            wire::split_method(method).ok_or_else(|| Error::MethodParseFailed(method.into()))?;
        if target != self.name {
            return Err(Error::UnsupportedMethod {
                tracker: target.into(),
                method: op.into(),
            });
        }
        let cancel = &self.cancel;
        match op {
            wire::CALL => {
                let req: CallRequest = decode(params)?;
                Ok(Value::from(self.tracker.call(cancel, req).await?))
            }
            wire::SUBSCRIBE => {
                let req: SubscribeRequest = decode(params)?;
                Ok(Value::from(self.tracker.subscribe(cancel, req).await?))
            }
            wire::UNSUBSCRIBE => {
                let req: UnsubscribeParams = decode(params)?;
                self.tracker.unsubscribe(cancel, &req.tracker_ref).await?;
                Ok(Value::Null)
            }
            wire::HANDLE_WEBHOOK => {
                let req: WebhookParams = decode(params)?;
                let update = self
                    .tracker
                    .handle_webhook(cancel, &req.subscription, req.request)
                    .await?;
                Ok(serde_json::to_value(update)?)
            }
            other => Err(Error::UnsupportedMethod {
                tracker: self.name.clone(),
                method: other.into(),
            }),
        }
    }
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T> {
    Ok(serde_json::from_value(params)?)
}
