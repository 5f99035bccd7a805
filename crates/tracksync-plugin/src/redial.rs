use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracksync_core::{Error, Result};

use crate::client::{Dialer, RpcClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// An RPC connection that re-dials when the transport shuts down.
///
/// Only `Error::TransportShutdown` is retried; every other error is
/// returned to the caller as it came.
pub struct Redialer {
    dialer: Arc<dyn Dialer>,
    policy: RetryPolicy,
    current: Mutex<Option<Arc<dyn RpcClient>>>,
}

impl Redialer {
    /// Dial once up front, retrying per `policy`. Exhausting the policy is
    /// fatal.
    pub async fn connect(dialer: Arc<dyn Dialer>, policy: RetryPolicy) -> Result<Self> {
        let mut last = None;
        for attempt in 1..=policy.attempts() {
            match dialer.dial().await {
                Ok(client) => {
                    return Ok(Self {
                        dialer,
                        policy,
                        current: Mutex::new(Some(client)),
                    })
                }
                Err(e) => {
                    warn!(attempt, error = %e, "dial failed");
                    last = Some(e);
                }
            }
            if attempt < policy.attempts() {
                tokio::time::sleep(policy.delay).await;
            }
        }
        Err(Error::Transport(format!(
            "dial failed after {} attempts: {}",
            policy.attempts(),
            last.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn call(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let mut last = Error::TransportShutdown;
        for attempt in 1..=self.policy.attempts() {
            if attempt > 1 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.policy.delay) => {}
                }
            }

            let client = match self.client(cancel).await {
                Ok(c) => c,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(attempt, method, error = %e, "redial failed");
                    last = e;
                    continue;
                }
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = client.call(method, params.clone()) => r,
            };
            match outcome {
                Err(Error::TransportShutdown) => {
                    debug!(attempt, method, "transport shut down, redialing");
                    self.invalidate(&client).await;
                    last = Error::TransportShutdown;
                }
                other => return other,
            }
        }
        Err(last)
    }

    /// The live client, dialing a new one when there is none. The lock is
    /// not held while dialing, and a concurrent dial that finished first is
    /// kept.
    async fn client(&self, cancel: &CancellationToken) -> Result<Arc<dyn RpcClient>> {
        if let Some(c) = self.current.lock().await.as_ref() {
            return Ok(Arc::clone(c));
        }
        let dialed = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.dialer.dial() => r?,
        };
        let mut current = self.current.lock().await;
        Ok(Arc::clone(current.get_or_insert(dialed)))
    }

    /// Drop `stale` unless another caller already replaced it.
    async fn invalidate(&self, stale: &Arc<dyn RpcClient>) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, stale)) {
            *current = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
