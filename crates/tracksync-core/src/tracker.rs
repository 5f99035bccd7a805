//! The tracker capability: what the engine needs from each backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Subscription, Update};
use crate::vars::Vars;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub method: String,
    pub vars: Vars,
    /// The tracker's task id for the ticket, empty when it has none yet.
    #[serde(default)]
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub webhook_url: String,
    pub vars: Vars,
}

/// A webhook request as received on the subscription endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// A webhook paired with the subscription it was addressed to.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: Subscription,
    pub request: WebhookRequest,
}

pub type WebhookInbox = mpsc::Receiver<Delivery>;

// ---------------------------------------------------------------------------
// UpdateHandler
// ---------------------------------------------------------------------------

/// Receives every update a tracker produces.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, subscription: Subscription, update: Update);
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Tracker: Send + Sync {
    fn name(&self) -> &str;

    /// Run `request.method`; returns the task id the tracker now uses.
    async fn call(&self, cancel: &CancellationToken, request: CallRequest) -> Result<String>;

    /// Register a webhook; returns the tracker's reference for it.
    async fn subscribe(&self, cancel: &CancellationToken, request: SubscribeRequest)
        -> Result<String>;

    async fn unsubscribe(&self, cancel: &CancellationToken, tracker_ref: &str) -> Result<()>;

    /// Turn a raw webhook into an update. `None` means the payload is not
    /// something the engine reacts to.
    async fn handle_webhook(
        &self,
        cancel: &CancellationToken,
        subscription: &Subscription,
        request: WebhookRequest,
    ) -> Result<Option<Update>>;

    /// Deliver updates to `handler` until `cancel` fires.
    ///
    /// The default is [`drain_inbox`].
    /// Returns `Error::Cancelled` on shutdown.
    async fn listen(
        &self,
        cancel: CancellationToken,
        inbox: WebhookInbox,
        handler: Arc<dyn UpdateHandler>,
    ) -> Result<()> {
        drain_inbox(self, cancel, inbox, handler).await
    }
}

/// Feed each delivery in `inbox`, in order, through `tracker`'s
/// [`Tracker::handle_webhook`] and hand the resulting updates to `handler`.
///
/// Returns `Error::Cancelled` once `cancel` fires or the inbox closes.
pub async fn drain_inbox<T: Tracker + ?Sized>(
    tracker: &T,
    cancel: CancellationToken,
    mut inbox: WebhookInbox,
    handler: Arc<dyn UpdateHandler>,
) -> Result<()> {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            d = inbox.recv() => match d {
                Some(d) => d,
                None => return Err(Error::Cancelled),
            },
        };
        let sub_id = delivery.subscription.id.clone();
        match tracker
            .handle_webhook(&cancel, &delivery.subscription, delivery.request)
            .await
        {
            Ok(Some(update)) => handler.handle(&cancel, delivery.subscription, update).await,
            Ok(None) => {
                debug!(tracker = %tracker.name(), subscription = %sub_id, "webhook ignored")
            }
            Err(e) => {
                warn!(tracker = %tracker.name(), subscription = %sub_id, error = %e, "webhook rejected")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TrackerRegistry
// ---------------------------------------------------------------------------

/// The trackers wired into one engine instance, by name.
#[derive(Clone, Default)]
pub struct TrackerRegistry {
    trackers: HashMap<String, Arc<dyn Tracker>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tracker: Arc<dyn Tracker>) {
        self.trackers.insert(tracker.name().to_string(), tracker);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Tracker>> {
        self.trackers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TrackerNotRegistered(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.trackers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tracker>> {
        self.trackers.values()
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

impl FromIterator<Arc<dyn Tracker>> for TrackerRegistry {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Tracker>>>(iter: I) -> Self {
        let mut reg = Self::new();
        for t in iter {
            reg.register(t);
        }
        reg
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
