#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracksync_core::config::Config;
use tracksync_core::model::{Content, Locator, Subscription, Ticket, Update};
use tracksync_core::storage::{MemoryStorage, SubscriptionStore, TicketQuery, TicketStore};
use tracksync_core::tracker::{
    drain_inbox, CallRequest, SubscribeRequest, Tracker, TrackerRegistry, UpdateHandler,
    WebhookInbox, WebhookRequest,
};
use tracksync_core::{Error, Result};

// ---------------------------------------------------------------------------
// FakeTracker
// ---------------------------------------------------------------------------

/// Records every call. Methods listed with `failing` return an error;
/// refs listed with `gone` answer `NotFound` on unsubscribe.
#[derive(Default)]
pub struct FakeTracker {
    name: String,
    failing: HashSet<String>,
    gone: HashSet<String>,
    refuse_subscribe: bool,
    delay: Option<Duration>,
    listen_fails_after: Option<Duration>,
    listen_stopped: AtomicBool,
    next: AtomicUsize,
    pub calls: Mutex<Vec<CallRequest>>,
    pub subscribed: Mutex<Vec<SubscribeRequest>>,
    pub unsubscribed: Mutex<Vec<String>>,
}

impl FakeTracker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn failing(mut self, method: &str) -> Self {
        self.failing.insert(method.to_string());
        self
    }

    pub fn gone(mut self, tracker_ref: &str) -> Self {
        self.gone.insert(tracker_ref.to_string());
        self
    }

    pub fn refuse_subscribe(mut self) -> Self {
        self.refuse_subscribe = true;
        self
    }

    pub fn delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    /// `listen` fails with a transport error after `d`.
    pub fn listen_fails_after(mut self, d: Duration) -> Self {
        self.listen_fails_after = Some(d);
        self
    }

    pub fn listen_stopped(&self) -> bool {
        self.listen_stopped.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<CallRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.method).collect()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }

    fn bump(&self) -> usize {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl Tracker for FakeTracker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, _: &CancellationToken, req: CallRequest) -> Result<String> {
        self.calls.lock().unwrap().push(req.clone());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.failing.contains(&req.method) {
            return Err(Error::UnexpectedRemoteStatus(format!("{} failed", req.method)));
        }
        if req.task_id.is_empty() {
            Ok(format!("{}-{}", self.name, self.bump()))
        } else {
            Ok(req.task_id)
        }
    }

    async fn subscribe(&self, _: &CancellationToken, req: SubscribeRequest) -> Result<String> {
        self.subscribed.lock().unwrap().push(req);
        if self.refuse_subscribe {
            return Err(Error::UnexpectedRemoteStatus("403".into()));
        }
        Ok(format!("ref-{}-{}", self.name, self.bump()))
    }

    async fn unsubscribe(&self, _: &CancellationToken, tracker_ref: &str) -> Result<()> {
        self.unsubscribed.lock().unwrap().push(tracker_ref.to_string());
        if self.gone.contains(tracker_ref) {
            return Err(Error::not_found("webhook", tracker_ref));
        }
        Ok(())
    }

    /// Body is `<id>:<title>`; an empty body is ignored.
    async fn handle_webhook(
        &self,
        _: &CancellationToken,
        subscription: &Subscription,
        request: WebhookRequest,
    ) -> Result<Option<Update>> {
        if request.body.is_empty() {
            return Ok(None);
        }
        let (id, title) = request
            .body
            .split_once(':')
            .ok_or_else(|| Error::UnexpectedRemoteStatus("bad payload".into()))?;
        Ok(Some(update(&subscription.trigger_name, &self.name, id, title)))
    }

    async fn listen(
        &self,
        cancel: CancellationToken,
        inbox: WebhookInbox,
        handler: Arc<dyn UpdateHandler>,
    ) -> Result<()> {
        let result = match self.listen_fails_after {
            Some(d) => tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = tokio::time::sleep(d) => Err(Error::Transport("plugin connection lost".into())),
            },
            None => drain_inbox(self, cancel, inbox, handler).await,
        };
        self.listen_stopped.store(true, Ordering::SeqCst);
        result
    }
}

pub fn registry(trackers: &[Arc<FakeTracker>]) -> TrackerRegistry {
    trackers
        .iter()
        .map(|t| Arc::clone(t) as Arc<dyn Tracker>)
        .collect()
}

pub fn update(trigger: &str, tracker: &str, id: &str, title: &str) -> Update {
    Update {
        trigger_name: trigger.to_string(),
        url: format!("https://{tracker}.example/{id}"),
        received_from: Locator::new(tracker, id),
        content: Content::titled(title),
    }
}

// ---------------------------------------------------------------------------
// RecordingStorage
// ---------------------------------------------------------------------------

/// In-memory storage that counts ticket writes.
#[derive(Default)]
pub struct RecordingStorage {
    inner: MemoryStorage,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
}

impl RecordingStorage {
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub async fn by_locator(&self, tracker: &str, id: &str) -> Result<Ticket> {
        self.inner
            .get_ticket(&TicketQuery::Locator(Locator::new(tracker, id)))
            .await
    }
}

#[async_trait]
impl TicketStore for RecordingStorage {
    async fn create_ticket(&self, ticket: &Ticket) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_ticket(ticket).await
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_ticket(ticket).await
    }

    async fn get_ticket(&self, query: &TicketQuery) -> Result<Ticket> {
        self.inner.get_ticket(query).await
    }
}

#[async_trait]
impl SubscriptionStore for RecordingStorage {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<String> {
        self.inner.create_subscription(subscription).await
    }

    async fn get_subscription(&self, id: &str) -> Result<Subscription> {
        self.inner.get_subscription(id).await
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.inner.update_subscription(subscription).await
    }

    async fn delete_subscription(&self, id: &str) -> Result<()> {
        self.inner.delete_subscription(id).await
    }

    async fn list_subscriptions(&self, tracker: Option<&str>) -> Result<Vec<Subscription>> {
        self.inner.list_subscriptions(tracker).await
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// Build a flow from the `triggers:` and `jobs:` YAML sections.
pub fn flow(sections: &str) -> Config {
    let yaml = format!(
        "server:\n  base_url: http://hooks.test\ntrackers:\n  - name: github\n    plugin: {{ address: \"127.0.0.1:1\" }}\n  - name: jira\n    plugin: {{ address: \"127.0.0.1:2\" }}\n{sections}"
    );
    Config::from_yaml(&yaml).unwrap()
}
