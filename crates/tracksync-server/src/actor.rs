//! The orchestrator: registers trigger webhooks, routes incoming updates to
//! the jobs that react to them and tears the webhooks down on shutdown.
//!
//! ```text
//!   HTTP /{id} ──► InboxRouter ──► per-tracker inbox ──► Tracker::listen
//!                                                            │
//!                                  Dispatcher ◄──────────────┘
//!                                      │  one task per job, ≤ MAX_CONCURRENT_RUNS
//!                                      ▼
//!                               SequenceExecutor
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracksync_core::flow::{FlowProvider, Job, Trigger};
use tracksync_core::model::{Subscription, Ticket, Update};
use tracksync_core::storage::Storage;
use tracksync_core::tracker::{
    Delivery, SubscribeRequest, TrackerRegistry, UpdateHandler, WebhookRequest,
};
use tracksync_core::vars::Evaluator;
use tracksync_core::{Error, Result};

use crate::executor::SequenceExecutor;
use crate::subscriptions::{SubscriptionManager, WebhookHandler};

/// Upper bound on job runs in flight across all trackers.
pub const MAX_CONCURRENT_RUNS: usize = 16;

/// How long tearing down webhooks may take.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const INBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorState {
    Idle,
    RegisteringTriggers,
    Listening,
    UnregisteringTriggers,
    Stopped,
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub struct Actor {
    flow: Arc<dyn FlowProvider>,
    trackers: TrackerRegistry,
    subscriptions: Arc<SubscriptionManager>,
    executor: Arc<SequenceExecutor>,
    evaluator: Evaluator,
    permits: Arc<Semaphore>,
    run_timeout: Option<Duration>,
    state: watch::Sender<ActorState>,
}

impl Actor {
    pub fn new(
        flow: Arc<dyn FlowProvider>,
        trackers: TrackerRegistry,
        storage: Arc<dyn Storage>,
        base_url: &str,
    ) -> Self {
        Self::with_evaluator(flow, trackers, storage, base_url, Evaluator::default())
    }

    pub fn with_evaluator(
        flow: Arc<dyn FlowProvider>,
        trackers: TrackerRegistry,
        storage: Arc<dyn Storage>,
        base_url: &str,
        evaluator: Evaluator,
    ) -> Self {
        let (state, _) = watch::channel(ActorState::Idle);
        Self {
            flow,
            subscriptions: Arc::new(SubscriptionManager::new(Arc::clone(&storage), base_url)),
            executor: Arc::new(SequenceExecutor::new(
                trackers.clone(),
                storage,
                evaluator.clone(),
            )),
            trackers,
            evaluator,
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_RUNS)),
            run_timeout: None,
            state,
        }
    }

    /// Bound every job run. `None` leaves runs unbounded.
    pub fn run_timeout(mut self, limit: Option<Duration>) -> Self {
        self.run_timeout = limit;
        self
    }

    pub fn state(&self) -> ActorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ActorState> {
        self.state.subscribe()
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    fn set_state(&self, next: ActorState) {
        let prev = self.state.send_replace(next);
        info!(from = ?prev, to = ?next, "actor state");
    }

    /// The handler every tracker delivers its updates to.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            flow: Arc::clone(&self.flow),
            executor: Arc::clone(&self.executor),
            permits: Arc::clone(&self.permits),
            run_timeout: self.run_timeout,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register, listen until `cancel` fires, then unregister.
    ///
    /// Webhooks are torn down even when registration fails. A normal
    /// shutdown returns `Ok`.
    pub async fn run(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        self.set_state(ActorState::RegisteringTriggers);
        let result = match self.register_triggers(&cancel).await {
            Ok(()) => {
                self.set_state(ActorState::Listening);
                self.listen(listener, cancel).await
            }
            Err(e) => {
                error!(error = %e, "trigger registration failed");
                Err(e)
            }
        };

        self.set_state(ActorState::UnregisteringTriggers);
        self.unregister_triggers().await;
        self.set_state(ActorState::Stopped);

        match result {
            Err(Error::Cancelled) => Ok(()),
            other => other,
        }
    }

    /// Subscribe every configured trigger with its tracker. The first
    /// failure abandons the registrations still in flight.
    pub async fn register_triggers(&self, cancel: &CancellationToken) -> Result<()> {
        let triggers = self.flow.list_triggers().await?;
        try_join_all(triggers.iter().map(|t| self.register_trigger(cancel, t))).await?;
        info!(count = triggers.len(), "triggers registered");
        Ok(())
    }

    async fn register_trigger(&self, cancel: &CancellationToken, trigger: &Trigger) -> Result<()> {
        let tracker = self.trackers.get(&trigger.tracker)?;
        let vars = self
            .evaluator
            .evaluate(&trigger.vars, &Update::default(), &Ticket::default())?;
        let sub = self
            .subscriptions
            .create(&trigger.tracker, &trigger.name)
            .await?;
        let tracker_ref = tracker
            .subscribe(
                cancel,
                SubscribeRequest {
                    webhook_url: sub.url(),
                    vars,
                },
            )
            .await?;
        self.subscriptions.set_tracker_ref(&sub.id, &tracker_ref).await?;
        info!(
            trigger = %trigger.name,
            tracker = %trigger.tracker,
            subscription = %sub.id,
            tracker_ref = %tracker_ref,
            "trigger registered"
        );
        Ok(())
    }

    /// Run every tracker's listen loop plus the webhook endpoint.
    ///
    /// Returns `Error::Cancelled` on shutdown, or the first listener
    /// failure after stopping the others.
    pub async fn listen(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let cancel = cancel.child_token();
        let dispatcher: Arc<dyn UpdateHandler> = Arc::new(self.dispatcher());

        let mut inboxes = HashMap::new();
        let mut tasks = JoinSet::new();
        for tracker in self.trackers.iter() {
            let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
            inboxes.insert(tracker.name().to_string(), tx);
            let tracker = Arc::clone(tracker);
            let cancel = cancel.clone();
            let handler = Arc::clone(&dispatcher);
            tasks.spawn(async move {
                let name = tracker.name().to_string();
                let result = tracker.listen(cancel, rx, handler).await;
                (name, result)
            });
        }

        let router: Arc<dyn WebhookHandler> = Arc::new(InboxRouter { inboxes });
        {
            let subscriptions = Arc::clone(&self.subscriptions);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = subscriptions.listen(listener, cancel, router).await;
                ("webhooks".to_string(), result)
            });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let (name, result) = match joined {
                Ok(r) => r,
                Err(e) => ("listener".to_string(), Err(Error::Io(e.into()))),
            };
            match result {
                Ok(()) | Err(Error::Cancelled) => debug!(listener = %name, "stopped"),
                Err(e) => {
                    error!(listener = %name, error = %e, "listener failed");
                    if failure.is_none() {
                        failure = Some(e);
                        cancel.cancel();
                    }
                }
            }
        }
        Err(failure.unwrap_or(Error::Cancelled))
    }

    /// Unsubscribe and delete every persisted subscription. Errors are
    /// logged; returns how many subscriptions were removed.
    pub async fn unregister_triggers(&self) -> usize {
        self.remove_subscriptions("").await
    }

    /// Like [`Self::unregister_triggers`], limited to `tracker` when it is
    /// not empty.
    pub async fn remove_subscriptions(&self, tracker: &str) -> usize {
        let subs = match self.subscriptions.list(tracker).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "cannot list subscriptions");
                return 0;
            }
        };
        let total = subs.len();

        // Runs after shutdown, independent of the caller's token.
        let cancel = CancellationToken::new();
        let work = join_all(subs.into_iter().map(|s| self.unregister(&cancel, s)));
        let removed = match tokio::time::timeout(SHUTDOWN_TIMEOUT, work).await {
            Ok(done) => done.into_iter().filter(|ok| *ok).count(),
            Err(_) => {
                cancel.cancel();
                warn!(timeout = ?SHUTDOWN_TIMEOUT, "unregistering timed out");
                0
            }
        };
        info!(removed, total, "subscriptions removed");
        removed
    }

    async fn unregister(&self, cancel: &CancellationToken, sub: Subscription) -> bool {
        if let Some(tracker_ref) = &sub.tracker_ref {
            let tracker = match self.trackers.get(&sub.tracker_name) {
                Ok(t) => t,
                Err(e) => {
                    warn!(subscription = %sub.id, error = %e, "cannot unsubscribe");
                    return false;
                }
            };
            match tracker.unsubscribe(cancel, tracker_ref).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(subscription = %sub.id, tracker_ref = %tracker_ref, "webhook already gone")
                }
                Err(e) => {
                    warn!(subscription = %sub.id, error = %e, "unsubscribe failed");
                    return false;
                }
            }
        }
        match self.subscriptions.delete(&sub.id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(subscription = %sub.id, error = %e, "cannot delete subscription");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Runs the jobs subscribed to an update's trigger.
///
/// `handle` returns once every run has finished, so a tracker's updates are
/// processed in arrival order.
pub struct Dispatcher {
    flow: Arc<dyn FlowProvider>,
    executor: Arc<SequenceExecutor>,
    permits: Arc<Semaphore>,
    run_timeout: Option<Duration>,
}

#[async_trait]
impl UpdateHandler for Dispatcher {
    async fn handle(&self, cancel: &CancellationToken, subscription: Subscription, update: Update) {
        let jobs = match self.flow.list_subscribed_jobs(&subscription.trigger_name).await {
            Ok(jobs) => jobs,
            Err(e) if e.is_not_found() => {
                debug!(trigger = %subscription.trigger_name, "no jobs subscribed");
                return;
            }
            Err(e) => {
                warn!(trigger = %subscription.trigger_name, error = %e, "cannot list jobs");
                return;
            }
        };

        let update = Arc::new(update);
        let mut runs = JoinSet::new();
        for job in jobs {
            let executor = Arc::clone(&self.executor);
            let permits = Arc::clone(&self.permits);
            let update = Arc::clone(&update);
            let cancel = cancel.clone();
            let limit = self.run_timeout;
            runs.spawn(async move {
                let _permit = match permits.acquire().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                run_job(&executor, &cancel, &update, &job, limit).await;
            });
        }
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "job task panicked");
            }
        }
    }
}

async fn run_job(
    executor: &SequenceExecutor,
    cancel: &CancellationToken,
    update: &Update,
    job: &Job,
    limit: Option<Duration>,
) {
    let run = executor.execute(cancel, update, job);
    let result = match limit {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .unwrap_or(Err(Error::Timeout(limit))),
        None => run.await,
    };
    match result {
        Ok(ticket) => info!(job = %job.name, ticket = %ticket.id, from = %update.received_from, "job completed"),
        Err(e) => warn!(job = %job.name, from = %update.received_from, error = %e, "job failed"),
    }
}

// ---------------------------------------------------------------------------
// InboxRouter
// ---------------------------------------------------------------------------

/// Hands each webhook to the inbox of the tracker that owns its
/// subscription.
struct InboxRouter {
    inboxes: HashMap<String, mpsc::Sender<Delivery>>,
}

#[async_trait]
impl WebhookHandler for InboxRouter {
    async fn handle(&self, subscription: Subscription, request: WebhookRequest) {
        let Some(inbox) = self.inboxes.get(&subscription.tracker_name) else {
            warn!(
                subscription = %subscription.id,
                tracker = %subscription.tracker_name,
                "webhook for unregistered tracker dropped"
            );
            return;
        };
        let id = subscription.id.clone();
        if inbox.send(Delivery { subscription, request }).await.is_err() {
            warn!(subscription = %id, "tracker listener gone, webhook dropped");
        }
    }
}
