use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracksync_core::model::Subscription;
use tracksync_core::storage::Storage;
use tracksync_core::tracker::WebhookRequest;
use tracksync_core::Result;

/// Receives webhooks once their subscription has been resolved.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, subscription: Subscription, request: WebhookRequest);
}

// ---------------------------------------------------------------------------
// SubscriptionManager
// ---------------------------------------------------------------------------

/// Owns webhook subscriptions and the HTTP endpoint they point at.
pub struct SubscriptionManager {
    storage: Arc<dyn Storage>,
    base_url: String,
}

impl SubscriptionManager {
    pub fn new(storage: Arc<dyn Storage>, base_url: impl Into<String>) -> Self {
        Self {
            storage,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Persist a new subscription for `trigger` on `tracker`. The tracker
    /// reference is filled in later by [`Self::set_tracker_ref`].
    pub async fn create(&self, tracker: &str, trigger: &str) -> Result<Subscription> {
        let mut sub = Subscription::new(tracker, trigger, &self.base_url);
        sub.id = self.storage.create_subscription(&sub).await?;
        debug!(subscription = %sub.id, tracker, trigger, "subscription created");
        Ok(sub)
    }

    pub async fn set_tracker_ref(&self, id: &str, tracker_ref: &str) -> Result<Subscription> {
        let mut sub = self.storage.get_subscription(id).await?;
        sub.tracker_ref = Some(tracker_ref.to_string());
        self.storage.update_subscription(&sub).await?;
        Ok(sub)
    }

    /// Remove a subscription. Removing one that does not exist succeeds.
    pub async fn delete(&self, id: &str) -> Result<()> {
        match self.storage.delete_subscription(id).await {
            Err(e) if e.is_not_found() => {
                debug!(subscription = id, "already deleted");
                Ok(())
            }
            other => other,
        }
    }

    /// Subscriptions of `tracker`, or all of them when `tracker` is empty.
    pub async fn list(&self, tracker: &str) -> Result<Vec<Subscription>> {
        let filter = (!tracker.is_empty()).then_some(tracker);
        self.storage.list_subscriptions(filter).await
    }

    pub async fn get(&self, id: &str) -> Result<Subscription> {
        self.storage.get_subscription(id).await
    }

    /// Webhook routes. Every `/{subscription_id}` request is resolved to its
    /// subscription and passed to `handler`.
    pub fn router(self: &Arc<Self>, handler: Arc<dyn WebhookHandler>) -> Router {
        let state = AppState {
            manager: Arc::clone(self),
            handler,
        };
        Router::new()
            .route("/{subscription_id}", get(receive).post(receive))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve webhooks on `listener` until `cancel` fires.
    pub async fn listen(
        self: &Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<()> {
        let app = self.router(handler);
        info!(
            addr = ?listener.local_addr().ok(),
            base_url = %self.base_url,
            "webhook endpoint listening"
        );
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        info!("webhook endpoint stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    manager: Arc<SubscriptionManager>,
    handler: Arc<dyn WebhookHandler>,
}

async fn receive(
    State(state): State<AppState>,
    Path(id): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let subscription = match load_subscription(&state.manager, &id).await {
        Ok(Some(sub)) => sub,
        Ok(None) => return StatusCode::OK.into_response(),
        Err(resp) => return resp,
    };
    let request = WebhookRequest {
        method: method.to_string(),
        headers: headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect(),
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    state.handler.handle(subscription, request).await;
    StatusCode::OK.into_response()
}

/// Resolve the path segment to a subscription. Unknown ids are dropped.
async fn load_subscription(
    manager: &SubscriptionManager,
    id: &str,
) -> std::result::Result<Option<Subscription>, Response> {
    match manager.get(id).await {
        Ok(sub) => Ok(Some(sub)),
        Err(e) if e.is_not_found() => {
            warn!(subscription = id, "webhook for unknown subscription dropped");
            Ok(None)
        }
        Err(e) => {
            error!(subscription = id, error = %e, "cannot load subscription");
            let body = serde_json::json!({ "error": e.to_string() });
            Err((StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tracksync_core::storage::MemoryStorage;

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new(Arc::new(MemoryStorage::new()), "https://hooks.example.com/")
    }

    #[tokio::test]
    async fn create_assigns_id_and_url() {
        let m = manager();
        let sub = m.create("github", "opened").await.unwrap();
        assert!(!sub.id.is_empty());
        assert!(sub.tracker_ref.is_none());
        assert_eq!(sub.url(), format!("https://hooks.example.com/{}", sub.id));
    }

    #[tokio::test]
    async fn set_tracker_ref_persists() {
        let m = manager();
        let sub = m.create("github", "opened").await.unwrap();
        m.set_tracker_ref(&sub.id, "hook-9").await.unwrap();
        assert_eq!(m.get(&sub.id).await.unwrap().tracker_ref.as_deref(), Some("hook-9"));
        assert!(m.set_tracker_ref("nope", "x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let m = manager();
        let sub = m.create("github", "opened").await.unwrap();
        m.delete(&sub.id).await.unwrap();
        m.delete(&sub.id).await.unwrap();
        assert!(m.get(&sub.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_tracker() {
        let m = manager();
        m.create("github", "a").await.unwrap();
        m.create("jira", "b").await.unwrap();
        m.create("github", "c").await.unwrap();
        assert_eq!(m.list("").await.unwrap().len(), 3);
        let gh = m.list("github").await.unwrap();
        assert_eq!(gh.len(), 2);
        assert!(gh.iter().all(|s| s.tracker_name == "github"));
    }
}
