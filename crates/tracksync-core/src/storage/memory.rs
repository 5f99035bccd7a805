use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{SubscriptionStore, TicketQuery, TicketStore};
use crate::error::{Error, Result};
use crate::model::{Locator, Subscription, Ticket};

/// In-process storage, used for development runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tickets: HashMap<String, Ticket>,
    locators: HashMap<Locator, String>,
    subscriptions: HashMap<String, Subscription>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    /// Point every locator of `ticket` at it. A locator held by another
    /// ticket moves over: the last write wins.
    fn index(&mut self, ticket: &Ticket) {
        self.locators.retain(|_, owner| owner != &ticket.id);
        for locator in ticket.locators() {
            if let Some(prev) = self.locators.insert(locator.clone(), ticket.id.clone()) {
                if prev != ticket.id {
                    debug!(%locator, from = %prev, to = %ticket.id, "locator re-pointed");
                }
            }
        }
    }
}

#[async_trait]
impl TicketStore for MemoryStorage {
    async fn create_ticket(&self, ticket: &Ticket) -> Result<String> {
        let mut inner = self.inner.write().await;
        let mut stored = ticket.clone();
        stored.id = Uuid::new_v4().to_string();
        inner.index(&stored);
        inner.tickets.insert(stored.id.clone(), stored.clone());
        Ok(stored.id)
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.tickets.contains_key(&ticket.id) {
            return Err(Error::not_found("ticket", &ticket.id));
        }
        inner.index(ticket);
        inner.tickets.insert(ticket.id.clone(), ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, query: &TicketQuery) -> Result<Ticket> {
        let inner = self.inner.read().await;
        let id = match query {
            TicketQuery::Id(id) => Some(id),
            TicketQuery::Locator(l) => inner.locators.get(l),
        };
        id.and_then(|id| inner.tickets.get(id))
            .cloned()
            .ok_or_else(|| Error::not_found("ticket", query.to_string()))
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStorage {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<String> {
        let mut stored = subscription.clone();
        stored.id = Uuid::new_v4().to_string();
        let id = stored.id.clone();
        self.inner.write().await.subscriptions.insert(id.clone(), stored);
        Ok(id)
    }

    async fn get_subscription(&self, id: &str) -> Result<Subscription> {
        self.inner
            .read()
            .await
            .subscriptions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("subscription", id))
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.subscriptions.get_mut(&subscription.id) {
            Some(slot) => {
                *slot = subscription.clone();
                Ok(())
            }
            None => Err(Error::not_found("subscription", &subscription.id)),
        }
    }

    async fn delete_subscription(&self, id: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .subscriptions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("subscription", id))
    }

    async fn list_subscriptions(&self, tracker: Option<&str>) -> Result<Vec<Subscription>> {
        let inner = self.inner.read().await;
        let mut subs: Vec<_> = inner
            .subscriptions
            .values()
            .filter(|s| tracker.map_or(true, |t| s.tracker_name == t))
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(subs)
    }
}
