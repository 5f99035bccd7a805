//! Persistent storage engine backed by redb.
//!
//! # Table design
//!
//! ```text
//! tickets          ticket id            -> JSON Ticket
//! ticket_locators  "<tracker>/<task id>" -> ticket id
//! subscriptions    subscription id      -> JSON Subscription
//! ```
//!
//! Tracker names never contain `/`, so the first `/` of a locator key
//! separates the tracker from the task id. The locator index is rewritten in
//! the same write transaction as the ticket it points to. A locator already
//! held by another ticket is re-pointed to the ticket written last.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;
use uuid::Uuid;

use super::{SubscriptionStore, TicketQuery, TicketStore};
use crate::error::{Error, Result};
use crate::model::{Subscription, Ticket};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const TICKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("tickets");
const TICKET_LOCATORS: TableDefinition<&str, &str> = TableDefinition::new("ticket_locators");
const SUBSCRIPTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("subscriptions");

fn db_err(e: impl std::fmt::Display) -> Error {
    Error::Persistence(e.to_string())
}

// ---------------------------------------------------------------------------
// RedbStorage
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorage").finish_non_exhaustive()
    }
}

impl RedbStorage {
    /// Open or create the database at `path`, creating its tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(TICKETS).map_err(db_err)?;
        wt.open_table(TICKET_LOCATORS).map_err(db_err)?;
        wt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Run a synchronous redb operation off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| Error::Persistence(format!("storage task failed: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// Ticket operations
// ---------------------------------------------------------------------------

fn put_ticket(db: &Database, ticket: &Ticket, create: bool) -> Result<()> {
    let value = serde_json::to_vec(ticket)?;
    let wt = db.begin_write().map_err(db_err)?;
    {
        let mut tickets = wt.open_table(TICKETS).map_err(db_err)?;
        let mut locators = wt.open_table(TICKET_LOCATORS).map_err(db_err)?;

        let previous = tickets
            .get(ticket.id.as_str())
            .map_err(db_err)?
            .map(|g| g.value().to_vec());
        match (&previous, create) {
            (Some(_), true) => return Err(Error::AlreadyExists(format!("ticket {}", ticket.id))),
            (None, false) => return Err(Error::not_found("ticket", &ticket.id)),
            _ => {}
        }

        if let Some(prev) = previous {
            let prev: Ticket = serde_json::from_slice(&prev)?;
            for locator in prev.locators() {
                let key = locator.to_string();
                let owned = locators
                    .get(key.as_str())
                    .map_err(db_err)?
                    .is_some_and(|g| g.value() == ticket.id);
                if owned {
                    locators.remove(key.as_str()).map_err(db_err)?;
                }
            }
        }
        // A locator held by another ticket moves to this one.
        for locator in ticket.locators() {
            let key = locator.to_string();
            let prev_owner = locators
                .insert(key.as_str(), ticket.id.as_str())
                .map_err(db_err)?
                .map(|g| g.value().to_string());
            if let Some(owner) = prev_owner.filter(|o| o != &ticket.id) {
                debug!(locator = %key, from = %owner, to = %ticket.id, "locator re-pointed");
            }
        }
        tickets
            .insert(ticket.id.as_str(), value.as_slice())
            .map_err(db_err)?;
    }
    wt.commit().map_err(db_err)?;
    Ok(())
}

fn read_ticket(db: &Database, query: &TicketQuery) -> Result<Ticket> {
    let rt = db.begin_read().map_err(db_err)?;
    let id = match query {
        TicketQuery::Id(id) => id.clone(),
        TicketQuery::Locator(locator) => {
            let locators = rt.open_table(TICKET_LOCATORS).map_err(db_err)?;
            let found = locators
                .get(locator.to_string().as_str())
                .map_err(db_err)?
                .map(|g| g.value().to_string());
            found.ok_or_else(|| Error::not_found("ticket", query.to_string()))?
        }
    };
    let tickets = rt.open_table(TICKETS).map_err(db_err)?;
    let bytes = tickets
        .get(id.as_str())
        .map_err(db_err)?
        .map(|g| g.value().to_vec())
        .ok_or_else(|| Error::not_found("ticket", query.to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl TicketStore for RedbStorage {
    async fn create_ticket(&self, ticket: &Ticket) -> Result<String> {
        let mut stored = ticket.clone();
        stored.id = Uuid::new_v4().to_string();
        self.blocking(move |db| {
            put_ticket(db, &stored, true)?;
            Ok(stored.id)
        })
        .await
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<()> {
        let ticket = ticket.clone();
        self.blocking(move |db| put_ticket(db, &ticket, false)).await
    }

    async fn get_ticket(&self, query: &TicketQuery) -> Result<Ticket> {
        let query = query.clone();
        self.blocking(move |db| read_ticket(db, &query)).await
    }
}

// ---------------------------------------------------------------------------
// Subscription operations
// ---------------------------------------------------------------------------

fn put_subscription(db: &Database, sub: &Subscription, create: bool) -> Result<()> {
    let value = serde_json::to_vec(sub)?;
    let wt = db.begin_write().map_err(db_err)?;
    {
        let mut table = wt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
        let exists = table.get(sub.id.as_str()).map_err(db_err)?.is_some();
        if !create && !exists {
            return Err(Error::not_found("subscription", &sub.id));
        }
        table
            .insert(sub.id.as_str(), value.as_slice())
            .map_err(db_err)?;
    }
    wt.commit().map_err(db_err)?;
    Ok(())
}

fn read_subscriptions(db: &Database) -> Result<Vec<Subscription>> {
    let rt = db.begin_read().map_err(db_err)?;
    let table = rt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
    let mut result = Vec::new();
    for entry in table.iter().map_err(db_err)? {
        let (_, v) = entry.map_err(db_err)?;
        result.push(serde_json::from_slice(v.value())?);
    }
    Ok(result)
}

#[async_trait]
impl SubscriptionStore for RedbStorage {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<String> {
        let mut stored = subscription.clone();
        stored.id = Uuid::new_v4().to_string();
        self.blocking(move |db| {
            put_subscription(db, &stored, true)?;
            Ok(stored.id)
        })
        .await
    }

    async fn get_subscription(&self, id: &str) -> Result<Subscription> {
        let id = id.to_string();
        self.blocking(move |db| {
            let rt = db.begin_read().map_err(db_err)?;
            let table = rt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
            let bytes = table
                .get(id.as_str())
                .map_err(db_err)?
                .map(|g| g.value().to_vec())
                .ok_or_else(|| Error::not_found("subscription", &id))?;
            Ok(serde_json::from_slice(&bytes)?)
        })
        .await
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        let sub = subscription.clone();
        self.blocking(move |db| put_subscription(db, &sub, false))
            .await
    }

    async fn delete_subscription(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.blocking(move |db| {
            let wt = db.begin_write().map_err(db_err)?;
            let removed = {
                let mut table = wt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
                let removed = table.remove(id.as_str()).map_err(db_err)?.is_some();
                removed
            };
            wt.commit().map_err(db_err)?;
            if removed {
                Ok(())
            } else {
                Err(Error::not_found("subscription", &id))
            }
        })
        .await
    }

    async fn list_subscriptions(&self, tracker: Option<&str>) -> Result<Vec<Subscription>> {
        let tracker = tracker.map(str::to_string);
        self.blocking(move |db| {
            let mut subs: Vec<Subscription> = read_subscriptions(db)?
                .into_iter()
                .filter(|s| tracker.as_deref().map_or(true, |t| s.tracker_name == t))
                .collect();
            subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            Ok(subs)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Content, Locator, Update};
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RedbStorage) {
        let dir = TempDir::new().unwrap();
        let db = RedbStorage::open(&dir.path().join("tracksync.redb")).unwrap();
        (dir, db)
    }

    fn ticket_from(tracker: &str, id: &str, title: &str) -> Ticket {
        let mut t = Ticket::default();
        t.patch(&Update {
            received_from: Locator::new(tracker, id),
            content: Content::titled(title),
            ..Default::default()
        });
        t
    }

    #[tokio::test]
    async fn created_ticket_is_found_by_locator_and_id() {
        let (_dir, db) = open_tmp();
        let id = db.create_ticket(&ticket_from("trk1", "5", "Bug")).await.unwrap();
        assert!(!id.is_empty());

        let by_locator = db
            .get_ticket(&TicketQuery::Locator(Locator::new("trk1", "5")))
            .await
            .unwrap();
        assert_eq!(by_locator.id, id);
        assert_eq!(by_locator.variations["trk1"].content.title, "Bug");

        let by_id = db.get_ticket(&TicketQuery::Id(id)).await.unwrap();
        assert_eq!(by_id, by_locator);
    }

    #[tokio::test]
    async fn unknown_locator_is_not_found() {
        let (_dir, db) = open_tmp();
        let err = db
            .get_ticket(&TicketQuery::Locator(Locator::new("trk1", "404")))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn update_moves_locator_index() {
        let (_dir, db) = open_tmp();
        let mut ticket = ticket_from("trk1", "5", "Bug");
        ticket.id = db.create_ticket(&ticket).await.unwrap();

        ticket.set_task_id("trk2", "42");
        ticket.set_task_id("trk1", "6");
        db.update_ticket(&ticket).await.unwrap();

        let by_new = db
            .get_ticket(&TicketQuery::Locator(Locator::new("trk2", "42")))
            .await
            .unwrap();
        assert_eq!(by_new.id, ticket.id);
        assert!(db
            .get_ticket(&TicketQuery::Locator(Locator::new("trk1", "5")))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn update_of_unknown_ticket_is_not_found() {
        let (_dir, db) = open_tmp();
        let mut ticket = ticket_from("trk1", "5", "Bug");
        ticket.id = "missing".into();
        assert!(db.update_ticket(&ticket).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn second_ticket_claiming_locator_takes_it_over() {
        let (_dir, db) = open_tmp();
        let mut first = ticket_from("trk1", "5", "A");
        first.set_task_id("trk2", "J-1");
        let first_id = db.create_ticket(&first).await.unwrap();
        let mut second = ticket_from("trk1", "5", "B");
        second.set_task_id("trk3", "L-1");
        let second_id = db.create_ticket(&second).await.unwrap();

        let by_shared = db
            .get_ticket(&TicketQuery::Locator(Locator::new("trk1", "5")))
            .await
            .unwrap();
        assert_eq!(by_shared.id, second_id);
        assert_eq!(by_shared.task_id("trk3"), "L-1");
        let by_first_only = db
            .get_ticket(&TicketQuery::Locator(Locator::new("trk2", "J-1")))
            .await
            .unwrap();
        assert_eq!(by_first_only.id, first_id);

        // Rewriting the first ticket must not steal back or drop the moved key.
        let mut first = by_first_only;
        first.set_task_id("trk1", "6");
        db.update_ticket(&first).await.unwrap();
        let still = db
            .get_ticket(&TicketQuery::Locator(Locator::new("trk1", "5")))
            .await
            .unwrap();
        assert_eq!(still.id, second_id);
    }

    #[tokio::test]
    async fn subscription_lifecycle() {
        let (_dir, db) = open_tmp();
        let id = db
            .create_subscription(&Subscription::new("gh", "new-issue", "http://hooks"))
            .await
            .unwrap();
        db.create_subscription(&Subscription::new("jira", "moved", "http://hooks"))
            .await
            .unwrap();

        let mut sub = db.get_subscription(&id).await.unwrap();
        assert_eq!(sub.tracker_ref, None);
        sub.tracker_ref = Some("hook-7".into());
        db.update_subscription(&sub).await.unwrap();
        assert_eq!(
            db.get_subscription(&id).await.unwrap().tracker_ref.as_deref(),
            Some("hook-7")
        );

        assert_eq!(db.list_subscriptions(None).await.unwrap().len(), 2);
        let gh = db.list_subscriptions(Some("gh")).await.unwrap();
        assert_eq!(gh.len(), 1);
        assert_eq!(gh[0].id, id);

        db.delete_subscription(&id).await.unwrap();
        assert!(db.get_subscription(&id).await.unwrap_err().is_not_found());
        assert!(db.delete_subscription(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tracksync.redb");
        let id = {
            let db = RedbStorage::open(&path).unwrap();
            db.create_ticket(&ticket_from("trk1", "5", "Bug")).await.unwrap()
        };
        let db = RedbStorage::open(&path).unwrap();
        assert_eq!(db.get_ticket(&TicketQuery::Id(id.clone())).await.unwrap().id, id);
    }
}
