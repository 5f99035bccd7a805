//! Storage engine contracts for tickets and subscriptions.
//!
//! The engine treats storage as an externally synchronised service: each
//! call is its own transaction and concurrent writes to one key are
//! serialised by the implementation, last write wins.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Locator, Subscription, Ticket};

pub mod memory;
pub mod redb;

pub use self::memory::MemoryStorage;
pub use self::redb::RedbStorage;

/// How to find a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketQuery {
    Locator(Locator),
    Id(String),
}

impl std::fmt::Display for TicketQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locator(l) => write!(f, "{l}"),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Persist a new ticket and return the id assigned to it.
    async fn create_ticket(&self, ticket: &Ticket) -> Result<String>;

    async fn update_ticket(&self, ticket: &Ticket) -> Result<()>;

    /// Fails with `NotFound` when no ticket matches.
    async fn get_ticket(&self, query: &TicketQuery) -> Result<Ticket>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Persist a new subscription and return the id assigned to it.
    async fn create_subscription(&self, subscription: &Subscription) -> Result<String>;

    async fn get_subscription(&self, id: &str) -> Result<Subscription>;

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()>;

    async fn delete_subscription(&self, id: &str) -> Result<()>;

    /// All subscriptions, or only those of `tracker` when given.
    async fn list_subscriptions(&self, tracker: Option<&str>) -> Result<Vec<Subscription>>;
}

pub trait Storage: TicketStore + SubscriptionStore {}

impl<T: TicketStore + SubscriptionStore> Storage for T {}
