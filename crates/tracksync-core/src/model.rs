//! Canonical records shared by every tracksync component.
//!
//! A [`Ticket`] is the cross-tracker view of one unit of work. Each tracker
//! that has seen the ticket owns one [`Task`] variation holding its local id
//! and last known content. [`Update`]s arrive from trackers and are folded
//! into tickets by the sequence executor.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// Address of a task inside one tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub tracker: String,
    pub id: String,
}

impl Locator {
    pub fn new(tracker: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tracker: tracker.into(),
            id: id.into(),
        }
    }

    /// True when either half is blank.
    pub fn is_empty(&self) -> bool {
        self.tracker.trim().is_empty() || self.id.trim().is_empty()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tracker, self.id)
    }
}

// ---------------------------------------------------------------------------
// Content / Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl Content {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

/// One tracker's variation of a ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub content: Content,
}

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Empty until the storage engine assigns an id on first persist.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub variations: BTreeMap<String, Task>,
}

impl Ticket {
    pub fn is_persisted(&self) -> bool {
        !self.id.is_empty()
    }

    /// Fold an inbound update into the variation of the tracker it came from.
    pub fn patch(&mut self, update: &Update) {
        let from = &update.received_from;
        let task = self.variations.entry(from.tracker.clone()).or_default();
        task.id = from.id.clone();
        task.content = update.content.clone();
    }

    /// Record the task id a tracker returned, keeping any known content.
    pub fn set_task_id(&mut self, tracker: &str, id: impl Into<String>) {
        self.variations.entry(tracker.to_string()).or_default().id = id.into();
    }

    /// Current task id for `tracker`, empty when the tracker has not
    /// participated yet.
    pub fn task_id(&self, tracker: &str) -> &str {
        self.variations
            .get(tracker)
            .map(|t| t.id.as_str())
            .unwrap_or("")
    }

    /// Every non-empty locator this ticket can be found under.
    pub fn locators(&self) -> Vec<Locator> {
        self.variations
            .iter()
            .map(|(tracker, task)| Locator::new(tracker.clone(), task.id.clone()))
            .filter(|l| !l.is_empty())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// A change event received from a tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub trigger_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub received_from: Locator,
    #[serde(flatten)]
    pub content: Content,
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A trigger's webhook registration with a tracker.
///
/// `tracker_ref` stays `None` until the tracker confirms the registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_ref: Option<String>,
    pub tracker_name: String,
    pub trigger_name: String,
    pub base_url: String,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        tracker_name: impl Into<String>,
        trigger_name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            tracker_ref: None,
            tracker_name: tracker_name.into(),
            trigger_name: trigger_name.into(),
            base_url: base_url.into(),
            created_at: Utc::now(),
        }
    }

    /// Callback address handed to the tracker.
    pub fn url(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
