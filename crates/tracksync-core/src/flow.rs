//! Jobs, triggers and the sequences they run.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::vars::Vars;

// ---------------------------------------------------------------------------
// ActionName
// ---------------------------------------------------------------------------

/// A `tracker/method` pair naming what an action calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActionName {
    pub tracker: String,
    pub method: String,
}

impl FromStr for ActionName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tracker), Some(method), None)
                if !tracker.trim().is_empty() && !method.trim().is_empty() =>
            {
                Ok(Self {
                    tracker: tracker.to_string(),
                    method: method.to_string(),
                })
            }
            _ => Err(Error::MethodParseFailed(s.to_string())),
        }
    }
}

impl TryFrom<String> for ActionName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ActionName> for String {
    fn from(name: ActionName) -> Self {
        name.to_string()
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tracker, self.method)
    }
}

// ---------------------------------------------------------------------------
// Sequence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: ActionName,
    #[serde(default)]
    pub vars: Vars,
    /// Detached actions run without the ticket's task id and their result
    /// is not linked to the ticket.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub detached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct If {
    #[serde(rename = "if")]
    pub condition: String,
    #[serde(default)]
    pub actions: Sequence,
}

/// One step of a sequence. A mapping with an `if` key is a branch; anything
/// else must be an action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Step {
    If(If),
    Action(Action),
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        let step = if raw.get("if").is_some() {
            serde_json::from_value(raw).map(Step::If)
        } else {
            serde_json::from_value(raw).map(Step::Action)
        };
        step.map_err(D::Error::custom)
    }
}

pub type Sequence = Vec<Step>;

// ---------------------------------------------------------------------------
// Trigger / Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
    pub tracker: String,
    #[serde(default)]
    pub vars: Vars,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    #[serde(rename = "trigger")]
    pub trigger_name: String,
    #[serde(default)]
    pub actions: Sequence,
}

// ---------------------------------------------------------------------------
// FlowProvider
// ---------------------------------------------------------------------------

/// Read-only source of the configured flow.
#[async_trait]
pub trait FlowProvider: Send + Sync {
    /// Jobs bound to `trigger`. Fails with `NotFound` when there are none.
    async fn list_subscribed_jobs(&self, trigger: &str) -> Result<Vec<Job>>;

    async fn list_trackers(&self) -> Result<Vec<String>>;

    async fn list_triggers(&self) -> Result<Vec<Trigger>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
