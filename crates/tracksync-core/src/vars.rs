//! Deferred variables and their evaluation against an update.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::model::{Content, Ticket, Update};
use crate::template::{Expression, Functions, Template};

// ---------------------------------------------------------------------------
// Vars
// ---------------------------------------------------------------------------

/// Named template strings, rendered lazily per update.
///
/// Equality compares the key/value pairs only; whether the map has been
/// evaluated is not part of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vars {
    values: BTreeMap<String, String>,
    #[serde(skip)]
    evaluated: bool,
}

impl PartialEq for Vars {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for Vars {}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluated
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Vars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            evaluated: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Renders [`Vars`] and `if` conditions with a fixed function registry.
#[derive(Debug, Clone)]
pub struct Evaluator {
    functions: Functions,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(Functions::standard())
    }
}

impl Evaluator {
    pub fn new(functions: Functions) -> Self {
        Self { functions }
    }

    pub fn functions(&self) -> &Functions {
        &self.functions
    }

    /// Render every value of `vars` against `update` and `ticket`.
    ///
    /// Already evaluated maps are returned as they are.
    pub fn evaluate(&self, vars: &Vars, update: &Update, ticket: &Ticket) -> Result<Vars> {
        if vars.evaluated {
            return Ok(vars.clone());
        }
        let ctx = context(update, ticket);
        let mut values = BTreeMap::new();
        for (key, raw) in &vars.values {
            let rendered = Template::parse(raw, &self.functions)
                .and_then(|t| t.render(&ctx, &self.functions))
                .map_err(|e| Error::Template {
                    key: key.clone(),
                    message: e.to_string(),
                })?;
            values.insert(key.clone(), rendered);
        }
        Ok(Vars {
            values,
            evaluated: true,
        })
    }

    /// Evaluate an `if` condition; anything but a boolean is an error.
    pub fn condition(&self, condition: &str, update: &Update, ticket: &Ticket) -> Result<bool> {
        let value = Expression::parse(condition, &self.functions)
            .and_then(|e| e.eval(&context(update, ticket), &self.functions))
            .map_err(|e| Error::Template {
                key: "if".into(),
                message: e.to_string(),
            })?;
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(Error::IfCondition {
                condition: condition.to_string(),
                got: other.to_string(),
            }),
        }
    }

    /// Parse-only check used by configuration validation.
    pub fn check_template(&self, src: &str) -> std::result::Result<(), String> {
        Template::parse(src, &self.functions)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    pub fn check_condition(&self, src: &str) -> std::result::Result<(), String> {
        Expression::parse(src, &self.functions)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

fn content_value(content: &Content) -> Value {
    json!({
        "Title": content.title,
        "Body": content.body,
        "Fields": content.fields,
    })
}

/// Template context: `.Update` and `.Ticket`.
fn context(update: &Update, ticket: &Ticket) -> Value {
    let mut u = content_value(&update.content);
    if let Value::Object(m) = &mut u {
        m.insert("TriggerName".into(), json!(update.trigger_name));
        m.insert("URL".into(), json!(update.url));
        m.insert(
            "ReceivedFrom".into(),
            json!({
                "Tracker": update.received_from.tracker,
                "ID": update.received_from.id,
            }),
        );
    }
    let variations: serde_json::Map<String, Value> = ticket
        .variations
        .iter()
        .map(|(tracker, task)| {
            let mut v = content_value(&task.content);
            if let Value::Object(m) = &mut v {
                m.insert("ID".into(), json!(task.id));
            }
            (tracker.clone(), v)
        })
        .collect();
    json!({
        "Update": u,
        "Ticket": {"ID": ticket.id, "Variations": variations},
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Locator;

    fn update() -> Update {
        let mut content = Content::titled("Bug");
        content.fields.insert("label".into(), "bug".into());
        Update {
            trigger_name: "new-issue".into(),
            url: "https://gh/1".into(),
            received_from: Locator::new("gh", "1"),
            content,
        }
    }

    fn ticket() -> Ticket {
        let mut t = Ticket {
            id: "t-1".into(),
            ..Default::default()
        };
        t.set_task_id("jira", "42");
        t
    }

    fn evaluator() -> Evaluator {
        Evaluator::new(Functions::standard().with("env", |_| Ok(json!("PROJ"))))
    }

    #[test]
    fn renders_update_and_ticket_fields() {
        let vars: Vars = [
            ("title", "{{ .Update.Title }}"),
            ("from", "{{ .Update.ReceivedFrom.Tracker }}/{{ .Update.ReceivedFrom.ID }}"),
            ("jira", "{{ .Ticket.Variations.jira.ID }}"),
            ("project", "{{ env \"JIRA_PROJECT\" }}"),
        ]
        .into_iter()
        .collect();

        let out = evaluator().evaluate(&vars, &update(), &ticket()).unwrap();
        assert!(out.is_evaluated());
        assert_eq!(out.get("title"), Some("Bug"));
        assert_eq!(out.get("from"), Some("gh/1"));
        assert_eq!(out.get("jira"), Some("42"));
        assert_eq!(out.get("project"), Some("PROJ"));
    }

    #[test]
    fn empty_vars_evaluate_to_empty_marked_map() {
        let out = evaluator()
            .evaluate(&Vars::new(), &Update::default(), &Ticket::default())
            .unwrap();
        assert!(out.is_empty());
        assert!(out.is_evaluated());
    }

    #[test]
    fn re_evaluation_is_a_no_op() {
        let vars: Vars = [("raw", "{{ `{{ .Update.Title }}` }}")].into_iter().collect();
        let ev = evaluator();
        let once = ev.evaluate(&vars, &update(), &ticket()).unwrap();
        assert_eq!(once.get("raw"), Some("{{ .Update.Title }}"));
        let twice = ev.evaluate(&once, &update(), &ticket()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn failing_key_is_reported() {
        let vars: Vars = [("ok", "fine"), ("broken", "{{ nope }}")].into_iter().collect();
        let err = evaluator()
            .evaluate(&vars, &update(), &ticket())
            .unwrap_err();
        match err {
            Error::Template { key, message } => {
                assert_eq!(key, "broken");
                assert!(message.contains("not defined"), "{message}");
            }
            other => panic!("expected Template error, got {other:?}"),
        }
    }

    #[test]
    fn equality_ignores_evaluation_state() {
        let vars: Vars = [("a", "plain")].into_iter().collect();
        let evaluated = evaluator()
            .evaluate(&vars, &update(), &ticket())
            .unwrap();
        assert!(evaluated.is_evaluated() && !vars.is_evaluated());
        assert_eq!(vars, evaluated);
    }

    #[test]
    fn condition_true_and_false() {
        let ev = evaluator();
        assert!(ev
            .condition(r#"eq .Update.Fields.label "bug""#, &update(), &ticket())
            .unwrap());
        assert!(!ev
            .condition(r#"eq .Update.Title "Feature""#, &update(), &ticket())
            .unwrap());
    }

    #[test]
    fn non_boolean_condition_is_rejected() {
        let ev = evaluator();
        for cond in [".Update.Title", "keys .Update.Fields", "1"] {
            let err = ev.condition(cond, &update(), &ticket()).unwrap_err();
            assert!(
                matches!(err, Error::IfCondition { .. }),
                "{cond}: expected IfCondition, got {err:?}"
            );
        }
    }

    #[test]
    fn vars_deserialize_from_plain_map() {
        let vars: Vars = serde_yaml::from_str("title: \"{{ .Update.Title }}\"\nlabel: bug\n").unwrap();
        assert_eq!(vars.len(), 2);
        assert!(!vars.is_evaluated());
    }
}
