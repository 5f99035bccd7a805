//! Frames exchanged between the engine and a plugin.
//!
//! One JSON object per line. Requests carry an `id` chosen by the caller;
//! the plugin answers with the same `id` and either `result` or `error`.
//! Method names are `<tracker>.<Method>`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracksync_core::model::Subscription;
use tracksync_core::tracker::WebhookRequest;
use tracksync_core::Error;

pub const CALL: &str = "Call";
pub const SUBSCRIBE: &str = "Subscribe";
pub const UNSUBSCRIBE: &str = "Unsubscribe";
pub const HANDLE_WEBHOOK: &str = "HandleWebhook";

/// `<tracker>.<Method>`
pub fn method(tracker: &str, name: &str) -> String {
    format!("{tracker}.{name}")
}

/// Split a wire method into tracker and method name.
pub fn split_method(method: &str) -> Option<(&str, &str)> {
    method
        .rsplit_once('.')
        .filter(|(t, m)| !t.is_empty() && !m.is_empty())
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: &Error) -> Self {
        Self {
            id,
            result: None,
            error: Some(WireError::from(error)),
        }
    }

    /// The call outcome this response carries.
    pub fn into_result(self) -> Result<Value, Error> {
        match self.error {
            Some(e) => Err(e.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    pub tracker_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookParams {
    pub subscription: Subscription,
    pub request: WebhookRequest,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    UnsupportedMethod,
    ActionNotSupported,
    UnexpectedRemoteStatus,
    MethodParseFailed,
    InvalidParams,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    /// Structured detail for codes that need more than a message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        match e {
            Error::NotFound { key, .. } => Self::new(ErrorCode::NotFound, key.clone()),
            Error::AlreadyExists(m) => Self::new(ErrorCode::AlreadyExists, m.clone()),
            Error::UnsupportedMethod { tracker, method } => Self {
                code: ErrorCode::UnsupportedMethod,
                message: e.to_string(),
                data: Some(serde_json::json!({ "tracker": tracker, "method": method })),
            },
            Error::ActionNotSupported(m) => Self::new(ErrorCode::ActionNotSupported, m.clone()),
            Error::UnexpectedRemoteStatus(m) => {
                Self::new(ErrorCode::UnexpectedRemoteStatus, m.clone())
            }
            Error::MethodParseFailed(m) => Self::new(ErrorCode::MethodParseFailed, m.clone()),
            Error::Json(_) => Self::new(ErrorCode::InvalidParams, e.to_string()),
            Error::Cancelled => Self::new(ErrorCode::Cancelled, e.to_string()),
            other => Self::new(ErrorCode::Internal, other.to_string()),
        }
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        match e.code {
            ErrorCode::NotFound => Error::NotFound {
                kind: "remote object",
                key: e.message,
            },
            ErrorCode::AlreadyExists => Error::AlreadyExists(e.message),
            ErrorCode::UnsupportedMethod => {
                let field = |name: &str| {
                    e.data
                        .as_ref()
                        .and_then(|d| d.get(name))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                Error::UnsupportedMethod {
                    tracker: field("tracker"),
                    method: field("method"),
                }
            }
            ErrorCode::ActionNotSupported => Error::ActionNotSupported(e.message),
            ErrorCode::UnexpectedRemoteStatus => Error::UnexpectedRemoteStatus(e.message),
            ErrorCode::MethodParseFailed => Error::MethodParseFailed(e.message),
            ErrorCode::Cancelled => Error::Cancelled,
            ErrorCode::InvalidParams | ErrorCode::Internal => {
                Error::Transport(format!("plugin error: {}", e.message))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_split_on_last_dot() {
        assert_eq!(method("github", CALL), "github.Call");
        assert_eq!(split_method("github.Call"), Some(("github", "Call")));
        assert_eq!(split_method("my.plugin.Subscribe"), Some(("my.plugin", "Subscribe")));
        assert_eq!(split_method("Call"), None);
        assert_eq!(split_method(".Call"), None);
    }

    #[test]
    fn error_taxonomy_survives_the_wire() {
        let original = Error::UnsupportedMethod {
            tracker: "jira".into(),
            method: "close".into(),
        };
        let line = serde_json::to_string(&Response::err(7, &original)).unwrap();
        let back: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, 7);
        match back.into_result().unwrap_err() {
            Error::UnsupportedMethod { tracker, method } => {
                assert_eq!(tracker, "jira");
                assert_eq!(method, "close");
            }
            other => panic!("unexpected {other:?}"),
        }

        let nf: Error = WireError::from(&Error::not_found("hook", "h1")).into();
        assert!(nf.is_not_found());
    }

    #[test]
    fn unknown_failures_become_transport_errors() {
        let err: Error = WireError::from(&Error::Persistence("disk".into())).into();
        assert!(matches!(err, Error::Transport(m) if m.contains("disk")));
    }

    #[test]
    fn missing_result_reads_as_null() {
        let resp: Response = serde_json::from_str(r#"{"id":1}"#).unwrap();
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }
}
