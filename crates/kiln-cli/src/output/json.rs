//! JSON output formatting

use serde::Serialize;
use serde_json::{Value, json};

/// Anything `kiln -o json` can print
pub trait JsonOutput: Send + Sync {
    fn to_json(&self) -> Value;
}

impl<T: Serialize + Send + Sync> JsonOutput for T {
    fn to_json(&self) -> Value {
        json!(self)
    }
}

/// Outcome of a command that has no result type of its own.
///
/// Serialized as `{"success": .., "message"?, "data"?, "error"?}`; absent
/// fields are left out.
#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReport {
    /// Command finished; `message` says what it did
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
            error: None,
        }
    }

    /// Command finished with a result payload, e.g. an invocation result
    pub fn with_data(data: Value) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
            error: None,
        }
    }

    /// Command failed; printed by `main` before exiting non-zero
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_omits_empty_fields() {
        let value = CommandReport::ok("loaded").to_json();
        assert_eq!(value, json!({"success": true, "message": "loaded"}));

        let value = CommandReport::failed("boom").to_json();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "boom");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_report_with_data() {
        let value = CommandReport::with_data(json!({"ok": true})).to_json();
        assert_eq!(value["data"]["ok"], true);
        assert!(value.get("message").is_none());
    }
}
