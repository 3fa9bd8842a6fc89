/*!
 * The capability interface a thing implementation provides.
 *
 * A device access instance dispatches inbound service invocations to
 * these three callbacks. Taking the full trait object at construction is
 * the fail-fast capability check: an implementation missing one of the
 * methods does not exist.
 */
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

/// Outcome of a thing callback invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackOutput {
    /// Callback status code, zero on success
    pub code: i64,
    /// Human-readable outcome description
    pub message: String,
    /// Call-specific payload: flat properties for `get`, an echo object
    /// for `set`, service output for everything else
    pub data: Value,
}

impl CallbackOutput {
    /// Create a success outcome
    pub fn ok(data: Value) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data,
        }
    }

    /// Create a failure outcome
    pub fn fail<S: Into<String>>(code: i64, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            data: Value::Null,
        }
    }

    /// Whether the callback reported success
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// The three capabilities every thing must provide
#[async_trait]
pub trait ThingCallbacks: Send + Sync {
    /// Read the requested property values; the outcome data must be a
    /// flat object keyed by property name
    async fn get_properties(&self, keys: Vec<String>) -> Result<CallbackOutput>;

    /// Apply the given property values
    async fn set_properties(&self, properties: Map<String, Value>) -> Result<CallbackOutput>;

    /// Invoke a named service with its arguments
    async fn call_service(&self, name: &str, args: Map<String, Value>) -> Result<CallbackOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_ctors() {
        let ok = CallbackOutput::ok(json!({"temperature": 21}));
        assert!(ok.is_ok());
        assert_eq!(ok.data["temperature"], 21);

        let fail = CallbackOutput::fail(3, "unsupported");
        assert!(!fail.is_ok());
        assert_eq!(fail.message, "unsupported");
    }
}
