/*!
 * Result envelopes and status codes for bus RPCs.
 *
 * Every request/reply call on the bus answers with the same JSON shape:
 * `{code, message, params?}`, where a zero code means success and any
 * nonzero code is a failure with `message` as the human-readable reason.
 */
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status code for a successful call
pub const CODE_SUCCESS: i64 = 0;

/// Fixed status code reported when a thing callback signals an
/// unclassified failure
pub const CODE_UNKNOWN: i64 = 100_000;

/// Connect-result status code that demands a fresh connect attempt
pub const CODE_RETRY_CONNECT: i64 = 102;

/// The JSON result envelope every bus RPC replies with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Status code, zero on success
    pub code: i64,
    /// Human-readable outcome description
    pub message: String,
    /// Optional call-specific payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl ReplyEnvelope {
    /// Create a success envelope
    pub fn success(params: Option<Value>) -> Self {
        Self {
            code: CODE_SUCCESS,
            message: "success".to_string(),
            params,
        }
    }

    /// Create a failure envelope
    pub fn failure<S: Into<String>>(code: i64, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            params: None,
        }
    }

    /// Whether the envelope reports success
    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }

    /// Serialize the envelope to its wire JSON form
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":{},"message":"envelope serialization failure"}}"#,
                CODE_UNKNOWN
            )
        })
    }

    /// Parse an envelope from its wire JSON form
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope() {
        let envelope = ReplyEnvelope::success(Some(json!({"devNum": 2})));
        assert!(envelope.is_success());
        assert_eq!(envelope.message, "success");
        assert_eq!(envelope.params.as_ref().unwrap()["devNum"], 2);
    }

    #[test]
    fn test_failure_envelope() {
        let envelope = ReplyEnvelope::failure(5, "config missing");
        assert!(!envelope.is_success());
        assert_eq!(envelope.code, 5);
    }

    #[test]
    fn test_json_round_trip() {
        let envelope = ReplyEnvelope::success(Some(json!({"deviceCloudId": "abc"})));
        let parsed = ReplyEnvelope::from_json(&envelope.to_json()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_params_omitted_when_absent() {
        let raw = ReplyEnvelope::failure(1, "nope").to_json();
        assert!(!raw.contains("params"));
    }
}
