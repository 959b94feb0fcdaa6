// Core domain types shared across all Syncwire crates.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A document as carried on the wire: a flat map of top-level fields.
///
/// The store sink decides how documents are materialized locally; the
/// session core only ever merges and replaces whole top-level fields.
pub type Document = serde_json::Map<String, Value>;

/// Identity of a document within a collection. Opaque to the session core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(pub String);

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of a method invocation. Allocated from a per-connection
/// monotonic counter and stringified on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodId(pub String);

impl MethodId {
    /// Build an id from the connection's monotonic counter.
    pub fn from_seq(seq: u64) -> Self {
        Self(seq.to_string())
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MethodId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubId(pub String);

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A structured application-level error, as carried in `result` and `nosub`
/// messages. `error` is a machine-readable code (string or number), `reason`
/// a human-readable sentence, `details` free-form context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodError {
    pub error: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Marks an error a test (or stub) anticipates, so the stub-exception
    /// diagnostic log is suppressed for it. Never serialized.
    #[serde(skip)]
    pub expected: bool,
}

impl MethodError {
    pub fn new(error: impl Into<Value>, reason: impl Into<String>) -> Self {
        Self { error: error.into(), reason: Some(reason.into()), details: None, expected: false }
    }

    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn expected(mut self) -> Self {
        self.expected = true;
        self
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} [{}]", reason, display_code(&self.error)),
            None => write!(f, "method error {}", display_code(&self.error)),
        }
    }
}

impl std::error::Error for MethodError {}

/// Render the error code without JSON string quoting.
fn display_code(code: &Value) -> String {
    match code {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Merge a `changed` message's effect into a document: set every field in
/// `fields`, then drop every field named in `cleared`.
pub fn merge_document_fields(doc: &mut Document, fields: &Document, cleared: &[String]) {
    for (key, value) in fields {
        doc.insert(key.clone(), value.clone());
    }
    for key in cleared {
        doc.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn doc_id_serializes_transparently() {
        let id = DocId::from("abc123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc123\"");
    }

    #[test]
    fn method_id_from_seq_stringifies() {
        assert_eq!(MethodId::from_seq(7), MethodId("7".to_string()));
    }

    #[test]
    fn method_error_round_trips() {
        let err = MethodError::new(404, "not found").with_details(json!({"collection": "tasks"}));
        let encoded = serde_json::to_string(&err).unwrap();
        let decoded: MethodError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, err);
        assert!(!decoded.expected);
    }

    #[test]
    fn method_error_display_prefers_reason() {
        let err = MethodError::new("internal-error", "something broke");
        assert_eq!(err.to_string(), "something broke [internal-error]");

        let bare = MethodError { error: json!(500), reason: None, details: None, expected: false };
        assert_eq!(bare.to_string(), "method error 500");
    }

    #[test]
    fn merge_sets_fields_and_drops_cleared() {
        let mut doc = Document::new();
        doc.insert("a".into(), json!(1));
        doc.insert("b".into(), json!(2));

        let mut fields = Document::new();
        fields.insert("b".into(), json!(20));
        fields.insert("c".into(), json!(3));

        merge_document_fields(&mut doc, &fields, &["a".to_string()]);

        assert_eq!(doc.get("a"), None);
        assert_eq!(doc.get("b"), Some(&json!(20)));
        assert_eq!(doc.get("c"), Some(&json!(3)));
    }
}
