//! Line-oriented extractor/loader message protocol.
//!
//! Each line on a plugin's standard output is one JSON object with a `type`
//! tag. The pipeline forwards every line opaquely and only needs to tell
//! state messages apart from the rest.

use serde_json::{Map, Value};

/// Message kind decoded from the `type` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Schema,
    Record,
    State,
    ActivateVersion,
    Batch,
    /// Any tag this host does not know about. Forwarded untouched.
    Other(String),
}

impl MessageKind {
    /// Map a wire tag onto a kind. Matching is case-insensitive.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_uppercase().as_str() {
            "SCHEMA" => Self::Schema,
            "RECORD" => Self::Record,
            "STATE" => Self::State,
            "ACTIVATE_VERSION" => Self::ActivateVersion,
            "BATCH" => Self::Batch,
            _ => Self::Other(tag.to_string()),
        }
    }

    /// Wire tag for this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Schema => "SCHEMA",
            Self::Record => "RECORD",
            Self::State => "STATE",
            Self::ActivateVersion => "ACTIVATE_VERSION",
            Self::Batch => "BATCH",
            Self::Other(tag) => tag,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded protocol line: its kind plus the full JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolLine {
    pub kind: MessageKind,
    pub body: Map<String, Value>,
}

impl ProtocolLine {
    /// Decode one line of plugin output.
    ///
    /// Returns `None` for anything that is not a JSON object with a string
    /// `type` field. Such lines are still forwarded and logged by callers;
    /// they are just never interpreted.
    #[must_use]
    pub fn decode(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let Ok(Value::Object(body)) = serde_json::from_str::<Value>(trimmed) else {
            return None;
        };
        let kind = MessageKind::from_tag(body.get("type")?.as_str()?);
        Some(Self { kind, body })
    }

    #[must_use]
    pub fn is_state(&self) -> bool {
        self.kind == MessageKind::State
    }

    /// The bookmark payload of a STATE message (its `value` object).
    ///
    /// `None` for other kinds, or for STATE messages whose `value` is not an
    /// object.
    #[must_use]
    pub fn state_value(&self) -> Option<&Map<String, Value>> {
        if !self.is_state() {
            return None;
        }
        self.body.get("value")?.as_object()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_known_kinds() {
        let line = ProtocolLine::decode(r#"{"type":"RECORD","stream":"users","record":{}}"#).unwrap();
        assert_eq!(line.kind, MessageKind::Record);
        assert_eq!(line.body["stream"], "users");

        let line = ProtocolLine::decode(r#"{"type":"schema","stream":"users"}"#).unwrap();
        assert_eq!(line.kind, MessageKind::Schema);
    }

    #[test]
    fn unknown_tag_is_passthrough() {
        let line = ProtocolLine::decode(r#"{"type":"METRIC","value":1}"#).unwrap();
        assert_eq!(line.kind, MessageKind::Other("METRIC".into()));
        assert_eq!(line.kind.to_string(), "METRIC");
        assert!(line.state_value().is_none());
    }

    #[test]
    fn state_value_extracted() {
        let line =
            ProtocolLine::decode(r#"{"type":"STATE","value":{"bookmarks":{"s1":1}}}"#).unwrap();
        assert!(line.is_state());
        assert_eq!(
            Value::Object(line.state_value().unwrap().clone()),
            json!({"bookmarks": {"s1": 1}})
        );
    }

    #[test]
    fn malformed_lines_are_not_messages() {
        assert!(ProtocolLine::decode("INFO starting sync").is_none());
        assert!(ProtocolLine::decode("{not json").is_none());
        assert!(ProtocolLine::decode(r#"{"value":{"a":1}}"#).is_none());
        assert!(ProtocolLine::decode(r#"{"type":7}"#).is_none());
        assert!(ProtocolLine::decode("").is_none());
    }

    #[test]
    fn state_with_non_object_value_has_no_payload() {
        let line = ProtocolLine::decode(r#"{"type":"STATE","value":"oops"}"#).unwrap();
        assert!(line.is_state());
        assert!(line.state_value().is_none());
    }
}
