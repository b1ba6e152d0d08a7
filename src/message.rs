//! Opaque identifiers and payloads exchanged over the transport.

use std::fmt;
use uuid::Uuid;

/// Opaque identifier a client chooses at subscription time to correlate its
/// SSE subscription with its POSTs, stable across underlying TCP reconnects
/// within the keep-alive window.
///
/// The reference client generates a v4 UUID, but the server treats it as an
/// opaque string — any caller-supplied identifier is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a new random client id (v4 UUID).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing caller-supplied identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// An application payload carried by the transport.
///
/// Messages are opaque to the transport except that they must survive a
/// round trip through the configured text codec (JSON) unchanged: the wire
/// representation is always a JSON-encoded string, never an arbitrary JSON
/// value, so embedded newlines and control characters cannot corrupt SSE
/// framing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Message(String);

impl Message {
    /// Wrap a string as a message payload.
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    /// Borrow the payload.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the message, returning the owned payload.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The transport-level directive carried by a `control` SSE event.
///
/// The only defined value is `Close`; any other literal is a protocol
/// mismatch and is treated as a hard error by the client (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDirective {
    /// Instructs the client to tear down the transport immediately.
    Close,
}

impl ControlDirective {
    /// Parse the literal body of a `control` SSE event.
    pub fn parse(body: &str) -> std::result::Result<Self, String> {
        match body {
            "close" => Ok(Self::Close),
            other => Err(other.to_string()),
        }
    }

    /// The wire literal for this directive.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Close => "close",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn client_id_round_trips_through_display() {
        let id = ClientId::new("abc-123");
        assert_eq!(id.to_string(), "abc-123");
        assert_eq!(id.as_str(), "abc-123");
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn message_serializes_as_plain_string() {
        let msg = Message::new("hello \"world\"\nwith newline");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, "\"hello \\\"world\\\"\\nwith newline\"");
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn control_directive_rejects_unknown_literals() {
        assert_eq!(ControlDirective::parse("close"), Ok(ControlDirective::Close));
        assert_eq!(
            ControlDirective::parse("reset"),
            Err("reset".to_string())
        );
    }

    proptest::proptest! {
        #[test]
        fn message_round_trips_through_json_for_any_string(payload: String) {
            let msg = Message::new(payload);
            let json = serde_json::to_string(&msg).unwrap();
            let back: Message = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, msg);
        }
    }
}
