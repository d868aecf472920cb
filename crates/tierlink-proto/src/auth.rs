//! Authentication handshake messages.

use rkyv::{Archive, Deserialize, Serialize};

/// Kind of a handshake message.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMessageType {
    /// A mechanism step: the initial message, a challenge, or a response.
    Challenge,
    /// The server accepted the client. Sent once, by the server.
    Success,
}

/// A single message on the authentication stream.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthMessage {
    /// Message kind.
    pub message_type: AuthMessageType,
    /// Opaque mechanism bytes.
    pub payload: Vec<u8>,
    /// Channel the handshake authenticates.
    pub channel_id: String,
    /// Mechanism name, only set on the initial message.
    pub scheme: Option<String>,
}

impl AuthMessage {
    /// Creates a challenge (or response) message.
    #[must_use]
    pub fn challenge(channel_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_type: AuthMessageType::Challenge,
            payload,
            channel_id: channel_id.into(),
            scheme: None,
        }
    }

    /// Creates a success message.
    #[must_use]
    pub fn success(channel_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_type: AuthMessageType::Success,
            payload,
            channel_id: channel_id.into(),
            scheme: None,
        }
    }

    /// Tags the message with the mechanism name.
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    /// Returns true if this is a success message.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.message_type == AuthMessageType::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_kind() {
        let initial = AuthMessage::challenge("ch-1", b"\0alice\0secret".to_vec()).with_scheme("PLAIN");
        assert_eq!(initial.message_type, AuthMessageType::Challenge);
        assert_eq!(initial.scheme.as_deref(), Some("PLAIN"));
        assert!(!initial.is_success());

        let done = AuthMessage::success("ch-1", Vec::new());
        assert!(done.is_success());
        assert!(done.scheme.is_none());
    }
}
