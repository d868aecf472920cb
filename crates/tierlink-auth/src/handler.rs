//! Handshake handlers translating mechanism steps into stream messages.

use tierlink_proto::{AuthMessage, AuthMessageType};

use crate::mechanism::{ClientMechanism, MechanismError, ServerMechanism, ServerStep};

/// Client-side handshake handler.
pub struct HandshakeClientHandler {
    mechanism: Box<dyn ClientMechanism>,
}

impl std::fmt::Debug for HandshakeClientHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeClientHandler")
            .field("scheme", &self.mechanism.name())
            .field("complete", &self.mechanism.is_complete())
            .finish()
    }
}

impl HandshakeClientHandler {
    /// Wraps a client mechanism.
    #[must_use]
    pub fn new(mechanism: Box<dyn ClientMechanism>) -> Self {
        Self { mechanism }
    }

    /// Name of the mechanism in use.
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.mechanism.name()
    }

    /// Builds the message that opens the handshake on `channel_id`.
    pub fn initial_message(&mut self, channel_id: &str) -> Result<AuthMessage, MechanismError> {
        let payload = self.mechanism.initial_response()?;
        Ok(AuthMessage::challenge(channel_id, payload).with_scheme(self.mechanism.name()))
    }

    /// Processes a message from the server.
    ///
    /// Returns the response to send, or `None` when the server declared
    /// success and the mechanism agrees the exchange is complete.
    pub fn handle_message(&mut self, message: &AuthMessage) -> Result<Option<AuthMessage>, MechanismError> {
        match message.message_type {
            AuthMessageType::Challenge => {
                let response = self.mechanism.evaluate_challenge(&message.payload)?;
                Ok(Some(AuthMessage::challenge(message.channel_id.clone(), response)))
            }
            AuthMessageType::Success => {
                // Mechanisms may piggyback a final server message on success.
                if !message.payload.is_empty() && !self.mechanism.is_complete() {
                    self.mechanism.evaluate_challenge(&message.payload)?;
                }
                if self.mechanism.is_complete() {
                    Ok(None)
                } else {
                    Err(MechanismError::UnexpectedStep(
                        "server declared success before the mechanism completed".into(),
                    ))
                }
            }
        }
    }
}

/// Server-side handshake handler.
pub struct HandshakeServerHandler {
    mechanism: Box<dyn ServerMechanism>,
}

impl std::fmt::Debug for HandshakeServerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeServerHandler")
            .field("scheme", &self.mechanism.name())
            .field("authorized_id", &self.mechanism.authorized_id())
            .finish()
    }
}

impl HandshakeServerHandler {
    /// Wraps a server mechanism.
    #[must_use]
    pub fn new(mechanism: Box<dyn ServerMechanism>) -> Self {
        Self { mechanism }
    }

    /// Processes a client message and returns the reply.
    pub fn handle_message(&mut self, message: &AuthMessage) -> Result<AuthMessage, MechanismError> {
        if message.message_type != AuthMessageType::Challenge {
            return Err(MechanismError::UnexpectedStep(
                "clients may not send success".into(),
            ));
        }
        let channel_id = message.channel_id.clone();
        match self.mechanism.evaluate_response(&message.payload)? {
            ServerStep::Challenge(challenge) => Ok(AuthMessage::challenge(channel_id, challenge)),
            ServerStep::Complete(payload) => Ok(AuthMessage::success(channel_id, payload)),
        }
    }

    /// Returns true once the client is authenticated.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.mechanism.authorized_id().is_some()
    }

    /// Identity the client authenticated as.
    #[must_use]
    pub fn authorized_id(&self) -> Option<&str> {
        self.mechanism.authorized_id()
    }

    /// Name of the mechanism in use.
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.mechanism.name()
    }
}
