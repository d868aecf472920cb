//! Pluggable handshake mechanisms.

use thiserror::Error;

/// Failures raised by a mechanism while processing a handshake step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MechanismError {
    /// The peer's message could not be parsed.
    #[error("malformed handshake message: {0}")]
    Malformed(String),

    /// The credentials were checked and rejected.
    #[error("credentials rejected: {0}")]
    Rejected(String),

    /// No mechanism with this name is available.
    #[error("unsupported authentication scheme: {0}")]
    UnsupportedScheme(String),

    /// A message arrived that the mechanism does not expect at this point.
    #[error("unexpected handshake step: {0}")]
    UnexpectedStep(String),
}

/// Client side of a mechanism.
pub trait ClientMechanism: Send + Sync {
    /// Mechanism name sent with the initial message, e.g. `PLAIN`.
    fn name(&self) -> &str;

    /// Produces the first message of the exchange.
    fn initial_response(&mut self) -> Result<Vec<u8>, MechanismError>;

    /// Answers a server challenge.
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError>;

    /// Returns true once the client has nothing more to send.
    fn is_complete(&self) -> bool;
}

/// Result of the server evaluating one client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStep {
    /// Send this challenge and wait for another response.
    Challenge(Vec<u8>),
    /// The client is authenticated; send success with this payload.
    Complete(Vec<u8>),
}

/// Server side of a mechanism.
pub trait ServerMechanism: Send {
    /// Mechanism name.
    fn name(&self) -> &str;

    /// Evaluates a client message.
    fn evaluate_response(&mut self, response: &[u8]) -> Result<ServerStep, MechanismError>;

    /// Identity the client authenticated as, once complete.
    fn authorized_id(&self) -> Option<&str>;
}

/// Creates server mechanisms by name.
pub trait MechanismProvider: Send + Sync {
    /// Returns a fresh server mechanism for `scheme`.
    fn server_mechanism(&self, scheme: &str) -> Result<Box<dyn ServerMechanism>, MechanismError>;
}
