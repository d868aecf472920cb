//! The `PLAIN` mechanism.
//!
//! The client sends a single message `authzid NUL authcid NUL passwd`. An
//! empty authorization id means "act as the authenticated user".

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::mechanism::{
    ClientMechanism, MechanismError, MechanismProvider, ServerMechanism, ServerStep,
};

/// Mechanism name.
pub const PLAIN: &str = "PLAIN";

/// Checks username/password pairs.
pub trait CredentialStore: Send + Sync {
    /// Returns true if the password is valid for `username`.
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// In-memory credential store.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    users: RwLock<HashMap<String, String>>,
}

impl StaticCredentials {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user.
    #[must_use]
    pub fn with_user(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.insert(username, password);
        self
    }

    /// Adds or replaces a user.
    pub fn insert(&self, username: impl Into<String>, password: impl Into<String>) {
        self.users.write().insert(username.into(), password.into());
    }

    /// Removes a user. Existing sessions are unaffected.
    pub fn remove(&self, username: &str) -> bool {
        self.users.write().remove(username).is_some()
    }
}

impl CredentialStore for StaticCredentials {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .read()
            .get(username)
            .is_some_and(|expected| expected == password)
    }
}

/// Client half of `PLAIN`.
pub struct PlainClient {
    authorization_id: String,
    username: String,
    password: String,
    sent: bool,
}

impl std::fmt::Debug for PlainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainClient")
            .field("username", &self.username)
            .field("sent", &self.sent)
            .finish_non_exhaustive()
    }
}

impl PlainClient {
    /// Creates a client authenticating as `username`.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authorization_id: String::new(),
            username: username.into(),
            password: password.into(),
            sent: false,
        }
    }

    /// Requests to act as a different identity.
    #[must_use]
    pub fn with_authorization_id(mut self, authorization_id: impl Into<String>) -> Self {
        self.authorization_id = authorization_id.into();
        self
    }
}

impl ClientMechanism for PlainClient {
    fn name(&self) -> &str {
        PLAIN
    }

    fn initial_response(&mut self) -> Result<Vec<u8>, MechanismError> {
        if self.username.is_empty() {
            return Err(MechanismError::Malformed("empty username".into()));
        }
        let mut message = Vec::with_capacity(
            self.authorization_id.len() + self.username.len() + self.password.len() + 2,
        );
        message.extend_from_slice(self.authorization_id.as_bytes());
        message.push(0);
        message.extend_from_slice(self.username.as_bytes());
        message.push(0);
        message.extend_from_slice(self.password.as_bytes());
        self.sent = true;
        Ok(message)
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        Err(MechanismError::UnexpectedStep(
            "PLAIN does not answer challenges".into(),
        ))
    }

    fn is_complete(&self) -> bool {
        self.sent
    }
}

/// Server half of `PLAIN`.
pub struct PlainServer {
    store: Arc<dyn CredentialStore>,
    authorized: Option<String>,
}

impl PlainServer {
    /// Creates a server mechanism checking against `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            authorized: None,
        }
    }
}

impl ServerMechanism for PlainServer {
    fn name(&self) -> &str {
        PLAIN
    }

    fn evaluate_response(&mut self, response: &[u8]) -> Result<ServerStep, MechanismError> {
        if self.authorized.is_some() {
            return Err(MechanismError::UnexpectedStep(
                "PLAIN exchange already complete".into(),
            ));
        }

        let text = std::str::from_utf8(response)
            .map_err(|_| MechanismError::Malformed("credentials are not UTF-8".into()))?;
        let mut parts = text.split('\0');
        let (Some(authzid), Some(authcid), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(MechanismError::Malformed(
                "expected authzid, authcid and password".into(),
            ));
        };

        if authcid.is_empty() {
            return Err(MechanismError::Malformed("empty username".into()));
        }
        if !self.store.verify(authcid, password) {
            return Err(MechanismError::Rejected(format!("invalid credentials for {authcid}")));
        }
        if !authzid.is_empty() && authzid != authcid {
            return Err(MechanismError::Rejected(format!(
                "{authcid} may not act as {authzid}"
            )));
        }

        self.authorized = Some(authcid.to_owned());
        Ok(ServerStep::Complete(Vec::new()))
    }

    fn authorized_id(&self) -> Option<&str> {
        self.authorized.as_deref()
    }
}

/// Provides `PLAIN` server mechanisms backed by one credential store.
#[derive(Clone)]
pub struct PlainProvider {
    store: Arc<dyn CredentialStore>,
}

impl PlainProvider {
    /// Creates a provider.
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }
}

impl MechanismProvider for PlainProvider {
    fn server_mechanism(&self, scheme: &str) -> Result<Box<dyn ServerMechanism>, MechanismError> {
        if scheme.eq_ignore_ascii_case(PLAIN) {
            Ok(Box::new(PlainServer::new(Arc::clone(&self.store))))
        } else {
            Err(MechanismError::UnsupportedScheme(scheme.to_owned()))
        }
    }
}
