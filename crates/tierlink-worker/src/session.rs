//! The worker's connection to the coordinator.

use tierlink_auth::{AuthClientDriver, AuthStatus, HandshakeClientHandler, PlainClient, PLAIN};
use tierlink_core::{RpcChannel, StatusError};
use tierlink_proto::CorrelationId;
use tracing::{info, warn};

use crate::config::{AuthSettings, ConfigError, WorkerConfig};
use crate::error::Result;

/// An open, possibly authenticated, coordinator connection.
pub struct CoordinatorSession {
    channel: RpcChannel,
    driver: Option<AuthClientDriver>,
    status: Option<AuthStatus>,
}

impl std::fmt::Debug for CoordinatorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorSession")
            .field("peer", &self.channel.peer())
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl CoordinatorSession {
    /// Connects to the configured coordinator and authenticates.
    pub async fn establish(config: &WorkerConfig) -> Result<Self> {
        let coordinator = &config.coordinator;
        let connection = coordinator
            .transport
            .connect_timeout(coordinator.connect_timeout())
            .await?;
        let channel = RpcChannel::from_connection(connection);
        info!(coordinator = %coordinator.transport, "connected to coordinator");
        Self::authenticate(channel, &config.auth).await
    }

    /// Authenticates an open channel.
    ///
    /// If the coordinator has authentication disabled and `allow_disabled`
    /// is set, the session proceeds unauthenticated.
    pub async fn authenticate(channel: RpcChannel, settings: &AuthSettings) -> Result<Self> {
        if !settings.enabled {
            return Ok(Self::unauthenticated(channel));
        }
        if !settings.scheme.eq_ignore_ascii_case(PLAIN) {
            channel.close();
            return Err(ConfigError::Invalid(format!(
                "unsupported authentication scheme {}",
                settings.scheme
            ))
            .into());
        }

        let mechanism = PlainClient::new(settings.username.clone(), settings.password.clone());
        let mut driver = AuthClientDriver::new(
            HandshakeClientHandler::new(Box::new(mechanism)),
            settings.handshake_timeout(),
        );
        let status = driver.subscribe();
        let channel_id = CorrelationId::new().to_string();

        match driver.start_on(&channel, &channel_id).await {
            Ok(()) => Ok(Self {
                channel,
                driver: Some(driver),
                status: Some(status),
            }),
            Err(StatusError::AuthDisabled) if settings.allow_disabled => {
                warn!(coordinator = channel.peer(), "coordinator has authentication disabled, continuing without");
                Ok(Self::unauthenticated(channel))
            }
            Err(e) => {
                channel.close();
                Err(e.into())
            }
        }
    }

    fn unauthenticated(channel: RpcChannel) -> Self {
        Self {
            channel,
            driver: None,
            status: None,
        }
    }

    /// The multiplexed channel for coordinator calls.
    #[must_use]
    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    /// Returns true while the session is authenticated.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.status.as_ref().is_some_and(AuthStatus::is_authenticated)
    }

    /// Handle on the authenticated flag, if the session authenticated.
    #[must_use]
    pub fn status(&self) -> Option<AuthStatus> {
        self.status.clone()
    }

    /// Resolves when the session can no longer be used: the coordinator
    /// revoked it or the connection closed.
    pub async fn lost(&self) {
        match self.status.clone() {
            Some(mut status) => {
                tokio::select! {
                    () = status.unauthenticated() => {}
                    () = self.channel.closed() => {}
                }
            }
            None => self.channel.closed().await,
        }
    }

    /// Stops the authentication channel, then closes the connection.
    pub async fn close(mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.stop().await;
        }
        self.channel.close();
        info!(coordinator = self.channel.peer(), "coordinator session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn session_can_be_shared_with_spawned_tasks() {
        assert_send_sync::<CoordinatorSession>();
        assert_send_sync::<AuthClientDriver>();
    }
}
