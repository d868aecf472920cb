//! Server half of the authenticated channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use tierlink_core::{bridge, BidiStream, RpcService, StreamFrame, StreamReceiver, StreamSender};
use tierlink_proto::{AuthMessage, Method, RpcMessage, Status};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::HandshakeServerHandler;
use crate::mechanism::MechanismProvider;

/// Default bound on a server-side handshake.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// A channel that completed the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedChannel {
    pub channel_id: String,
    /// Identity the client authenticated as.
    pub authorized_id: String,
    pub scheme: String,
    pub authenticated_at: SystemTime,
}

#[derive(Debug)]
struct Entry {
    channel: AuthenticatedChannel,
    session: u64,
    revoke: CancellationToken,
}

/// Registry of authenticated channels.
#[derive(Debug, Clone, Default)]
pub struct AuthenticatedChannels {
    entries: Arc<DashMap<String, Entry>>,
}

impl AuthenticatedChannels {
    /// Returns true if `channel_id` is authenticated.
    #[must_use]
    pub fn contains(&self, channel_id: &str) -> bool {
        self.entries.contains_key(channel_id)
    }

    /// Details of an authenticated channel.
    #[must_use]
    pub fn get(&self, channel_id: &str) -> Option<AuthenticatedChannel> {
        self.entries.get(channel_id).map(|entry| entry.channel.clone())
    }

    /// Number of authenticated channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no channel is authenticated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of all authenticated channels.
    #[must_use]
    pub fn channel_ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Revokes a channel. The client observes its long-poll completing.
    ///
    /// Returns false if the channel is not authenticated.
    pub fn revoke(&self, channel_id: &str) -> bool {
        match self.entries.remove(channel_id) {
            Some((_, entry)) => {
                entry.revoke.cancel();
                true
            }
            None => false,
        }
    }

    fn insert(&self, channel: AuthenticatedChannel, session: u64, revoke: CancellationToken) {
        let previous = self.entries.insert(
            channel.channel_id.clone(),
            Entry {
                channel,
                session,
                revoke,
            },
        );
        // A re-authenticated channel replaces the old session.
        if let Some(previous) = previous {
            previous.revoke.cancel();
        }
    }

    fn remove_session(&self, channel_id: &str, session: u64) {
        self.entries.remove_if(channel_id, |_, entry| entry.session == session);
    }
}

/// Serves the `Authenticate` method.
///
/// Without a mechanism provider every stream fails with `Unimplemented`,
/// which clients report as authentication being disabled.
pub struct AuthServer {
    provider: Option<Arc<dyn MechanismProvider>>,
    channels: AuthenticatedChannels,
    handshake_timeout: Duration,
    next_session: AtomicU64,
}

impl std::fmt::Debug for AuthServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthServer")
            .field("enabled", &self.is_enabled())
            .field("channels", &self.channels.len())
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl AuthServer {
    /// Creates a server authenticating with mechanisms from `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn MechanismProvider>) -> Self {
        Self {
            provider: Some(provider),
            channels: AuthenticatedChannels::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            next_session: AtomicU64::new(1),
        }
    }

    /// Creates a server that refuses to authenticate.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            provider: None,
            channels: AuthenticatedChannels::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            next_session: AtomicU64::new(1),
        }
    }

    /// Sets the bound on each handshake.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Returns true if authentication is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Registry of authenticated channels.
    #[must_use]
    pub fn channels(&self) -> &AuthenticatedChannels {
        &self.channels
    }

    /// Runs one authentication stream to completion.
    pub async fn authenticate(&self, stream: BidiStream<AuthMessage, AuthMessage>) {
        let (sender, mut receiver) = stream.split();
        let Some(provider) = &self.provider else {
            let _ = sender
                .fail(Status::unimplemented("authentication is not enabled"))
                .await;
            return;
        };

        let handshake = tokio::time::timeout(
            self.handshake_timeout,
            handshake(provider.as_ref(), &sender, &mut receiver),
        )
        .await;
        let channel = match handshake {
            Ok(Some(channel)) => channel,
            Ok(None) => return,
            Err(_) => {
                debug!("handshake timed out");
                let _ = sender
                    .fail(Status::deadline_exceeded("handshake did not complete in time"))
                    .await;
                return;
            }
        };

        let channel_id = channel.channel_id.clone();
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let revoke = CancellationToken::new();
        info!(%channel_id, user = %channel.authorized_id, scheme = %channel.scheme, "channel authenticated");
        self.channels.insert(channel, session, revoke.clone());

        long_poll(&channel_id, &sender, &mut receiver, &revoke).await;
        self.channels.remove_session(&channel_id, session);
    }
}

/// Runs the challenge/response exchange. Returns `None` if the stream
/// ended or the client was rejected; the client has been told why.
async fn handshake(
    provider: &dyn MechanismProvider,
    sender: &StreamSender<AuthMessage>,
    receiver: &mut StreamReceiver<AuthMessage>,
) -> Option<AuthenticatedChannel> {
    let Some(StreamFrame::Message(mut message)) = receiver.next().await else {
        return None;
    };

    let scheme = message.scheme.clone().unwrap_or_default();
    let channel_id = message.channel_id.clone();
    let mut handler = match provider.server_mechanism(&scheme) {
        Ok(mechanism) => HandshakeServerHandler::new(mechanism),
        Err(e) => {
            warn!(%channel_id, error = %e, "cannot authenticate channel");
            let _ = sender.fail(Status::unauthenticated(e.to_string())).await;
            return None;
        }
    };

    loop {
        let reply = match handler.handle_message(&message) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%channel_id, error = %e, "handshake rejected");
                let _ = sender.fail(Status::unauthenticated(e.to_string())).await;
                return None;
            }
        };
        sender.send(reply).await.ok()?;

        if let Some(authorized_id) = handler.authorized_id() {
            return Some(AuthenticatedChannel {
                channel_id,
                authorized_id: authorized_id.to_owned(),
                scheme: handler.scheme().to_owned(),
                authenticated_at: SystemTime::now(),
            });
        }

        message = match receiver.next().await {
            Some(StreamFrame::Message(next)) => next,
            _ => return None,
        };
    }
}

/// Holds an authenticated stream open until revoked or closed by the client.
async fn long_poll(
    channel_id: &str,
    sender: &StreamSender<AuthMessage>,
    receiver: &mut StreamReceiver<AuthMessage>,
    revoke: &CancellationToken,
) {
    loop {
        tokio::select! {
            () = revoke.cancelled() => {
                info!(channel_id, "revoking channel");
                let _ = sender.complete().await;
                return;
            }
            frame = receiver.next() => match frame {
                Some(StreamFrame::Message(_)) => {
                    debug!(channel_id, "ignoring message on authenticated channel");
                }
                Some(StreamFrame::Completed) => {
                    debug!(channel_id, "client closed authenticated channel");
                    let _ = sender.complete().await;
                    return;
                }
                Some(StreamFrame::Error(status)) => {
                    debug!(channel_id, %status, "authenticated channel failed");
                    return;
                }
                None => return,
            },
        }
    }
}

#[async_trait]
impl RpcService for AuthServer {
    async fn call(&self, method: Method, stream: BidiStream<RpcMessage, RpcMessage>) {
        if method != Method::Authenticate {
            let _ = stream
                .sender
                .fail(Status::unimplemented(format!("method {method} is not served")))
                .await;
            return;
        }
        self.authenticate(bridge(stream)).await;
    }
}
