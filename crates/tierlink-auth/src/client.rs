//! Client half of the authenticated channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tierlink_core::{BidiStream, RpcChannel, StatusError, StreamFrame, StreamReceiver, StreamSender};
use tierlink_proto::{AuthMessage, Method, Status};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::HandshakeClientHandler;

/// Lifecycle of a client authentication channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Created, nothing sent yet.
    Init,
    /// Initial message sent, exchanging challenges.
    Handshaking,
    /// The server accepted us; the stream is now a revocation long-poll.
    Authenticated,
    /// The server closed the long-poll.
    Revoked,
    /// We closed the long-poll.
    Stopped,
    /// The handshake or the channel failed.
    Failed,
}

impl AuthState {
    /// Terminal states never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Revoked | Self::Stopped | Self::Failed)
    }
}

/// Observable authenticated flag.
///
/// The driver is the only writer; any number of handles may read or wait.
#[derive(Debug, Clone)]
pub struct AuthStatus {
    rx: watch::Receiver<bool>,
}

impl AuthStatus {
    /// Returns the current value of the flag.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is false, immediately if it already is.
    ///
    /// Also resolves if the driver is gone.
    pub async fn unauthenticated(&mut self) {
        let _ = self.rx.wait_for(|authenticated| !*authenticated).await;
    }

    /// Resolves once the flag is true. Returns false if the driver went away
    /// first.
    pub async fn authenticated(&mut self) -> bool {
        self.rx.wait_for(|authenticated| *authenticated).await.is_ok()
    }
}

/// State shared between the driver and its message loop.
#[derive(Debug)]
struct Session {
    state: Mutex<AuthState>,
    flag: watch::Sender<bool>,
}

impl Session {
    fn state(&self) -> AuthState {
        *self.state.lock()
    }

    /// Moves to `next` unless already terminal. The flag follows the state.
    fn transition(&self, next: AuthState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        self.flag.send_replace(next == AuthState::Authenticated);
        true
    }
}

type Outcome = Result<(), StatusError>;

/// Drives the client side of one authentication channel.
///
/// `start` sends the mechanism's initial message and waits, bounded by the
/// handshake timeout, for the exchange to finish. After success the stream
/// stays open; if the server completes it the state becomes `Revoked` and
/// every [`AuthStatus`] observes `false`.
pub struct AuthClientDriver {
    handler: Option<HandshakeClientHandler>,
    timeout: Duration,
    session: Arc<Session>,
    cancel: CancellationToken,
    channel_id: Option<String>,
    sender: Option<StreamSender<AuthMessage>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for AuthClientDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClientDriver")
            .field("channel_id", &self.channel_id)
            .field("state", &self.state())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AuthClientDriver {
    /// Creates a driver that waits at most `timeout` for the handshake.
    #[must_use]
    pub fn new(handler: HandshakeClientHandler, timeout: Duration) -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            handler: Some(handler),
            timeout,
            session: Arc::new(Session {
                state: Mutex::new(AuthState::Init),
                flag,
            }),
            cancel: CancellationToken::new(),
            channel_id: None,
            sender: None,
            task: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.session.state()
    }

    /// Returns true while the channel is authenticated.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state() == AuthState::Authenticated
    }

    /// Handle to observe the authenticated flag.
    #[must_use]
    pub fn subscribe(&self) -> AuthStatus {
        AuthStatus {
            rx: self.session.flag.subscribe(),
        }
    }

    /// Token that interrupts a pending [`start`](Self::start).
    #[must_use]
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Channel id passed to `start`, if started.
    #[must_use]
    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    /// Opens the authentication method on `channel` and runs the handshake.
    pub async fn start_on(&mut self, channel: &RpcChannel, channel_id: &str) -> Outcome {
        let stream = channel.open(Method::Authenticate, None).await?;
        self.start(channel_id, stream).await
    }

    /// Runs the handshake over `stream`.
    ///
    /// Errors:
    /// - `Unauthenticated` if the mechanism failed or the server rejected us
    /// - `AuthDisabled` if the server does not implement authentication
    /// - `Unavailable` on timeout, local cancellation or a broken stream
    /// - `InvalidState` if called twice
    pub async fn start(&mut self, channel_id: &str, stream: BidiStream<AuthMessage, AuthMessage>) -> Outcome {
        let Some(mut handler) = self.handler.take() else {
            return Err(StatusError::InvalidState(
                "authentication channel already started".into(),
            ));
        };
        self.channel_id = Some(channel_id.to_owned());
        let (sender, receiver) = stream.split();

        self.session.transition(AuthState::Handshaking);
        debug!(channel_id, scheme = handler.scheme(), "starting authentication");

        let initial = match handler.initial_message(channel_id) {
            Ok(message) => message,
            Err(e) => {
                self.session.transition(AuthState::Failed);
                let _ = sender.fail(Status::unauthenticated(e.to_string())).await;
                return Err(StatusError::Unauthenticated(e.to_string()));
            }
        };
        if let Err(e) = sender.send(initial).await {
            self.session.transition(AuthState::Failed);
            return Err(e);
        }

        let (done_tx, mut done_rx) = oneshot::channel();
        self.task = Some(tokio::spawn(drive(
            handler,
            sender.clone(),
            receiver,
            Arc::clone(&self.session),
            done_tx,
            channel_id.to_owned(),
        )));
        self.sender = Some(sender);

        let outcome = tokio::select! {
            biased;
            outcome = &mut done_rx => outcome.unwrap_or_else(|_| {
                Err(StatusError::Unknown("handshake ended without an outcome".into()))
            }),
            () = self.cancel.cancelled() => {
                self.abandon("authentication interrupted").await;
                Err(StatusError::Unavailable("authentication interrupted".into()))
            }
            () = tokio::time::sleep(self.timeout) => {
                self.abandon("authentication timed out").await;
                Err(StatusError::Unavailable(format!(
                    "authentication did not complete within {:?}",
                    self.timeout
                )))
            }
        };

        match &outcome {
            Ok(()) => info!(channel_id, "channel authenticated"),
            Err(e) => debug!(channel_id, error = %e, "authentication failed"),
        }
        outcome
    }

    /// Stops an authenticated channel by closing our end of the stream.
    ///
    /// Does nothing unless authenticated. Never fails: errors are logged.
    pub async fn stop(&mut self) {
        if self.state() != AuthState::Authenticated {
            return;
        }
        self.session.transition(AuthState::Stopped);

        if let Some(sender) = self.sender.take() {
            if let Err(e) = sender.complete().await {
                warn!(channel_id = ?self.channel_id, error = %e, "failed to close authentication stream");
            }
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        debug!(channel_id = ?self.channel_id, "authentication channel stopped");
    }

    /// Gives up on a pending handshake.
    async fn abandon(&mut self, reason: &str) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.session.transition(AuthState::Failed);
        if let Some(sender) = self.sender.take() {
            let _ = sender.fail(Status::cancelled(reason)).await;
        }
    }
}

impl Drop for AuthClientDriver {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn resolve(done: &mut Option<oneshot::Sender<Outcome>>, outcome: Outcome) {
    if let Some(done) = done.take() {
        let _ = done.send(outcome);
    }
}

/// Processes server messages for the lifetime of the channel.
async fn drive(
    mut handler: HandshakeClientHandler,
    sender: StreamSender<AuthMessage>,
    mut receiver: StreamReceiver<AuthMessage>,
    session: Arc<Session>,
    done: oneshot::Sender<Outcome>,
    channel_id: String,
) {
    let mut done = Some(done);

    loop {
        let frame = receiver.next().await;
        let state = session.state();

        match frame {
            Some(StreamFrame::Message(message)) if state == AuthState::Handshaking => {
                match handler.handle_message(&message) {
                    Ok(Some(response)) => {
                        if let Err(e) = sender.send(response).await {
                            session.transition(AuthState::Failed);
                            resolve(&mut done, Err(e));
                            return;
                        }
                    }
                    Ok(None) => {
                        // Flag before waking the caller so a revoke that
                        // follows immediately is never lost.
                        session.transition(AuthState::Authenticated);
                        resolve(&mut done, Ok(()));
                    }
                    Err(e) => {
                        warn!(%channel_id, error = %e, "handshake mechanism failed");
                        session.transition(AuthState::Failed);
                        let _ = sender.fail(Status::unauthenticated(e.to_string())).await;
                        resolve(&mut done, Err(StatusError::Unauthenticated(e.to_string())));
                        return;
                    }
                }
            }
            Some(StreamFrame::Message(_)) => {
                debug!(%channel_id, ?state, "ignoring message on authenticated channel");
            }
            Some(StreamFrame::Completed) => {
                if state == AuthState::Authenticated {
                    if session.transition(AuthState::Revoked) {
                        info!(%channel_id, "authentication revoked by coordinator");
                    }
                } else {
                    session.transition(AuthState::Failed);
                    resolve(
                        &mut done,
                        Err(StatusError::Unauthenticated(
                            "coordinator closed the stream before authentication completed".into(),
                        )),
                    );
                }
                return;
            }
            Some(StreamFrame::Error(status)) => {
                let error = StatusError::from_auth_status(&status);
                if state == AuthState::Authenticated {
                    warn!(%channel_id, error = %error, "authenticated channel failed");
                }
                session.transition(AuthState::Failed);
                resolve(&mut done, Err(error));
                return;
            }
            None => {
                if state == AuthState::Authenticated {
                    warn!(%channel_id, "authenticated channel lost");
                }
                session.transition(AuthState::Failed);
                resolve(
                    &mut done,
                    Err(StatusError::Unavailable("authentication stream closed".into())),
                );
                return;
            }
        }
    }
}
