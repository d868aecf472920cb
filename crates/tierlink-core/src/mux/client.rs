//! Client side of the multiplexer.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tierlink_proto::codec::MessageType;
use tierlink_proto::{CorrelationId, Envelope, EnvelopeHeader, Method, RpcFrame, RpcMessage, Status};
use tokio::io::ReadHalf;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use super::{read_frame, spawn_writer, Outbound};
use crate::status::StatusError;
use crate::stream::{self, bridge, BidiStream, StreamFrame, StreamReceiver, StreamSender, DEFAULT_STREAM_CAPACITY};
use crate::transport::{Connection, Transport, TransportError};

struct Shared {
    /// Sender into each open call's inbound stream.
    calls: DashMap<CorrelationId, StreamSender<RpcMessage>>,
    outbound: Outbound,
    shutdown: CancellationToken,
    peer: String,
}

impl Shared {
    async fn dispatch(&self, envelope: Envelope<RpcFrame>) {
        let call = envelope.header.correlation_id;
        let frame = match envelope.payload {
            RpcFrame::Message(message) => StreamFrame::Message(message),
            RpcFrame::Complete => StreamFrame::Completed,
            RpcFrame::Error(status) => StreamFrame::Error(status),
            RpcFrame::Open(method) => {
                warn!(%call, %method, peer = %self.peer, "ignoring call opened by the server");
                return;
            }
        };

        let sender = if frame.is_terminal() {
            self.calls.remove(&call).map(|(_, sender)| sender)
        } else {
            self.calls.get(&call).map(|entry| entry.value().clone())
        };
        let Some(sender) = sender else {
            debug!(%call, "frame for unknown call");
            return;
        };

        if sender.send_frame(frame).await.is_err() {
            self.calls.remove(&call);
        }
    }

    /// Ends one call locally with `status`.
    fn fail_call(&self, call: CorrelationId, status: Status) {
        if let Some((_, sender)) = self.calls.remove(&call) {
            tokio::spawn(async move {
                let _ = sender.fail(status).await;
            });
        }
    }

    fn fail_all(&self, status: &Status) {
        let open: Vec<CorrelationId> = self.calls.iter().map(|entry| *entry.key()).collect();
        for call in open {
            if let Some((_, sender)) = self.calls.remove(&call) {
                let status = status.clone();
                tokio::spawn(async move {
                    let _ = sender.fail(status).await;
                });
            }
        }
    }
}

/// A client connection to the coordinator carrying many concurrent calls.
///
/// Cloning is cheap; the connection closes when the last clone is dropped
/// or [`RpcChannel::close`] is called.
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("peer", &self.inner.peer)
            .field("open_calls", &self.inner.calls.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcChannel {
    /// Connects to the coordinator.
    pub async fn connect(transport: &Transport) -> Result<Self, TransportError> {
        let connection = transport.connect().await?;
        Ok(Self::from_connection(connection))
    }

    /// Wraps an established connection. Must be called within a tokio runtime.
    #[must_use]
    pub fn from_connection(connection: Box<dyn Connection>) -> Self {
        let peer = connection.peer();
        let (reader, writer) = tokio::io::split(connection);
        let shutdown = CancellationToken::new();

        let inner = Arc::new_cyclic(|shared: &Weak<Shared>| {
            let shared = shared.clone();
            let rejected = Box::new(move |call: CorrelationId, status: Status| {
                if let Some(shared) = shared.upgrade() {
                    shared.fail_call(call, status);
                }
            });
            Shared {
                calls: DashMap::new(),
                outbound: spawn_writer(writer, shutdown.clone(), rejected),
                shutdown: shutdown.clone(),
                peer,
            }
        });
        tokio::spawn(read_loop(reader, Arc::clone(&inner)));

        Self {
            inner,
            _guard: Arc::new(shutdown.drop_guard()),
        }
    }

    /// Address of the remote end.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Returns true once the connection is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves when the connection closes.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Closes the connection, failing every open call with `Unavailable`.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Number of calls currently open.
    #[must_use]
    pub fn open_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Opens a call and returns a stream typed for the method's messages.
    pub async fn open<Out, In>(
        &self,
        method: Method,
        deadline: Option<Duration>,
    ) -> Result<BidiStream<Out, In>, StatusError>
    where
        Out: Into<RpcMessage> + Send + 'static,
        In: TryFrom<RpcMessage> + Send + 'static,
    {
        let raw = self.open_raw(method, deadline).await?;
        Ok(bridge(raw))
    }

    /// Opens a call carrying untyped messages.
    pub async fn open_raw(
        &self,
        method: Method,
        deadline: Option<Duration>,
    ) -> Result<BidiStream<RpcMessage, RpcMessage>, StatusError> {
        let closed = || StatusError::Unavailable(format!("connection to {} closed", self.inner.peer));
        if self.is_closed() {
            return Err(closed());
        }

        let mut header = EnvelopeHeader::new();
        if let Some(deadline) = deadline {
            header = header.with_timeout(deadline);
        }
        let call = header.correlation_id;

        let (inbound_tx, inbound_rx) = stream::channel(DEFAULT_STREAM_CAPACITY);
        let (outbound_tx, outbound_rx) = stream::channel(DEFAULT_STREAM_CAPACITY);
        self.inner.calls.insert(call, inbound_tx);

        // The reader may have failed every call between the check above and
        // the insert; this call would then never hear back.
        if self.is_closed() {
            self.inner.calls.remove(&call);
            return Err(closed());
        }

        let message_type = method.message_type();
        let open = Envelope {
            header,
            payload: RpcFrame::Open(method),
        };
        if self.inner.outbound.send((message_type, open)).await.is_err() {
            self.inner.calls.remove(&call);
            return Err(closed());
        }

        tokio::spawn(forward_outbound(
            Arc::clone(&self.inner),
            call,
            message_type,
            outbound_rx,
        ));
        debug!(%call, %method, "call opened");

        Ok(BidiStream::new(outbound_tx, inbound_rx))
    }

    /// Sends one request and waits for the first response.
    ///
    /// The deadline bounds the whole exchange and is also sent to the server.
    pub async fn unary(
        &self,
        method: Method,
        request: RpcMessage,
        deadline: Duration,
    ) -> Result<RpcMessage, StatusError> {
        let (sender, mut receiver) = self.open_raw(method, Some(deadline)).await?.split();

        let exchange = async {
            sender.send(request).await?;
            sender.complete().await?;
            match receiver.next().await {
                Some(StreamFrame::Message(response)) => Ok(response),
                Some(StreamFrame::Error(status)) => Err(StatusError::from_status(&status)),
                Some(StreamFrame::Completed) => Err(StatusError::Internal(format!(
                    "{method} completed without a response"
                ))),
                None => Err(StatusError::Unavailable(format!(
                    "connection closed during {method}"
                ))),
            }
        };

        let outcome = tokio::time::timeout(deadline, exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                let _ = sender.fail(Status::cancelled("client deadline exceeded")).await;
                Err(StatusError::DeadlineExceeded(format!(
                    "{method} did not complete within {deadline:?}"
                )))
            }
        }
    }
}

/// Forwards one call's outgoing frames to the writer task.
async fn forward_outbound(
    shared: Arc<Shared>,
    call: CorrelationId,
    message_type: MessageType,
    mut frames: StreamReceiver<RpcMessage>,
) {
    let mut half_closed = false;
    loop {
        let frame = tokio::select! {
            () = shared.shutdown.cancelled() => return,
            frame = frames.next() => frame,
        };

        let payload = match frame {
            Some(StreamFrame::Message(message)) => RpcFrame::Message(message),
            Some(StreamFrame::Completed) => {
                half_closed = true;
                RpcFrame::Complete
            }
            Some(StreamFrame::Error(status)) => {
                shared.calls.remove(&call);
                RpcFrame::Error(status)
            }
            None if half_closed => return,
            None => {
                shared.calls.remove(&call);
                RpcFrame::Error(Status::cancelled("call dropped by client"))
            }
        };

        let failed = matches!(payload, RpcFrame::Error(_));
        let envelope = Envelope::for_call(call, payload);
        if shared.outbound.send((message_type, envelope)).await.is_err() || failed {
            return;
        }
    }
}

async fn read_loop(mut reader: ReadHalf<Box<dyn Connection>>, shared: Arc<Shared>) {
    loop {
        let frame = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(envelope)) => shared.dispatch(envelope).await,
            Ok(None) => {
                debug!(peer = %shared.peer, "coordinator closed the connection");
                break;
            }
            Err(e) => {
                warn!(peer = %shared.peer, error = %e, "failed to read frame");
                break;
            }
        }
    }

    shared.shutdown.cancel();
    shared.fail_all(&Status::unavailable(format!(
        "connection to {} closed",
        shared.peer
    )));
}
