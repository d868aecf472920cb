//! Server side of the multiplexer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tierlink_proto::codec::MessageType;
use tierlink_proto::{CorrelationId, Envelope, Method, RpcFrame, RpcMessage, Status};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{read_frame, spawn_writer, Outbound};
use crate::stream::{self, BidiStream, StreamFrame, StreamReceiver, StreamSender, DEFAULT_STREAM_CAPACITY};
use crate::transport::{Connection, Listener, TransportError};

type CallTable = DashMap<CorrelationId, StreamSender<RpcMessage>>;

/// Handles calls accepted by [`serve_connection`].
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handles one call.
    ///
    /// `stream.receiver` yields the client's messages; responses go out
    /// through `stream.sender`, which must end with `complete()` or
    /// `fail()`.
    async fn call(&self, method: Method, stream: BidiStream<RpcMessage, RpcMessage>);
}

/// Dispatches calls to per-method services.
///
/// Methods without a route fail with `Unimplemented`.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<Method, Arc<dyn RpcService>>,
}

impl Router {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `method` to `service`.
    #[must_use]
    pub fn route(mut self, method: Method, service: Arc<dyn RpcService>) -> Self {
        self.routes.insert(method, service);
        self
    }

    /// Routes every method in `methods` to `service`.
    #[must_use]
    pub fn route_all(mut self, methods: &[Method], service: Arc<dyn RpcService>) -> Self {
        for method in methods {
            self.routes.insert(*method, Arc::clone(&service));
        }
        self
    }
}

#[async_trait]
impl RpcService for Router {
    async fn call(&self, method: Method, stream: BidiStream<RpcMessage, RpcMessage>) {
        match self.routes.get(&method) {
            Some(service) => service.call(method, stream).await,
            None => {
                let _ = stream
                    .sender
                    .fail(Status::unimplemented(format!("method {method} is not served")))
                    .await;
            }
        }
    }
}

/// Serves calls arriving on one connection until it closes or `shutdown`
/// is cancelled.
pub async fn serve_connection(
    connection: Box<dyn Connection>,
    service: Arc<dyn RpcService>,
    shutdown: CancellationToken,
) {
    let peer = connection.peer();
    let (mut reader, writer) = tokio::io::split(connection);
    let token = shutdown.child_token();
    let calls: Arc<CallTable> = Arc::new(DashMap::new());
    let rejected = {
        let calls = Arc::clone(&calls);
        Box::new(move |call: CorrelationId, status: Status| {
            if let Some((_, sender)) = calls.remove(&call) {
                tokio::spawn(async move {
                    let _ = sender.fail(status).await;
                });
            }
        })
    };
    let outbound = spawn_writer(writer, token.clone(), rejected);

    debug!(%peer, "serving connection");

    loop {
        let frame = tokio::select! {
            () = token.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        let envelope = match frame {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!(%peer, "client closed the connection");
                break;
            }
            Err(e) => {
                warn!(%peer, error = %e, "failed to read frame");
                break;
            }
        };

        let call = envelope.header.correlation_id;
        match envelope.payload {
            RpcFrame::Open(method) => {
                let message_type = method.message_type();
                if envelope.header.is_expired() {
                    debug!(%call, %method, "rejecting call opened past its deadline");
                    let reply = RpcFrame::Error(Status::deadline_exceeded("deadline already passed"));
                    let _ = outbound
                        .send((message_type, Envelope::for_call(call, reply)))
                        .await;
                    continue;
                }

                let (request_tx, request_rx) = stream::channel(DEFAULT_STREAM_CAPACITY);
                let (response_tx, response_rx) = stream::channel(DEFAULT_STREAM_CAPACITY);
                calls.insert(call, request_tx);

                tokio::spawn(forward_responses(
                    outbound.clone(),
                    Arc::clone(&calls),
                    call,
                    message_type,
                    response_rx,
                ));
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service
                        .call(method, BidiStream::new(response_tx, request_rx))
                        .await;
                });
            }
            RpcFrame::Message(message) => deliver(&calls, call, StreamFrame::Message(message)).await,
            RpcFrame::Complete => deliver(&calls, call, StreamFrame::Completed).await,
            RpcFrame::Error(status) => {
                if let Some((_, sender)) = calls.remove(&call) {
                    let _ = sender.fail(status).await;
                }
            }
        }
    }

    token.cancel();
    let open: Vec<CorrelationId> = calls.iter().map(|entry| *entry.key()).collect();
    for call in open {
        if let Some((_, sender)) = calls.remove(&call) {
            tokio::spawn(async move {
                let _ = sender.fail(Status::unavailable("client disconnected")).await;
            });
        }
    }
    debug!(%peer, "connection finished");
}

/// Accepts connections and serves each on its own task.
pub async fn serve(
    listener: Box<dyn Listener>,
    service: Arc<dyn RpcService>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    info!(address = %listener.local_addr()?, "accepting connections");

    loop {
        let connection = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        tokio::spawn(serve_connection(
            connection,
            Arc::clone(&service),
            shutdown.clone(),
        ));
    }
}

async fn deliver(calls: &CallTable, call: CorrelationId, frame: StreamFrame<RpcMessage>) {
    let Some(sender) = calls.get(&call).map(|entry| entry.value().clone()) else {
        debug!(%call, "frame for unknown call");
        return;
    };
    if sender.send_frame(frame).await.is_err() {
        calls.remove(&call);
    }
}

/// Forwards a handler's responses until it ends the call.
async fn forward_responses(
    outbound: Outbound,
    calls: Arc<CallTable>,
    call: CorrelationId,
    message_type: MessageType,
    mut responses: StreamReceiver<RpcMessage>,
) {
    loop {
        let payload = match responses.next().await {
            Some(StreamFrame::Message(message)) => RpcFrame::Message(message),
            Some(StreamFrame::Completed) => RpcFrame::Complete,
            Some(StreamFrame::Error(status)) => RpcFrame::Error(status),
            None => RpcFrame::Error(Status::internal("handler ended the call without a status")),
        };
        let finished = !matches!(payload, RpcFrame::Message(_));
        if outbound
            .send((message_type, Envelope::for_call(call, payload)))
            .await
            .is_err()
            || finished
        {
            break;
        }
    }
    calls.remove(&call);
}
