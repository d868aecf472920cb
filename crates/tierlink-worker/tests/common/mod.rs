//! Common test utilities for worker integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

pub mod fixtures;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tierlink_auth::{AuthServer, PlainProvider, StaticCredentials};
use tierlink_core::transport::TcpListener;
use tierlink_core::{serve, BidiStream, Listener, Router, RpcChannel, RpcService, StreamFrame, Transport};
use tierlink_proto::{
    BlockHeartbeatRequest, BlockHeartbeatResponse, Command, CommitBlockInUfsRequest,
    CommitBlockRequest, GetWorkerIdResponse, Method, RegisterWorkerChunk, RegisterWorkerResponse,
    RpcMessage, Status, WorkerId,
};
use tokio_util::sync::CancellationToken;

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const WORKER_USER: &str = "worker";
pub const WORKER_PASSWORD: &str = "s3cret";

/// In-memory block master that records everything it is sent.
pub struct FakeMaster {
    worker_id: WorkerId,
    commits: Mutex<Vec<CommitBlockRequest>>,
    ufs_commits: Mutex<Vec<CommitBlockInUfsRequest>>,
    heartbeats: Mutex<Vec<BlockHeartbeatRequest>>,
    registrations: Mutex<Vec<Vec<RegisterWorkerChunk>>>,
    commands: Mutex<VecDeque<Command>>,
    heartbeat_attempts: AtomicU32,
    failing_heartbeats: AtomicU32,
    heartbeat_delay: Mutex<Duration>,
    stall_registration: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeMaster {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            commits: Mutex::new(Vec::new()),
            ufs_commits: Mutex::new(Vec::new()),
            heartbeats: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            commands: Mutex::new(VecDeque::new()),
            heartbeat_attempts: AtomicU32::new(0),
            failing_heartbeats: AtomicU32::new(0),
            heartbeat_delay: Mutex::new(Duration::ZERO),
            stall_registration: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// The next `count` heartbeats fail with `Unavailable`.
    pub fn fail_heartbeats(&self, count: u32) {
        self.failing_heartbeats.store(count, Ordering::SeqCst);
    }

    /// Every heartbeat is held this long before it is answered.
    pub fn delay_heartbeats(&self, delay: Duration) {
        *self.heartbeat_delay.lock() = delay;
    }

    /// Registrations are read to the end but never acknowledged.
    pub fn stall_registration(&self) {
        self.stall_registration.store(true, Ordering::SeqCst);
    }

    /// Queues a command for the next successful heartbeat.
    pub fn push_command(&self, command: Command) {
        self.commands.lock().push_back(command);
    }

    pub fn commits(&self) -> Vec<CommitBlockRequest> {
        self.commits.lock().clone()
    }

    pub fn ufs_commits(&self) -> Vec<CommitBlockInUfsRequest> {
        self.ufs_commits.lock().clone()
    }

    pub fn heartbeats(&self) -> Vec<BlockHeartbeatRequest> {
        self.heartbeats.lock().clone()
    }

    pub fn registrations(&self) -> Vec<Vec<RegisterWorkerChunk>> {
        self.registrations.lock().clone()
    }

    pub fn heartbeat_attempts(&self) -> u32 {
        self.heartbeat_attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn heartbeat(&self, request: BlockHeartbeatRequest) -> Result<Command, Status> {
        self.heartbeat_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_heartbeats
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Status::unavailable("master is busy"));
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.heartbeat_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.heartbeats.lock().push(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(self.commands.lock().pop_front().unwrap_or_else(Command::nothing))
    }
}

#[async_trait]
impl RpcService for FakeMaster {
    async fn call(&self, method: Method, stream: BidiStream<RpcMessage, RpcMessage>) {
        let (sender, mut receiver) = stream.split();
        let response = match method {
            Method::RegisterWorker => {
                let mut chunks = Vec::new();
                loop {
                    match receiver.next().await {
                        Some(StreamFrame::Message(RpcMessage::RegisterWorker(chunk))) => chunks.push(chunk),
                        Some(StreamFrame::Completed) => break,
                        _ => return,
                    }
                }
                let received_blocks = chunks.iter().map(RegisterWorkerChunk::block_count).sum::<usize>();
                self.registrations.lock().push(chunks);
                if self.stall_registration.load(Ordering::SeqCst) {
                    // Hold the call open until the client cancels it.
                    while let Some(frame) = receiver.next().await {
                        if matches!(frame, StreamFrame::Error(_)) {
                            break;
                        }
                    }
                    return;
                }
                Ok(RegisterWorkerResponse {
                    received_blocks: u64::try_from(received_blocks).unwrap(),
                }
                .into())
            }
            _ => {
                let Some(StreamFrame::Message(request)) = receiver.next().await else {
                    return;
                };
                match request {
                    RpcMessage::CommitBlock(request) => {
                        self.commits.lock().push(request);
                        Ok(RpcMessage::CommitBlockResponse)
                    }
                    RpcMessage::CommitBlockInUfs(request) => {
                        self.ufs_commits.lock().push(request);
                        Ok(RpcMessage::CommitBlockInUfsResponse)
                    }
                    RpcMessage::GetWorkerId(_) => Ok(GetWorkerIdResponse {
                        worker_id: self.worker_id,
                    }
                    .into()),
                    RpcMessage::BlockHeartbeat(request) => self
                        .heartbeat(request)
                        .await
                        .map(|command| BlockHeartbeatResponse { command }.into()),
                    other => Err(Status::invalid_argument(format!("unexpected message {}", other.name()))),
                }
            }
        };

        let _ = match response {
            Ok(message) => match sender.send(message).await {
                Ok(()) => sender.complete().await,
                Err(e) => Err(e),
            },
            Err(status) => sender.fail(status).await,
        };
    }
}

/// A coordinator listening on a loopback port.
pub struct TestCoordinator {
    pub master: Arc<FakeMaster>,
    pub auth: Option<Arc<AuthServer>>,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestCoordinator {
    /// Coordinator with `PLAIN` authentication for [`WORKER_USER`].
    pub async fn with_auth() -> Self {
        let store = Arc::new(StaticCredentials::new().with_user(WORKER_USER, WORKER_PASSWORD));
        let auth = Arc::new(AuthServer::new(Arc::new(PlainProvider::new(store))));
        Self::start(Some(auth)).await
    }

    /// Coordinator that does not serve authentication at all.
    pub async fn without_auth() -> Self {
        Self::start(None).await
    }

    async fn start(auth: Option<Arc<AuthServer>>) -> Self {
        let master = Arc::new(FakeMaster::new(42));
        let mut router = Router::new().route_all(
            &[
                Method::CommitBlock,
                Method::CommitBlockInUfs,
                Method::GetWorkerId,
                Method::BlockHeartbeat,
                Method::RegisterWorker,
            ],
            master.clone(),
        );
        if let Some(auth) = &auth {
            router = router.route(Method::Authenticate, auth.clone());
        }

        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap().parse().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(Box::new(listener), Arc::new(router), shutdown.clone()));

        Self {
            master,
            auth,
            addr,
            shutdown,
        }
    }

    pub fn transport(&self) -> Transport {
        Transport::tcp(self.addr)
    }

    /// Opens a fresh unauthenticated channel.
    pub async fn connect(&self) -> RpcChannel {
        RpcChannel::connect(&self.transport()).await.unwrap()
    }

    /// Revokes every authenticated channel, returning how many there were.
    pub fn revoke_all(&self) -> usize {
        let Some(auth) = &self.auth else {
            return 0;
        };
        let ids = auth.channels().channel_ids();
        ids.iter().filter(|id| auth.channels().revoke(id)).count()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Polls `condition` every few milliseconds until it holds or [`TIMEOUT`]
/// expires.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
