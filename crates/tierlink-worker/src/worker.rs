//! Worker process lifecycle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::block_master::{BlockMasterClient, RemoteBlockMaster};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::session::CoordinatorSession;
use crate::storage::LocalBlockStore;
use crate::sync::BlockMasterSync;

/// Runs a worker until `shutdown` is cancelled or the coordinator session
/// is lost.
///
/// Opens local storage, connects and authenticates, obtains a worker id,
/// registers and heartbeats. The session is always closed on the way out.
pub async fn run(config: WorkerConfig, shutdown: CancellationToken) -> Result<()> {
    let store = Arc::new(LocalBlockStore::open(&config.storage).await?);
    let session = CoordinatorSession::establish(&config).await?;

    let outcome = serve(&config, &session, store, shutdown.clone()).await;
    shutdown.cancel();
    session.close().await;
    outcome
}

async fn serve(
    config: &WorkerConfig,
    session: &CoordinatorSession,
    store: Arc<LocalBlockStore>,
    shutdown: CancellationToken,
) -> Result<()> {
    let service = Arc::new(
        RemoteBlockMaster::new(session.channel().clone())
            .with_rpc_timeout(config.heartbeat.rpc_timeout()),
    );
    let client = Arc::new(BlockMasterClient::from_config(service, config));
    let worker_id = client.get_worker_id(&config.worker.address()).await?;

    let sync = BlockMasterSync::new(client, store, worker_id, config.heartbeat.interval())
        .with_configs(config.config_properties())
        .with_max_report_blocks(config.heartbeat.max_report_blocks);

    let outcome = tokio::select! {
        result = sync.run(shutdown) => result,
        () = session.lost() => {
            error!(worker_id, "lost coordinator session");
            Err(WorkerError::SessionLost)
        }
    };
    if outcome.is_ok() {
        info!(worker_id, "worker stopped");
    }
    outcome
}
