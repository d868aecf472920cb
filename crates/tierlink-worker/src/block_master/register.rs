//! Registration stream: chunking and the bounded wait for the
//! acknowledgement.

use std::time::Duration;

use tierlink_core::{StatusError, StreamFrame};
use tierlink_proto::{LocationBlockIdListEntry, RegisterWorkerChunk, RegisterWorkerResponse, Status};
use tracing::debug;

use super::{merge_block_locations, BlockMasterService, RegistrationPayload};

/// Splits a registration snapshot into stream chunks.
///
/// The first chunk carries the metadata. Every following chunk carries at
/// most `chunk_size` block ids; a location with more ids than that is split
/// over several chunks, repeating its location key.
#[must_use]
pub fn registration_chunks(payload: &RegistrationPayload, chunk_size: usize) -> Vec<RegisterWorkerChunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = vec![RegisterWorkerChunk::Metadata(payload.metadata())];

    let mut entries: Vec<LocationBlockIdListEntry> = Vec::new();
    let mut room = chunk_size;
    for location in merge_block_locations(payload.current_blocks.iter().cloned()) {
        let mut ids = location.block_ids.as_slice();
        while !ids.is_empty() {
            let take = room.min(ids.len());
            let (head, rest) = ids.split_at(take);
            entries.push(LocationBlockIdListEntry {
                location: location.location.clone(),
                block_ids: head.to_vec(),
            });
            ids = rest;
            room -= take;

            if room == 0 {
                chunks.push(RegisterWorkerChunk::Blocks {
                    worker_id: payload.worker_id,
                    entries: std::mem::take(&mut entries),
                });
                room = chunk_size;
            }
        }
    }
    if !entries.is_empty() {
        chunks.push(RegisterWorkerChunk::Blocks {
            worker_id: payload.worker_id,
            entries,
        });
    }
    chunks
}

/// Streams `chunks` and waits up to `timeout` for the acknowledgement.
///
/// Expiry cancels the stream and yields `InvalidState`: a registration
/// cannot be resumed, only resent in full.
pub(super) async fn send_registration(
    service: &dyn BlockMasterService,
    chunks: &[RegisterWorkerChunk],
    timeout: Duration,
) -> Result<RegisterWorkerResponse, StatusError> {
    let (sender, mut receiver) = service.register_worker(timeout).await?.split();

    let exchange = async {
        for chunk in chunks {
            sender.send(chunk.clone()).await?;
        }
        sender.complete().await?;
        debug!(chunks = chunks.len(), "registration sent, awaiting acknowledgement");

        match receiver.next().await {
            Some(StreamFrame::Message(response)) => Ok(response),
            Some(StreamFrame::Error(status)) => Err(StatusError::from_status(&status)),
            Some(StreamFrame::Completed) => Err(StatusError::InvalidState(
                "coordinator closed registration without acknowledging it".into(),
            )),
            None => Err(StatusError::Unavailable("registration stream closed".into())),
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(outcome) => outcome,
        Err(_) => {
            let _ = sender.fail(Status::cancelled("registration timed out")).await;
            Err(StatusError::InvalidState(format!(
                "registration not acknowledged within {timeout:?}; the full snapshot must be resent"
            )))
        }
    }
}
