//! Call multiplexing over a single connection.
//!
//! Every frame carries its call's correlation id. The client side
//! ([`RpcChannel`]) opens calls and routes replies back to the caller's
//! stream; the server side ([`serve_connection`]) hands each opened call to
//! an [`RpcService`].

mod client;
mod server;

use tierlink_proto::codec::{Codec, FrameHeader, MessageType, FRAME_HEADER_SIZE};
use tierlink_proto::{CorrelationId, Envelope, ProtocolError, RpcFrame, Status};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use client::RpcChannel;
pub use server::{serve, serve_connection, Router, RpcService};

/// Frames queued for the writer task.
const WRITE_QUEUE_DEPTH: usize = 256;

/// Queue feeding a connection's writer task.
pub(crate) type Outbound = mpsc::Sender<(MessageType, Envelope<RpcFrame>)>;

/// Told about a call whose frame the writer could not encode.
pub(crate) type RejectedFrame = Box<dyn Fn(CorrelationId, Status) + Send + Sync>;

/// Reads one frame. `Ok(None)` means the peer closed the connection cleanly.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope<RpcFrame>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = FrameHeader::decode(&header_buf)?;
    let len = header.validate()?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let envelope: Envelope<RpcFrame> = Codec::decode(&payload)?;
    if !envelope.header.is_compatible() {
        return Err(ProtocolError::UnsupportedVersion(envelope.header.version));
    }
    Ok(Some(envelope))
}

/// Spawns the task that serialises all writes to one connection.
///
/// A write failure cancels `shutdown`, which the reader side observes. A
/// frame that cannot be encoded fails its call on both ends: the peer gets
/// a `ResourceExhausted` error frame instead and `rejected` is told locally.
pub(crate) fn spawn_writer<W>(mut writer: W, shutdown: CancellationToken, rejected: RejectedFrame) -> Outbound
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<(MessageType, Envelope<RpcFrame>)>(WRITE_QUEUE_DEPTH);

    tokio::spawn(async move {
        let mut codec = Codec::with_capacity(8192);
        loop {
            let item = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                item = rx.recv() => item,
            };
            let Some((message_type, envelope)) = item else {
                break;
            };

            let encoded = codec.encode(&envelope, message_type).map(|_| ());
            if let Err(e) = encoded {
                let call = envelope.header.correlation_id;
                warn!(%call, error = %e, "failing call with unencodable frame");
                let status = Status::resource_exhausted(format!("frame rejected: {e}"));
                rejected(call, status.clone());
                if matches!(envelope.payload, RpcFrame::Error(_)) {
                    continue;
                }
                let notice = Envelope::for_call(call, RpcFrame::Error(status));
                if codec.encode(&notice, message_type).is_err() {
                    continue;
                }
            }

            let bytes = codec.last_frame();
            if let Err(e) = writer.write_all(bytes).await {
                warn!(error = %e, "connection write failed");
                shutdown.cancel();
                break;
            }
            if let Err(e) = writer.flush().await {
                warn!(error = %e, "connection flush failed");
                shutdown.cancel();
                break;
            }
        }
        debug!("writer task stopped");
        let _ = writer.shutdown().await;
    });

    tx
}
