//! In-process message streams.
//!
//! A call is driven through a pair of streams, one per direction. Each
//! direction ends with exactly one terminal frame: `Completed` for a normal
//! half-close or `Error` for a failure. A receiver that yields `None` lost
//! its peer without a terminal frame.

use tierlink_proto::Status;
use tokio::sync::mpsc;

use crate::status::StatusError;

/// Default number of frames buffered per stream direction.
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

/// A frame travelling along one direction of a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame<T> {
    /// A payload message.
    Message(T),
    /// The sender failed the stream.
    Error(Status),
    /// The sender half-closed its direction.
    Completed,
}

impl<T> StreamFrame<T> {
    /// Maps the payload of a `Message` frame.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StreamFrame<U> {
        match self {
            Self::Message(message) => StreamFrame::Message(f(message)),
            Self::Error(status) => StreamFrame::Error(status),
            Self::Completed => StreamFrame::Completed,
        }
    }

    /// Returns true for `Error` and `Completed`.
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Message(_))
    }
}

/// Sending half of a stream direction.
#[derive(Debug)]
pub struct StreamSender<T> {
    tx: mpsc::Sender<StreamFrame<T>>,
}

impl<T> Clone for StreamSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> StreamSender<T> {
    /// Sends a payload message.
    pub async fn send(&self, message: T) -> Result<(), StatusError> {
        self.send_frame(StreamFrame::Message(message)).await
    }

    /// Fails the stream with `status`.
    pub async fn fail(&self, status: Status) -> Result<(), StatusError> {
        self.send_frame(StreamFrame::Error(status)).await
    }

    /// Half-closes this direction.
    pub async fn complete(&self) -> Result<(), StatusError> {
        self.send_frame(StreamFrame::Completed).await
    }

    /// Sends a raw frame.
    pub async fn send_frame(&self, frame: StreamFrame<T>) -> Result<(), StatusError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| StatusError::Unavailable("stream closed".into()))
    }

    /// Returns true once the receiving half is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a stream direction.
#[derive(Debug)]
pub struct StreamReceiver<T> {
    rx: mpsc::Receiver<StreamFrame<T>>,
}

impl<T> StreamReceiver<T> {
    /// Waits for the next frame. `None` means every sender is gone.
    pub async fn next(&mut self) -> Option<StreamFrame<T>> {
        self.rx.recv().await
    }

    /// Stops accepting frames; pending senders observe a closed stream.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Creates one stream direction.
#[must_use]
pub fn channel<T>(capacity: usize) -> (StreamSender<T>, StreamReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StreamSender { tx }, StreamReceiver { rx })
}

/// Both directions of a call as seen from one end.
#[derive(Debug)]
pub struct BidiStream<Out, In> {
    /// Frames this end sends.
    pub sender: StreamSender<Out>,
    /// Frames this end receives.
    pub receiver: StreamReceiver<In>,
}

impl<Out, In> BidiStream<Out, In> {
    /// Assembles a stream from its halves.
    #[must_use]
    pub fn new(sender: StreamSender<Out>, receiver: StreamReceiver<In>) -> Self {
        Self { sender, receiver }
    }

    /// Splits the stream into its halves.
    #[must_use]
    pub fn split(self) -> (StreamSender<Out>, StreamReceiver<In>) {
        (self.sender, self.receiver)
    }
}

/// Creates two connected ends of an in-process bidirectional stream.
#[must_use]
pub fn duplex<A, B>(capacity: usize) -> (BidiStream<A, B>, BidiStream<B, A>) {
    let (a_tx, a_rx) = channel(capacity);
    let (b_tx, b_rx) = channel(capacity);
    (BidiStream::new(a_tx, b_rx), BidiStream::new(b_tx, a_rx))
}

/// Re-types a stream through message conversions.
///
/// Outgoing messages are converted with `Into`, incoming ones with
/// `TryFrom`. An incoming message of the wrong type fails the returned
/// stream with an `Internal` status. Must be called within a tokio runtime.
pub fn bridge<Out, In, W, R>(inner: BidiStream<W, R>) -> BidiStream<Out, In>
where
    Out: Into<W> + Send + 'static,
    In: TryFrom<R> + Send + 'static,
    W: Send + 'static,
    R: Send + 'static,
{
    let (out_tx, mut out_rx) = channel::<Out>(DEFAULT_STREAM_CAPACITY);
    let (in_tx, in_rx) = channel::<In>(DEFAULT_STREAM_CAPACITY);
    let BidiStream {
        sender: inner_tx,
        receiver: mut inner_rx,
    } = inner;

    tokio::spawn(async move {
        while let Some(frame) = out_rx.next().await {
            let failed = matches!(frame, StreamFrame::Error(_));
            if inner_tx.send_frame(frame.map(Into::into)).await.is_err() || failed {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = inner_rx.next().await {
            let frame = match frame {
                StreamFrame::Message(message) => match In::try_from(message) {
                    Ok(message) => StreamFrame::Message(message),
                    Err(_) => StreamFrame::Error(Status::internal("unexpected message type on stream")),
                },
                StreamFrame::Error(status) => StreamFrame::Error(status),
                StreamFrame::Completed => StreamFrame::Completed,
            };
            let failed = matches!(frame, StreamFrame::Error(_));
            if in_tx.send_frame(frame).await.is_err() || failed {
                break;
            }
        }
    });

    BidiStream::new(out_tx, in_rx)
}
