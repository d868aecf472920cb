//! Core infrastructure for tierlink.
//!
//! - **Transport**: TCP and Unix socket connections to the coordinator
//! - **Stream**: in-process message streams with explicit terminal frames
//! - **Mux**: many concurrent calls over one connection, client and server side
//! - **Status**: the failure taxonomy every call surfaces

pub mod mux;
pub mod status;
pub mod stream;
pub mod transport;

pub use mux::{serve, serve_connection, Router, RpcChannel, RpcService};
pub use status::StatusError;
pub use stream::{bridge, duplex, BidiStream, StreamFrame, StreamReceiver, StreamSender};
pub use transport::{Connection, Listener, Transport, TransportError};
