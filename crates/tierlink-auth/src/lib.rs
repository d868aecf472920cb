//! Authenticated channel establishment.
//!
//! Before a worker's connection is trusted it runs a SASL-style
//! challenge/response handshake over a bidirectional stream. Once the
//! server signals success the same stream stays open as a revocation
//! long-poll: the server completing it tells the worker its session is no
//! longer valid.
//!
//! - [`AuthClientDriver`] runs the client half and exposes an
//!   [`AuthStatus`] handle other components can watch.
//! - [`AuthServer`] runs the server half and keeps the registry of
//!   authenticated channels.
//! - Mechanisms are pluggable through [`ClientMechanism`] and
//!   [`ServerMechanism`]; [`plain`] implements `PLAIN`.

mod client;
mod handler;
mod mechanism;
pub mod plain;
mod server;

pub use client::{AuthClientDriver, AuthState, AuthStatus};
pub use handler::{HandshakeClientHandler, HandshakeServerHandler};
pub use mechanism::{ClientMechanism, MechanismError, MechanismProvider, ServerMechanism, ServerStep};
pub use plain::{CredentialStore, PlainClient, PlainProvider, PlainServer, StaticCredentials, PLAIN};
pub use server::{AuthServer, AuthenticatedChannel, AuthenticatedChannels};
