//! Jsonipc Core - correlated async remote calls into an engine process.
//!
//! This crate connects to an engine over a WebSocket, authenticates with an
//! opaque credential, bootstraps the engine's root object and then lets
//! callers invoke methods on remote objects and await their replies.
//!
//! # Example
//!
//! ```rust,ignore
//! use jsonipc_core::{ClientConfig, Session};
//!
//! #[tokio::main]
//! async fn main() -> jsonipc_core::Result<()> {
//!     let session = Session::connect(&ClientConfig::default())?;
//!
//!     // Waits for the bootstrap handshake
//!     let server = session.server().await?;
//!
//!     let name = server.call("getName", vec![]).await?;
//!     println!("Engine: {}", name);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ipc;
pub mod object;

// Re-export commonly used types
pub use config::{ClientConfig, Endpoint};
pub use error::{JsonipcError, Result};
pub use ipc::{
    CallMultiplexer, Connection, ConnectionState, MessageSink, PendingCall, ReplyOutcome,
    Server, Session, SessionFailure, SessionState, TransportEvent,
};
pub use object::{ObjectProxy, RemoteObject};
