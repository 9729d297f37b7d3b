//! Jsonipc remote calls over a WebSocket.
//!
//! Lets a front-end process call methods on objects living in a remote engine
//! and await correlated replies over one persistent channel.
//!
//! # Architecture
//!
//! - **Transport**: owns the WebSocket and surfaces open/message/error/close events
//! - **Multiplexer**: assigns correlation ids and settles pending calls on reply
//! - **Session**: wires both together and runs the bootstrap handshake
//! - **Protocol**: call and reply envelope types shared by all of the above

pub mod multiplexer;
pub mod protocol;
pub mod session;
pub mod transport;

pub use multiplexer::{CallMultiplexer, PendingCall, ReplyOutcome};
pub use protocol::{CallEnvelope, CallId, ObjectId, RemoteFault, ReplyEnvelope};
pub use session::{Server, Session, SessionDriver, SessionFailure, SessionState};
pub use transport::{Connection, ConnectionState, MessageSink, TransportEvent};
