//! Session lifecycle and bootstrap handshake.
//!
//! A session owns one [`Connection`] and one [`CallMultiplexer`]. As soon as
//! the connection opens, the bootstrap method is called with no target and
//! no arguments; its result must be a positive object id, which becomes the
//! root [`Server`] object.
//!
//! ```text
//! Uninitialized --open--> Handshaking --valid id--> Ready
//!       |                      |
//!       +------ error ---------+--invalid id / error--> Failed
//! ```

use super::multiplexer::{CallMultiplexer, PendingCall, ReplyOutcome};
use super::protocol::CallId;
use super::transport::{Connection, ConnectionState, MessageSink, TransportEvent};
use crate::config::ClientConfig;
use crate::object::{ObjectProxy, RemoteObject};
use crate::{JsonipcError, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Proxy for the engine's root object.
pub type Server = ObjectProxy<Arc<Connection>>;

/// Why a session could not reach `Ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    /// The bootstrap result was not a positive object id.
    Authentication(String),
    /// The engine rejected the bootstrap call.
    Remote { code: String, message: String },
    /// The channel failed before the handshake completed.
    Transport(String),
}

impl SessionFailure {
    fn from_error(err: &JsonipcError) -> Self {
        match err {
            JsonipcError::AuthenticationFailed { message } => {
                SessionFailure::Authentication(message.clone())
            }
            JsonipcError::Remote { code, message } => SessionFailure::Remote {
                code: code.clone(),
                message: message.clone(),
            },
            other => SessionFailure::Transport(other.to_string()),
        }
    }

    pub fn to_error(&self) -> JsonipcError {
        match self {
            SessionFailure::Authentication(message) => JsonipcError::AuthenticationFailed {
                message: message.clone(),
            },
            SessionFailure::Remote { code, message } => JsonipcError::Remote {
                code: code.clone(),
                message: message.clone(),
            },
            SessionFailure::Transport(message) => JsonipcError::Transport {
                message: message.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Ready(RemoteObject),
    Failed(SessionFailure),
}

impl SessionState {
    pub fn is_settled(&self) -> bool {
        matches!(self, SessionState::Ready(_) | SessionState::Failed(_))
    }
}

/// Check the bootstrap result and turn it into the root object reference.
pub fn validate_bootstrap_result(value: &Value) -> Result<RemoteObject> {
    RemoteObject::from_value(value).map_err(|_| JsonipcError::AuthenticationFailed {
        message: format!("bootstrap returned {} instead of a positive object id", value),
    })
}

/// Move to `next` unless the handshake already settled.
fn settle(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    state.send_if_modified(|current| {
        if current.is_settled() {
            false
        } else {
            *current = next;
            true
        }
    })
}

/// Reacts to transport events on behalf of a session.
///
/// Every transition happens inside [`SessionDriver::handle_event`], so the
/// outcome of the bootstrap reply is applied before the next event is seen.
pub struct SessionDriver<S: MessageSink> {
    mux: Arc<CallMultiplexer<S>>,
    state: Arc<watch::Sender<SessionState>>,
    bootstrap: Mutex<Option<PendingCall>>,
    bootstrap_method: String,
    reject_pending_on_failure: bool,
}

impl<S: MessageSink> SessionDriver<S> {
    pub fn new(
        mux: Arc<CallMultiplexer<S>>,
        bootstrap_method: impl Into<String>,
        reject_pending_on_failure: bool,
    ) -> Self {
        Self {
            mux,
            state: Arc::new(watch::Sender::new(SessionState::Uninitialized)),
            bootstrap: Mutex::new(None),
            bootstrap_method: bootstrap_method.into(),
            reject_pending_on_failure,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.begin_handshake(),
            TransportEvent::Message(raw) => match self.mux.on_message(&raw) {
                Ok(ReplyOutcome::Settled(id)) => self.finish_handshake(id),
                Ok(ReplyOutcome::Unmatched(_)) => {}
                Err(e) => warn!("Dropping inbound message: {}", e),
            },
            TransportEvent::Error(cause) => self.on_failure(cause),
            TransportEvent::Closed => self.on_failure("connection closed".to_string()),
        }
    }

    fn bootstrap_slot(&self) -> MutexGuard<'_, Option<PendingCall>> {
        self.bootstrap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_handshake(&self) {
        let fresh = self.state.send_if_modified(|current| {
            if *current == SessionState::Uninitialized {
                *current = SessionState::Handshaking;
                true
            } else {
                false
            }
        });
        if !fresh {
            warn!("Ignoring repeated open event");
            return;
        }

        match self.mux.invoke(None, &self.bootstrap_method, vec![]) {
            Ok(pending) => {
                debug!("Bootstrap call {} issued", pending.id());
                *self.bootstrap_slot() = Some(pending);
            }
            Err(e) => {
                error!("Bootstrap call could not be sent: {}", e);
                settle(&self.state, SessionState::Failed(SessionFailure::from_error(&e)));
            }
        }
    }

    /// Apply the bootstrap outcome once its reply has been routed.
    fn finish_handshake(&self, settled_id: CallId) {
        let mut slot = self.bootstrap_slot();
        let Some(pending) = slot.as_mut().filter(|pending| pending.id() == settled_id) else {
            return;
        };
        let Some(outcome) = pending.try_settled() else {
            return;
        };
        *slot = None;
        drop(slot);

        let next = match outcome.and_then(|value| validate_bootstrap_result(&value)) {
            Ok(root) => {
                info!("Session ready, root object {}", root.id());
                SessionState::Ready(root)
            }
            Err(e) => {
                error!("Bootstrap failed: {}", e);
                SessionState::Failed(SessionFailure::from_error(&e))
            }
        };
        settle(&self.state, next);
    }

    fn on_failure(&self, cause: String) {
        if settle(
            &self.state,
            SessionState::Failed(SessionFailure::Transport(cause.clone())),
        ) {
            error!("Session failed before ready: {}", cause);
        }
        self.bootstrap_slot().take();
        if self.reject_pending_on_failure {
            self.mux.fail_all(&cause);
        }
    }
}

/// A connection to an engine plus the handshake that yields its root object.
pub struct Session {
    connection: Arc<Connection>,
    mux: Arc<CallMultiplexer<Arc<Connection>>>,
    state_rx: watch::Receiver<SessionState>,
    event_loop: JoinHandle<()>,
}

impl Session {
    /// Start connecting. The handshake runs in the background; use
    /// [`Session::server`] to wait for it.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let (connection, mut events) = Connection::connect(
            &config.endpoint,
            &config.credential,
            config.connect_timeout,
        )?;
        let connection = Arc::new(connection);
        let mux = Arc::new(CallMultiplexer::new(Arc::clone(&connection)));
        let driver = SessionDriver::new(
            Arc::clone(&mux),
            config.bootstrap_method.clone(),
            config.reject_pending_on_failure,
        );
        let state_rx = driver.subscribe();

        let event_loop = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                driver.handle_event(event);
            }
            debug!("Transport event stream ended");
        });

        Ok(Self {
            connection,
            mux,
            state_rx,
            event_loop,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn multiplexer(&self) -> &Arc<CallMultiplexer<Arc<Connection>>> {
        &self.mux
    }

    /// Wait for the handshake and return the root object proxy.
    pub async fn server(&self) -> Result<Server> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(SessionState::is_settled)
            .await
            .map_err(|_| JsonipcError::ConnectionLost {
                cause: "session stopped before the handshake completed".to_string(),
            })?;

        match &*state {
            SessionState::Ready(root) => Ok(ObjectProxy::new(root.clone(), Arc::clone(&self.mux))),
            SessionState::Failed(failure) => Err(failure.to_error()),
            other => Err(JsonipcError::Other(format!("unexpected session state {:?}", other))),
        }
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}
