//! WebSocket transport connector.
//!
//! Owns one ordered, full-duplex message channel to a fixed endpoint. The
//! credential is presented as the `Sec-WebSocket-Protocol` header during the
//! opening handshake. Establishment happens in a background task; the owner
//! observes it through [`TransportEvent`]s rather than a return value.
//!
//! # Tasks
//!
//! - **Reader**: the connection task itself; turns inbound text frames into
//!   [`TransportEvent::Message`] and reports failure or close.
//! - **Writer**: drains an unbounded queue into the socket, so payloads go out
//!   in the order [`MessageSink::send`] accepted them.

use crate::config::Endpoint;
use crate::{JsonipcError, Result};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

/// Lifecycle of a connection. `Failed` and `Closed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Failed(String),
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_) | ConnectionState::Closed)
    }
}

/// Lifecycle and data events surfaced to the owner of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Closed,
}

/// Something call envelopes can be written to.
pub trait MessageSink: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Enqueue a payload. Fails with `NotOpen` instead of queueing when the
    /// channel is not open.
    fn send(&self, payload: String) -> Result<()>;
}

impl<T: MessageSink + ?Sized> MessageSink for Arc<T> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn send(&self, payload: String) -> Result<()> {
        (**self).send(payload)
    }
}

/// Handle to a WebSocket connection. Dropping it tears the connection down.
#[derive(Debug)]
pub struct Connection {
    endpoint: Endpoint,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound_tx: UnboundedSender<Message>,
    task_handle: JoinHandle<()>,
}

impl Connection {
    /// Start connecting to `endpoint`.
    ///
    /// Returns immediately in the `Connecting` state together with the event
    /// stream; must be called from within a tokio runtime.
    pub fn connect(
        endpoint: &Endpoint,
        credential: &str,
        connect_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let request = build_request(endpoint, credential)?;

        let state = Arc::new(watch::Sender::new(ConnectionState::Connecting));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) =
            mpsc::channel(crate::config::ProtocolConfig::EVENT_CHANNEL_CAPACITY);

        debug!("Connecting to {}", endpoint);

        let task_handle = tokio::spawn(run_connection(
            request,
            connect_timeout,
            state.clone(),
            outbound_rx,
            events_tx,
        ));

        Ok((
            Self {
                endpoint: endpoint.clone(),
                state,
                outbound_tx,
                task_handle,
            },
            events_rx,
        ))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch connection state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Close the channel from the local side.
    pub fn close(&self) {
        if transition(&self.state, ConnectionState::Closed) {
            info!("Closing connection to {}", self.endpoint);
            let _ = self.outbound_tx.send(Message::Close(None));
        }
    }
}

impl MessageSink for Connection {
    fn is_open(&self) -> bool {
        *self.state.borrow() == ConnectionState::Open
    }

    fn send(&self, payload: String) -> Result<()> {
        if !self.is_open() {
            return Err(JsonipcError::NotOpen);
        }
        self.outbound_tx
            .send(Message::text(payload))
            .map_err(|_| JsonipcError::ConnectionLost {
                cause: "writer task stopped".to_string(),
            })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task_handle.abort();
    }
}

fn build_request(endpoint: &Endpoint, credential: &str) -> Result<Request> {
    if credential.is_empty() {
        return Err(JsonipcError::Validation {
            field: "credential".to_string(),
            message: "credential must not be empty".to_string(),
        });
    }
    let url = endpoint.url()?;
    let mut request = url.as_str().into_client_request()?;
    let protocol = HeaderValue::from_str(credential).map_err(|e| JsonipcError::Validation {
        field: "credential".to_string(),
        message: e.to_string(),
    })?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    Ok(request)
}

/// Move to `next` unless the connection already reached a terminal state.
fn transition(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() {
            false
        } else {
            *current = next;
            true
        }
    })
}

async fn report_failure(
    state: &watch::Sender<ConnectionState>,
    events_tx: &mpsc::Sender<TransportEvent>,
    cause: String,
) {
    if transition(state, ConnectionState::Failed(cause.clone())) {
        error!("Transport failure: {}", cause);
        let _ = events_tx.send(TransportEvent::Error(cause)).await;
    } else {
        debug!("Transport failure after local close: {}", cause);
        let _ = events_tx.send(TransportEvent::Closed).await;
    }
}

async fn report_closed(
    state: &watch::Sender<ConnectionState>,
    events_tx: &mpsc::Sender<TransportEvent>,
) {
    transition(state, ConnectionState::Closed);
    info!("Connection closed");
    let _ = events_tx.send(TransportEvent::Closed).await;
}

async fn run_connection(
    request: Request,
    connect_timeout: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    mut outbound_rx: UnboundedReceiver<Message>,
    events_tx: mpsc::Sender<TransportEvent>,
) {
    let ws_stream = match tokio::time::timeout(connect_timeout, connect_async(request)).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            report_failure(&state, &events_tx, e.to_string()).await;
            return;
        }
        Err(_) => {
            report_failure(
                &state,
                &events_tx,
                format!("connect timed out after {:?}", connect_timeout),
            )
            .await;
            return;
        }
    };

    let (mut ws_write, mut ws_read) = ws_stream.split();

    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_write.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    // A local close() may have raced the handshake.
    if !transition(&state, ConnectionState::Open) {
        writer_handle.abort();
        let _ = events_tx.send(TransportEvent::Closed).await;
        return;
    }
    info!("Connection open");
    let _ = events_tx.send(TransportEvent::Open).await;

    loop {
        match ws_read.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!("Received {} bytes", text.len());
                if events_tx
                    .send(TransportEvent::Message(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Some(Ok(Message::Binary(bin))) => {
                warn!("Ignoring {} byte binary frame", bin.len());
            }
            Some(Ok(Message::Close(_))) | None => {
                report_closed(&state, &events_tx).await;
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                report_failure(&state, &events_tx, e.to_string()).await;
                break;
            }
        }
    }

    writer_handle.abort();
}
