//! Correlated call multiplexer.
//!
//! Turns fire-and-forget sends into awaitable calls. Every call gets a fresh
//! correlation id and a pending entry; the entry is removed and settled when a
//! reply with the same id arrives. Replies may arrive in any order.
//!
//! # Thread Safety
//!
//! The pending table is a `DashMap` and the id counter an `AtomicU64`, so a
//! multiplexer can be shared across tasks behind an `Arc`.

use super::protocol::{parse_reply, CallEnvelope, CallId, ObjectId};
use super::transport::MessageSink;
use crate::config::ProtocolConfig;
use crate::{JsonipcError, Result};
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What happened to an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// A pending call was settled.
    Settled(CallId),
    /// No call was waiting for this id; the reply was dropped.
    Unmatched(CallId),
}

/// A call in flight. Resolves when the matching reply arrives.
#[derive(Debug)]
pub struct PendingCall {
    id: CallId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Take the outcome if the call has already been settled, without
    /// waiting.
    pub fn try_settled(&mut self) -> Option<Result<Value>> {
        match self.rx.try_recv() {
            Ok(settled) => Some(settled),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(JsonipcError::ConnectionLost {
                cause: "pending call dropped without a reply".to_string(),
            })),
        }
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|settled| {
            settled.unwrap_or_else(|_| {
                Err(JsonipcError::ConnectionLost {
                    cause: "pending call dropped without a reply".to_string(),
                })
            })
        })
    }
}

/// Pick a random counter base so ids from different sessions rarely collide
/// in shared logs.
pub fn seeded_id_base() -> u64 {
    ProtocolConfig::ID_SEED_MULTIPLIER * rand::rng().random_range(ProtocolConfig::ID_SEED_RANGE)
}

/// Multiplexes correlated calls over a single [`MessageSink`].
#[derive(Debug)]
pub struct CallMultiplexer<S: MessageSink> {
    sink: S,
    next_id: AtomicU64,
    pending: DashMap<CallId, oneshot::Sender<Result<Value>>>,
}

impl<S: MessageSink> CallMultiplexer<S> {
    /// Create a multiplexer with a randomly seeded id counter.
    pub fn new(sink: S) -> Self {
        Self::with_id_base(sink, seeded_id_base())
    }

    /// Create a multiplexer whose first call id is `base + 1`. Once the
    /// counter reaches `u64::MAX`, further calls fail instead of wrapping.
    pub fn with_id_base(sink: S, base: u64) -> Self {
        Self {
            sink,
            next_id: AtomicU64::new(base),
            pending: DashMap::new(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Issue a call without waiting for its reply.
    ///
    /// Fails immediately, without consuming an id, when the channel is not
    /// open.
    pub fn invoke(
        &self,
        target: Option<ObjectId>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<PendingCall> {
        if !self.sink.is_open() {
            return Err(JsonipcError::NotOpen);
        }

        let id = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
            .map(|n| n + 1)
            .map_err(|_| JsonipcError::Other("correlation ids exhausted".to_string()))?;
        let payload = CallEnvelope::new(id, target, method, args).to_json()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        debug!("Jsonipc call {} -> {:?}.{}", id, target, method);

        if let Err(e) = self.sink.send(payload) {
            self.pending.remove(&id);
            return Err(e);
        }

        Ok(PendingCall { id, rx })
    }

    /// Issue a call and wait for its reply.
    pub async fn call(
        &self,
        target: Option<ObjectId>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.invoke(target, method, args)?.await
    }

    /// Issue a call and wait at most `timeout` for its reply.
    ///
    /// On timeout the pending entry is dropped, so a late reply is ignored.
    pub async fn call_with_timeout(
        &self,
        target: Option<ObjectId>,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let pending = self.invoke(target, method, args)?;
        let id = pending.id();
        match tokio::time::timeout(timeout, pending).await {
            Ok(settled) => settled,
            Err(_) => {
                self.pending.remove(&id);
                warn!("Jsonipc call {} timed out after {:?}", id, timeout);
                Err(JsonipcError::Timeout(timeout))
            }
        }
    }

    /// Route an inbound payload to the call it answers.
    ///
    /// Malformed payloads are a `Protocol` error; replies nobody waits for
    /// are dropped without touching the table.
    pub fn on_message(&self, raw: &str) -> Result<ReplyOutcome> {
        let reply = parse_reply(raw)?;
        let id = reply.id;

        match self.pending.remove(&id) {
            Some((_, tx)) => {
                debug!("Jsonipc reply {}", id);
                // The caller may have stopped waiting; nothing to do then.
                let _ = tx.send(reply.into_outcome());
                Ok(ReplyOutcome::Settled(id))
            }
            None => {
                debug!("Ignoring reply for unknown call id {}", id);
                Ok(ReplyOutcome::Unmatched(id))
            }
        }
    }

    /// Reject every pending call with `ConnectionLost`. Returns how many
    /// calls were rejected.
    pub fn fail_all(&self, cause: &str) -> usize {
        let ids: Vec<CallId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(JsonipcError::ConnectionLost {
                    cause: cause.to_string(),
                }));
                rejected += 1;
            }
        }
        if rejected > 0 {
            warn!("Rejected {} pending calls: {}", rejected, cause);
        }
        rejected
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    /// Sink that records payloads instead of writing them anywhere.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub open: AtomicBool,
        pub fail_sends: AtomicBool,
        pub sent: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn open() -> Self {
            let sink = Self::default();
            sink.open.store(true, Ordering::SeqCst);
            sink
        }

        pub fn sent(&self) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|s| serde_json::from_str(s).unwrap())
                .collect()
        }
    }

    impl MessageSink for RecordingSink {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn send(&self, payload: String) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(JsonipcError::ConnectionLost {
                    cause: "test".to_string(),
                });
            }
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_round_trip_resolves_with_result() {
        let mux = CallMultiplexer::with_id_base(RecordingSink::open(), 10000);

        let pending = mux.invoke(Some(42), "getName", vec![]).unwrap();
        assert_eq!(pending.id(), 10001);
        assert_eq!(
            mux.sink().sent(),
            vec![json!({"id": 10001, "this": 42, "method": "getName", "args": []})]
        );

        let outcome = mux.on_message(r#"{"id": 10001, "result": "demo"}"#).unwrap();
        assert_eq!(outcome, ReplyOutcome::Settled(10001));
        assert_eq!(pending.await.unwrap(), json!("demo"));
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_rejects_with_code() {
        let mux = CallMultiplexer::with_id_base(RecordingSink::open(), 10000);
        let pending = mux.invoke(Some(42), "getName", vec![]).unwrap();

        mux.on_message(
            r#"{"id": 10001, "error": {"code": "NotFound", "message": "no such method"}}"#,
        )
        .unwrap();

        let err = pending.await.unwrap_err();
        assert_eq!(err.remote_code(), Some("NotFound"));
    }

    #[test]
    fn test_invoke_when_closed_consumes_nothing() {
        let mux = CallMultiplexer::with_id_base(RecordingSink::default(), 500);

        let result = mux.invoke(Some(1), "ping", vec![]);
        assert!(matches!(result, Err(JsonipcError::NotOpen)));
        assert_eq!(mux.pending_count(), 0);
        assert!(mux.sink().sent().is_empty());

        mux.sink().open.store(true, Ordering::SeqCst);
        let pending = mux.invoke(Some(1), "ping", vec![]).unwrap();
        assert_eq!(pending.id(), 501);
    }

    #[test]
    fn test_ids_are_distinct_and_increasing() {
        let mux = CallMultiplexer::new(RecordingSink::open());
        let ids: Vec<CallId> = (0..50)
            .map(|_| mux.invoke(None, "m", vec![]).unwrap().id())
            .collect();

        assert!(ids[0] > 0);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_id_counter_stops_at_max() {
        let mux = CallMultiplexer::with_id_base(RecordingSink::open(), u64::MAX - 1);

        let last = mux.invoke(None, "m", vec![]).unwrap();
        assert_eq!(last.id(), u64::MAX);

        let err = mux.invoke(None, "m", vec![]).unwrap_err();
        assert!(matches!(err, JsonipcError::Other(_)));
        assert_eq!(mux.pending_count(), 1);
        assert_eq!(mux.sink().sent().len(), 1);
    }

    #[test]
    fn test_try_settled_reports_delivered_reply() {
        let mux = CallMultiplexer::with_id_base(RecordingSink::open(), 0);
        let mut pending = mux.invoke(None, "m", vec![]).unwrap();
        assert!(pending.try_settled().is_none());

        mux.on_message(r#"{"id": 1, "result": 5}"#).unwrap();
        assert_eq!(pending.try_settled().unwrap().unwrap(), json!(5));
    }

    #[test]
    fn test_seeded_base_is_in_range() {
        for _ in 0..100 {
            let base = seeded_id_base();
            assert_eq!(base % ProtocolConfig::ID_SEED_MULTIPLIER, 0);
            assert!(base >= 100_000 && base < 990_000);
        }
    }

    #[test]
    fn test_unknown_reply_changes_nothing() {
        let mux = CallMultiplexer::with_id_base(RecordingSink::open(), 0);
        let mut pending = mux.invoke(None, "m", vec![]).unwrap();

        let outcome = mux.on_message(r#"{"id": 999, "result": true}"#).unwrap();
        assert_eq!(outcome, ReplyOutcome::Unmatched(999));
        assert_eq!(mux.pending_count(), 1);
        assert!((&mut pending).now_or_never().is_none());
    }

    #[test]
    fn test_malformed_reply_is_a_protocol_error() {
        let mux = CallMultiplexer::with_id_base(RecordingSink::open(), 0);
        let _pending = mux.invoke(None, "m", vec![]).unwrap();

        let err = mux.on_message("{\"result\": 1}").unwrap_err();
        assert!(matches!(err, JsonipcError::Protocol { .. }));
        assert_eq!(mux.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let mux = CallMultiplexer::with_id_base(RecordingSink::open(), 0);
        let first = mux.invoke(Some(7), "a", vec![json!(1)]).unwrap();
        let second = mux.invoke(Some(7), "b", vec![json!(2)]).unwrap();

        mux.on_message(&format!(r#"{{"id": {}, "result": "b"}}"#, second.id()))
            .unwrap();
        mux.on_message(&format!(r#"{{"id": {}, "result": "a"}}"#, first.id()))
            .unwrap();

        assert_eq!(second.await.unwrap(), json!("b"));
        assert_eq!(first.await.unwrap(), json!("a"));
    }

    #[tokio::test]
    async fn test_duplicate_reply_settles_once() {
        let mux = CallMultiplexer::with_id_base(RecordingSink::open(), 0);
        let pending = mux.invoke(None, "m", vec![]).unwrap();

        let reply = r#"{"id": 1, "result": 1}"#;
        assert_eq!(mux.on_message(reply).unwrap(), ReplyOutcome::Settled(1));
        assert_eq!(mux.on_message(reply).unwrap(), ReplyOutcome::Unmatched(1));
        assert_eq!(pending.await.unwrap(), json!(1));
    }

    #[test]
    fn test_failed_send_removes_entry() {
        let sink = RecordingSink::open();
        sink.fail_sends.store(true, Ordering::SeqCst);
        let mux = CallMultiplexer::with_id_base(sink, 0);

        assert!(mux.invoke(None, "m", vec![]).is_err());
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_pending_calls() {
        let mux = CallMultiplexer::with_id_base(RecordingSink::open(), 0);
        let a = mux.invoke(None, "a", vec![]).unwrap();
        let b = mux.invoke(None, "b", vec![]).unwrap();

        assert_eq!(mux.fail_all("socket reset"), 2);
        assert_eq!(mux.pending_count(), 0);
        assert!(matches!(a.await, Err(JsonipcError::ConnectionLost { .. })));
        assert!(matches!(b.await, Err(JsonipcError::ConnectionLost { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_with_timeout_drops_entry() {
        let mux = CallMultiplexer::with_id_base(RecordingSink::open(), 0);

        let result = mux
            .call_with_timeout(None, "slow", vec![], Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(JsonipcError::Timeout(_))));
        assert_eq!(mux.pending_count(), 0);

        let late = mux.on_message(r#"{"id": 1, "result": null}"#).unwrap();
        assert_eq!(late, ReplyOutcome::Unmatched(1));
    }
}
