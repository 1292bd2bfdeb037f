//! Message router
//!
//! Owns the correlation state for the one connection: assigns `ns`
//! sequence numbers to outbound requests, matches inbound frames to
//! pending calls, feeds subscription queues, and hands trade-lifecycle
//! pushes to their watchers. Exactly one reader task calls `route()`,
//! so fulfillment happens sequentially in arrival order; outbound frames
//! funnel through one queue drained by a single writer task, so send
//! order matches call-issuance order.

use crate::core::types::DealStatus;
use crate::protocol::frame::{self, Envelope, Frame};
use crate::protocol::validator::Validator;
use crate::ws::subscription::SubscriptionRegistry;
use crate::{ClientError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Inbound actions that belong to the trade lifecycle rather than to a
/// correlated pending call
const TRADE_ACTIONS: &[&str] = &[
    "buySuccessful",
    "openTradeSuccessful",
    "closeTradeSuccessful",
    "tradesStatus",
    "optStatus",
    "optionFinished",
];

/// Key a reply is matched on: `ns` when the venue echoes one, otherwise
/// the action name (e.g. `pong`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallKey {
    Ns(u64),
    Action(String),
}

/// One outstanding request awaiting its reply
struct PendingCall {
    action: String,
    /// Encoded frame, kept for requeueing when retry is set
    frame: String,
    /// Requeue instead of failing when the connection drops
    retry: bool,
    tx: oneshot::Sender<Result<Value>>,
}

/// Terminal outcome of a deal, delivered to `watch_deal`
#[derive(Debug, Clone)]
pub struct DealResult {
    pub status: DealStatus,
    pub profit: f64,
    pub details: Value,
}

/// Where a raw watcher's matches go
enum RawSink {
    /// One frame, then the watcher is gone
    Once(oneshot::Sender<String>),
    /// Every matching frame until the receiver is dropped
    Stream(UnboundedSender<String>),
}

/// Validator evaluated against the raw text of every inbound frame,
/// before the codec sees it
struct RawWatcher {
    validator: Validator,
    sink: RawSink,
}

/// Raw frames matching a validator, in arrival order
pub struct RawStream {
    rx: UnboundedReceiver<String>,
}

impl RawStream {
    /// Next matching frame; `None` once the session is closed
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Message router shared by session, client and reader task
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    /// Monotonic correlation sequence
    seq: AtomicU64,
    /// Session token; refreshed by server `token` pushes
    token: Mutex<String>,
    pending: Mutex<HashMap<CallKey, PendingCall>>,
    subs: Arc<SubscriptionRegistry>,
    /// FIFO watchers for uncorrelated `buySuccessful` pushes
    order_acks: Mutex<VecDeque<oneshot::Sender<Result<Value>>>>,
    /// Deal id -> resolution watcher
    deal_watch: Mutex<HashMap<u64, oneshot::Sender<DealResult>>>,
    /// Validator-keyed watchers over raw inbound text
    raw_watchers: Mutex<Vec<RawWatcher>>,
    out_tx: UnboundedSender<String>,
    out_rx: Arc<tokio::sync::Mutex<UnboundedReceiver<String>>>,
    closed: AtomicBool,
}

/// Removes the pending entry when a caller's await is cancelled
struct PendingGuard<'a> {
    inner: &'a RouterInner,
    key: CallKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.key);
    }
}

impl Router {
    pub fn new(token: String, subs: Arc<SubscriptionRegistry>) -> Self {
        let (out_tx, out_rx) = unbounded_channel();
        Self {
            inner: Arc::new(RouterInner {
                seq: AtomicU64::new(1),
                token: Mutex::new(token),
                pending: Mutex::new(HashMap::new()),
                subs,
                order_acks: Mutex::new(VecDeque::new()),
                deal_watch: Mutex::new(HashMap::new()),
                raw_watchers: Mutex::new(Vec::new()),
                out_tx,
                out_rx: Arc::new(tokio::sync::Mutex::new(out_rx)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Next correlation id. Never reused while its call is outstanding.
    pub fn next_ns(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn token(&self) -> String {
        self.inner.token.lock().clone()
    }

    pub fn set_token(&self, token: String) {
        *self.inner.token.lock() = token;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The outbound queue; the session's writer task locks it for the
    /// lifetime of one connection
    pub(crate) fn writer_queue(&self) -> Arc<tokio::sync::Mutex<UnboundedReceiver<String>>> {
        self.inner.out_rx.clone()
    }

    /// Queue a frame for the serialized writer
    pub fn enqueue(&self, encoded: String) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.inner
            .out_tx
            .send(encoded)
            .map_err(|_| ClientError::Closed)
    }

    /// Issue a correlated request and await its reply
    pub async fn call(&self, action: &str, message: Value, wait: Duration) -> Result<Value> {
        self.call_opts(action, message, wait, false).await
    }

    /// `retry` requeues the frame on reconnect instead of failing the call
    pub async fn call_opts(
        &self,
        action: &str,
        message: Value,
        wait: Duration,
        retry: bool,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let ns = self.next_ns();
        let encoded = frame::encode_request(action, message, &self.token(), ns);
        let key = CallKey::Ns(ns);
        let rx = self.register(key.clone(), action, encoded.clone(), retry);
        self.enqueue(encoded)?;
        self.await_reply(key, rx, wait, action).await
    }

    /// Register a call whose frame the session sends itself over the
    /// control channel (auth handshake, priming, replay)
    pub(crate) fn register_direct(
        &self,
        action: &str,
    ) -> (u64, oneshot::Receiver<Result<Value>>) {
        let ns = self.next_ns();
        let rx = self.register(CallKey::Ns(ns), action, String::new(), false);
        (ns, rx)
    }

    /// Await a call registered with `register_direct`
    pub(crate) async fn await_direct(
        &self,
        ns: u64,
        rx: oneshot::Receiver<Result<Value>>,
        wait: Duration,
        what: &str,
    ) -> Result<Value> {
        self.await_reply(CallKey::Ns(ns), rx, wait, what).await
    }

    /// Wait for the next inbound frame carrying the given action and no
    /// matching `ns` (used for `pong`)
    pub async fn wait_action(&self, action: &str, wait: Duration) -> Result<Value> {
        let key = CallKey::Action(action.to_string());
        let rx = self.register(key.clone(), action, String::new(), false);
        self.await_reply(key, rx, wait, action).await
    }

    fn register(
        &self,
        key: CallKey,
        action: &str,
        encoded: String,
        retry: bool,
    ) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            key,
            PendingCall {
                action: action.to_string(),
                frame: encoded,
                retry,
                tx,
            },
        );
        rx
    }

    async fn await_reply(
        &self,
        key: CallKey,
        rx: oneshot::Receiver<Result<Value>>,
        wait: Duration,
        what: &str,
    ) -> Result<Value> {
        let _guard = PendingGuard {
            inner: self.inner.as_ref(),
            key,
        };
        match timeout(wait, rx).await {
            Ok(Ok(reply)) => reply,
            // Sender dropped without a reply: the session shut down
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout(what.to_string())),
        }
    }

    /// Watch for the next `buySuccessful` push (FIFO across callers)
    pub fn watch_order(&self) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.inner.order_acks.lock().push_back(tx);
        rx
    }

    /// Watch for the terminal resolution of one deal
    pub fn watch_deal(&self, deal_id: u64) -> oneshot::Receiver<DealResult> {
        let (tx, rx) = oneshot::channel();
        self.inner.deal_watch.lock().insert(deal_id, tx);
        rx
    }

    /// Stop watching a deal; later resolution pushes are dropped
    pub fn unwatch_deal(&self, deal_id: u64) {
        self.inner.deal_watch.lock().remove(&deal_id);
    }

    /// Watch for the first inbound frame the validator accepts
    pub fn watch_raw_once(&self, validator: Validator) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.inner.raw_watchers.lock().push(RawWatcher {
            validator,
            sink: RawSink::Once(tx),
        });
        rx
    }

    /// Stream every inbound frame the validator accepts
    pub fn watch_raw(&self, validator: Validator) -> RawStream {
        let (tx, rx) = unbounded_channel();
        self.inner.raw_watchers.lock().push(RawWatcher {
            validator,
            sink: RawSink::Stream(tx),
        });
        RawStream { rx }
    }

    /// Raw watchers observe the text before decoding and never consume
    /// the frame; normal routing continues behind them
    fn feed_raw(&self, raw: &str) {
        let mut watchers = self.inner.raw_watchers.lock();
        if watchers.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(watchers.len());
        for RawWatcher { validator, sink } in watchers.drain(..) {
            if !validator.check(raw) {
                kept.push(RawWatcher { validator, sink });
                continue;
            }
            match sink {
                RawSink::Once(tx) => {
                    let _ = tx.send(raw.to_string());
                }
                RawSink::Stream(tx) => {
                    // A failed send means the stream's consumer is gone
                    if tx.send(raw.to_string()).is_ok() {
                        kept.push(RawWatcher {
                            validator,
                            sink: RawSink::Stream(tx),
                        });
                    }
                }
            }
        }
        *watchers = kept;
    }

    /// Route one inbound raw frame. Called only by the reader task.
    pub fn route(&self, raw: &str) {
        self.feed_raw(raw);
        match frame::decode(raw) {
            Ok(Frame::Message(env)) => self.dispatch(env),
            Ok(Frame::Event { name, payload, .. }) => self.dispatch_event(&name, payload),
            Ok(Frame::Control(prefix)) => {
                tracing::trace!(?prefix, "framing-level control frame");
            }
            Err(e) => {
                // Undecodable input fails no pending call
                tracing::warn!(error = %e, "dropping undecodable frame");
            }
        }
    }

    fn dispatch(&self, env: Envelope) {
        match env.action.as_deref() {
            Some("error") => self.handle_error(&env),
            Some("token") => {
                if let Some(token) = env.message().get("token").and_then(Value::as_str) {
                    tracing::info!("session token refreshed by server");
                    self.set_token(token.to_string());
                }
            }
            Some("multipleAction") => {
                let actions = env
                    .message()
                    .get("actions")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for sub in actions {
                    let action = sub.get("action").and_then(Value::as_str).map(str::to_string);
                    let ns = sub.get("ns").and_then(|v| match v {
                        Value::Number(n) => n.as_u64(),
                        Value::String(s) => s.parse().ok(),
                        _ => None,
                    });
                    self.dispatch(Envelope {
                        action,
                        ns,
                        body: sub,
                    });
                }
            }
            action => {
                // 1. Correlated pending call
                if let Some(ns) = env.ns {
                    if self.fulfill_ns(ns, action, &env) {
                        return;
                    }
                }
                // 2. Trade lifecycle pushes
                if let Some(a) = action {
                    if TRADE_ACTIONS.contains(&a) {
                        self.handle_trade(a, &env);
                        return;
                    }
                }
                // 3. Subscription updates
                if action == Some("candles") {
                    if let Some(asset_id) = asset_id_of(env.message()) {
                        if self.inner.subs.deliver(asset_id, env.message()) {
                            return;
                        }
                    }
                }
                // 4. Action-keyed waiter (pong and friends)
                if let Some(a) = action {
                    if self.fulfill_key(&CallKey::Action(a.to_string()), &env) {
                        return;
                    }
                }
                tracing::warn!(
                    action = action.unwrap_or("<none>"),
                    ns = env.ns,
                    "dropping unroutable frame"
                );
            }
        }
    }

    fn dispatch_event(&self, name: &str, payload: Value) {
        if name == "candles" {
            if let Some(asset_id) = asset_id_of(&payload) {
                if self.inner.subs.deliver(asset_id, &payload) {
                    return;
                }
            }
        }
        tracing::warn!(event = name, "dropping unroutable event frame");
    }

    /// Fulfill a pending call by `ns`. The action name must agree when
    /// both sides carry one.
    fn fulfill_ns(&self, ns: u64, action: Option<&str>, env: &Envelope) -> bool {
        let key = CallKey::Ns(ns);
        let mut pending = self.inner.pending.lock();
        let matches = match (pending.get(&key), action) {
            (Some(p), Some(a)) => p.action == a,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        if let Some(call) = pending.remove(&key) {
            drop(pending);
            let _ = call.tx.send(Ok(env.body.clone()));
        }
        true
    }

    fn fulfill_key(&self, key: &CallKey, env: &Envelope) -> bool {
        let call = self.inner.pending.lock().remove(key);
        match call {
            Some(call) => {
                let _ = call.tx.send(Ok(env.body.clone()));
                true
            }
            None => false,
        }
    }

    fn handle_error(&self, env: &Envelope) {
        let detail = error_detail(env.message());

        if let Some(ns) = env.ns {
            let call = self.inner.pending.lock().remove(&CallKey::Ns(ns));
            if let Some(call) = call {
                let err = match call.action.as_str() {
                    "setContext" => ClientError::AuthRejected(detail),
                    "buyOption" => ClientError::OrderRejected(detail),
                    _ => ClientError::Protocol(format!("venue error: {detail}")),
                };
                let _ = call.tx.send(Err(err));
                return;
            }
        }

        // Uncorrelated errors most commonly reject an order placement
        let watcher = self.inner.order_acks.lock().pop_front();
        match watcher {
            Some(tx) => {
                let _ = tx.send(Err(ClientError::OrderRejected(detail)));
            }
            None => tracing::warn!(error = %detail, "venue error with no waiting call"),
        }
    }

    fn handle_trade(&self, action: &str, env: &Envelope) {
        match action {
            "buySuccessful" => {
                let option = env.message().get("option").cloned().unwrap_or(Value::Null);
                let mut acks = self.inner.order_acks.lock();
                // Skip watchers whose caller already gave up
                while let Some(tx) = acks.pop_front() {
                    if tx.send(Ok(option.clone())).is_ok() {
                        return;
                    }
                }
                tracing::debug!("buySuccessful with no waiting order");
            }
            "optionFinished" => self.resolve_deals(env.message().get("options")),
            "closeTradeSuccessful" => self.resolve_deals(env.message().get("trades")),
            "tradesStatus" | "optStatus" => {
                // Interim status only; resolution waits for a terminal push
                tracing::debug!(action, "interim trade status");
            }
            "openTradeSuccessful" => {
                tracing::debug!("trade opened on venue side");
            }
            _ => {}
        }
    }

    fn resolve_deals(&self, items: Option<&Value>) {
        let Some(items) = items.and_then(Value::as_array) else {
            return;
        };
        for item in items {
            let Some(id) = item.get("id").and_then(Value::as_u64) else {
                continue;
            };
            let profit = item
                .get("result_amount_cash")
                .or_else(|| item.get("profit"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let status = if profit > 0.0 {
                DealStatus::Won
            } else {
                DealStatus::Lost
            };
            let watcher = self.inner.deal_watch.lock().remove(&id);
            match watcher {
                Some(tx) => {
                    let _ = tx.send(DealResult {
                        status,
                        profit,
                        details: item.clone(),
                    });
                }
                // First terminal status won already, or nobody asked
                None => tracing::debug!(deal_id = id, "resolution push with no watcher"),
            }
        }
    }

    /// The connection owning the outstanding calls dropped: fail them
    /// with a connection-lost error, or requeue the ones that opted into
    /// retry. Deal watchers survive, resolutions may arrive after the
    /// reconnect.
    pub fn on_connection_lost(&self) {
        let mut pending = self.inner.pending.lock();
        let mut kept = HashMap::new();
        for (key, call) in pending.drain() {
            if call.retry && !call.frame.is_empty() {
                let _ = self.inner.out_tx.send(call.frame.clone());
                kept.insert(key, call);
            } else {
                let _ = call.tx.send(Err(ClientError::ConnectionLost));
            }
        }
        *pending = kept;
        drop(pending);

        let mut acks = self.inner.order_acks.lock();
        while let Some(tx) = acks.pop_front() {
            let _ = tx.send(Err(ClientError::ConnectionLost));
        }
    }

    /// Terminal closure: every outstanding await fails with `Closed`
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for (_, call) in self.inner.pending.lock().drain() {
            let _ = call.tx.send(Err(ClientError::Closed));
        }
        let mut acks = self.inner.order_acks.lock();
        while let Some(tx) = acks.pop_front() {
            let _ = tx.send(Err(ClientError::Closed));
        }
        self.inner.deal_watch.lock().clear();
        self.inner.raw_watchers.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

fn asset_id_of(payload: &Value) -> Option<u32> {
    payload.get("assetId").and_then(Value::as_u64).map(|v| v as u32)
}

fn error_detail(message: &Value) -> String {
    match message {
        Value::String(s) => s.clone(),
        Value::Null => "unknown error".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> (Router, Arc<SubscriptionRegistry>) {
        let subs = Arc::new(SubscriptionRegistry::new());
        (Router::new("tok".to_string(), subs.clone()), subs)
    }

    /// Drain the outbound queue into raw frames
    async fn drain_out(router: &Router) -> Vec<String> {
        let queue = router.writer_queue();
        let mut rx = queue.lock().await;
        let mut frames = Vec::new();
        while let Ok(f) = rx.try_recv() {
            frames.push(f);
        }
        frames
    }

    #[tokio::test]
    async fn test_responses_route_by_correlation_id_despite_reordering() {
        let (router, _) = router();

        let r1 = router.clone();
        let first = tokio::spawn(async move {
            r1.call("profile", json!({}), Duration::from_secs(5)).await
        });
        let r2 = router.clone();
        let second = tokio::spawn(async move {
            r2.call("assets", json!({}), Duration::from_secs(5)).await
        });

        // Wait until both calls are registered
        while router.pending_len() < 2 {
            tokio::task::yield_now().await;
        }
        let frames = drain_out(&router).await;
        assert_eq!(frames.len(), 2);
        let ns_of = |f: &str, action: &str| -> Option<u64> {
            let v: Value = serde_json::from_str(f).unwrap();
            (v["action"] == action).then(|| v["ns"].as_u64().unwrap())
        };
        let profile_ns = frames.iter().find_map(|f| ns_of(f, "profile")).unwrap();
        let assets_ns = frames.iter().find_map(|f| ns_of(f, "assets")).unwrap();

        // Venue answers in reverse order
        router.route(&format!(
            r#"{{"action":"assets","ns":{assets_ns},"message":{{"assets":[1]}}}}"#
        ));
        router.route(&format!(
            r#"{{"action":"profile","ns":{profile_ns},"message":{{"profile":{{"id":7}}}}}}"#
        ));

        let profile = first.await.unwrap().unwrap();
        let assets = second.await.unwrap().unwrap();
        assert_eq!(profile["message"]["profile"]["id"], 7);
        assert_eq!(assets["message"]["assets"][0], 1);
    }

    #[tokio::test]
    async fn test_unroutable_frame_affects_no_pending_call() {
        let (router, _) = router();

        let r = router.clone();
        let call = tokio::spawn(async move {
            r.call("profile", json!({}), Duration::from_secs(5)).await
        });
        while router.pending_len() < 1 {
            tokio::task::yield_now().await;
        }
        let frames = drain_out(&router).await;
        let sent: Value = serde_json::from_str(&frames[0]).unwrap();
        let ns = sent["ns"].as_u64().unwrap();

        // Garbage, unknown action, and an event with no subscriber
        router.route("!! not a frame !!");
        router.route(r#"{"action":"somethingUnknown","message":{}}"#);
        router.route(r#"42["mystery",{"x":1}]"#);

        assert_eq!(router.pending_len(), 1);
        router.route(&format!(r#"{{"action":"profile","ns":{ns},"message":{{}}}}"#));
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_error_frame_fails_matching_call() {
        let (router, _) = router();

        let r = router.clone();
        let call = tokio::spawn(async move {
            r.call("buyOption", json!({"amount": 5.0}), Duration::from_secs(5))
                .await
        });
        while router.pending_len() < 1 {
            tokio::task::yield_now().await;
        }
        let frames = drain_out(&router).await;
        let sent: Value = serde_json::from_str(&frames[0]).unwrap();
        let ns = sent["ns"].as_u64().unwrap();

        router.route(&format!(
            r#"{{"action":"error","ns":{ns},"message":"insufficient balance"}}"#
        ));
        match call.await.unwrap() {
            Err(ClientError::OrderRejected(msg)) => assert_eq!(msg, "insufficient balance"),
            other => panic!("expected OrderRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_candles_feed_subscription_queue() {
        let (router, subs) = router();
        let (_, mut rx) = subs.register(142, vec![5]);

        router.route(r#"{"action":"candles","message":{"assetId":142,"candles":[{"t":1,"tf":5,"v":[1,2,0.5,1.5]}]}}"#);

        let payload = rx.try_recv().unwrap();
        assert_eq!(payload["assetId"], 142);
    }

    #[tokio::test]
    async fn test_candles_for_other_asset_do_not_deliver() {
        let (router, subs) = router();
        let (_, mut rx) = subs.register(142, vec![5]);

        router.route(r#"{"action":"candles","message":{"assetId":151,"candles":[]}}"#);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_buy_successful_fulfills_order_watcher() {
        let (router, _) = router();
        let rx = router.watch_order();

        router.route(r#"{"action":"buySuccessful","message":{"option":{"id":999}}}"#);

        let option = rx.await.unwrap().unwrap();
        assert_eq!(option["id"], 999);
    }

    #[tokio::test]
    async fn test_option_finished_resolves_deal_watcher() {
        let (router, _) = router();
        let rx = router.watch_deal(999);

        router.route(
            r#"{"action":"optionFinished","message":{"options":[{"id":999,"result_amount_cash":4.1}]}}"#,
        );

        let result = rx.await.unwrap();
        assert_eq!(result.status, DealStatus::Won);
        assert_eq!(result.profit, 4.1);
    }

    #[tokio::test]
    async fn test_late_resolution_after_unwatch_is_dropped() {
        let (router, _) = router();
        let rx = router.watch_deal(999);
        router.unwatch_deal(999);
        drop(rx);

        // Must not panic or hang
        router.route(
            r#"{"action":"closeTradeSuccessful","message":{"trades":[{"id":999,"profit":-5.0}]}}"#,
        );
    }

    #[tokio::test]
    async fn test_zero_profit_resolves_as_lost() {
        let (router, _) = router();
        let rx = router.watch_deal(1000);

        router.route(
            r#"{"action":"optionFinished","message":{"options":[{"id":1000,"result_amount_cash":0.0}]}}"#,
        );
        assert_eq!(rx.await.unwrap().status, DealStatus::Lost);
    }

    #[tokio::test]
    async fn test_connection_lost_fails_calls_and_requeues_retries() {
        let (router, _) = router();

        let r1 = router.clone();
        let plain = tokio::spawn(async move {
            r1.call("profile", json!({}), Duration::from_secs(5)).await
        });
        let r2 = router.clone();
        let retried = tokio::spawn(async move {
            r2.call_opts("assets", json!({}), Duration::from_secs(5), true)
                .await
        });
        while router.pending_len() < 2 {
            tokio::task::yield_now().await;
        }
        drain_out(&router).await;

        router.on_connection_lost();

        match plain.await.unwrap() {
            Err(ClientError::ConnectionLost) => {}
            other => panic!("expected ConnectionLost, got {other:?}"),
        }

        // The retried call stays pending and its frame is requeued
        assert_eq!(router.pending_len(), 1);
        let frames = drain_out(&router).await;
        assert_eq!(frames.len(), 1);
        let v: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["action"], "assets");

        // A reply on the new connection still completes the call
        router.route(&format!(
            r#"{{"action":"assets","ns":{},"message":{{}}}}"#,
            v["ns"].as_u64().unwrap()
        ));
        assert!(retried.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_everything_with_closed() {
        let (router, _) = router();

        let r = router.clone();
        let call = tokio::spawn(async move {
            r.call("profile", json!({}), Duration::from_secs(5)).await
        });
        while router.pending_len() < 1 {
            tokio::task::yield_now().await;
        }

        router.close();
        match call.await.unwrap() {
            Err(ClientError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
        assert!(matches!(
            router.call("profile", json!({}), Duration::from_secs(1)).await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_pong_routes_to_action_waiter() {
        let (router, _) = router();

        let r = router.clone();
        let wait = tokio::spawn(async move {
            r.wait_action("pong", Duration::from_secs(5)).await
        });
        while router.pending_len() < 1 {
            tokio::task::yield_now().await;
        }

        router.route(r#"{"action":"pong","message":{"data":"1700000000123"}}"#);
        let reply = wait.await.unwrap().unwrap();
        assert_eq!(reply["message"]["data"], "1700000000123");
    }

    #[tokio::test]
    async fn test_cancelled_call_deregisters() {
        let (router, _) = router();

        let r = router.clone();
        let call = tokio::spawn(async move {
            r.call("profile", json!({}), Duration::from_secs(60)).await
        });
        while router.pending_len() < 1 {
            tokio::task::yield_now().await;
        }

        call.abort();
        let _ = call.await;
        assert_eq!(router.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_raw_watcher_fires_on_first_match_only() {
        let (router, _) = router();
        let once = router.watch_raw_once(Validator::contains("pong"));

        // Non-matching traffic leaves the watcher armed
        router.route(r#"{"action":"candles","message":{"assetId":142}}"#);
        router.route(r#"{"action":"pong","message":{"data":"1700000000123"}}"#);

        let raw = once.await.unwrap();
        assert!(raw.contains("1700000000123"));
        assert!(router.inner.raw_watchers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_raw_stream_yields_every_match_without_consuming() {
        let (router, subs) = router();
        let (_, mut sub_rx) = subs.register(142, vec![5]);
        let mut stream = router.watch_raw(Validator::all_of(vec![
            Validator::contains("candles"),
            Validator::contains("\"assetId\":142"),
        ]));

        router.route(r#"{"action":"candles","message":{"assetId":142,"candles":[]}}"#);
        router.route(r#"{"action":"candles","message":{"assetId":151,"candles":[]}}"#);
        router.route(r#"{"action":"candles","message":{"assetId":142,"candles":[{"t":9}]}}"#);

        assert!(stream.next().await.unwrap().contains("\"assetId\":142"));
        assert!(stream.next().await.unwrap().contains("\"t\":9"));
        // The subscription still received both frames for its asset
        assert!(sub_rx.try_recv().is_ok());
        assert!(sub_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_close_ends_raw_streams() {
        let (router, _) = router();
        let mut stream = router.watch_raw(Validator::prefix("{"));
        router.close();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_multiple_action_fans_out() {
        let (router, _) = router();

        let r = router.clone();
        let call = tokio::spawn(async move {
            r.call("profile", json!({}), Duration::from_secs(5)).await
        });
        while router.pending_len() < 1 {
            tokio::task::yield_now().await;
        }
        let frames = drain_out(&router).await;
        let ns = serde_json::from_str::<Value>(&frames[0]).unwrap()["ns"]
            .as_u64()
            .unwrap();

        router.route(&format!(
            r#"{{"action":"multipleAction","message":{{"actions":[{{"action":"profile","ns":{ns},"message":{{"profile":{{}}}}}}]}}}}"#
        ));
        assert!(call.await.unwrap().is_ok());
    }
}
