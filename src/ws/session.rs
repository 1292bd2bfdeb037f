//! Connection manager
//!
//! Owns the connection lifecycle: dial, authenticate, prime, replay
//! subscriptions, then hold the line until the transport fails or goes
//! stale, reconnecting with bounded jittered backoff. Per connection it
//! runs one reader task and one writer task; the writer drains the
//! control channel (auth, ping, replay) from the start and gates caller
//! frames until the session is `Ready`, so nothing from a caller leaves
//! the socket before the handshake.

use crate::infrastructure::config::ClientConfig;
use crate::protocol::frame;
use crate::ws::ping::KeepaliveMonitor;
use crate::ws::router::Router;
use crate::ws::subscription::{self, SubscriptionRegistry};
use crate::ws::transport::{WsSink, WsSource, WsTransport};
use crate::{ClientError, Result};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
    Closed,
}

/// How one connection ended
enum ConnEnd {
    /// `disconnect()` was requested
    Shutdown,
    /// Transport failed or went stale after reaching `Ready`
    Lost(String),
}

/// Shared session handle; cheap to clone
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: ClientConfig,
    router: Router,
    subs: Arc<SubscriptionRegistry>,
    monitor: KeepaliveMonitor,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    /// Set once by the first `connect()`; a session runs one supervisor
    /// for its whole life
    started: AtomicBool,
    /// Replies to the post-auth priming batch, keyed by action
    primed: Mutex<HashMap<String, Value>>,
}

impl Session {
    pub fn new(token: String, config: ClientConfig) -> Self {
        let subs = Arc::new(SubscriptionRegistry::new());
        let router = Router::new(token, subs.clone());
        let monitor = KeepaliveMonitor::new(config.ping_interval(), config.stale_multiplier);
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                config,
                router,
                subs,
                monitor,
                state_tx,
                shutdown_tx,
                started: AtomicBool::new(false),
                primed: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.subs
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Observe lifecycle transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// A cached reply from the session-priming batch, if it arrived
    pub fn primed(&self, action: &str) -> Option<Value> {
        self.inner.primed.lock().get(action).cloned()
    }

    /// Establish the session: spawns the supervisor and resolves once the
    /// first connection reaches `Ready`, or with the fatal error that
    /// prevented it.
    pub async fn connect(&self) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Err(ClientError::Closed);
        }
        // Exactly one supervisor per session, ever; a second connect
        // must not revive a session on its way down
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ClientError::InvalidArgument(
                "session already started; create a new client to reconnect".to_string(),
            ));
        }
        let (first_tx, first_rx) = oneshot::channel();
        let session = self.clone();
        tokio::spawn(session.supervise(first_tx));
        first_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Terminal closure from any state. Idempotent.
    pub fn disconnect(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        tracing::info!("disconnecting session");
        self.inner.shutdown_tx.send_replace(true);
        self.close_terminal();
    }

    fn close_terminal(&self) {
        self.set_state(SessionState::Closed);
        self.inner.router.close();
        self.inner.subs.close();
    }

    fn set_state(&self, state: SessionState) {
        let prev = *self.inner.state_tx.borrow();
        // Closed is terminal; nothing drives the state out of it
        if prev == state || prev == SessionState::Closed {
            return;
        }
        tracing::info!(?prev, next = ?state, "session state change");
        // send_replace keeps the value current with no subscribers
        self.inner.state_tx.send_replace(state);
    }

    fn shutdown_requested(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    async fn supervise(self, first_tx: oneshot::Sender<Result<()>>) {
        let mut first = Some(first_tx);
        let mut attempt: u32 = 0;
        let mut backoff = self.inner.config.reconnect_initial();

        loop {
            if self.shutdown_requested() {
                self.finish(None, &mut first);
                return;
            }

            match self.run_connection(&mut first).await {
                Ok(ConnEnd::Shutdown) => {
                    self.finish(None, &mut first);
                    return;
                }
                Ok(ConnEnd::Lost(reason)) => {
                    // The connection had reached Ready; start backoff over
                    tracing::warn!(%reason, "connection lost, reconnecting");
                    attempt = 0;
                    backoff = self.inner.config.reconnect_initial();
                }
                Err(e @ ClientError::AuthRejected(_)) => {
                    // Fatal by contract, never retried
                    tracing::error!(error = %e, "authentication rejected");
                    self.finish(Some(e), &mut first);
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "connection attempt failed");
                    attempt += 1;
                    if attempt >= self.inner.config.reconnect_max_attempts {
                        self.finish(
                            Some(ClientError::Transport(format!(
                                "reconnect attempts exhausted after {attempt} tries: {e}"
                            ))),
                            &mut first,
                        );
                        return;
                    }
                }
            }

            self.inner.router.on_connection_lost();
            self.set_state(SessionState::Reconnecting);

            let pause = jittered(backoff);
            tracing::info!(backoff_ms = pause.as_millis() as u64, "backing off before redial");
            let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
            if *shutdown_rx.borrow() {
                self.finish(None, &mut first);
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown_rx.changed() => {
                    self.finish(None, &mut first);
                    return;
                }
            }
            backoff = (backoff * 2).min(self.inner.config.reconnect_cap());
        }
    }

    fn finish(&self, error: Option<ClientError>, first: &mut Option<oneshot::Sender<Result<()>>>) {
        if let Some(tx) = first.take() {
            let _ = tx.send(match error {
                Some(e) => Err(e),
                None => Ok(()),
            });
        } else if let Some(e) = error {
            tracing::error!(error = %e, "session terminated");
        }
        self.close_terminal();
    }

    /// One full connection: dial, handshake, serve until it ends
    async fn run_connection(
        &self,
        first: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> Result<ConnEnd> {
        let cfg = &self.inner.config;

        if self.shutdown_requested() || self.state() == SessionState::Closed {
            return Ok(ConnEnd::Shutdown);
        }
        self.set_state(SessionState::Connecting);
        let transport = WsTransport::connect(&cfg.url, cfg.connect_timeout()).await?;
        let (sink, source) = transport.split();

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<String>();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (stale_tx, mut stale_rx) = mpsc::unbounded_channel::<()>();

        let mut writer = tokio::spawn(run_writer(
            sink,
            ctrl_rx,
            self.inner.router.writer_queue(),
            ready_rx,
        ));
        let mut reader = tokio::spawn(run_reader(
            source,
            self.inner.router.clone(),
            self.inner.monitor.clone(),
        ));

        // The handshake is the first frame on the wire
        self.set_state(SessionState::Authenticating);
        if let Err(e) = self.authenticate(&ctrl_tx).await {
            writer.abort();
            reader.abort();
            return Err(e);
        }

        self.prime(&ctrl_tx);
        for frame in resubscribe_frames(&self.inner.router, &self.inner.subs) {
            let _ = ctrl_tx.send(frame);
        }

        // Release caller frames queued during setup, in submission order
        let _ = ready_tx.send(true);
        self.set_state(SessionState::Ready);
        tracing::info!(url = %cfg.url, "session ready");
        if let Some(tx) = first.take() {
            let _ = tx.send(Ok(()));
        }

        let keepalive = tokio::spawn(
            self.inner
                .monitor
                .clone()
                .run(ctrl_tx.clone(), stale_tx),
        );

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            writer.abort();
            reader.abort();
            keepalive.abort();
            return Ok(ConnEnd::Shutdown);
        }
        let end = tokio::select! {
            _ = shutdown_rx.changed() => ConnEnd::Shutdown,
            _ = stale_rx.recv() => ConnEnd::Lost("stale connection".to_string()),
            res = &mut reader => ConnEnd::Lost(end_reason("reader", res)),
            res = &mut writer => ConnEnd::Lost(end_reason("writer", res)),
        };

        writer.abort();
        reader.abort();
        keepalive.abort();
        Ok(end)
    }

    /// Send `setContext` and wait for its ack. The venue often stays
    /// silent on success, so an unanswered grace period counts as
    /// accepted; only an explicit rejection is fatal.
    async fn authenticate(&self, ctrl_tx: &UnboundedSender<String>) -> Result<()> {
        let router = &self.inner.router;
        let (ns, rx) = router.register_direct("setContext");
        let is_demo = if self.inner.config.demo { 1 } else { 0 };
        let encoded = frame::encode_request(
            "setContext",
            json!({"is_demo": is_demo}),
            &router.token(),
            ns,
        );
        ctrl_tx
            .send(encoded)
            .map_err(|_| ClientError::ConnectionLost)?;

        match router
            .await_direct(ns, rx, self.inner.config.auth_grace(), "setContext")
            .await
        {
            Ok(_) => {
                tracing::debug!("auth acknowledged");
                Ok(())
            }
            Err(ClientError::Timeout(_)) => {
                tracing::debug!("no auth rejection within grace period");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Issue the venue's session-priming batch and cache the replies as
    /// they come back. Unanswered lookups are logged, not fatal.
    fn prime(&self, ctrl_tx: &UnboundedSender<String>) {
        let router = &self.inner.router;
        let token = router.token();

        let mut actions = Vec::new();
        let mut waits = Vec::new();
        for action in ["profile", "assets", "getCandlesTimeframes"] {
            let (ns, rx) = router.register_direct(action);
            actions.push(json!({
                "action": action,
                "message": {},
                "ns": ns,
                "token": token,
            }));
            waits.push((action, ns, rx));
        }

        let batch = frame::encode_request(
            "multipleAction",
            json!({"actions": actions}),
            &token,
            router.next_ns(),
        );
        let _ = ctrl_tx.send(batch);

        let session = self.clone();
        tokio::spawn(async move {
            let wait = session.inner.config.call_timeout();
            for (action, ns, rx) in waits {
                match session.inner.router.await_direct(ns, rx, wait, action).await {
                    Ok(body) => {
                        session.inner.primed.lock().insert(action.to_string(), body);
                    }
                    Err(e) => tracing::debug!(action, error = %e, "priming lookup unanswered"),
                }
            }
        });
    }
}

/// Subscribe frames replayed after auth on a fresh connection, in the
/// order the subscriptions were first registered
fn resubscribe_frames(router: &Router, subs: &SubscriptionRegistry) -> Vec<String> {
    subs.snapshot()
        .into_iter()
        .map(|(asset_id, timeframes)| {
            frame::encode_request(
                "subscribeCandles",
                subscription::subscribe_message(asset_id, &timeframes),
                &router.token(),
                router.next_ns(),
            )
        })
        .collect()
}

fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.8..1.25);
    base.mul_f64(factor)
}

fn end_reason(task: &str, res: std::result::Result<Result<()>, tokio::task::JoinError>) -> String {
    match res {
        Ok(Ok(())) => format!("{task} finished: peer closed"),
        Ok(Err(e)) => format!("{task} failed: {e}"),
        Err(e) => format!("{task} panicked: {e}"),
    }
}

/// Drains control frames from the start; caller frames only once ready.
/// Control frames keep priority so pings go out under load.
async fn run_writer(
    mut sink: WsSink,
    mut ctrl: UnboundedReceiver<String>,
    out_q: Arc<tokio::sync::Mutex<UnboundedReceiver<String>>>,
    mut ready_rx: watch::Receiver<bool>,
) -> Result<()> {
    while !*ready_rx.borrow() {
        tokio::select! {
            frame = ctrl.recv() => match frame {
                Some(f) => sink.send_text(&f).await?,
                None => return Ok(()),
            },
            changed = ready_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }

    let mut out = out_q.lock_owned().await;
    loop {
        tokio::select! {
            biased;
            frame = ctrl.recv() => match frame {
                Some(f) => sink.send_text(&f).await?,
                None => return Ok(()),
            },
            frame = out.recv() => match frame {
                Some(f) => sink.send_text(&f).await?,
                None => return Ok(()),
            },
        }
    }
}

/// Single reader: every inbound frame records liveness and routes
async fn run_reader(mut source: WsSource, router: Router, monitor: KeepaliveMonitor) -> Result<()> {
    while let Some(text) = source.next_text().await? {
        monitor.record_activity();
        router.route(&text);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    fn session() -> Session {
        Session::new("tok".to_string(), ClientConfig::default())
    }

    /// Local venue stand-in: accepts connections, acks `setContext`,
    /// reports every inbound text frame tagged with its connection index,
    /// and hangs up on the first connection once the replay went through.
    async fn spawn_venue_server() -> (String, mpsc::UnboundedReceiver<(usize, String)>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut next_conn = 0usize;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let id = next_conn;
                next_conn += 1;
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let mut seen = 0usize;
                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let text = text.to_string();
                        let _ = tx.send((id, text.clone()));
                        seen += 1;
                        let v: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                        if v["action"] == "setContext" {
                            let ack = format!(
                                r#"{{"action":"setContext","ns":{},"message":{{}}}}"#,
                                v["ns"]
                            );
                            if ws.send(Message::text(ack)).await.is_err() {
                                return;
                            }
                        }
                        if id == 0 && seen >= 4 {
                            return;
                        }
                    }
                });
            }
        });
        (url, rx)
    }

    #[tokio::test]
    async fn test_reconnect_replays_auth_before_subscriptions() {
        let (url, mut frames) = spawn_venue_server().await;
        let mut config = ClientConfig::default();
        config.url = url;
        config.reconnect_initial_ms = 10;
        let s = Session::new("tok".to_string(), config);
        s.subscriptions().register(155, vec![5]);
        s.subscriptions().register(142, vec![60]);

        s.connect().await.unwrap();

        // The server drops the first connection after the replay, forcing
        // a redial; collect traffic until the second replay is complete
        let mut by_conn: Vec<Vec<Value>> = vec![Vec::new(), Vec::new()];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (id, raw) = tokio::time::timeout(remaining, frames.recv())
                .await
                .expect("venue never saw the redial")
                .expect("server channel closed early");
            if id < 2 {
                by_conn[id].push(serde_json::from_str(&raw).unwrap());
            }
            let replayed = by_conn[1]
                .iter()
                .filter(|v| v["action"] == "subscribeCandles")
                .count();
            if replayed == 2 {
                break;
            }
        }

        // On both connections auth goes out first and the subscriptions
        // follow in registration order
        for conn in &by_conn {
            assert_eq!(conn[0]["action"], "setContext");
            let assets: Vec<u64> = conn
                .iter()
                .filter(|v| v["action"] == "subscribeCandles")
                .map(|v| v["message"]["assets"][0]["id"].as_u64().unwrap())
                .collect();
            assert_eq!(assets, vec![155, 142]);
        }
        s.disconnect();
    }

    #[tokio::test]
    async fn test_second_connect_is_refused() {
        let (url, _frames) = spawn_venue_server().await;
        let mut config = ClientConfig::default();
        config.url = url;
        let s = Session::new("tok".to_string(), config);

        s.connect().await.unwrap();
        assert!(matches!(
            s.connect().await,
            Err(ClientError::InvalidArgument(_))
        ));

        s.disconnect();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(matches!(s.connect().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_closed_state_is_terminal() {
        let s = session();
        s.disconnect();

        // Stragglers from a dying connection cannot revive the session
        s.set_state(SessionState::Connecting);
        s.set_state(SessionState::Ready);
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_resubscribe_frames_preserve_registration_order() {
        let s = session();
        s.subscriptions().register(155, vec![5]);
        s.subscriptions().register(142, vec![60]);
        s.subscriptions().register(160, vec![5, 60]);

        let frames = resubscribe_frames(s.router(), s.subscriptions());
        assert_eq!(frames.len(), 3);

        let mut seen_ns = Vec::new();
        let assets: Vec<u64> = frames
            .iter()
            .map(|f| {
                let v: Value = serde_json::from_str(f).unwrap();
                assert_eq!(v["action"], "subscribeCandles");
                seen_ns.push(v["ns"].as_u64().unwrap());
                v["message"]["assets"][0]["id"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(assets, vec![155, 142, 160]);

        // Correlation ids stay distinct across the replayed frames
        let mut deduped = seen_ns.clone();
        deduped.dedup();
        assert_eq!(deduped, seen_ns);
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_closes_everything() {
        let s = session();
        s.disconnect();

        assert_eq!(s.state(), SessionState::Closed);
        assert!(matches!(
            s.router()
                .call("profile", json!({}), Duration::from_secs(1))
                .await,
            Err(ClientError::Closed)
        ));
        assert!(matches!(s.connect().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let s = session();
        s.disconnect();
        s.disconnect();
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_authenticate_sends_set_context_first() {
        let s = session();
        let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel();

        let session = s.clone();
        let auth = tokio::spawn(async move { session.authenticate(&ctrl_tx).await });

        let first = ctrl_rx.recv().await.unwrap();
        let v: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(v["action"], "setContext");
        assert_eq!(v["message"]["is_demo"], 1);
        assert_eq!(v["token"], "tok");
        let ns = v["ns"].as_u64().unwrap();

        // Explicit ack completes the handshake
        s.router()
            .route(&format!(r#"{{"action":"setContext","ns":{ns},"message":{{}}}}"#));
        assert!(auth.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_grace_period_counts_as_authenticated() {
        let s = session();
        let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel();

        let session = s.clone();
        let auth = tokio::spawn(async move { session.authenticate(&ctrl_tx).await });
        let _ = ctrl_rx.recv().await.unwrap();

        // No reply at all; paused time runs the grace period out
        assert!(auth.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_auth_rejection_is_fatal() {
        let s = session();
        let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel();

        let session = s.clone();
        let auth = tokio::spawn(async move { session.authenticate(&ctrl_tx).await });

        let first = ctrl_rx.recv().await.unwrap();
        let ns = serde_json::from_str::<Value>(&first).unwrap()["ns"]
            .as_u64()
            .unwrap();
        s.router().route(&format!(
            r#"{{"action":"error","ns":{ns},"message":"bad token"}}"#
        ));

        match auth.await.unwrap() {
            Err(ClientError::AuthRejected(msg)) => assert_eq!(msg, "bad token"),
            other => panic!("expected AuthRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_prime_batches_lookups_and_caches_replies() {
        let s = session();
        let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel();

        s.prime(&ctrl_tx);

        let batch = ctrl_rx.recv().await.unwrap();
        let v: Value = serde_json::from_str(&batch).unwrap();
        assert_eq!(v["action"], "multipleAction");
        let actions = v["message"]["actions"].as_array().unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0]["action"], "profile");

        let profile_ns = actions[0]["ns"].as_u64().unwrap();
        s.router().route(&format!(
            r#"{{"action":"profile","ns":{profile_ns},"message":{{"profile":{{"demo_balance":10000.0}}}}}}"#
        ));

        // The caching task runs on the same runtime
        for _ in 0..50 {
            if s.primed("profile").is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let cached = s.primed("profile").unwrap();
        assert_eq!(cached["message"]["profile"]["demo_balance"], 10000.0);
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= Duration::from_secs(8));
            assert!(d <= Duration::from_millis(12_500));
        }
    }
}
