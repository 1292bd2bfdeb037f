//! Keepalive monitor
//!
//! Sends the venue's application-level ping on a fixed interval and
//! watches time since the last inbound frame of any kind. It never owns
//! the transport: pings go through the session's control channel, and
//! staleness is reported as a signal for the connection manager to act on.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Tracks inbound traffic and emits liveness probes
#[derive(Clone)]
pub struct KeepaliveMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    /// Probe interval
    ping_interval: Duration,
    /// Silence beyond this duration marks the connection stale
    stale_after: Duration,
    /// Millis since `epoch` of the last inbound frame
    last_inbound: AtomicU64,
    epoch: Instant,
}

impl KeepaliveMonitor {
    /// `stale_multiplier` is expressed in probe intervals: silence longer
    /// than `ping_interval * stale_multiplier` is considered stale.
    pub fn new(ping_interval: Duration, stale_multiplier: u32) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                ping_interval,
                stale_after: ping_interval * stale_multiplier.max(1),
                last_inbound: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
        }
    }

    /// Record that any inbound frame arrived
    #[inline]
    pub fn record_activity(&self) {
        let millis = self.inner.epoch.elapsed().as_millis() as u64;
        self.inner.last_inbound.store(millis, Ordering::Relaxed);
    }

    /// Time since the last inbound frame
    pub fn idle(&self) -> Duration {
        let last = self.inner.last_inbound.load(Ordering::Relaxed);
        self.inner.epoch.elapsed().saturating_sub(Duration::from_millis(last))
    }

    /// Whether silence has exceeded the staleness threshold
    pub fn is_stale(&self) -> bool {
        self.idle() > self.inner.stale_after
    }

    /// The venue's application-level liveness probe
    pub fn ping_frame() -> String {
        json!({"action": "ping", "v": 23, "message": {}}).to_string()
    }

    /// Run the probe loop until the connection goes stale or the control
    /// channel closes. Sends one staleness signal and returns.
    pub async fn run(self, ctrl_tx: UnboundedSender<String>, stale_tx: UnboundedSender<()>) {
        self.record_activity();
        let mut ticker = interval(self.inner.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if self.is_stale() {
                tracing::warn!(
                    idle_ms = self.idle().as_millis() as u64,
                    "connection stale, signalling reconnect"
                );
                let _ = stale_tx.send(());
                return;
            }

            if ctrl_tx.send(Self::ping_frame()).is_err() {
                // Connection torn down underneath us
                return;
            }
        }
    }
}

/// Server time is carried on the pong reply; the codec does not touch it,
/// the client reads it through a pending call on the `pong` action.
pub fn parse_server_time(message: &serde_json::Value) -> Option<i64> {
    let data = message.get("data")?;
    let digits: String = match data {
        serde_json::Value::String(s) => s.chars().take(10).collect(),
        serde_json::Value::Number(n) => n.to_string().chars().take(10).collect(),
        _ => return None,
    };
    digits.parse().ok()
}
