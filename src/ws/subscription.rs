//! Subscription multiplexer
//!
//! All live-data subscriptions share the one connection. The registry
//! holds them in registration order so a reconnect can replay the
//! subscribe frames exactly as they were first issued. Delivery queues
//! are unbounded FIFO channels written only by the router's reader task.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Opaque subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubId(pub(crate) u64);

struct SubEntry {
    id: SubId,
    asset_id: u32,
    timeframes: Vec<u32>,
    tx: UnboundedSender<Value>,
    active: bool,
}

/// Registry of active subscriptions, shared between session and router
pub struct SubscriptionRegistry {
    entries: Mutex<Vec<SubEntry>>,
    next_id: Mutex<u64>,
    closed: AtomicBool,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a subscription and hand back its delivery queue
    pub fn register(&self, asset_id: u32, timeframes: Vec<u32>) -> (SubId, UnboundedReceiver<Value>) {
        let (tx, rx) = unbounded_channel();
        let id = {
            let mut next = self.next_id.lock();
            let id = SubId(*next);
            *next += 1;
            id
        };
        self.entries.lock().push(SubEntry {
            id,
            asset_id,
            timeframes,
            tx,
            active: true,
        });
        (id, rx)
    }

    /// Remove a subscription. Returns its asset id the first time only;
    /// a second call for the same id is a no-op.
    pub fn unregister(&self, id: SubId) -> Option<u32> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|e| e.id == id && e.active)?;
        let entry = entries.remove(pos);
        Some(entry.asset_id)
    }

    /// Deliver a payload to every subscription of the asset.
    /// Returns true when at least one queue accepted it.
    pub fn deliver(&self, asset_id: u32, payload: &Value) -> bool {
        let entries = self.entries.lock();
        let mut delivered = false;
        for entry in entries.iter().filter(|e| e.active && e.asset_id == asset_id) {
            if entry.tx.send(payload.clone()).is_ok() {
                delivered = true;
            }
        }
        delivered
    }

    /// Whether any active subscription covers the asset
    pub fn matches(&self, asset_id: u32) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.active && e.asset_id == asset_id)
    }

    /// Snapshot of (asset id, timeframes) in registration order, for
    /// resubscription replay
    pub fn snapshot(&self) -> Vec<(u32, Vec<u32>)> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.active)
            .map(|e| (e.asset_id, e.timeframes.clone()))
            .collect()
    }

    /// Terminal closure: drop every delivery queue so consumers observe
    /// end-of-stream
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.entries.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the venue's subscribe control frame body
pub fn subscribe_message(asset_id: u32, timeframes: &[u32]) -> Value {
    json!({"assets": [{"id": asset_id, "timeframes": timeframes}]})
}

/// Build the venue's unsubscribe control frame body
pub fn unsubscribe_message(asset_id: u32) -> Value {
    json!({"assets": [{"id": asset_id}]})
}

/// Live candle stream handle
///
/// Infinite while the subscription stays active; `next()` yields `None`
/// after `unsubscribe` or terminal session closure. One logical consumer
/// per handle.
pub struct CandleSubscription {
    pub(crate) id: SubId,
    pub(crate) asset_id: u32,
    pub(crate) rx: UnboundedReceiver<Value>,
}

impl CandleSubscription {
    /// Await the next update payload
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn asset_id(&self) -> u32 {
        self.asset_id
    }

    pub fn id(&self) -> SubId {
        self.id
    }
}
