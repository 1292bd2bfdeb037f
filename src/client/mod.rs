//! Public async client surface
//!
//! Wraps the session engine with the venue's operations: account
//! lookups, candle history, live subscriptions, and the trade
//! lifecycle from placement to resolution.

pub mod blocking;

use crate::core::types::{Asset, Candle, Deal, DealStatus, Direction};
use crate::infrastructure::config::ClientConfig;
use crate::protocol::frame;
use crate::protocol::validator::Validator;
use crate::ws::ping::{self, KeepaliveMonitor};
use crate::ws::router::{DealResult, RawStream};
use crate::ws::session::{Session, SessionState};
use crate::ws::subscription::{self, CandleSubscription};
use crate::{ClientError, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Async client for the venue
///
/// Cheap to clone; all clones share the one session.
#[derive(Clone)]
pub struct ExpertClient {
    session: Session,
}

impl ExpertClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_config(token, ClientConfig::default())
    }

    pub fn with_config(token: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            session: Session::new(token.into(), config),
        }
    }

    /// The underlying session, for state observation
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    fn config(&self) -> &ClientConfig {
        self.session.config()
    }

    /// Establish the session; resolves once the connection is ready
    pub async fn connect(&self) -> Result<()> {
        self.session.connect().await
    }

    /// Terminal closure; every outstanding await fails with `Closed`
    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    async fn call(&self, action: &str, message: Value) -> Result<Value> {
        self.session
            .router()
            .call(action, message, self.config().call_timeout())
            .await
    }

    /// Fetch the user profile
    pub async fn fetch_profile(&self) -> Result<Value> {
        let body = match self.call("profile", json!({})).await {
            Ok(body) => body,
            // The priming batch usually has it already
            Err(ClientError::Timeout(_)) => self
                .session
                .primed("profile")
                .ok_or_else(|| ClientError::Timeout("profile".to_string()))?,
            Err(e) => return Err(e),
        };
        Ok(body
            .get("message")
            .and_then(|m| m.get("profile"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Account balance of the configured account (demo or live)
    pub async fn balance(&self) -> Result<f64> {
        let profile = self.fetch_profile().await?;
        let field = if self.config().demo {
            "demo_balance"
        } else {
            "real_balance"
        };
        profile
            .get(field)
            .and_then(Value::as_f64)
            .ok_or_else(|| ClientError::Protocol(format!("profile missing {field}")))
    }

    /// List of tradable instruments
    pub async fn fetch_assets(&self) -> Result<Vec<Asset>> {
        let body = self.assets_body().await?;
        let assets = body
            .get("message")
            .and_then(|m| m.get("assets"))
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::Protocol("assets reply without asset list".to_string()))?;
        Ok(assets.iter().filter_map(Asset::from_value).collect())
    }

    /// Payout percent for a symbol
    pub async fn payout(&self, symbol: &str) -> Result<i64> {
        let assets = self.fetch_assets().await?;
        assets
            .iter()
            .find(|a| a.symbol.eq_ignore_ascii_case(symbol))
            .map(|a| a.payout)
            .ok_or_else(|| ClientError::AssetNotFound(symbol.to_string()))
    }

    /// Current server time as a UNIX timestamp. Falls back to the local
    /// clock when the venue does not answer the probe in time.
    pub async fn server_time(&self) -> Result<i64> {
        let router = self.session.router();
        let wait = router.wait_action("pong", self.config().call_timeout());
        router.enqueue(KeepaliveMonitor::ping_frame())?;
        match wait.await {
            Ok(body) => {
                let message = body.get("message").cloned().unwrap_or(Value::Null);
                ping::parse_server_time(&message)
                    .ok_or_else(|| ClientError::Protocol("pong without server time".to_string()))
            }
            Err(ClientError::Timeout(_)) => {
                tracing::warn!("no pong in time, using local clock");
                Ok(local_unix_time())
            }
            Err(e) => Err(e),
        }
    }

    /// Historical candles ending `offset_secs` before now, covering
    /// `duration_secs` at the given timeframe
    pub async fn get_candles(
        &self,
        asset_id: u32,
        timeframe: u32,
        offset_secs: i64,
        duration_secs: i64,
    ) -> Result<Vec<Candle>> {
        let end = self.server_time().await? - offset_secs;

        // The venue serves history more reliably while streaming the asset
        let sub_frame = frame::encode_request(
            "subscribeCandles",
            subscription::subscribe_message(asset_id, &[timeframe]),
            &self.session.router().token(),
            self.session.router().next_ns(),
        );
        self.session.router().enqueue(sub_frame)?;

        let reply = self
            .call(
                "assetHistoryCandles",
                json!({
                    "assetid": asset_id,
                    "periods": [[end - duration_secs, end]],
                    "timeframes": [timeframe],
                }),
            )
            .await;

        // Stop the transient stream again, unless a live subscription
        // still wants this asset
        if !self.session.subscriptions().matches(asset_id) {
            let unsub = frame::encode_request(
                "unsubscribeCandles",
                subscription::unsubscribe_message(asset_id),
                &self.session.router().token(),
                self.session.router().next_ns(),
            );
            let _ = self.session.router().enqueue(unsub);
        }
        let reply = reply?;

        let raw = reply
            .get("message")
            .and_then(|m| m.get("candles"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut candles: Vec<Candle> = raw
            .iter()
            .filter_map(|c| Candle::from_value(c, timeframe))
            .filter(|c| c.timeframe == timeframe)
            .collect();
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        Ok(candles)
    }

    /// Subscribe to live candle updates for an asset
    ///
    /// The handle yields updates until `unsubscribe` or terminal closure.
    /// The registration survives reconnects via replay.
    pub fn subscribe(&self, asset_id: u32, timeframes: &[u32]) -> Result<CandleSubscription> {
        if self.state() == SessionState::Closed {
            return Err(ClientError::Closed);
        }
        let (id, rx) = self
            .session
            .subscriptions()
            .register(asset_id, timeframes.to_vec());

        // Before Ready the replay pass sends the frame instead
        if self.session.is_ready() {
            let frame = frame::encode_request(
                "subscribeCandles",
                subscription::subscribe_message(asset_id, timeframes),
                &self.session.router().token(),
                self.session.router().next_ns(),
            );
            self.session.router().enqueue(frame)?;
        }

        Ok(CandleSubscription { id, asset_id, rx })
    }

    /// Cancel a subscription. Idempotent: a second call for the same
    /// handle is a no-op and sends no duplicate frame.
    pub fn unsubscribe(&self, sub: &CandleSubscription) -> Result<()> {
        let Some(asset_id) = self.session.subscriptions().unregister(sub.id()) else {
            return Ok(());
        };
        // Keep the venue streaming while other subscriptions still
        // cover this asset
        if self.session.is_ready() && !self.session.subscriptions().matches(asset_id) {
            let frame = frame::encode_request(
                "unsubscribeCandles",
                subscription::unsubscribe_message(asset_id),
                &self.session.router().token(),
                self.session.router().next_ns(),
            );
            self.session.router().enqueue(frame)?;
        }
        Ok(())
    }

    /// Send a frame exactly as given, bypassing the request codec
    pub fn send_raw(&self, frame_text: String) -> Result<()> {
        self.session.router().enqueue(frame_text)
    }

    /// Send a raw frame and wait for the first inbound frame the
    /// validator accepts, returned as raw text
    pub async fn create_raw_order(
        &self,
        frame_text: String,
        validator: Validator,
    ) -> Result<String> {
        let rx = self.session.router().watch_raw_once(validator);
        self.session.router().enqueue(frame_text)?;
        match tokio::time::timeout(self.config().call_timeout(), rx).await {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout("raw order".to_string())),
        }
    }

    /// Send a raw frame and stream every inbound frame the validator
    /// accepts. The stream ends on terminal closure.
    pub fn create_raw_iterator(
        &self,
        frame_text: String,
        validator: Validator,
    ) -> Result<RawStream> {
        let stream = self.session.router().watch_raw(validator);
        self.session.router().enqueue(frame_text)?;
        Ok(stream)
    }

    /// Place a CALL trade
    pub async fn buy(
        &self,
        asset_id: u32,
        amount: f64,
        expiration: u64,
        check_win: bool,
    ) -> Result<(u64, Deal)> {
        self.place_trade(Direction::Call, asset_id, amount, expiration, check_win)
            .await
    }

    /// Place a PUT trade
    pub async fn sell(
        &self,
        asset_id: u32,
        amount: f64,
        expiration: u64,
        check_win: bool,
    ) -> Result<(u64, Deal)> {
        self.place_trade(Direction::Put, asset_id, amount, expiration, check_win)
            .await
    }

    async fn place_trade(
        &self,
        direction: Direction,
        asset_id: u32,
        amount: f64,
        expiration: u64,
        check_win: bool,
    ) -> Result<(u64, Deal)> {
        if !(amount > 0.0) {
            return Err(ClientError::InvalidArgument(format!(
                "amount must be positive, got {amount}"
            )));
        }
        if expiration == 0 {
            return Err(ClientError::InvalidArgument(
                "expiration must be positive".to_string(),
            ));
        }

        let (step, purchase_time) = self.trade_timing(asset_id).await;
        let server_time = self.server_time().await?;
        let strike = server_time + purchase_time;
        let shift = expiration.div_ceil(step).max(2);
        let message = json!({
            "type": direction.as_str(),
            "amount": amount,
            "assetid": asset_id,
            "strike_time": strike,
            "is_demo": if self.config().demo { 1 } else { 0 },
            "expiration_shift": shift,
            "ratePosition": 0,
        });

        // The watcher goes in before the send so the uncorrelated
        // buySuccessful push cannot slip past
        let ack = self.session.router().watch_order();
        // The correlated reply is usually empty; the deal id rides the push
        self.call("buyOption", message).await?;

        let option = match tokio::time::timeout(self.config().call_timeout(), ack).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => return Err(ClientError::Timeout("buySuccessful".to_string())),
        };
        let deal_id = option
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::Protocol("buySuccessful without deal id".to_string()))?;
        tracing::info!(deal_id, asset_id, ?direction, amount, "trade placed");

        let mut deal = Deal {
            id: deal_id,
            asset_id,
            direction,
            amount,
            expiration,
            status: DealStatus::Open,
            profit: None,
        };

        if check_win {
            let result = self.check_win(deal_id, expiration).await?;
            let profit = result.status.is_terminal().then_some(result.profit);
            deal.resolve(result.status, profit);
        }

        Ok((deal_id, deal))
    }

    /// Wait for a deal's terminal outcome, bounded by its expiration
    /// plus the resolution grace window. Returns `Unknown` on timeout
    /// rather than erroring or hanging. While waiting, the trade history
    /// is polled as a fallback for a missed push.
    pub async fn check_win(&self, deal_id: u64, expiration: u64) -> Result<DealResult> {
        let router = self.session.router();
        let mut pushed = router.watch_deal(deal_id);
        let deadline =
            Instant::now() + Duration::from_secs(expiration) + self.config().resolution_grace();

        let mut poll = tokio::time::interval(self.config().poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        loop {
            tokio::select! {
                result = &mut pushed => {
                    return Ok(match result {
                        Ok(r) => {
                            tracing::info!(deal_id, status = ?r.status, profit = r.profit, "deal resolved");
                            r
                        }
                        // Session shut down underneath the wait
                        Err(_) => unknown_result(),
                    });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    router.unwatch_deal(deal_id);
                    tracing::warn!(deal_id, "no resolution within window, reporting Unknown");
                    return Ok(unknown_result());
                }
                _ = poll.tick() => {
                    let budget = deadline
                        .saturating_duration_since(Instant::now())
                        .min(self.config().call_timeout());
                    if let Some(result) = self.poll_history(deal_id, budget).await {
                        router.unwatch_deal(deal_id);
                        tracing::info!(deal_id, status = ?result.status, "deal resolved via history poll");
                        return Ok(result);
                    }
                }
            }
        }
    }

    /// List currently open trades
    pub async fn open_trades(&self) -> Result<Vec<Value>> {
        let body = self
            .call(
                "openTrades",
                json!({"count": 20, "is_demo": if self.config().demo { 1 } else { 0 }}),
            )
            .await?;
        Ok(trades_of(&body))
    }

    /// List recently closed trades
    pub async fn trade_history(&self) -> Result<Vec<Value>> {
        let body = self
            .call(
                "tradeHistory",
                json!({"count": 20, "cursor": null, "is_demo": if self.config().demo { 1 } else { 0 }}),
            )
            .await?;
        Ok(trades_of(&body))
    }

    async fn assets_body(&self) -> Result<Value> {
        if let Some(body) = self.session.primed("assets") {
            return Ok(body);
        }
        self.call("assets", json!({})).await
    }

    /// Expiration step and purchase lead time for an asset, with the
    /// venue's defaults when the lookup is unavailable
    async fn trade_timing(&self, asset_id: u32) -> (u64, i64) {
        let entry = match self.assets_body().await {
            Ok(body) => body
                .get("message")
                .and_then(|m| m.get("assets"))
                .and_then(Value::as_array)
                .and_then(|assets| {
                    assets
                        .iter()
                        .find(|a| a.get("id").and_then(Value::as_u64) == Some(u64::from(asset_id)))
                        .cloned()
                }),
            Err(_) => None,
        };
        match entry {
            Some(a) => (
                a.get("expiration_step").and_then(Value::as_u64).unwrap_or(5),
                a.get("purchase_time").and_then(Value::as_i64).unwrap_or(30),
            ),
            None => (5, 30),
        }
    }

    async fn poll_history(&self, deal_id: u64, budget: Duration) -> Option<DealResult> {
        if budget.is_zero() {
            return None;
        }
        let call = self.session.router().call(
            "tradeHistory",
            json!({"count": 20, "cursor": null, "is_demo": if self.config().demo { 1 } else { 0 }}),
            budget,
        );
        match call.await {
            Ok(body) => terminal_in(&trades_of(&body), deal_id),
            Err(e) => {
                tracing::debug!(deal_id, error = %e, "history poll unanswered");
                None
            }
        }
    }
}

fn trades_of(body: &Value) -> Vec<Value> {
    body.get("message")
        .and_then(|m| m.get("trades"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Find a terminal result for the deal in a trade listing
fn terminal_in(trades: &[Value], deal_id: u64) -> Option<DealResult> {
    let entry = trades
        .iter()
        .find(|t| t.get("id").and_then(Value::as_u64) == Some(deal_id))?;
    let profit = entry
        .get("result_amount_cash")
        .or_else(|| entry.get("profit"))
        .and_then(Value::as_f64)?;
    let status = if profit > 0.0 {
        DealStatus::Won
    } else {
        DealStatus::Lost
    };
    Some(DealResult {
        status,
        profit,
        details: entry.clone(),
    })
}

fn unknown_result() -> DealResult {
    DealResult {
        status: DealStatus::Unknown,
        profit: 0.0,
        details: Value::Null,
    }
}

fn local_unix_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
