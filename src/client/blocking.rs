//! Blocking facade
//!
//! Owns a private runtime and delegates every operation to the async
//! client. For callers that do not run tokio themselves.

use crate::core::types::{Asset, Candle, Deal};
use crate::infrastructure::config::ClientConfig;
use crate::protocol::validator::Validator;
use crate::ws::router::{DealResult, RawStream};
use crate::ws::session::SessionState;
use crate::ws::subscription::CandleSubscription;
use crate::Result;
use serde_json::Value;
use tokio::runtime::Runtime;

/// Blocking client for the venue
pub struct ExpertOption {
    runtime: Runtime,
    client: super::ExpertClient,
}

impl ExpertOption {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_config(token, ClientConfig::default())
    }

    pub fn with_config(token: impl Into<String>, config: ClientConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            client: super::ExpertClient::with_config(token, config),
            runtime,
        })
    }

    pub fn state(&self) -> SessionState {
        self.client.state()
    }

    pub fn connect(&self) -> Result<()> {
        self.runtime.block_on(self.client.connect())
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    pub fn fetch_profile(&self) -> Result<Value> {
        self.runtime.block_on(self.client.fetch_profile())
    }

    pub fn balance(&self) -> Result<f64> {
        self.runtime.block_on(self.client.balance())
    }

    pub fn fetch_assets(&self) -> Result<Vec<Asset>> {
        self.runtime.block_on(self.client.fetch_assets())
    }

    pub fn payout(&self, symbol: &str) -> Result<i64> {
        self.runtime.block_on(self.client.payout(symbol))
    }

    pub fn server_time(&self) -> Result<i64> {
        self.runtime.block_on(self.client.server_time())
    }

    pub fn get_candles(
        &self,
        asset_id: u32,
        timeframe: u32,
        offset_secs: i64,
        duration_secs: i64,
    ) -> Result<Vec<Candle>> {
        self.runtime.block_on(self.client.get_candles(
            asset_id,
            timeframe,
            offset_secs,
            duration_secs,
        ))
    }

    pub fn subscribe(&self, asset_id: u32, timeframes: &[u32]) -> Result<CandleSubscription> {
        self.client.subscribe(asset_id, timeframes)
    }

    pub fn unsubscribe(&self, sub: &CandleSubscription) -> Result<()> {
        self.client.unsubscribe(sub)
    }

    /// Block for the next update of a subscription; `None` after
    /// unsubscribe or terminal closure
    pub fn next_update(&self, sub: &mut CandleSubscription) -> Option<Value> {
        self.runtime.block_on(sub.next())
    }

    pub fn buy(
        &self,
        asset_id: u32,
        amount: f64,
        expiration: u64,
        check_win: bool,
    ) -> Result<(u64, Deal)> {
        self.runtime
            .block_on(self.client.buy(asset_id, amount, expiration, check_win))
    }

    pub fn sell(
        &self,
        asset_id: u32,
        amount: f64,
        expiration: u64,
        check_win: bool,
    ) -> Result<(u64, Deal)> {
        self.runtime
            .block_on(self.client.sell(asset_id, amount, expiration, check_win))
    }

    pub fn check_win(&self, deal_id: u64, expiration: u64) -> Result<DealResult> {
        self.runtime
            .block_on(self.client.check_win(deal_id, expiration))
    }

    pub fn open_trades(&self) -> Result<Vec<Value>> {
        self.runtime.block_on(self.client.open_trades())
    }

    pub fn trade_history(&self) -> Result<Vec<Value>> {
        self.runtime.block_on(self.client.trade_history())
    }

    pub fn send_raw(&self, frame_text: String) -> Result<()> {
        self.client.send_raw(frame_text)
    }

    pub fn create_raw_order(&self, frame_text: String, validator: Validator) -> Result<String> {
        self.runtime
            .block_on(self.client.create_raw_order(frame_text, validator))
    }

    pub fn create_raw_iterator(
        &self,
        frame_text: String,
        validator: Validator,
    ) -> Result<RawStream> {
        self.client.create_raw_iterator(frame_text, validator)
    }

    /// Block for the next frame of a raw iterator; `None` after
    /// terminal closure
    pub fn next_raw(&self, stream: &mut RawStream) -> Option<String> {
        self.runtime.block_on(stream.next())
    }
}

impl Drop for ExpertOption {
    fn drop(&mut self) {
        self.client.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientError;

    #[test]
    fn test_blocking_validation_path() {
        let client = ExpertOption::new("tok").unwrap();
        assert!(matches!(
            client.buy(142, -1.0, 60, false),
            Err(ClientError::InvalidArgument(_))
        ));
        client.disconnect();
        assert_eq!(client.state(), SessionState::Closed);
    }
}
