//! Core domain types: assets, candles, deals

pub mod asset;
pub mod types;

pub use asset::{asset_id, asset_symbol, DEFAULT_SERVER};
pub use types::{Asset, Candle, Deal, DealStatus, Direction};
