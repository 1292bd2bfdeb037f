//! Async WebSocket client engine for the ExpertOption trading venue
//!
//! Multiplexes correlated request/response calls, live candle subscriptions
//! and the trade lifecycle over one persistent connection, with transparent
//! reconnect and resubscription.

pub mod client;
pub mod core;
pub mod infrastructure;
pub mod protocol;
pub mod ws;

// Re-export commonly used types
pub use crate::client::blocking::ExpertOption;
pub use crate::client::ExpertClient;
pub use crate::core::types::{Asset, Candle, Deal, DealStatus, Direction};
pub use crate::infrastructure::config::ClientConfig;
pub use crate::protocol::validator::Validator;
pub use crate::ws::router::{DealResult, RawStream};
pub use crate::ws::session::{Session, SessionState};
pub use crate::ws::subscription::CandleSubscription;

use thiserror::Error;

/// Main error type for the venue client
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connect/send/receive failure. Handled internally by reconnect;
    /// surfaced only when retries are exhausted.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Venue refused the setContext handshake. Fatal, never retried.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// A specific call exceeded its deadline. Local and non-fatal.
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// Venue declined a trade (insufficient balance, closed market, ...).
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// Frame undecodable or unroutable. Logged and dropped, fails no call.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Caller-side validation failure, raised before any network I/O.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The connection owning a pending call was dropped.
    #[error("Connection lost")]
    ConnectionLost,

    /// The session is closed; no further calls are possible.
    #[error("Session closed")]
    Closed,

    /// Asset id or symbol not present in the asset table.
    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ClientError>;
