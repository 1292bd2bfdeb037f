//! Connection engine: transport, keepalive, routing, subscriptions, session

pub mod ping;
pub mod router;
pub mod session;
pub mod subscription;
pub mod transport;

pub use router::Router;
pub use session::{Session, SessionState};
pub use subscription::CandleSubscription;
