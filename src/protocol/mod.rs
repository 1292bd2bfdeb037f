//! Wire protocol: frame codec and message-shape validators

pub mod frame;
pub mod validator;

pub use frame::{Envelope, Frame, FramePrefix};
pub use validator::Validator;
