//! Core subscriber machinery shared by every connection.

pub mod distribution;
pub mod flow_control;
pub mod status;
pub mod waiter;

pub use distribution::Distribution;
pub use flow_control::{FlowControlSettings, FlowController, LimitExceededBehavior};
pub use waiter::Waiter;
