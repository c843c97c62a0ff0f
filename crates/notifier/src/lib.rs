//! The notifier service: consumes wake-up messages, delivers email, and
//! shuts down gracefully.

pub mod consumer;
pub mod shutdown;
pub mod sink;
pub mod worker;

pub use consumer::{Consumer, MessageDisposition};
pub use shutdown::{InFlightGuard, ShutdownCoordinator, wait_for_signals};
pub use sink::TracingSink;
pub use worker::{DrainOutcome, Notifier, NotifierSettings};
