//! Resilience patterns shared by the venue adapter and replication sender:
//! exponential backoff for retries, and a panic hook for graceful shutdown.

pub mod backoff;
pub mod panic;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use panic::install_panic_handler;
