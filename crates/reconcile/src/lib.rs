//! Herald reconcile: turns "something changed" signals into exactly one notification
//! per lifecycle transition, backed by a durable record written with optimistic
//! concurrency.

#![forbid(unsafe_code)]

pub mod driver;
mod error;
mod reconciler;
pub mod retry;

pub use driver::{run as run_driver, DriverOptions, DriverStats};
pub use error::ReconcileError;
pub use reconciler::{Outcome, Reconciler, ReconcilerOptions};
pub use retry::RetryPolicy;
