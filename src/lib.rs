//! `plimit`: bounded-concurrency task admission for async Rust.
//!
//! This crate provides the admission gate (`limiter`), its validated bound
//! (`concurrency`), the outcome future handed back to submitters (`handle`),
//! a batch helper that preserves submission order (`bounded`), and the YAML
//! job runner used by the `plimit` CLI (`config`, `runner`, `trace`).
//!
//! Invariants:
//! - at most `N` submitted tasks are in flight at any instant
//! - tasks that have to wait start in submission order
//! - every task settles its handle exactly once, panics included
//! - queued tasks dropped by `clear_queue` settle as `Cancelled` and never run

pub mod bounded;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod handle;
pub mod limiter;
pub mod runner;
pub mod trace;

pub use bounded::{run_bounded, run_with_limit};
pub use concurrency::Concurrency;
pub use error::{LimitError, TaskError};
pub use handle::TaskHandle;
pub use limiter::{Limiter, LimiterStats, WeakLimiter};
