//! Partition-dispatch-collect engine on top of tokio.
//!
//! # Features
//! - Contiguous chunking of a task list across a fixed pool of worker slots
//! - Batch delivery (one final snapshot) or incremental delivery (a snapshot per chunk)
//! - Index-ordered results regardless of completion order
//! - Supersede and dispose with discard-by-run-id of stale chunk reports
//! - Completion timeout for hung worker slots
//! - Pluggable task executor, with an HTTP fetcher out of the box

pub mod aggregator;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod fetch;
pub mod handle;
pub mod model;
pub mod partition;
pub mod pool;
pub mod result;

pub use engine::Engine;
pub use errors::{EngineError, TaskError};
pub use executor::{executor_fn, FnExecutor, TaskExecutor};
pub use handle::Subscription;
pub use model::{DeliveryMode, EngineMetrics, RunId};
pub use pool::Config;
pub use result::{Outcome, ResultSnapshot};
