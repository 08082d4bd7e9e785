//! Tokio-based building blocks for in-process pipelines: a backlog-bounded
//! stage feeding a fixed worker pool, with draining and first-error capture,
//! and a fixed-capacity pool of reusable values.

mod consume;
mod error;
mod getter;
mod options;
mod pool;
mod stage;
mod tracker;
mod worker;

pub use consume::{consume, Putter, Waiter};
pub use error::{BoxError, ConsumeError};
pub use getter::Getter;
pub use options::ConsumeOptions;
pub use pool::{Pool, Pooled};
