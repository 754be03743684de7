//! Bounded-parallel batch execution with per-item failure isolation

mod batch;
mod pool;

pub use batch::{BatchReport, ItemFailure};
pub(crate) use batch::panic_message;
pub use pool::WorkerPool;
