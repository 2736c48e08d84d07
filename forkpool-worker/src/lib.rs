//! Worker-process side of forkpool
//!
//! A worker binary links a [`TaskRegistry`], constructs a [`Worker`] around
//! it and drives it over its stdio. The pool never ships code; it only binds
//! ids to the task names both binaries already share.

pub mod error;
pub mod lag;
pub mod registry;
pub mod runtime;

pub use error::WorkerError;
pub use lag::{FixedLag, LagProbe, TimerLag};
pub use registry::{TaskFn, TaskRegistry};
pub use runtime::{TaskContext, Worker};
