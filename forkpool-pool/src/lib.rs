//! Pool side of forkpool
//!
//! A [`Pool`] schedules calls across worker processes by their reported
//! event-loop lag, routes callbacks and event-handle signals, and reaps
//! workers that sit idle. Tasks are bound by name with [`Pool::wrap`]; the
//! worker binary must carry the same names in its task registry.

pub mod config;
pub mod error;
pub mod event;
pub mod handle;
pub mod pool;
pub mod slots;
pub mod spawner;

pub use config::{PoolConfig, LAG_BUCKET_FLOOR, LAG_REJECT_FLOOR};
pub use error::PoolError;
pub use event::EventHandle;
pub use pool::{Pool, PoolStats, WorkerStatus, WrappedTask};
pub use spawner::{ProcessSpawner, WorkerControl, WorkerId, WorkerLink, WorkerSpawner};
