//! Pool error types

use thiserror::Error;

use forkpool_codec::{CodecError, RemoteError};
use forkpool_ipc::IpcError;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Argument or result payload could not be dried or undried
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Transport failure on the control or side channel
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// A worker process could not be started
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Every worker is gone and a new one could not be added
    #[error("no worker available")]
    NoWorkers,

    /// The chosen worker's channel closed before the message went out
    #[error("worker {0} is gone")]
    WorkerGone(u32),

    /// The remote task reported a failure
    #[error("remote task failed: {0}")]
    Task(RemoteError),
}
