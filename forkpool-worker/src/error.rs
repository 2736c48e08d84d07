//! Worker runtime error types

use thiserror::Error;

use forkpool_codec::CodecError;
use forkpool_ipc::IpcError;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Transport failure on the control or side channel
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// Argument or result payload could not be dried or undried
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Exec referenced a fncid that was never shipped
    #[error("no task wrapped under fncid {0}")]
    UnknownFunction(u32),

    /// Wrap named a task the worker binary does not carry
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// The runtime's outbound queue is gone; the worker is shutting down
    #[error("worker runtime stopped")]
    RuntimeStopped,

    /// The peer went away before answering an acknowledged signal
    #[error("no response for event {0}")]
    AckDropped(String),
}
