//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forkpool_codec::DriedPayload;

use crate::error::IpcError;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Stable id of a wrapped task, pool-global and never reassigned
pub type FncId = u32;

/// Correlation id linking an `exec` to its eventual `callback` and events
pub type CallId = u64;

/// Nested correlation id for acknowledgement-seeking event signals
pub type EventId = u64;

/// Side-channel address and declared length of one buffer transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub address: String,
    pub length: u64,
}

/// Side-channel address of one stream transfer; read until the peer closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub address: String,
}

/// Messages sent from the pool to worker processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolMessage {
    /// Ship a task id; the worker verifies it against its linked-in registry
    Wrap { fncid: FncId, name: String },

    /// Execute a shipped task
    Exec {
        fncid: FncId,
        cbid: CallId,
        args: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        buffers: Vec<BufferDescriptor>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        streams: Vec<StreamDescriptor>,
    },

    /// Forward a caller-side emitted signal into the running call
    CbEvent {
        cbid: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eid: Option<EventId>,
        name: String,
        args: String,
    },

    /// Reply to an acknowledgement-seeking signal from the worker
    EventResponse {
        cbid: CallId,
        eid: EventId,
        args: String,
    },

    /// The caller discarded its event handle; the worker may free call state
    ReapEvent { cbid: CallId },

    /// Generic one-way signal
    Event { name: String },
}

/// Messages sent from worker processes to the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Result of one call, correlated by cbid
    Callback {
        cbid: CallId,
        response: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        buffers: Vec<BufferDescriptor>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        streams: Vec<StreamDescriptor>,
    },

    /// Periodic health report, sent regardless of activity
    Ping { lag: f64, bufferlock: bool },

    /// A worker-side emitted signal for the call's event handle
    CbEvent {
        cbid: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eid: Option<EventId>,
        name: String,
        args: String,
    },

    /// Reply to an acknowledgement-seeking signal from the caller
    EventResponse {
        cbid: CallId,
        eid: EventId,
        args: String,
    },

    /// Generic one-way signal
    Event { name: String },

    /// An uncaught failure with no callback to deliver it to
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}

/// Extract the text of a dried event payload.
///
/// Event messages carry no side lists on the wire, so a payload holding
/// buffers or streams cannot be sent as an event.
pub fn event_args(payload: DriedPayload) -> Result<String, IpcError> {
    if !payload.buffers.is_empty() || !payload.streams.is_empty() {
        return Err(IpcError::EventPayload);
    }
    Ok(payload.text)
}
