//! Pool-side bookkeeping for one worker

use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::time::Instant;

use forkpool_ipc::{ChannelLock, FncId, MessageEnvelope, PoolMessage};

use crate::error::PoolError;
use crate::spawner::{WorkerControl, WorkerId};

pub struct WorkerHandle {
    pub id: WorkerId,
    sender: mpsc::UnboundedSender<MessageEnvelope<PoolMessage>>,
    pub control: Box<dyn WorkerControl>,

    /// Last reported event-loop lag, milliseconds
    pub lag: f64,
    /// Whether the worker reported a side-channel transfer in flight
    pub bufferlock: bool,
    /// Calls dispatched but not yet called back
    pub running: u32,
    pub idle_since: Instant,
    pub updated_on: Instant,

    /// Serializes this pool's outbound side-channel transfers to the worker
    pub lock: ChannelLock,
    /// Task ids already bound on this worker
    pub shipped: HashSet<FncId>,
}

impl WorkerHandle {
    pub fn new(
        id: WorkerId,
        sender: mpsc::UnboundedSender<MessageEnvelope<PoolMessage>>,
        control: Box<dyn WorkerControl>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            sender,
            control,
            lag: 0.0,
            bufferlock: false,
            running: 0,
            idle_since: now,
            updated_on: now,
            lock: ChannelLock::new(),
            shipped: HashSet::new(),
        }
    }

    pub fn send(&self, message: PoolMessage) -> Result<(), PoolError> {
        self.sender
            .send(MessageEnvelope::new(message))
            .map_err(|_| PoolError::WorkerGone(self.id))
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<MessageEnvelope<PoolMessage>> {
        self.sender.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.control.connected()
    }
}
