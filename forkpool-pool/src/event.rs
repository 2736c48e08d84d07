//! The caller's live connection to one dispatched call
//!
//! Every call yields an [`EventHandle`]. While the handle is held, signals
//! flow both ways between the caller and the running task; releasing it
//! tells the worker to drop its per-call event state. Release is explicit,
//! with a drop fallback so an abandoned handle still frees the remote side.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use forkpool_codec::{dry, Value};
use forkpool_ipc::{event_args, CallId, EventId, MessageEnvelope, PoolMessage};

use crate::error::PoolError;
use crate::spawner::WorkerId;

/// A handler for signals the worker emits on this call
pub type SignalHandler = Rc<dyn Fn(Vec<Value>) -> Option<Vec<Value>>>;

pub(crate) struct EventInner {
    cbid: CallId,
    worker: WorkerId,
    sender: mpsc::UnboundedSender<MessageEnvelope<PoolMessage>>,
    handlers: RefCell<HashMap<String, SignalHandler>>,
    acks: RefCell<HashMap<EventId, oneshot::Sender<Vec<Value>>>>,
    next_eid: Cell<EventId>,
    released: Cell<bool>,
}

impl EventInner {
    pub(crate) fn new(
        cbid: CallId,
        worker: WorkerId,
        sender: mpsc::UnboundedSender<MessageEnvelope<PoolMessage>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            cbid,
            worker,
            sender,
            handlers: RefCell::new(HashMap::new()),
            acks: RefCell::new(HashMap::new()),
            next_eid: Cell::new(0),
            released: Cell::new(false),
        })
    }

    pub(crate) fn cbid(&self) -> CallId {
        self.cbid
    }

    /// Run the installed handler for a worker-emitted signal
    pub(crate) fn handle_signal(&self, name: &str, args: Vec<Value>) -> Option<Vec<Value>> {
        let handler = self.handlers.borrow().get(name).cloned();
        match handler {
            Some(handler) => handler(args),
            None => {
                debug!(cbid = self.cbid, name = %name, "no handler installed for signal");
                None
            }
        }
    }

    /// Deliver the worker's answer to an acknowledged signal
    pub(crate) fn resolve_ack(&self, eid: EventId, args: Vec<Value>) {
        match self.acks.borrow_mut().remove(&eid) {
            Some(tx) => {
                let _ = tx.send(args);
            }
            None => debug!(cbid = self.cbid, eid, "response for an unknown event id"),
        }
    }

    fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        let _ = self
            .sender
            .send(MessageEnvelope::new(PoolMessage::ReapEvent {
                cbid: self.cbid,
            }));
    }
}

impl Drop for EventInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Cloneable caller-side handle for one call's event traffic
#[derive(Clone)]
pub struct EventHandle {
    inner: Rc<EventInner>,
}

impl EventHandle {
    pub(crate) fn new(inner: Rc<EventInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<EventInner> {
        &self.inner
    }

    pub fn cbid(&self) -> CallId {
        self.inner.cbid
    }

    pub fn worker(&self) -> WorkerId {
        self.inner.worker
    }

    /// Install a handler for signals the running task emits
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Option<Vec<Value>> + 'static,
    {
        self.inner
            .handlers
            .borrow_mut()
            .insert(name.into(), Rc::new(handler));
    }

    /// Emit a fire-and-forget signal into the running task.
    ///
    /// Signals travel on the control channel only, so the payload must not
    /// contain buffers or streams.
    pub fn emit(&self, name: &str, args: &[Value]) -> Result<(), PoolError> {
        let text = event_args(dry(args)?)?;
        self.inner
            .sender
            .send(MessageEnvelope::new(PoolMessage::CbEvent {
                cbid: self.inner.cbid,
                eid: None,
                name: name.to_string(),
                args: text,
            }))
            .map_err(|_| PoolError::WorkerGone(self.inner.worker))
    }

    /// Emit a signal and wait for the task's handler to answer it
    pub async fn emit_with_ack(
        &self,
        name: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, PoolError> {
        let text = event_args(dry(args)?)?;
        let eid = self.inner.next_eid.get();
        self.inner.next_eid.set(eid + 1);
        let (tx, rx) = oneshot::channel();
        self.inner.acks.borrow_mut().insert(eid, tx);
        self.inner
            .sender
            .send(MessageEnvelope::new(PoolMessage::CbEvent {
                cbid: self.inner.cbid,
                eid: Some(eid),
                name: name.to_string(),
                args: text,
            }))
            .map_err(|_| PoolError::WorkerGone(self.inner.worker))?;
        rx.await.map_err(|_| PoolError::WorkerGone(self.inner.worker))
    }

    /// Tell the worker to drop its per-call event state. Safe to call more
    /// than once; dropping the last clone of the handle does this too.
    pub fn release(&self) {
        self.inner.release();
    }
}
