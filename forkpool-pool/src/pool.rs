//! The pool: worker scheduling, call dispatch, and callback routing
//!
//! Scheduling follows reported lag. Workers under the lag floor form the
//! preferred bucket and ties break toward fewer running calls; a worker past
//! the rejection floor refuses new work with a probability that grows with
//! its lag. When the best worker is overloaded and the pool is under its
//! limit, a new worker is added; at the limit the pool degrades to the best
//! worker it has rather than failing the call.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use forkpool_codec::{
    as_remote_error, dry, undry_list, DryRegistry, RemoteError, Value,
};
use forkpool_ipc::{
    event_args, prepare_outbound, receive_payload, AddressAllocator, ByteTransport, CallId,
    FncId, MessageEnvelope, PoolMessage, UnixTransport, WorkerMessage,
};

use crate::config::{PoolConfig, LAG_BUCKET_FLOOR, LAG_REJECT_FLOOR};
use crate::error::PoolError;
use crate::event::{EventHandle, EventInner};
use crate::handle::WorkerHandle;
use crate::slots::SlotTable;
use crate::spawner::{WorkerId, WorkerLink, WorkerSpawner};

/// Completion callback for one call; receives the callback arguments with
/// the error slot first
pub type CallbackFn = Box<dyn FnOnce(Vec<Value>)>;

/// Hook for failures that have no callback to land in
pub type ErrorHook = Rc<dyn Fn(RemoteError)>;

/// Hook for generic one-way signals from workers
pub type EventHook = Rc<dyn Fn(&str)>;

struct CallSlot {
    callback: Option<CallbackFn>,
    worker: WorkerId,
}

struct PoolInner {
    config: PoolConfig,
    spawner: Rc<dyn WorkerSpawner>,
    transport: Rc<dyn ByteTransport>,
    alloc: Rc<AddressAllocator>,
    hooks: DryRegistry,
    functions: Vec<String>,
    workers: HashMap<WorkerId, Rc<RefCell<WorkerHandle>>>,
    next_worker_id: WorkerId,
    callbacks: SlotTable<CallSlot>,
    events: HashMap<CallId, Weak<EventInner>>,
    on_error: Option<ErrorHook>,
    on_event: Option<EventHook>,
    forks: u64,
    calls: u64,
}

/// Counters and gauges for one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub running: u32,
    pub in_flight: usize,
    pub total_calls: u64,
    pub total_forks: u64,
}

/// Point-in-time view of one worker
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub lag: f64,
    pub bufferlock: bool,
    pub running: u32,
    pub connected: bool,
    /// How long the worker has had no running calls
    pub idle_for: Duration,
    /// How long ago the worker last reported anything
    pub last_report: Duration,
}

/// A pool of worker processes.
///
/// Cheap to clone; clones share state. Must be constructed and driven inside
/// a `LocalSet`, since workers and their pumps run as local tasks.
#[derive(Clone)]
pub struct Pool {
    inner: Rc<RefCell<PoolInner>>,
}

impl Pool {
    pub fn new(config: PoolConfig, spawner: impl WorkerSpawner + 'static) -> Self {
        let reap_interval = config.reap_interval();
        let idle_timeout = config.idle_timeout();
        let inner = Rc::new(RefCell::new(PoolInner {
            config,
            spawner: Rc::new(spawner),
            transport: Rc::new(UnixTransport),
            alloc: Rc::new(AddressAllocator::new("pool")),
            hooks: DryRegistry::new(),
            functions: Vec::new(),
            workers: HashMap::new(),
            next_worker_id: 0,
            callbacks: SlotTable::new(),
            events: HashMap::new(),
            on_error: None,
            on_event: None,
            forks: 0,
            calls: 0,
        }));

        let weak = Rc::downgrade(&inner);
        tokio::task::spawn_local(async move {
            let mut ticker = interval(reap_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                reap(&inner, idle_timeout);
            }
        });

        Self { inner }
    }

    pub fn with_transport(self, transport: impl ByteTransport + 'static) -> Self {
        self.inner.borrow_mut().transport = Rc::new(transport);
        self
    }

    /// Register an undry hook for custom payload types crossing back from
    /// workers
    pub fn register_undry(&self, name: impl Into<String>, hook: impl Fn(Value) -> Value + 'static) {
        self.inner.borrow_mut().hooks.register(name, hook);
    }

    /// Install the hook for failures with no callback to land in
    pub fn on_error(&self, hook: impl Fn(RemoteError) + 'static) {
        self.inner.borrow_mut().on_error = Some(Rc::new(hook));
    }

    /// Install the hook for generic one-way worker signals
    pub fn on_event(&self, hook: impl Fn(&str) + 'static) {
        self.inner.borrow_mut().on_event = Some(Rc::new(hook));
    }

    /// Bind a task name to a stable id. The id is pool-global; wrapping the
    /// same name twice yields the same id.
    pub fn wrap(&self, name: impl Into<String>) -> WrappedTask {
        let name = name.into();
        let mut inner = self.inner.borrow_mut();
        let fncid = match inner.functions.iter().position(|n| n == &name) {
            Some(index) => index as FncId,
            None => {
                inner.functions.push(name.clone());
                (inner.functions.len() - 1) as FncId
            }
        };
        WrappedTask {
            pool: self.clone(),
            fncid,
            name,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.borrow();
        PoolStats {
            workers: inner.workers.len(),
            running: inner
                .workers
                .values()
                .map(|h| h.borrow().running)
                .sum(),
            in_flight: inner.callbacks.len(),
            total_calls: inner.calls,
            total_forks: inner.forks,
        }
    }

    /// Per-worker snapshots, ordered by worker id
    pub fn workers(&self) -> Vec<WorkerStatus> {
        let inner = self.inner.borrow();
        let now = Instant::now();
        let mut statuses: Vec<_> = inner
            .workers
            .values()
            .map(|handle| {
                let h = handle.borrow();
                WorkerStatus {
                    id: h.id,
                    lag: h.lag,
                    bufferlock: h.bufferlock,
                    running: h.running,
                    connected: h.is_connected(),
                    idle_for: now.saturating_duration_since(h.idle_since),
                    last_report: now.saturating_duration_since(h.updated_on),
                }
            })
            .collect();
        statuses.sort_by_key(|status| status.id);
        statuses
    }

    /// Terminate every worker. In-flight calls fail through the normal
    /// disconnect path.
    pub fn shutdown(&self) {
        let inner = self.inner.borrow();
        for handle in inner.workers.values() {
            handle.borrow().control.terminate();
        }
    }

    async fn acquire_worker(&self) -> Result<Rc<RefCell<WorkerHandle>>, PoolError> {
        let plan = {
            let inner = self.inner.borrow();
            let mut rng = rand::rng();
            plan_dispatch(&inner, &mut rng)
        };
        match plan? {
            Plan::Existing(handle) => {
                // Claim the idle clock at selection; dispatch awaits before
                // `running` goes up and a reaper tick must not land in that
                // window
                handle.borrow_mut().idle_since = Instant::now();
                Ok(handle)
            }
            Plan::SpawnNew => self.add_worker().await,
        }
    }

    async fn add_worker(&self) -> Result<Rc<RefCell<WorkerHandle>>, PoolError> {
        let (spawner, id) = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_worker_id;
            inner.next_worker_id += 1;
            (inner.spawner.clone(), id)
        };
        let WorkerLink {
            sender,
            receiver,
            control,
        } = spawner.spawn(id).await?;
        let handle = Rc::new(RefCell::new(WorkerHandle::new(id, sender, control)));
        {
            let mut inner = self.inner.borrow_mut();
            inner.workers.insert(id, handle.clone());
            inner.forks += 1;
        }
        info!(worker_id = id, "worker added");
        tokio::task::spawn_local(read_loop(Rc::downgrade(&self.inner), id, receiver));
        Ok(handle)
    }

    fn expire_call(&self, cbid: CallId) {
        let slot = {
            let mut inner = self.inner.borrow_mut();
            let slot = inner.callbacks.take(cbid);
            if slot.is_some() {
                inner.events.remove(&cbid);
            }
            slot
        };
        let Some(slot) = slot else { return };
        warn!(cbid, worker_id = slot.worker, "call expired without a callback");
        let err = RemoteError::new("call timed out");
        match slot.callback {
            Some(callback) => callback(vec![Value::custom(err)]),
            None => raise_error(&self.inner, err),
        }
    }
}

/// A task name bound to a pool, ready to dispatch
#[derive(Clone)]
pub struct WrappedTask {
    pool: Pool,
    fncid: FncId,
    name: String,
}

impl WrappedTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispatch without a completion callback. Results with an error in the
    /// first position surface through the pool's error hook.
    pub async fn call(&self, args: &[Value]) -> Result<EventHandle, PoolError> {
        self.dispatch(args, None).await
    }

    /// Dispatch with a completion callback receiving the callback arguments,
    /// error slot first
    pub async fn call_with<F>(&self, args: &[Value], callback: F) -> Result<EventHandle, PoolError>
    where
        F: FnOnce(Vec<Value>) + 'static,
    {
        self.dispatch(args, Some(Box::new(callback))).await
    }

    /// Dispatch and wait for completion. An error in the first callback
    /// position becomes `PoolError::Task`; otherwise the remaining callback
    /// arguments are returned.
    pub async fn invoke(&self, args: &[Value]) -> Result<Vec<Value>, PoolError> {
        let (tx, rx) = oneshot::channel();
        let _handle = self
            .call_with(args, move |values| {
                let _ = tx.send(values);
            })
            .await?;
        let mut values = rx.await.map_err(|_| PoolError::NoWorkers)?;
        if let Some(err) = values.first().and_then(as_remote_error) {
            return Err(PoolError::Task(err));
        }
        if !values.is_empty() {
            values.remove(0);
        }
        Ok(values)
    }

    async fn dispatch(
        &self,
        args: &[Value],
        callback: Option<CallbackFn>,
    ) -> Result<EventHandle, PoolError> {
        let handle = self.pool.acquire_worker().await?;
        let payload = dry(args)?;

        let (worker_id, sender, lock) = {
            let h = handle.borrow();
            (h.id, h.sender(), h.lock.clone())
        };

        {
            let mut h = handle.borrow_mut();
            if h.shipped.insert(self.fncid) {
                h.send(PoolMessage::Wrap {
                    fncid: self.fncid,
                    name: self.name.clone(),
                })?;
            }
        }

        let (cbid, transport, alloc, timeout) = {
            let mut inner = self.pool.inner.borrow_mut();
            let cbid = inner.callbacks.insert(CallSlot {
                callback,
                worker: worker_id,
            });
            inner.calls += 1;
            (
                cbid,
                inner.transport.clone(),
                inner.alloc.clone(),
                inner.config.call_timeout(),
            )
        };
        let event = EventInner::new(cbid, worker_id, sender);
        self.pool
            .inner
            .borrow_mut()
            .events
            .insert(cbid, Rc::downgrade(&event));

        let sent = self
            .send_exec(&handle, cbid, payload, transport, alloc, lock)
            .await;
        if let Err(err) = sent {
            let mut inner = self.pool.inner.borrow_mut();
            inner.callbacks.take(cbid);
            inner.events.remove(&cbid);
            return Err(err);
        }

        {
            let mut h = handle.borrow_mut();
            h.running += 1;
        }

        if let Some(deadline) = timeout {
            let pool = self.pool.clone();
            tokio::task::spawn_local(async move {
                tokio::time::sleep(deadline).await;
                pool.expire_call(cbid);
            });
        }

        Ok(EventHandle::new(event))
    }

    async fn send_exec(
        &self,
        handle: &Rc<RefCell<WorkerHandle>>,
        cbid: CallId,
        payload: forkpool_codec::DriedPayload,
        transport: Rc<dyn ByteTransport>,
        alloc: Rc<AddressAllocator>,
        lock: forkpool_ipc::ChannelLock,
    ) -> Result<(), PoolError> {
        if payload.buffers.is_empty() && payload.streams.is_empty() {
            handle.borrow().send(PoolMessage::Exec {
                fncid: self.fncid,
                cbid,
                args: payload.text,
                buffers: vec![],
                streams: vec![],
            })?;
            return Ok(());
        }

        let guard = lock.acquire().await;
        let transfer =
            prepare_outbound(&*transport, &alloc, payload.buffers, payload.streams).await?;
        handle.borrow().send(PoolMessage::Exec {
            fncid: self.fncid,
            cbid,
            args: payload.text,
            buffers: transfer.buffers.clone(),
            streams: transfer.streams.clone(),
        })?;
        tokio::task::spawn_local(async move {
            let _guard = guard;
            if let Err(err) = transfer.serve().await {
                error!(cbid, error = %err, "side-channel transfer failed");
            }
        });
        Ok(())
    }
}

enum Plan {
    Existing(Rc<RefCell<WorkerHandle>>),
    SpawnNew,
}

fn rank(handle: &WorkerHandle) -> (u8, u64) {
    // Calm workers order by backlog; lagging workers by the lag itself, so
    // degraded dispatch lands on the least-lagged one
    if handle.lag < LAG_BUCKET_FLOOR {
        (0, handle.running as u64)
    } else {
        (1, (handle.lag.max(0.0) * 1000.0) as u64)
    }
}

/// Probabilistic admission refusal: certain rejection at twice the floor
pub(crate) fn too_busy(lag: f64, rng: &mut impl Rng) -> bool {
    if lag <= LAG_REJECT_FLOOR {
        return false;
    }
    rng.random::<f64>() < (lag - LAG_REJECT_FLOOR) / LAG_REJECT_FLOOR
}

fn plan_dispatch(inner: &PoolInner, rng: &mut impl Rng) -> Result<Plan, PoolError> {
    let mut ordered: Vec<_> = inner
        .workers
        .values()
        .filter(|handle| handle.borrow().is_connected())
        .cloned()
        .collect();
    ordered.sort_by_key(|handle| rank(&handle.borrow()));
    let count = ordered.len();

    if ordered.is_empty() {
        if inner.config.limit == 0 {
            return Err(PoolError::NoWorkers);
        }
        return Ok(Plan::SpawnNew);
    }

    // Walk rank order and skip workers that refuse admission; the first
    // willing worker takes the call
    for handle in &ordered {
        let (lag, bufferlock, running) = {
            let h = handle.borrow();
            (h.lag, h.bufferlock, h.running)
        };
        if bufferlock || too_busy(lag, rng) {
            continue;
        }
        // A deep backlog on a young pool is a reason to widen it even
        // before lag shows
        if running > 10 && count < 2 && count < inner.config.limit {
            return Ok(Plan::SpawnNew);
        }
        return Ok(Plan::Existing(handle.clone()));
    }

    if count < inner.config.limit {
        return Ok(Plan::SpawnNew);
    }
    let best = ordered.remove(0);
    debug!(
        worker_id = best.borrow().id,
        lag = best.borrow().lag,
        "pool at limit, degrading to best worker"
    );
    Ok(Plan::Existing(best))
}

async fn read_loop(
    weak: Weak<RefCell<PoolInner>>,
    worker_id: WorkerId,
    mut receiver: mpsc::UnboundedReceiver<MessageEnvelope<WorkerMessage>>,
) {
    while let Some(envelope) = receiver.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        handle_worker_message(&inner, worker_id, envelope.message);
    }
    let Some(inner) = weak.upgrade() else { return };
    worker_lost(&inner, worker_id);
}

/// Any non-ping traffic proves the worker is alive and mid-conversation, so
/// it resets both the liveness and the idle clock
fn touch_worker(inner: &Rc<RefCell<PoolInner>>, worker_id: WorkerId) {
    let inner_ref = inner.borrow();
    if let Some(handle) = inner_ref.workers.get(&worker_id) {
        let mut h = handle.borrow_mut();
        h.idle_since = Instant::now();
        h.updated_on = Instant::now();
    }
}

fn handle_worker_message(
    inner: &Rc<RefCell<PoolInner>>,
    worker_id: WorkerId,
    message: WorkerMessage,
) {
    if !matches!(message, WorkerMessage::Ping { .. }) {
        touch_worker(inner, worker_id);
    }
    match message {
        WorkerMessage::Ping { lag, bufferlock } => {
            let inner_ref = inner.borrow();
            if let Some(handle) = inner_ref.workers.get(&worker_id) {
                let mut h = handle.borrow_mut();
                h.lag = lag;
                h.bufferlock = bufferlock;
                h.updated_on = Instant::now();
            }
        }

        WorkerMessage::Callback {
            cbid,
            response,
            buffers,
            streams,
        } => {
            let (transport, hooks, handle) = {
                let inner_ref = inner.borrow();
                (
                    inner_ref.transport.clone(),
                    inner_ref.hooks.clone(),
                    inner_ref.workers.get(&worker_id).cloned(),
                )
            };

            // Runs off the read loop: the worker blocks on serving its
            // announced transfers, and a transfer of our own may hold the
            // channel lock at the same time, so the loop must keep pumping
            // while this receive drains. Transfer addresses are unique, so
            // no lock is needed on the receiving side.
            let inner = inner.clone();
            tokio::task::spawn_local(async move {
                let (received_buffers, received_streams) =
                    if buffers.is_empty() && streams.is_empty() {
                        (vec![], vec![])
                    } else {
                        match receive_payload(&*transport, &buffers, &streams).await {
                            Ok(received) => received,
                            Err(err) => {
                                error!(cbid, error = %err, "side-channel receive failed");
                                (vec![], vec![])
                            }
                        }
                    };

                if let Some(handle) = &handle {
                    let mut h = handle.borrow_mut();
                    h.running = h.running.saturating_sub(1);
                    h.idle_since = Instant::now();
                    h.updated_on = Instant::now();
                }

                let slot = inner.borrow_mut().callbacks.take(cbid);
                let Some(slot) = slot else {
                    debug!(cbid, "late or mismatched callback, dropping");
                    return;
                };

                let values =
                    match undry_list(&response, &received_buffers, &received_streams, &hooks) {
                        Ok(values) => values,
                        Err(err) => {
                            error!(cbid, error = %err, "undecodable callback payload");
                            vec![Value::custom(RemoteError::new(err.to_string()))]
                        }
                    };

                match slot.callback {
                    Some(callback) => callback(values),
                    None => match values.first().and_then(as_remote_error) {
                        Some(err) => raise_error(&inner, err),
                        None => debug!(cbid, "completion with no callback"),
                    },
                }
            });
        }

        WorkerMessage::CbEvent {
            cbid,
            eid,
            name,
            args,
        } => {
            let (event, hooks, sender) = {
                let mut inner_ref = inner.borrow_mut();
                let event = inner_ref.events.get(&cbid).and_then(Weak::upgrade);
                if event.is_none() {
                    inner_ref.events.remove(&cbid);
                }
                let sender = inner_ref.workers.get(&worker_id).map(|h| h.borrow().sender());
                (event, inner_ref.hooks.clone(), sender)
            };

            let Some(event) = event else {
                debug!(cbid, name = %name, "signal for a released handle");
                if let (Some(eid), Some(sender)) = (eid, sender) {
                    // Answer anyway so an awaiting task is not stuck
                    let _ = sender.send(MessageEnvelope::new(PoolMessage::EventResponse {
                        cbid,
                        eid,
                        args: "[]".to_string(),
                    }));
                }
                return;
            };

            let values = match undry_list(&args, &[], &[], &hooks) {
                Ok(values) => values,
                Err(err) => {
                    warn!(cbid, name = %name, error = %err, "undecodable signal payload");
                    return;
                }
            };
            let response = event.handle_signal(&name, values);
            if let Some(eid) = eid {
                let text = response
                    .and_then(|values| dry(&values).ok())
                    .and_then(|payload| event_args(payload).ok())
                    .unwrap_or_else(|| "[]".to_string());
                if let Some(sender) = sender {
                    let _ = sender.send(MessageEnvelope::new(PoolMessage::EventResponse {
                        cbid,
                        eid,
                        args: text,
                    }));
                }
            }
        }

        WorkerMessage::EventResponse { cbid, eid, args } => {
            let (event, hooks) = {
                let inner_ref = inner.borrow();
                (
                    inner_ref.events.get(&cbid).and_then(Weak::upgrade),
                    inner_ref.hooks.clone(),
                )
            };
            let Some(event) = event else {
                debug!(cbid, eid, "response for a released handle");
                return;
            };
            match undry_list(&args, &[], &[], &hooks) {
                Ok(values) => event.resolve_ack(eid, values),
                Err(err) => warn!(cbid, eid, error = %err, "undecodable response payload"),
            }
        }

        WorkerMessage::Event { name } => {
            let hook = inner.borrow().on_event.clone();
            match hook {
                Some(hook) => hook(&name),
                None => debug!(worker_id, name = %name, "worker signal"),
            }
        }

        WorkerMessage::Error { message, stack } => {
            let err = match stack {
                Some(stack) => RemoteError::with_stack(message, stack),
                None => RemoteError::new(message),
            };
            raise_error(inner, err);
        }
    }
}

fn raise_error(inner: &Rc<RefCell<PoolInner>>, err: RemoteError) {
    let hook = inner.borrow().on_error.clone();
    match hook {
        Some(hook) => hook(err),
        None => error!(error = %err, "unhandled worker failure"),
    }
}

fn worker_lost(inner: &Rc<RefCell<PoolInner>>, worker_id: WorkerId) {
    let taken = {
        let mut inner_ref = inner.borrow_mut();
        inner_ref.workers.remove(&worker_id);
        let mut taken = Vec::new();
        for id in inner_ref.callbacks.ids() {
            if inner_ref.callbacks.get(id).map(|slot| slot.worker) == Some(worker_id) {
                if let Some(slot) = inner_ref.callbacks.take(id) {
                    inner_ref.events.remove(&id);
                    taken.push(slot);
                }
            }
        }
        taken
    };
    warn!(worker_id, in_flight = taken.len(), "worker disconnected");
    for slot in taken {
        let err = RemoteError::new(format!("worker {} disconnected", worker_id));
        match slot.callback {
            Some(callback) => callback(vec![Value::custom(err)]),
            None => raise_error(inner, err),
        }
    }
}

fn reap(inner: &Rc<RefCell<PoolInner>>, idle_timeout: Duration) {
    let mut inner_ref = inner.borrow_mut();
    inner_ref
        .events
        .retain(|_, event| event.strong_count() > 0);
    for (id, handle) in &inner_ref.workers {
        let h = handle.borrow();
        if !h.is_connected() {
            // The read loop notices the closed channel and cleans up
            continue;
        }
        if h.running == 0 && h.idle_since.elapsed() >= idle_timeout {
            debug!(worker_id = *id, "reaping idle worker");
            h.control.terminate();
        }
    }
}
