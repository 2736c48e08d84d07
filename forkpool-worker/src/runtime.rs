//! The worker-process runtime
//!
//! One worker owns one control channel back to the pool. A reader task pumps
//! incoming envelopes into the main loop, which dispatches them; each exec
//! runs as its own local task so a slow call never blocks pings or further
//! dispatch. All outbound traffic funnels through a single queue so the
//! writer half has exactly one owner.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use forkpool_codec::{dry, undry_list, DryRegistry, RemoteError, Value};
use forkpool_ipc::{
    channel, event_args, prepare_outbound, receive_payload, AddressAllocator, BufferDescriptor,
    ByteTransport, CallId, ChannelLock, EventId, FncId, IpcError, LineChannel, MessageEnvelope,
    PoolMessage, StreamDescriptor, UnixTransport, WorkerMessage,
};

use crate::error::WorkerError;
use crate::lag::{LagProbe, TimerLag};
use crate::registry::{TaskFn, TaskRegistry};

const PING_INTERVAL: Duration = Duration::from_millis(2500);

/// An event handler installed by a running task
pub type EventHandler = Rc<dyn Fn(Vec<Value>) -> Option<Vec<Value>>>;

/// Per-call state held while an exec is live
struct ExecSlot {
    cbid: CallId,
    done: Cell<bool>,
    handlers: RefCell<HashMap<String, EventHandler>>,
    acks: RefCell<HashMap<EventId, oneshot::Sender<Vec<Value>>>>,
    next_eid: Cell<EventId>,
}

impl ExecSlot {
    fn new(cbid: CallId) -> Self {
        Self {
            cbid,
            done: Cell::new(false),
            handlers: RefCell::new(HashMap::new()),
            acks: RefCell::new(HashMap::new()),
            next_eid: Cell::new(0),
        }
    }
}

struct WorkerShared {
    out: mpsc::UnboundedSender<WorkerMessage>,
    transport: Rc<dyn ByteTransport>,
    alloc: Rc<AddressAllocator>,
    lock: ChannelLock,
    hooks: DryRegistry,
    execs: RefCell<HashMap<CallId, Rc<ExecSlot>>>,
}

/// Handle a running task uses to complete its call and exchange signals
/// with the caller's event handle
#[derive(Clone)]
pub struct TaskContext {
    slot: Rc<ExecSlot>,
    shared: Rc<WorkerShared>,
}

impl TaskContext {
    pub fn cbid(&self) -> CallId {
        self.slot.cbid
    }

    /// Deliver the call's callback arguments. Only the first completion
    /// counts; later calls are logged and dropped.
    pub fn complete(&self, args: Vec<Value>) {
        if self.slot.done.replace(true) {
            warn!(cbid = self.slot.cbid, "call already completed");
            return;
        }
        let shared = self.shared.clone();
        let cbid = self.slot.cbid;
        tokio::task::spawn_local(async move {
            if let Err(err) = deliver_callback(&shared, cbid, args).await {
                error!(cbid, error = %err, "failed to deliver callback");
            }
        });
    }

    /// Complete with an error in the first callback position
    pub fn fail(&self, message: impl Into<String>) {
        self.complete(vec![Value::custom(RemoteError::new(message))]);
    }

    /// Install a handler for signals emitted on the caller's event handle
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Option<Vec<Value>> + 'static,
    {
        self.slot
            .handlers
            .borrow_mut()
            .insert(name.into(), Rc::new(handler));
    }

    /// Emit a fire-and-forget signal to the caller's event handle.
    ///
    /// Signals travel on the control channel only, so the payload must not
    /// contain buffers or streams.
    pub fn emit(&self, name: &str, args: &[Value]) -> Result<(), WorkerError> {
        let text = event_args(dry(args)?)?;
        self.shared
            .out
            .send(WorkerMessage::CbEvent {
                cbid: self.slot.cbid,
                eid: None,
                name: name.to_string(),
                args: text,
            })
            .map_err(|_| WorkerError::RuntimeStopped)
    }

    /// Emit a signal and wait for the caller's handler to answer it
    pub async fn emit_with_ack(
        &self,
        name: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, WorkerError> {
        let text = event_args(dry(args)?)?;
        let eid = self.slot.next_eid.get();
        self.slot.next_eid.set(eid + 1);
        let (tx, rx) = oneshot::channel();
        self.slot.acks.borrow_mut().insert(eid, tx);
        self.shared
            .out
            .send(WorkerMessage::CbEvent {
                cbid: self.slot.cbid,
                eid: Some(eid),
                name: name.to_string(),
                args: text,
            })
            .map_err(|_| WorkerError::RuntimeStopped)?;
        rx.await
            .map_err(|_| WorkerError::AckDropped(name.to_string()))
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn deliver_callback(
    shared: &Rc<WorkerShared>,
    cbid: CallId,
    args: Vec<Value>,
) -> Result<(), WorkerError> {
    let payload = dry(&args)?;
    if payload.buffers.is_empty() && payload.streams.is_empty() {
        shared
            .out
            .send(WorkerMessage::Callback {
                cbid,
                response: payload.text,
                buffers: vec![],
                streams: vec![],
            })
            .map_err(|_| WorkerError::RuntimeStopped)?;
        return Ok(());
    }

    // One transfer at a time on this worker's byte channel
    let _guard = shared.lock.acquire().await;
    let transfer =
        prepare_outbound(&*shared.transport, &shared.alloc, payload.buffers, payload.streams)
            .await?;
    shared
        .out
        .send(WorkerMessage::Callback {
            cbid,
            response: payload.text,
            buffers: transfer.buffers.clone(),
            streams: transfer.streams.clone(),
        })
        .map_err(|_| WorkerError::RuntimeStopped)?;
    transfer.serve().await?;
    Ok(())
}

/// The worker half of a pool. Construct one around the task catalog linked
/// into this binary, then drive it over a control channel.
pub struct Worker {
    registry: TaskRegistry,
    transport: Rc<dyn ByteTransport>,
    alloc: Rc<AddressAllocator>,
    lag: Option<Rc<dyn LagProbe>>,
    ping_interval: Duration,
}

impl Worker {
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            registry,
            transport: Rc::new(UnixTransport),
            alloc: Rc::new(AddressAllocator::new("worker")),
            lag: None,
            ping_interval: PING_INTERVAL,
        }
    }

    pub fn with_transport(mut self, transport: impl ByteTransport + 'static) -> Self {
        self.transport = Rc::new(transport);
        self
    }

    pub fn with_allocator(mut self, alloc: AddressAllocator) -> Self {
        self.alloc = Rc::new(alloc);
        self
    }

    pub fn with_lag_probe(mut self, probe: impl LagProbe + 'static) -> Self {
        self.lag = Some(Rc::new(probe));
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Run over this process's own stdio, the wiring a spawned worker
    /// process uses
    pub async fn run_stdio(self) -> Result<(), WorkerError> {
        self.run(channel::stdio()).await
    }

    /// Drive the worker until the pool disconnects
    pub async fn run<R, W>(mut self, channel: LineChannel<R, W>) -> Result<(), WorkerError>
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin,
    {
        let lag: Rc<dyn LagProbe> = match self.lag.take() {
            Some(probe) => probe,
            None => Rc::new(TimerLag::start()),
        };

        let (mut receiver, mut sender) = channel.split();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<MessageEnvelope<PoolMessage>>();
        let reader = tokio::task::spawn_local(async move {
            loop {
                match receiver.recv::<PoolMessage>().await {
                    Ok(envelope) => {
                        if in_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(IpcError::ConnectionClosed) => break,
                    Err(err) if err.is_fatal() => {
                        error!(error = %err, "control channel unusable");
                        break;
                    }
                    Err(err) => {
                        // Bad line; the channel itself is still usable
                        warn!(error = %err, "dropping malformed message");
                    }
                }
            }
        });
        // The reader owns the channel's read half; it must go down with this
        // future, ended or aborted, so the peer sees the close
        let _reader_guard = AbortOnDrop(reader.abort_handle());

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let shared = Rc::new(WorkerShared {
            out: out_tx,
            transport: self.transport.clone(),
            alloc: self.alloc.clone(),
            lock: ChannelLock::new(),
            hooks: self.registry.hooks().clone(),
            execs: RefCell::new(HashMap::new()),
        });

        let mut funcs: HashMap<FncId, TaskFn> = HashMap::new();
        let mut ping = interval(self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                incoming = in_rx.recv() => match incoming {
                    Some(envelope) => {
                        self.handle(envelope.message, &mut funcs, &shared, &lag);
                    }
                    None => break,
                },
                outgoing = out_rx.recv() => {
                    if let Some(message) = outgoing {
                        sender.send(&MessageEnvelope::new(message)).await?;
                    }
                },
                _ = ping.tick() => {
                    sender.send(&MessageEnvelope::new(WorkerMessage::Ping {
                        lag: lag.lag(),
                        bufferlock: shared.lock.is_locked(),
                    })).await?;
                },
            }
        }

        debug!("pool disconnected, worker loop ending");
        Ok(())
    }

    fn handle(
        &self,
        message: PoolMessage,
        funcs: &mut HashMap<FncId, TaskFn>,
        shared: &Rc<WorkerShared>,
        lag: &Rc<dyn LagProbe>,
    ) {
        match message {
            PoolMessage::Wrap { fncid, name } => match self.registry.get(&name) {
                Some(task) => {
                    debug!(fncid, name = %name, "task bound");
                    funcs.insert(fncid, task);
                }
                None => {
                    warn!(fncid, name = %name, "wrap for a task this binary does not carry");
                    let _ = shared.out.send(WorkerMessage::Error {
                        message: WorkerError::UnknownTask(name).to_string(),
                        stack: None,
                    });
                }
            },

            PoolMessage::Exec {
                fncid,
                cbid,
                args,
                buffers,
                streams,
            } => {
                // Report load right as work lands, not just on the timer
                let _ = shared.out.send(WorkerMessage::Ping {
                    lag: lag.lag(),
                    bufferlock: shared.lock.is_locked(),
                });

                let slot = Rc::new(ExecSlot::new(cbid));
                shared.execs.borrow_mut().insert(cbid, slot.clone());
                let ctx = TaskContext {
                    slot,
                    shared: shared.clone(),
                };
                let task = funcs.get(&fncid).cloned();
                tokio::task::spawn_local(run_exec(task, fncid, args, buffers, streams, ctx));
            }

            PoolMessage::CbEvent {
                cbid,
                eid,
                name,
                args,
            } => {
                let slot = shared.execs.borrow().get(&cbid).cloned();
                let Some(slot) = slot else {
                    debug!(cbid, name = %name, "signal for a call that is gone");
                    return;
                };
                let values = match undry_list(&args, &[], &[], &shared.hooks) {
                    Ok(values) => values,
                    Err(err) => {
                        warn!(cbid, name = %name, error = %err, "undecodable signal payload");
                        return;
                    }
                };
                let handler = slot.handlers.borrow().get(&name).cloned();
                let response = match handler {
                    Some(handler) => handler(values),
                    None => {
                        debug!(cbid, name = %name, "no handler installed for signal");
                        None
                    }
                };
                if let Some(eid) = eid {
                    let text = response
                        .and_then(|values| dry(&values).ok())
                        .and_then(|payload| event_args(payload).ok())
                        .unwrap_or_else(|| "[]".to_string());
                    let _ = shared.out.send(WorkerMessage::EventResponse {
                        cbid,
                        eid,
                        args: text,
                    });
                }
            }

            PoolMessage::EventResponse { cbid, eid, args } => {
                let slot = shared.execs.borrow().get(&cbid).cloned();
                let Some(slot) = slot else {
                    debug!(cbid, eid, "response for a call that is gone");
                    return;
                };
                let Some(tx) = slot.acks.borrow_mut().remove(&eid) else {
                    debug!(cbid, eid, "response for an unknown event id");
                    return;
                };
                match undry_list(&args, &[], &[], &shared.hooks) {
                    Ok(values) => {
                        let _ = tx.send(values);
                    }
                    Err(err) => {
                        warn!(cbid, eid, error = %err, "undecodable response payload");
                    }
                }
            }

            PoolMessage::ReapEvent { cbid } => {
                debug!(cbid, "caller released its event handle");
                shared.execs.borrow_mut().remove(&cbid);
            }

            PoolMessage::Event { name } => {
                debug!(name = %name, "pool signal");
            }
        }
    }
}

async fn run_exec(
    task: Option<TaskFn>,
    fncid: FncId,
    args: String,
    buffers: Vec<BufferDescriptor>,
    streams: Vec<StreamDescriptor>,
    ctx: TaskContext,
) {
    let arguments = match fetch_args(&args, &buffers, &streams, &ctx).await {
        Ok(arguments) => arguments,
        Err(err) => {
            error!(cbid = ctx.slot.cbid, error = %err, "could not materialize call arguments");
            ctx.fail(err.to_string());
            return;
        }
    };

    let Some(task) = task else {
        ctx.fail(WorkerError::UnknownFunction(fncid).to_string());
        return;
    };

    let outcome = std::panic::AssertUnwindSafe(task(arguments, ctx.clone()))
        .catch_unwind()
        .await;
    match outcome {
        Ok(()) => {
            if !ctx.slot.done.get() {
                warn!(cbid = ctx.slot.cbid, "task returned without completing its call");
                ctx.complete(vec![Value::Null]);
            }
        }
        Err(panic) => {
            let message = panic_message(panic);
            error!(cbid = ctx.slot.cbid, message = %message, "task panicked");
            if !ctx.slot.done.get() {
                ctx.fail(message);
            }
        }
    }
}

async fn fetch_args(
    args: &str,
    buffers: &[BufferDescriptor],
    streams: &[StreamDescriptor],
    ctx: &TaskContext,
) -> Result<Vec<Value>, WorkerError> {
    if buffers.is_empty() && streams.is_empty() {
        return Ok(undry_list(args, &[], &[], &ctx.shared.hooks)?);
    }
    let guard = ctx.shared.lock.acquire().await;
    let (received_buffers, received_streams) =
        receive_payload(&*ctx.shared.transport, buffers, streams).await?;
    drop(guard);
    Ok(undry_list(
        args,
        &received_buffers,
        &received_streams,
        &ctx.shared.hooks,
    )?)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkpool_codec::as_remote_error;
    use forkpool_ipc::{memory_pair, MemoryTransport};
    use tokio::task::LocalSet;

    fn test_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("add", |args: Vec<Value>, ctx: TaskContext| async move {
            let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
            ctx.complete(vec![Value::Null, Value::Int(sum)]);
        });
        registry.register("boom", |_args, _ctx: TaskContext| async move {
            panic!("it broke");
        });
        registry
    }

    async fn ship_and_exec(
        pool_side: &mut forkpool_ipc::MemoryChannel,
        fncid: FncId,
        name: &str,
        cbid: CallId,
        args: &[Value],
    ) {
        pool_side
            .sender
            .send(&MessageEnvelope::new(PoolMessage::Wrap {
                fncid,
                name: name.to_string(),
            }))
            .await
            .unwrap();
        let payload = dry(args).unwrap();
        pool_side
            .sender
            .send(&MessageEnvelope::new(PoolMessage::Exec {
                fncid,
                cbid,
                args: payload.text,
                buffers: vec![],
                streams: vec![],
            }))
            .await
            .unwrap();
    }

    async fn next_callback(
        pool_side: &mut forkpool_ipc::MemoryChannel,
    ) -> (CallId, Vec<Value>) {
        loop {
            let envelope: MessageEnvelope<WorkerMessage> =
                pool_side.receiver.recv().await.unwrap();
            match envelope.message {
                WorkerMessage::Callback { cbid, response, .. } => {
                    let values =
                        undry_list(&response, &[], &[], &DryRegistry::new()).unwrap();
                    return (cbid, values);
                }
                WorkerMessage::Ping { .. } => continue,
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn exec_runs_task_and_delivers_callback() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (mut pool_side, worker_side) = memory_pair(16 * 1024);
                let worker = Worker::new(test_registry())
                    .with_transport(MemoryTransport::new())
                    .with_lag_probe(crate::lag::FixedLag::new(0.0));
                tokio::task::spawn_local(worker.run(worker_side));

                ship_and_exec(&mut pool_side, 0, "add", 7, &[2.into(), 3.into()]).await;
                let (cbid, values) = next_callback(&mut pool_side).await;
                assert_eq!(cbid, 7);
                assert!(values[0].is_null());
                assert_eq!(values[1].as_i64(), Some(5));
            })
            .await;
    }

    #[tokio::test]
    async fn panicking_task_completes_with_error() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (mut pool_side, worker_side) = memory_pair(16 * 1024);
                let worker = Worker::new(test_registry())
                    .with_transport(MemoryTransport::new())
                    .with_lag_probe(crate::lag::FixedLag::new(0.0));
                tokio::task::spawn_local(worker.run(worker_side));

                ship_and_exec(&mut pool_side, 0, "boom", 9, &[]).await;
                let (cbid, values) = next_callback(&mut pool_side).await;
                assert_eq!(cbid, 9);
                let error = as_remote_error(&values[0]).unwrap();
                assert_eq!(error.message, "it broke");
            })
            .await;
    }

    #[tokio::test]
    async fn wrap_of_unknown_task_reports_an_error() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (mut pool_side, worker_side) = memory_pair(4096);
                let worker = Worker::new(test_registry())
                    .with_transport(MemoryTransport::new())
                    .with_lag_probe(crate::lag::FixedLag::new(0.0));
                tokio::task::spawn_local(worker.run(worker_side));

                pool_side
                    .sender
                    .send(&MessageEnvelope::new(PoolMessage::Wrap {
                        fncid: 3,
                        name: "missing".to_string(),
                    }))
                    .await
                    .unwrap();

                loop {
                    let envelope: MessageEnvelope<WorkerMessage> =
                        pool_side.receiver.recv().await.unwrap();
                    match envelope.message {
                        WorkerMessage::Error { message, .. } => {
                            assert!(message.contains("missing"));
                            break;
                        }
                        WorkerMessage::Ping { .. } => continue,
                        other => panic!("unexpected message: {:?}", other),
                    }
                }
            })
            .await;
    }

    #[tokio::test]
    async fn aborting_the_runtime_closes_the_control_channel() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (mut pool_side, worker_side) = memory_pair(4096);
                let worker = Worker::new(test_registry())
                    .with_transport(MemoryTransport::new())
                    .with_lag_probe(crate::lag::FixedLag::new(0.0));
                let running = tokio::task::spawn_local(worker.run(worker_side));
                tokio::task::yield_now().await;
                running.abort();

                // The peer must observe the close, not hang on a read half
                // left behind by the torn-down runtime
                loop {
                    match pool_side.receiver.recv::<WorkerMessage>().await {
                        Ok(_) => continue,
                        Err(IpcError::ConnectionClosed) => break,
                        Err(other) => panic!("unexpected channel error: {other}"),
                    }
                }
            })
            .await;
    }

    #[tokio::test]
    async fn signals_flow_both_ways_with_ack() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (mut pool_side, worker_side) = memory_pair(16 * 1024);
                let mut registry = TaskRegistry::new();
                registry.register("chatty", |_args, ctx: TaskContext| async move {
                    let answer = ctx
                        .emit_with_ack("question", &[Value::from("ready?")])
                        .await
                        .unwrap();
                    ctx.complete(vec![Value::Null, answer[0].clone()]);
                });
                let worker = Worker::new(registry)
                    .with_transport(MemoryTransport::new())
                    .with_lag_probe(crate::lag::FixedLag::new(0.0));
                tokio::task::spawn_local(worker.run(worker_side));

                ship_and_exec(&mut pool_side, 0, "chatty", 1, &[]).await;

                // Answer the worker's acknowledged signal like a pool would
                loop {
                    let envelope: MessageEnvelope<WorkerMessage> =
                        pool_side.receiver.recv().await.unwrap();
                    match envelope.message {
                        WorkerMessage::CbEvent {
                            cbid,
                            eid: Some(eid),
                            name,
                            ..
                        } => {
                            assert_eq!(name, "question");
                            let payload = dry(&[Value::from("yes")]).unwrap();
                            pool_side
                                .sender
                                .send(&MessageEnvelope::new(PoolMessage::EventResponse {
                                    cbid,
                                    eid,
                                    args: payload.text,
                                }))
                                .await
                                .unwrap();
                            break;
                        }
                        WorkerMessage::Ping { .. } => continue,
                        other => panic!("unexpected message: {:?}", other),
                    }
                }

                let (_, values) = next_callback(&mut pool_side).await;
                assert_eq!(values[1].as_str(), Some("yes"));
            })
            .await;
    }
}
