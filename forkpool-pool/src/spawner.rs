//! Worker process spawning
//!
//! The pool talks to a worker through a pair of message queues and a small
//! control surface; how the worker actually runs is the spawner's business.
//! The default spawner forks a child process and pumps its piped stdio; tests
//! run a real worker in-process over an in-memory channel instead.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::process::Stdio;
use std::rc::Rc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use forkpool_ipc::{
    IpcError, LineReceiver, LineSender, MessageEnvelope, PoolMessage, WorkerMessage,
};

use crate::error::PoolError;

/// Stable id of one worker within its pool
pub type WorkerId = u32;

/// Lifecycle surface of one spawned worker
pub trait WorkerControl {
    /// Whether the worker's channel is still up
    fn connected(&self) -> bool;

    /// Tear the worker down; the read loop observes the closed channel
    fn terminate(&self);
}

/// A connected worker: message queues in both directions plus control
pub struct WorkerLink {
    pub sender: mpsc::UnboundedSender<MessageEnvelope<PoolMessage>>,
    pub receiver: mpsc::UnboundedReceiver<MessageEnvelope<WorkerMessage>>,
    pub control: Box<dyn WorkerControl>,
}

#[async_trait(?Send)]
pub trait WorkerSpawner {
    async fn spawn(&self, worker_id: WorkerId) -> Result<WorkerLink, PoolError>;
}

/// Spawns worker binaries as child processes wired over piped stdio
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args = args.into_iter().collect();
        self
    }
}

struct ProcessControl {
    connected: Rc<Cell<bool>>,
    child: RefCell<tokio::process::Child>,
}

impl WorkerControl for ProcessControl {
    fn connected(&self) -> bool {
        self.connected.get()
    }

    fn terminate(&self) {
        if let Err(err) = self.child.borrow_mut().start_kill() {
            debug!(error = %err, "worker already gone");
        }
    }
}

#[async_trait(?Send)]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, worker_id: WorkerId) -> Result<WorkerLink, PoolError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("child has no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("child has no stdout pipe".to_string()))?;
        debug!(worker_id, program = %self.program.display(), "worker process started");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<MessageEnvelope<PoolMessage>>();
        tokio::task::spawn_local(async move {
            let mut sender = LineSender::new(stdin);
            while let Some(envelope) = out_rx.recv().await {
                if let Err(err) = sender.send(&envelope).await {
                    warn!(worker_id, error = %err, "worker stdin closed");
                    break;
                }
            }
        });

        let connected = Rc::new(Cell::new(true));
        let (in_tx, in_rx) = mpsc::unbounded_channel::<MessageEnvelope<WorkerMessage>>();
        let pump_connected = connected.clone();
        tokio::task::spawn_local(async move {
            let mut receiver = LineReceiver::new(stdout);
            loop {
                match receiver.recv::<WorkerMessage>().await {
                    Ok(envelope) => {
                        if in_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(IpcError::ConnectionClosed) => break,
                    Err(err) if err.is_fatal() => {
                        error!(worker_id, error = %err, "worker speaks a different protocol");
                        break;
                    }
                    Err(err) => {
                        warn!(worker_id, error = %err, "dropping malformed message");
                    }
                }
            }
            pump_connected.set(false);
        });

        Ok(WorkerLink {
            sender: out_tx,
            receiver: in_rx,
            control: Box::new(ProcessControl {
                connected,
                child: RefCell::new(child),
            }),
        })
    }
}
