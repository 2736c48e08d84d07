//! Out-of-band side channel for binary and stream payloads
//!
//! The control channel only carries a transport address and declared length
//! per payload; the bytes themselves move over a separate local byte
//! transport. The sender binds the address before the control message goes
//! out, then serves each transfer; the receiver connects, reads until the
//! declared length (buffers) or until the peer closes (streams), then
//! signals readiness by returning.
//!
//! Only one transfer may be in flight per worker at a time; [`ChannelLock`]
//! enforces that with a lock flag and a FIFO waiter queue.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::warn;

use forkpool_codec::StreamHandle;

use crate::error::IpcError;
use crate::protocol::{BufferDescriptor, StreamDescriptor};

/// A bidirectional byte connection
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> ByteStream for T {}

/// A bound address waiting for its single connection
#[async_trait(?Send)]
pub trait ByteAcceptor {
    async fn accept(self: Box<Self>) -> Result<Box<dyn ByteStream>, IpcError>;
}

/// The local byte-transport collaborator: bind an address and accept one
/// connection, or connect to a bound address and stream bytes
#[async_trait(?Send)]
pub trait ByteTransport {
    async fn bind(&self, address: &str) -> Result<Box<dyn ByteAcceptor>, IpcError>;
    async fn connect(&self, address: &str) -> Result<Box<dyn ByteStream>, IpcError>;
}

/// Default transport over Unix domain sockets
#[derive(Debug, Clone, Default)]
pub struct UnixTransport;

struct UnixAcceptor {
    listener: UnixListener,
    address: String,
}

#[async_trait(?Send)]
impl ByteAcceptor for UnixAcceptor {
    async fn accept(self: Box<Self>) -> Result<Box<dyn ByteStream>, IpcError> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| IpcError::SideChannel(e.to_string()))?;
        // One connection per address; the socket file is spent
        let _ = std::fs::remove_file(&self.address);
        Ok(Box::new(stream))
    }
}

#[async_trait(?Send)]
impl ByteTransport for UnixTransport {
    async fn bind(&self, address: &str) -> Result<Box<dyn ByteAcceptor>, IpcError> {
        let listener =
            UnixListener::bind(address).map_err(|e| IpcError::SideChannel(e.to_string()))?;
        Ok(Box::new(UnixAcceptor {
            listener,
            address: address.to_string(),
        }))
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn ByteStream>, IpcError> {
        let stream = UnixStream::connect(address)
            .await
            .map_err(|e| IpcError::SideChannel(e.to_string()))?;
        Ok(Box::new(stream))
    }
}

/// In-memory transport; lets tests and in-process workers run the same
/// transfer code paths without touching the filesystem
#[derive(Clone, Default)]
pub struct MemoryTransport {
    bound: Rc<RefCell<HashMap<String, oneshot::Sender<DuplexStream>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryAcceptor {
    pending: oneshot::Receiver<DuplexStream>,
}

#[async_trait(?Send)]
impl ByteAcceptor for MemoryAcceptor {
    async fn accept(self: Box<Self>) -> Result<Box<dyn ByteStream>, IpcError> {
        let stream = self
            .pending
            .await
            .map_err(|_| IpcError::SideChannel("listener dropped".to_string()))?;
        Ok(Box::new(stream))
    }
}

#[async_trait(?Send)]
impl ByteTransport for MemoryTransport {
    async fn bind(&self, address: &str) -> Result<Box<dyn ByteAcceptor>, IpcError> {
        let (tx, rx) = oneshot::channel();
        let replaced = self.bound.borrow_mut().insert(address.to_string(), tx);
        if replaced.is_some() {
            return Err(IpcError::SideChannel(format!(
                "address already bound: {}",
                address
            )));
        }
        Ok(Box::new(MemoryAcceptor { pending: rx }))
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn ByteStream>, IpcError> {
        let tx = self.bound.borrow_mut().remove(address).ok_or_else(|| {
            IpcError::SideChannel(format!("nothing bound at: {}", address))
        })?;
        let (near, far) = tokio::io::duplex(64 * 1024);
        tx.send(far)
            .map_err(|_| IpcError::SideChannel("acceptor dropped".to_string()))?;
        Ok(Box::new(near))
    }
}

/// Allocates transport addresses unique for the lifetime of this process
pub struct AddressAllocator {
    base: PathBuf,
    tag: String,
    counter: Cell<u64>,
}

impl AddressAllocator {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            base: std::env::temp_dir(),
            tag: tag.into(),
            counter: Cell::new(0),
        }
    }

    pub fn with_base(tag: impl Into<String>, base: PathBuf) -> Self {
        Self {
            base,
            tag: tag.into(),
            counter: Cell::new(0),
        }
    }

    fn next(&self, kind: char) -> String {
        let n = self.counter.get();
        self.counter.set(n + 1);
        format!(
            "{}/forkpool-{}-{}-{}-{}",
            self.base.display(),
            kind,
            std::process::id(),
            self.tag,
            n
        )
    }

    pub fn next_buffer(&self) -> String {
        self.next('b')
    }

    pub fn next_stream(&self) -> String {
        self.next('s')
    }
}

enum Job {
    Buffer(Box<dyn ByteAcceptor>, Bytes),
    Stream(Box<dyn ByteAcceptor>, StreamHandle),
}

/// A prepared outbound transfer: descriptors for the control message plus
/// the bound acceptors that will serve the bytes
pub struct OutboundTransfer {
    pub buffers: Vec<BufferDescriptor>,
    pub streams: Vec<StreamDescriptor>,
    jobs: Vec<Job>,
}

impl OutboundTransfer {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Serve every transfer in descriptor order. Call after the control
    /// message naming the addresses has been sent.
    pub async fn serve(self) -> Result<(), IpcError> {
        for job in self.jobs {
            match job {
                Job::Buffer(acceptor, bytes) => {
                    let mut conn = acceptor.accept().await?;
                    conn.write_all(&bytes).await?;
                    conn.shutdown().await?;
                }
                Job::Stream(acceptor, handle) => {
                    let mut conn = acceptor.accept().await?;
                    match handle.take_reader() {
                        Some(mut reader) => {
                            tokio::io::copy(&mut reader, &mut conn).await?;
                        }
                        None => {
                            // Spent or already-buffered handle; fall back to
                            // whatever bytes it holds
                            if let Some(bytes) = handle.bytes() {
                                conn.write_all(&bytes).await?;
                            } else {
                                warn!("stream handle already consumed, sending empty stream");
                            }
                        }
                    }
                    conn.shutdown().await?;
                }
            }
        }
        Ok(())
    }
}

/// Bind an address for every buffer and stream in a dried payload
pub async fn prepare_outbound(
    transport: &dyn ByteTransport,
    alloc: &AddressAllocator,
    buffers: Vec<Bytes>,
    streams: Vec<StreamHandle>,
) -> Result<OutboundTransfer, IpcError> {
    let mut transfer = OutboundTransfer {
        buffers: Vec::with_capacity(buffers.len()),
        streams: Vec::with_capacity(streams.len()),
        jobs: Vec::new(),
    };

    for bytes in buffers {
        let address = alloc.next_buffer();
        let acceptor = transport.bind(&address).await?;
        transfer.buffers.push(BufferDescriptor {
            address,
            length: bytes.len() as u64,
        });
        transfer.jobs.push(Job::Buffer(acceptor, bytes));
    }

    for handle in streams {
        let address = alloc.next_stream();
        let acceptor = transport.bind(&address).await?;
        transfer.streams.push(StreamDescriptor { address });
        transfer.jobs.push(Job::Stream(acceptor, handle));
    }

    Ok(transfer)
}

/// Fetch every announced buffer and stream, in descriptor order.
///
/// The caller must hold the worker's [`ChannelLock`] for the duration.
pub async fn receive_payload(
    transport: &dyn ByteTransport,
    buffers: &[BufferDescriptor],
    streams: &[StreamDescriptor],
) -> Result<(Vec<Bytes>, Vec<StreamHandle>), IpcError> {
    let mut received_buffers = Vec::with_capacity(buffers.len());
    for descriptor in buffers {
        let mut conn = transport.connect(&descriptor.address).await?;
        let mut bytes = vec![0u8; descriptor.length as usize];
        conn.read_exact(&mut bytes)
            .await
            .map_err(|e| IpcError::SideChannel(e.to_string()))?;
        received_buffers.push(Bytes::from(bytes));
    }

    let mut received_streams = Vec::with_capacity(streams.len());
    for descriptor in streams {
        let mut conn = transport.connect(&descriptor.address).await?;
        let mut bytes = Vec::new();
        conn.read_to_end(&mut bytes)
            .await
            .map_err(|e| IpcError::SideChannel(e.to_string()))?;
        received_streams.push(StreamHandle::from_bytes(Bytes::from(bytes)));
    }

    Ok((received_buffers, received_streams))
}

struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// The lock on one worker's physical byte channel.
///
/// Holders release in FIFO order; the lock state is what a worker reports as
/// `bufferlock` in its pings.
#[derive(Clone)]
pub struct ChannelLock {
    state: Rc<RefCell<LockState>>,
}

impl Default for ChannelLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelLock {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(LockState {
                locked: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.borrow().locked
    }

    pub async fn acquire(&self) -> ChannelGuard {
        let waiter = {
            let mut state = self.state.borrow_mut();
            if !state.locked {
                state.locked = true;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };
        if let Some(rx) = waiter {
            // A release hands the lock over directly; a dropped sender can
            // only mean the lock itself went away
            let _ = rx.await;
        }
        ChannelGuard {
            state: self.state.clone(),
        }
    }
}

/// Held for the duration of one side-channel transfer
pub struct ChannelGuard {
    state: Rc<RefCell<LockState>>,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        loop {
            match state.waiters.pop_front() {
                Some(next) => {
                    if next.send(()).is_ok() {
                        // Handed over; stays locked
                        return;
                    }
                }
                None => {
                    state.locked = false;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffer_transfer_over_memory_transport() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let transport = MemoryTransport::new();
                let alloc = AddressAllocator::new("test");

                let transfer = prepare_outbound(
                    &transport,
                    &alloc,
                    vec![Bytes::from_static(b"hello side channel")],
                    vec![],
                )
                .await
                .unwrap();
                let descriptors = transfer.buffers.clone();
                assert_eq!(descriptors[0].length, 18);
                let server = tokio::task::spawn_local(transfer.serve());

                let (buffers, streams) = receive_payload(&transport, &descriptors, &[])
                    .await
                    .unwrap();
                assert_eq!(buffers[0], Bytes::from_static(b"hello side channel"));
                assert!(streams.is_empty());
                server.await.unwrap().unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn stream_transfer_reads_until_close() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let transport = MemoryTransport::new();
                let alloc = AddressAllocator::new("stream-test");
                let handle = StreamHandle::from_reader(std::io::Cursor::new(
                    b"streamed bytes".to_vec(),
                ));

                let transfer = prepare_outbound(&transport, &alloc, vec![], vec![handle])
                    .await
                    .unwrap();
                let descriptors = transfer.streams.clone();
                let server = tokio::task::spawn_local(transfer.serve());

                let (_, streams) = receive_payload(&transport, &[], &descriptors)
                    .await
                    .unwrap();
                assert_eq!(
                    streams[0].bytes().unwrap(),
                    Bytes::from_static(b"streamed bytes")
                );
                server.await.unwrap().unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn channel_lock_is_fifo() {
        let lock = ChannelLock::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let first = lock.acquire().await;
                assert!(lock.is_locked());

                for i in 0..3 {
                    let lock = lock.clone();
                    let order = order.clone();
                    tokio::task::spawn_local(async move {
                        let _guard = lock.acquire().await;
                        order.borrow_mut().push(i);
                    });
                }
                // Let the waiters queue up behind the held guard
                tokio::task::yield_now().await;
                assert!(order.borrow().is_empty());

                drop(first);
                for _ in 0..8 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(*order.borrow(), vec![0, 1, 2]);
                assert!(!lock.is_locked());
            })
            .await;
    }

    #[tokio::test]
    async fn buffer_transfer_over_unix_sockets() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let transport = UnixTransport;
                let alloc = AddressAllocator::with_base("unix", dir.path().to_path_buf());

                let transfer = prepare_outbound(
                    &transport,
                    &alloc,
                    vec![Bytes::from_static(b"over a socket")],
                    vec![],
                )
                .await
                .unwrap();
                let descriptors = transfer.buffers.clone();
                let server = tokio::task::spawn_local(transfer.serve());

                let (buffers, _) = receive_payload(&transport, &descriptors, &[])
                    .await
                    .unwrap();
                assert_eq!(buffers[0], Bytes::from_static(b"over a socket"));
                server.await.unwrap().unwrap();

                // The socket file is gone once the transfer is served
                assert!(!std::path::Path::new(&descriptors[0].address).exists());
            })
            .await;
    }

    #[tokio::test]
    async fn addresses_are_unique() {
        let alloc = AddressAllocator::new("uniq");
        let a = alloc.next_buffer();
        let b = alloc.next_buffer();
        let c = alloc.next_stream();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(a.contains("forkpool-b-"));
        assert!(c.contains("forkpool-s-"));
    }
}
