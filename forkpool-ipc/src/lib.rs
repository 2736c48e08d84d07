//! Inter-process communication for forkpool
//!
//! The pool and its workers talk over two planes: a newline-delimited JSON
//! control channel carrying versioned [`MessageEnvelope`]s, and an
//! out-of-band side channel carrying buffer and stream bytes announced by
//! descriptors in the control messages.

pub mod channel;
pub mod error;
pub mod protocol;
pub mod sidechannel;

pub use channel::{
    child, memory_pair, stdio, ChildChannel, LineChannel, LineReceiver, LineSender, MemoryChannel,
    StdioChannel,
};
pub use error::IpcError;
pub use protocol::{
    event_args, BufferDescriptor, CallId, EventId, FncId, MessageEnvelope, PoolMessage,
    StreamDescriptor, WorkerMessage, IPC_PROTOCOL_VERSION,
};
pub use sidechannel::{
    prepare_outbound, receive_payload, AddressAllocator, ByteAcceptor, ByteStream, ByteTransport,
    ChannelGuard, ChannelLock, MemoryTransport, OutboundTransfer, UnixTransport,
};
