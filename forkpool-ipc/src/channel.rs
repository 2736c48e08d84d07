//! Control-channel transports
//!
//! Messages are newline-delimited JSON envelopes. The sender and receiver
//! halves are separate so the two directions can be driven by different
//! tasks; [`LineChannel`] bundles a matched pair.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadHalf,
    WriteHalf,
};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// The writing half of a control channel
pub struct LineSender<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineSender<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send<T: Serialize>(
        &mut self,
        envelope: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        let mut line =
            serde_json::to_string(envelope).map_err(|e| IpcError::Serialization(e.to_string()))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// The reading half of a control channel
pub struct LineReceiver<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> LineReceiver<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<MessageEnvelope<T>, IpcError> {
        self.line.clear();
        let read = self.reader.read_line(&mut self.line).await?;
        if read == 0 {
            return Err(IpcError::ConnectionClosed);
        }

        let envelope: MessageEnvelope<T> = serde_json::from_str(self.line.trim_end())
            .map_err(|e| IpcError::Deserialization(e.to_string()))?;

        if !envelope.is_compatible() {
            return Err(IpcError::VersionMismatch {
                expected: IPC_PROTOCOL_VERSION,
                actual: envelope.protocol_version,
            });
        }

        Ok(envelope)
    }
}

/// A bidirectional control channel
pub struct LineChannel<R, W> {
    pub receiver: LineReceiver<R>,
    pub sender: LineSender<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> LineChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            receiver: LineReceiver::new(reader),
            sender: LineSender::new(writer),
        }
    }

    /// Split into independently owned halves
    pub fn split(self) -> (LineReceiver<R>, LineSender<W>) {
        (self.receiver, self.sender)
    }
}

/// The worker side of the channel: this process's own stdin/stdout
pub type StdioChannel = LineChannel<tokio::io::Stdin, tokio::io::Stdout>;

/// Control channel over this process's stdin/stdout
pub fn stdio() -> StdioChannel {
    LineChannel::new(tokio::io::stdin(), tokio::io::stdout())
}

/// The pool side of the channel: a child process's piped stdio
pub type ChildChannel = LineChannel<tokio::process::ChildStdout, tokio::process::ChildStdin>;

/// Control channel over a spawned child's pipes
pub fn child(
    stdout: tokio::process::ChildStdout,
    stdin: tokio::process::ChildStdin,
) -> ChildChannel {
    LineChannel::new(stdout, stdin)
}

/// An in-memory control channel half, for tests and in-process workers
pub type MemoryChannel = LineChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// A connected pair of in-memory control channels
pub fn memory_pair(capacity: usize) -> (MemoryChannel, MemoryChannel) {
    let (near, far) = tokio::io::duplex(capacity);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, far_write) = tokio::io::split(far);
    (
        LineChannel::new(near_read, near_write),
        LineChannel::new(far_read, far_write),
    )
}
