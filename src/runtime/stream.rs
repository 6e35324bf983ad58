//! Streaming exec plumbing shared by all providers.
//!
//! - [`ExecStream`]: receiving side of a chunked command output
//! - [`ChunkSender`]: producing side, assigns sequence numbers
//! - [`SequenceBuffer`]: restores `sequence` order over a channel that may
//!   deliver frames out of order
//! - [`InteractiveSession`]: an exec stream with an attached stdin

use super::{ChunkKind, ExecChunk, ExecResult};
use crate::constants::EXEC_STREAM_CAPACITY;
use crate::error::{Error, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tokio::sync::mpsc;

// =============================================================================
// ExecStream
// =============================================================================

/// Ordered stream of output chunks from a running command.
///
/// Chunks are delivered as the command produces them. The stream ends after
/// the `Exit` chunk, or with an error item if the command failed at the
/// infrastructure level.
#[derive(Debug)]
pub struct ExecStream {
    rx: mpsc::Receiver<Result<ExecChunk>>,
    started: Instant,
}

impl ExecStream {
    /// Creates a connected sender/stream pair.
    #[must_use]
    pub fn channel() -> (ChunkSender, ExecStream) {
        let (tx, rx) = mpsc::channel(EXEC_STREAM_CAPACITY);
        (
            ChunkSender { tx, sequence: 0 },
            ExecStream {
                rx,
                started: Instant::now(),
            },
        )
    }

    /// Receives the next chunk, or `None` once the stream is finished.
    pub async fn next(&mut self) -> Option<Result<ExecChunk>> {
        self.rx.recv().await
    }

    /// Drains the stream into a buffered [`ExecResult`].
    pub async fn collect(mut self) -> Result<ExecResult> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(item) = self.next().await {
            let chunk = item?;
            match chunk.kind {
                ChunkKind::Stdout => stdout.extend_from_slice(&chunk.data),
                ChunkKind::Stderr => stderr.extend_from_slice(&chunk.data),
                ChunkKind::Exit => {
                    exit_code = chunk.exit_code();
                    break;
                }
            }
        }

        let exit_code = exit_code.ok_or_else(|| Error::Execution {
            runtime: String::new(),
            reason: "stream ended without exit status".to_string(),
        })?;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = self.started.elapsed().as_millis() as u64;
        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            duration_ms,
            metadata: HashMap::new(),
        })
    }
}

/// Producing half of an [`ExecStream`].
#[derive(Debug)]
pub struct ChunkSender {
    tx: mpsc::Sender<Result<ExecChunk>>,
    sequence: u64,
}

impl ChunkSender {
    /// Sends data, stamping the next sequence number.
    ///
    /// Returns false once the consumer has gone away.
    pub async fn send(&mut self, kind: ChunkKind, data: Vec<u8>) -> bool {
        let chunk = ExecChunk {
            kind,
            data,
            timestamp: Utc::now(),
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    /// Forwards an already-sequenced chunk unchanged.
    pub async fn forward(&mut self, chunk: ExecChunk) -> bool {
        self.sequence = self.sequence.max(chunk.sequence + 1);
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    /// Sends the terminal `Exit` chunk.
    pub async fn exit(mut self, code: i32) -> bool {
        self.send(ChunkKind::Exit, code.to_string().into_bytes()).await
    }

    /// Terminates the stream with an error.
    pub async fn fail(self, error: Error) {
        let _ = self.tx.send(Err(error)).await;
    }

    /// Whether the consumer dropped the stream.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Sequence Reordering
// =============================================================================

/// Reorders chunks that arrive out of sequence.
///
/// Chunks are released only once every lower sequence number has been seen,
/// so the consumer always observes a gap-free prefix.
#[derive(Debug, Default)]
pub struct SequenceBuffer {
    next: u64,
    pending: BTreeMap<u64, ExecChunk>,
}

impl SequenceBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts one chunk and returns every chunk now deliverable, in order.
    ///
    /// Duplicates and chunks older than the delivered prefix are dropped.
    pub fn push(&mut self, chunk: ExecChunk) -> Vec<ExecChunk> {
        if chunk.sequence < self.next {
            return Vec::new();
        }
        self.pending.insert(chunk.sequence, chunk);

        let mut ready = Vec::new();
        while let Some(chunk) = self.pending.remove(&self.next) {
            ready.push(chunk);
            self.next += 1;
        }
        ready
    }

    /// Flushes whatever is still buffered, in sequence order.
    ///
    /// Used when the channel closes with a gap that will never be filled.
    pub fn drain(&mut self) -> Vec<ExecChunk> {
        let rest: Vec<ExecChunk> = std::mem::take(&mut self.pending).into_values().collect();
        if let Some(last) = rest.last() {
            self.next = last.sequence + 1;
        }
        rest
    }

    /// Number of chunks held back waiting for a gap to fill.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

// =============================================================================
// Interactive Session
// =============================================================================

/// Exec session with stdin attached.
#[derive(Debug)]
pub struct InteractiveSession {
    stdin: Option<mpsc::Sender<Vec<u8>>>,
    /// Output of the command.
    pub output: ExecStream,
}

impl InteractiveSession {
    #[must_use]
    pub fn new(stdin: mpsc::Sender<Vec<u8>>, output: ExecStream) -> Self {
        Self {
            stdin: Some(stdin),
            output,
        }
    }

    /// Writes bytes to the command's stdin.
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let stdin = self
            .stdin
            .as_ref()
            .ok_or_else(|| Error::execution("session", "stdin already closed"))?;
        stdin
            .send(data.into())
            .await
            .map_err(|_| Error::execution("session", "command no longer reads stdin"))
    }

    /// Closes stdin, signalling EOF to the command.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Closes stdin and waits for the command to finish.
    pub async fn finish(mut self) -> Result<ExecResult> {
        self.close_stdin();
        self.output.collect().await
    }
}
