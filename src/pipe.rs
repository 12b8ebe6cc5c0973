//! In-memory byte pipe built on a bounded mpsc channel
//!
//! Stands in for a process's stdio when the counterpart runs in-process. The
//! writer batches bytes into chunks; `flush` hands the current chunk to the
//! reader. Dropping the writer is end-of-stream for the reader, dropping the
//! reader makes further writes fail with `BrokenPipe`.

use std::io::{self, Cursor, Read, Write};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

/// Sizing of one pipe
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Chunks that may be queued before the writer blocks
    pub channel_buffer: usize,
    /// Bytes gathered per chunk before it is handed over
    pub chunk_size: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        PipeConfig {
            channel_buffer: 64,
            chunk_size: 64 * 1024,
        }
    }
}

/// Shared interrupt flag. Once raised, blocked readers fail instead of waiting.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn pipe(config: &PipeConfig) -> (PipeWriter, PipeReader) {
    pipe_with_interrupt(config, Interrupt::default())
}

pub fn pipe_with_interrupt(config: &PipeConfig, interrupt: Interrupt) -> (PipeWriter, PipeReader) {
    let chunk_size = config.chunk_size.max(1);
    let (tx, rx) = mpsc::sync_channel(config.channel_buffer);
    let writer = PipeWriter {
        tx,
        pending: Vec::with_capacity(chunk_size),
        chunk_size,
    };
    let reader = PipeReader {
        rx,
        current: Cursor::new(Vec::new()),
        interrupt,
    };
    (writer, reader)
}

/// Sending half; stands in for a child's stdin or stdout.
pub struct PipeWriter {
    tx: SyncSender<Vec<u8>>,
    pending: Vec<u8>,
    chunk_size: usize,
}

impl PipeWriter {
    fn hand_over(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = mem::replace(&mut self.pending, Vec::with_capacity(self.chunk_size));
        self.tx
            .send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for piece in buf.chunks(self.chunk_size) {
            let room = self.chunk_size - self.pending.len();
            let (now, rest) = piece.split_at(piece.len().min(room));
            self.pending.extend_from_slice(now);
            if self.pending.len() == self.chunk_size {
                self.hand_over()?;
            }
            self.pending.extend_from_slice(rest);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.hand_over()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let _ = self.hand_over();
    }
}

/// Receiving half. End of stream once every writer is gone.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    current: Cursor<Vec<u8>>,
    interrupt: Interrupt,
}

const INTERRUPT_POLL: Duration = Duration::from_millis(25);

impl PipeReader {
    fn buffered(&self) -> bool {
        (self.current.position() as usize) < self.current.get_ref().len()
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while !self.buffered() {
            if self.interrupt.is_raised() {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "session interrupted",
                ));
            }
            match self.rx.recv_timeout(INTERRUPT_POLL) {
                Ok(chunk) => self.current = Cursor::new(chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        self.current.read(buf)
    }
}
