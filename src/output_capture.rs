//! Concurrent draining of a process's combined output stream.

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Size of the buffer each read goes into.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Default)]
struct CaptureBuffer {
    bytes: bytes::BytesMut,
    eof: bool,
    frozen: bool,
}

/// Drains a process's output stream on a dedicated task, accumulating everything read.
///
/// Pipes have a bounded capacity. A process writing more than that blocks until someone reads,
/// which deadlocks a parent only waiting for it to exit. Capturing output concurrently avoids
/// this.
///
/// The buffer is append-only until [OutputCapture::freeze] is called. Anything read after
/// freezing is discarded.
pub struct OutputCapture<R> {
    reader: Option<R>,
    chunk_size: usize,
    buffer: Arc<Mutex<CaptureBuffer>>,
    drain: Option<JoinHandle<()>>,
}

impl<R> Debug for OutputCapture<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputCapture")
            .field("started", &self.reader.is_none())
            .field("chunk_size", &self.chunk_size)
            .field("drain", &"non-debug < JoinHandle<()> >")
            .finish()
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> OutputCapture<R> {
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader: Some(reader),
            chunk_size: chunk_size.max(1),
            buffer: Arc::new(Mutex::new(CaptureBuffer::default())),
            drain: None,
        }
    }

    /// Starts draining the stream. Calling this more than once has no effect.
    pub fn start(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        let drain = drain(reader, self.chunk_size, self.buffer.clone());
        self.drain = Some(tokio::spawn(drain.in_current_span()));
    }

    /// Everything captured so far, decoded as UTF-8. Invalid sequences are replaced.
    pub fn output(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer.bytes).into_owned()
    }

    /// Whether the drain observed the end of the stream.
    pub fn reached_eof(&self) -> bool {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .eof
    }

    pub fn is_frozen(&self) -> bool {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frozen
    }

    /// Waits at most `grace` for the stream to end, then freezes the buffer and returns its
    /// contents.
    ///
    /// A descendant of the process may keep the stream open after the process itself exited.
    /// Whatever it writes after `grace` elapsed is not captured.
    pub async fn freeze(&mut self, grace: Duration) -> String {
        if let Some(drain) = self.drain.as_mut() {
            if !drain.is_finished() {
                match tokio::time::timeout(grace, drain).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, "Output drain task failed");
                    }
                    Err(_elapsed) => {
                        tracing::debug!(
                            ?grace,
                            "Output stream still open after grace period, freezing anyway"
                        );
                    }
                }
            }
        }

        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.frozen = true;
        String::from_utf8_lossy(&buffer.bytes).into_owned()
    }

    /// Releases the drain task. Safe to call repeatedly, before [OutputCapture::start], and after
    /// the drain completed.
    pub fn destroy(&mut self) {
        self.reader.take();
        if let Some(drain) = self.drain.take() {
            if !drain.is_finished() {
                tracing::debug!("Aborting output drain");
            }
            drain.abort();
        }
    }
}

impl<R> Drop for OutputCapture<R> {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(
    mut read: R,
    chunk_size: usize,
    buffer: Arc<Mutex<CaptureBuffer>>,
) {
    let mut chunk = bytes::BytesMut::with_capacity(chunk_size);
    loop {
        chunk.clear();
        chunk.reserve(chunk_size);
        match read.read_buf(&mut chunk).await {
            Ok(0) => {
                buffer.lock().unwrap_or_else(PoisonError::into_inner).eof = true;
                break;
            }
            Ok(bytes_read) => {
                let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                if buffer.frozen {
                    tracing::trace!(bytes_read, "Output already frozen, dropping chunk");
                } else {
                    buffer.bytes.extend_from_slice(&chunk);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Could not read from output stream");
                break;
            }
        }
    }
}
