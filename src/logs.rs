//! Container log multiplexing.
//!
//! Docker exposes a single follow-mode log stream per container that carries
//! both stdout and stderr frames. The [`LogMultiplexer`] drains that stream
//! for the whole lifetime of the instance:
//!
//! ```text
//!   runtime log stream ──▶ demux ──┬──▶ stdout sink
//!                                  └──▶ stderr sink
//!                                  └──▶ pipe ──▶ line scanner ──▶ ErrorLog
//! ```
//!
//! The scanner runs as its own task behind an unbounded pipe so that a slow
//! consumer of the [`ErrorLog`] never stalls the demux loop.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{BoxError, Result};
use crate::runtime::{LogChunk, RuntimeError};

/// Lines on the stderr channel starting with this marker are collected.
pub const ERROR_MARKER: &str = "ERROR";

/// A byte destination for one container log channel.
pub type LogSink = Box<dyn AsyncWrite + Send + Unpin>;

/// The stdout/stderr sink pair, discarding whatever the caller did not ask for.
pub struct LogSinks {
    pub stdout: LogSink,
    pub stderr: LogSink,
}

impl LogSinks {
    pub fn new(stdout: Option<LogSink>, stderr: Option<LogSink>) -> Self {
        Self {
            stdout: stdout.unwrap_or_else(|| Box::new(tokio::io::sink())),
            stderr: stderr.unwrap_or_else(|| Box::new(tokio::io::sink())),
        }
    }
}

impl Default for LogSinks {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// An in-memory sink that can be cloned and read back after shutdown.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|b| b.is_empty()).unwrap_or(true)
    }

    /// Append bytes without going through `AsyncWrite`.
    pub fn append(&self, bytes: &[u8]) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.extend_from_slice(bytes);
        }
    }

    /// Box a clone of this buffer as a [`LogSink`].
    pub fn sink(&self) -> LogSink {
        Box::new(self.clone())
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.inner.lock() {
            Ok(mut inner) => {
                inner.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            Err(_) => Poll::Ready(Err(std::io::Error::other("buffer lock poisoned"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Error lines extracted from the container's stderr, in arrival order.
///
/// Clones share the same storage. Only the scanner task appends; read it
/// once the instance has been stopped (or failed to start).
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
    }

    /// Snapshot of the collected lines.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits a byte stream into lines across arbitrary chunk boundaries.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let line = std::mem::replace(&mut self.pending, rest);
            lines.push(decode_line(&line));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(decode_line(&line))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_end_matches(['\n', '\r']).to_string()
}

fn spawn_scanner(errors: ErrorLog) -> (mpsc::UnboundedSender<Bytes>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let handle = tokio::spawn(async move {
        let mut splitter = LineSplitter::default();
        let record = |line: String| {
            if line.starts_with(ERROR_MARKER) {
                tracing::debug!("Captured MySQL error line: {}", line);
                errors.push(line);
            }
        };

        while let Some(chunk) = rx.recv().await {
            splitter.feed(&chunk).into_iter().for_each(&record);
        }
        if let Some(line) = splitter.finish() {
            record(line);
        }
    });

    (tx, handle)
}

/// How the log stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStreamEnd {
    /// The runtime closed the stream: the container exited on its own.
    EndOfStream,
    /// The stream was closed because the instance is being stopped.
    Closed,
}

/// Background task draining a container's log stream.
pub struct LogMultiplexer {
    stopping: Arc<AtomicBool>,
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<LogStreamEnd>>,
}

impl LogMultiplexer {
    /// Spawn the multiplexer over `stream`.
    ///
    /// Returns the handle and the receiving end of the "instance exited"
    /// signal, which fires at most once, only when the stream ends while the
    /// instance is not being stopped.
    pub fn spawn(
        stream: BoxStream<'static, std::result::Result<LogChunk, RuntimeError>>,
        sinks: LogSinks,
        errors: Option<ErrorLog>,
    ) -> (Self, oneshot::Receiver<()>) {
        let stopping = Arc::new(AtomicBool::new(false));
        let (close_tx, close_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();

        let task = tokio::spawn(drain(
            stream,
            sinks,
            errors,
            stopping.clone(),
            close_rx,
            exited_tx,
        ));

        let multiplexer = Self {
            stopping,
            close_tx: Some(close_tx),
            task,
        };
        (multiplexer, exited_rx)
    }

    /// Mark the instance as stopping. From here on, transport errors and
    /// end-of-stream are treated as a clean close.
    pub fn begin_shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the stream and wait for the task (and its scanner) to finish.
    ///
    /// Returns an error only if the stream failed while the instance was
    /// not being stopped.
    pub async fn shutdown(mut self) -> Result<LogStreamEnd> {
        self.begin_shutdown();
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }

        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(BoxError::LogStream {
                reason: format!("log task failed: {}", e),
            }),
        }
    }
}

async fn drain(
    mut stream: BoxStream<'static, std::result::Result<LogChunk, RuntimeError>>,
    mut sinks: LogSinks,
    errors: Option<ErrorLog>,
    stopping: Arc<AtomicBool>,
    mut close_rx: oneshot::Receiver<()>,
    exited_tx: oneshot::Sender<()>,
) -> Result<LogStreamEnd> {
    let (pipe, scanner) = match errors {
        Some(errors) => {
            let (tx, handle) = spawn_scanner(errors);
            (Some(tx), Some(handle))
        }
        None => (None, None),
    };

    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut close_rx => break Ok(LogStreamEnd::Closed),
            frame = stream.next() => match frame {
                Some(Ok(LogChunk::Stdout(bytes))) => {
                    write_frame(&mut sinks.stdout, &bytes, "stdout").await;
                }
                Some(Ok(LogChunk::Stderr(bytes))) => {
                    write_frame(&mut sinks.stderr, &bytes, "stderr").await;
                    if let Some(pipe) = &pipe {
                        let _ = pipe.send(bytes);
                    }
                }
                None => break Ok(LogStreamEnd::EndOfStream),
                Some(Err(e)) if stopping.load(Ordering::SeqCst) => {
                    tracing::debug!("Log stream closed during shutdown: {}", e);
                    break Ok(LogStreamEnd::Closed);
                }
                Some(Err(e)) => {
                    tracing::warn!("Container log stream failed: {}", e);
                    break Err(BoxError::LogStream { reason: e.to_string() });
                }
            }
        }
    };

    flush_sink(&mut sinks.stdout, "stdout").await;
    flush_sink(&mut sinks.stderr, "stderr").await;

    // Every captured line must be recorded before anyone hears about the exit.
    drop(pipe);
    if let Some(scanner) = scanner
        && let Err(e) = scanner.await
    {
        tracing::warn!("Error line scanner failed: {}", e);
    }

    if matches!(outcome, Ok(LogStreamEnd::EndOfStream)) && !stopping.load(Ordering::SeqCst) {
        tracing::debug!("Container log stream ended, container exited");
        let _ = exited_tx.send(());
    }

    outcome
}

async fn write_frame(sink: &mut LogSink, bytes: &[u8], channel: &str) {
    if let Err(e) = sink.write_all(bytes).await {
        tracing::warn!("Failed to write container {}, discarding it: {}", channel, e);
        *sink = Box::new(tokio::io::sink());
    }
}

async fn flush_sink(sink: &mut LogSink, channel: &str) {
    if let Err(e) = sink.flush().await {
        tracing::warn!("Failed to flush container {}: {}", channel, e);
    }
}
