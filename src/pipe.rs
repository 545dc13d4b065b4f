//! One-directional byte pump between two streams
//!
//! A [`Pipe`] copies from its reader to its writer on its own task until
//! end-of-stream, an I/O error or [`Pipe::stop`]. Stopping hands the
//! streams back to the pipe without closing them; [`Pipe::close`] stops
//! and then closes both.

use crate::config::DEFAULT_BUFFER_SIZE;
use crate::session::lock;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// PipeEvent reports pipe lifecycle to whoever owns the event channel
#[derive(Debug)]
pub enum PipeEvent {
    Started { pipe: &'static str },
    Transferred { pipe: &'static str, bytes: usize },
    /// Emitted once per run, after the endpoints were handed back
    Stopped { pipe: &'static str, total: u64 },
    Error { pipe: &'static str, error: io::Error },
}

#[derive(Default)]
struct Control {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Shared<R, W> {
    endpoints: Mutex<Option<(R, W)>>,
    running: AtomicBool,
    control: Mutex<Control>,
}

/// Pipe moves bytes from a reader to a writer
pub struct Pipe<R, W> {
    name: &'static str,
    buffer_size: usize,
    events: Option<UnboundedSender<PipeEvent>>,
    shared: Arc<Shared<R, W>>,
}

/// Pipe implementation block
impl<R, W> Pipe<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// new is a constructor for the Pipe type
    pub fn new(name: &'static str, reader: R, writer: W) -> Self {
        Self {
            name,
            buffer_size: DEFAULT_BUFFER_SIZE,
            events: None,
            shared: Arc::new(Shared {
                endpoints: Mutex::new(Some((reader, writer))),
                running: AtomicBool::new(false),
                control: Mutex::new(Control::default()),
            }),
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// with_events subscribes a channel to this pipe's events
    pub fn with_events(mut self, events: UnboundedSender<PipeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// start spawns the copy loop. Returns false if the pipe was already
    /// running or has been closed.
    pub fn start(&self) -> bool {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let Some((reader, writer)) = lock(&self.shared.endpoints).take() else {
            self.shared.running.store(false, Ordering::SeqCst);
            return false;
        };

        emit(&self.events, PipeEvent::Started { pipe: self.name });

        let cancel = CancellationToken::new();
        let mut control = lock(&self.shared.control);
        control.cancel = cancel.clone();
        control.task = Some(tokio::spawn(copy_loop(
            self.name,
            Arc::clone(&self.shared),
            reader,
            writer,
            self.buffer_size,
            cancel,
            self.events.clone(),
        )));

        true
    }

    /// stop interrupts the copy loop and waits for it to hand the streams
    /// back. The streams stay open. Returns false if the pipe was not running.
    pub async fn stop(&self) -> bool {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return false;
        }

        let task = {
            let mut control = lock(&self.shared.control);
            control.cancel.cancel();
            control.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }

        true
    }

    /// close stops the pipe and closes both streams
    pub async fn close(&self) {
        self.stop().await;

        // The loop may have ended on its own; wait for the hand-back
        let task = lock(&self.shared.control).task.take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let endpoints = lock(&self.shared.endpoints).take();
        if let Some((reader, mut writer)) = endpoints {
            let _ = writer.shutdown().await;
            drop(reader);
        }
    }
}

impl<R, W> Drop for Pipe<R, W> {
    fn drop(&mut self) {
        lock(&self.shared.control).cancel.cancel();
    }
}

fn emit(events: &Option<UnboundedSender<PipeEvent>>, event: PipeEvent) {
    if let Some(events) = events {
        // Nobody listening is fine
        let _ = events.send(event);
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

async fn copy_loop<R, W>(
    pipe: &'static str,
    shared: Arc<Shared<R, W>>,
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    cancel: CancellationToken,
    events: Option<UnboundedSender<PipeEvent>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                trace!(pipe, total, "end of stream");
                break;
            }
            Ok(n) => n,
            Err(error) => {
                debug!(pipe, %error, "read failed");
                emit(&events, PipeEvent::Error { pipe, error });
                break;
            }
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = write_chunk(&mut writer, &buf[..n]) => written,
        };
        if let Err(error) = written {
            debug!(pipe, %error, "write failed");
            emit(&events, PipeEvent::Error { pipe, error });
            break;
        }

        total += n as u64;
        emit(&events, PipeEvent::Transferred { pipe, bytes: n });
    }

    *lock(&shared.endpoints) = Some((reader, writer));
    shared.running.store(false, Ordering::SeqCst);
    emit(&events, PipeEvent::Stopped { pipe, total });
}
