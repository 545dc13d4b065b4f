//! Bidirectional relay built from two coupled pipes
//!
//! A relay owns both streams of a client/target pair. As soon as either
//! direction stops, or the session is closed, both pipes are closed so the
//! opposite direction unblocks and both sockets are released.

use crate::error::{Result, SocksError};
use crate::pipe::{Pipe, PipeEvent};
use crate::session::SessionHandle;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub const CLIENT_TO_TARGET: &str = "client->target";
pub const TARGET_TO_CLIENT: &str = "target->client";

/// Byte counts of a finished relay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
}

impl RelayStats {
    fn record(&mut self, pipe: &str, total: u64) {
        if pipe == CLIENT_TO_TARGET {
            self.client_to_target = total;
        } else {
            self.target_to_client = total;
        }
    }
}

/// Relay couples a client stream and a target stream
#[derive(Debug, Clone, Copy)]
pub struct Relay {
    buffer_size: usize,
}

/// Relay implementation block
impl Relay {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }

    /// run relays until one direction ends or the session is closed, then
    /// closes both streams. Returns the bytes moved in each direction.
    pub async fn run<C, T>(&self, client: C, target: T, session: &SessionHandle) -> Result<RelayStats>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (target_read, target_write) = tokio::io::split(target);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let upstream = Pipe::new(CLIENT_TO_TARGET, client_read, target_write)
            .with_buffer_size(self.buffer_size)
            .with_events(tx.clone());
        let downstream = Pipe::new(TARGET_TO_CLIENT, target_read, client_write)
            .with_buffer_size(self.buffer_size)
            .with_events(tx);

        upstream.start();
        downstream.start();

        let mut stats = RelayStats::default();
        let mut failure = None;

        // Wait for the first direction to finish
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(PipeEvent::Stopped { pipe, total }) => {
                        debug!(session = session.id(), pipe, total, "pipe stopped, closing relay");
                        stats.record(pipe, total);
                        break;
                    }
                    Some(PipeEvent::Error { pipe, error }) => {
                        debug!(session = session.id(), pipe, %error, "pipe failed");
                        failure.get_or_insert(error);
                    }
                    Some(PipeEvent::Transferred { pipe, bytes }) => {
                        trace!(session = session.id(), pipe, bytes, "relayed");
                    }
                    Some(PipeEvent::Started { .. }) => {}
                    None => break,
                },
                _ = session.closed() => {
                    debug!(session = session.id(), "session closed, closing relay");
                    break;
                }
            }
        }

        tokio::join!(upstream.close(), downstream.close());

        // Both loops have exited; collect what they reported on the way out
        while let Ok(event) = rx.try_recv() {
            match event {
                PipeEvent::Stopped { pipe, total } => stats.record(pipe, total),
                PipeEvent::Error { error, .. } => {
                    failure.get_or_insert(error);
                }
                _ => {}
            }
        }

        match failure {
            Some(error) => Err(SocksError::Relay(error)),
            None => Ok(stats),
        }
    }
}
