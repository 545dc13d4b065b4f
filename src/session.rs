//! Per-client session state and the shared session registry
//!
//! A [`Session`] owns the client stream while the protocol is being spoken.
//! Its [`SessionHandle`] is the shareable part (id, state, attributes and the
//! close signal) that lives in the [`SessionRegistry`] and can be closed
//! from any task. Closing a handle cancels every blocking operation the
//! session or its relay is parked on; the owning task then drops the
//! stream, which closes the socket.

use crate::codec::{self, Decode, Encode};
use crate::error::{Result, SocksError};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Attribute key under which the authenticated username is stored
pub const USER_ATTRIBUTE: &str = "user";

/// AsyncStream is any duplex byte stream a session can run over
/// (plain TCP, TLS-wrapped TCP, in-memory pipes in tests)
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// SessionState tracks where a session is in the SOCKS5 state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Authenticating,
    AwaitingCommand,
    Connecting,
    BindListening,
    BindRelaying,
    UdpAssociated,
    Relaying,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Negotiating => "NEGOTIATING",
            SessionState::Authenticating => "AUTHENTICATING",
            SessionState::AwaitingCommand => "AWAITING_COMMAND",
            SessionState::Connecting => "CONNECTING",
            SessionState::BindListening => "BIND_LISTENING",
            SessionState::BindRelaying => "BIND_RELAYING",
            SessionState::UdpAssociated => "UDP_ASSOCIATED",
            SessionState::Relaying => "RELAYING",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// SessionHandle is the registry-visible, closeable part of a session
pub struct SessionHandle {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    state: Mutex<SessionState>,
    attributes: Mutex<HashMap<String, String>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    registry: Weak<SessionRegistry>,
}

/// SessionHandle implementation block
impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// peer_addr is the client's address on the control connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// local_addr is the proxy's address on the control connection
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// set_state moves the session to a new state; CLOSED is terminal
    pub fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state == SessionState::Closed || *state == next {
            return;
        }
        trace!(session = self.id, from = %*state, to = %next, "state transition");
        *state = next;
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        lock(&self.attributes).get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.attributes).insert(key.into(), value.into());
    }

    pub fn remove_attribute(&self, key: &str) -> Option<String> {
        lock(&self.attributes).remove(key)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// closed resolves once the session has been closed
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// close signals every task working for this session to drop its
    /// sockets and removes the session from the registry.
    /// Returns false if the session was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        *lock(&self.state) = SessionState::Closed;
        self.shutdown.cancel();

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }

        // DEBUG
        debug!(session = self.id, peer = %self.peer_addr, "session closed");
        true
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Session owns one client connection while the protocol is spoken over it
pub struct Session {
    handle: Arc<SessionHandle>,
    stream: BoxedStream,
}

/// Session implementation block
impl Session {
    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    pub fn set_state(&self, state: SessionState) {
        self.handle.set_state(state)
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.handle.attribute(key)
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.handle.set_attribute(key, value)
    }

    /// read decodes the next message from the client
    pub async fn read<M: Decode>(&mut self) -> Result<M> {
        let Self { handle, stream } = self;
        tokio::select! {
            message = M::decode(stream) => message,
            _ = handle.closed() => Err(SocksError::Closed),
        }
    }

    /// write encodes a message, sends it and flushes the stream
    pub async fn write<M: Encode + ?Sized>(&mut self, msg: &M) -> Result<()> {
        let Self { handle, stream } = self;
        tokio::select! {
            written = codec::write_message(stream, msg) => written,
            _ = handle.closed() => Err(SocksError::Closed),
        }
    }

    /// until_closed runs fut unless the session gets closed first
    pub async fn until_closed<T, F>(&mut self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            result = fut => result,
            _ = self.handle.closed() => Err(SocksError::Closed),
        }
    }

    /// watch_client runs fut while watching the control connection. Bytes
    /// the client sends meanwhile are appended to `early`. If the client
    /// closes the connection or it fails, the session is closed and the
    /// wait ends with [`SocksError::Closed`].
    pub async fn watch_client<T, F>(&mut self, fut: F, early: &mut Vec<u8>) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::pin!(fut);
        let mut buf = [0u8; 512];

        loop {
            tokio::select! {
                result = &mut fut => return result,
                read = self.stream.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(session = self.handle.id, "client closed control connection");
                        self.handle.close();
                        return Err(SocksError::Closed);
                    }
                    Ok(n) => early.extend_from_slice(&buf[..n]),
                    Err(e) => {
                        debug!(session = self.handle.id, "control connection failed: {e}");
                        self.handle.close();
                        return Err(SocksError::Closed);
                    }
                },
                _ = self.handle.closed() => return Err(SocksError::Closed),
            }
        }
    }

    /// hold_open keeps the control connection open until the client closes
    /// it, the session is closed or `until` completes. Data the client sends
    /// meanwhile is discarded.
    pub async fn hold_open<F>(&mut self, until: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(until);
        let mut buf = [0u8; 512];

        loop {
            tokio::select! {
                read = self.stream.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(session = self.handle.id, "client closed control connection");
                        return Ok(());
                    }
                    Ok(n) => {
                        trace!(session = self.handle.id, bytes = n, "ignoring data on control connection");
                    }
                    Err(e) => return Err(SocksError::Io(e)),
                },
                _ = self.handle.closed() => return Ok(()),
                _ = &mut until => return Ok(()),
            }
        }
    }

    /// into_parts hands the stream over to a relay
    pub fn into_parts(self) -> (Arc<SessionHandle>, BoxedStream) {
        (self.handle, self.stream)
    }

    /// close closes the session and shuts the client stream down
    pub async fn close(mut self) {
        self.handle.close();
        let _ = self.stream.shutdown().await;
    }
}

/// SessionRegistry maps session ids to live sessions
#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: DashMap<u64, Arc<SessionHandle>>,
}

/// SessionRegistry implementation block
impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// create allocates the next session id and registers a session for stream
    pub fn create(
        self: &Arc<Self>,
        stream: BoxedStream,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Session {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = Arc::new(SessionHandle {
            id,
            peer_addr,
            local_addr,
            state: Mutex::new(SessionState::Negotiating),
            attributes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            registry: Arc::downgrade(self),
        });
        self.sessions.insert(id, Arc::clone(&handle));

        Session { handle, stream }
    }

    pub fn get(&self, id: u64) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// close_all hard-closes every registered session, returning how many
    pub fn close_all(&self) -> usize {
        // Snapshot first: closing removes entries from the map
        let handles: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        handles.iter().filter(|handle| handle.close()).count()
    }

    fn remove(&self, id: u64) {
        self.sessions.remove(&id);
    }
}
