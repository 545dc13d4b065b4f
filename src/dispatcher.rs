//! Per-session SOCKS5 state machine
//!
//! NEGOTIATING -> AUTHENTICATING -> AWAITING_COMMAND -> one of CONNECTING,
//! BIND_LISTENING/BIND_RELAYING, UDP_ASSOCIATED, RELAYING -> CLOSED.
//! Every path ends with the session closed; the last reply before a close
//! is always flushed first.

use crate::address::TargetAddress;
use crate::auth::AuthOutcome;
use crate::codec::{CommandReply, CommandRequest, MethodSelectionRequest, MethodSelectionResponse};
use crate::config::Config;
use crate::error::{ErrorKind, Result, SocksError, reply_for_io_error};
use crate::hooks::SessionHooks;
use crate::method::MethodRegistry;
use crate::protocol::{Command, ReplyCode};
use crate::relay::Relay;
use crate::session::{Session, SessionState, USER_ATTRIBUTE};
use crate::udp::{ClientEndpoint, UdpAssociation};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Dispatcher drives sessions through the protocol
#[derive(Clone)]
pub struct Dispatcher {
    methods: Arc<MethodRegistry>,
    hooks: Arc<dyn SessionHooks>,
    config: Arc<Config>,
}

/// Dispatcher implementation block
impl Dispatcher {
    /// new is a constructor for the Dispatcher type
    pub fn new(
        methods: Arc<MethodRegistry>,
        hooks: Arc<dyn SessionHooks>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            methods,
            hooks,
            config,
        }
    }

    /// run handles the full client/server SOCKS5 protocol flow of one
    /// session and closes it afterwards
    pub async fn run(&self, session: Session) {
        let handle = Arc::clone(session.handle());

        let result = match self.hooks.on_session_create(&handle) {
            Ok(()) => self.drive(session).await,
            // Dropping the session closes the stream without a reply
            Err(abort) => {
                drop(session);
                Err(abort.into())
            }
        };

        match result {
            Ok(()) => debug!(session = handle.id(), "session finished"),
            Err(e) => match e.kind() {
                ErrorKind::Closed => debug!(session = handle.id(), "session ended: {e}"),
                ErrorKind::Protocol | ErrorKind::Authentication | ErrorKind::Network => {
                    warn!(session = handle.id(), peer = %handle.peer_addr(), "session failed: {e}")
                }
                ErrorKind::Relay | ErrorKind::Resource => {
                    error!(session = handle.id(), peer = %handle.peer_addr(), "session failed: {e}")
                }
            },
        }

        handle.close();
        self.hooks.on_session_close(&handle);
    }

    async fn drive(&self, mut session: Session) -> Result<()> {
        // NEGOTIATING
        session.set_state(SessionState::Negotiating);
        let hello: MethodSelectionRequest = session.read().await?;
        let selected = self.methods.select(&hello.methods);
        let method = self.methods.resolve(selected);

        // DEBUG
        debug!(
            session = session.id(),
            "client offered {:02x?}, selected {:#04x} ({})",
            hello.methods,
            selected,
            method.name()
        );
        session.write(&MethodSelectionResponse::new(selected)).await?;

        // AUTHENTICATING
        session.set_state(SessionState::Authenticating);
        if let AuthOutcome::Success { user: Some(user) } = method.server_negotiate(&mut session).await? {
            info!(session = session.id(), "authenticated as {user:?}");
            session.set_attribute(USER_ATTRIBUTE, user);
        }

        // AWAITING_COMMAND
        session.set_state(SessionState::AwaitingCommand);
        let request: CommandRequest = session.read().await?;
        self.hooks.on_command_received(session.handle(), &request)?;

        if let Some(code) = request.rejection {
            return reject(&mut session, SocksError::Rejected(code)).await;
        }

        match request.command() {
            Some(Command::Connect) => self.connect(session, request.target).await,
            Some(Command::Bind) => self.bind(session, request.target).await,
            Some(Command::UdpAssociate) => self.udp_associate(session, request.target).await,
            None => reject(&mut session, SocksError::Rejected(ReplyCode::CommandNotSupported)).await,
        }
    }

    async fn connect(&self, mut session: Session, target: TargetAddress) -> Result<()> {
        session.set_state(SessionState::Connecting);

        // DEBUG
        info!(session = session.id(), "CONNECT {target}");

        let attempt = within(self.config.command_timeout, "connect", connect_any(&target));

        let outbound = match session.until_closed(attempt).await {
            Ok(outbound) => outbound,
            Err(e) => return reject(&mut session, e).await,
        };

        let bound = match outbound.local_addr() {
            Ok(bound) => bound,
            Err(e) => return reject(&mut session, SocksError::Resource(e)).await,
        };
        let _ = outbound.set_nodelay(true);

        session.write(&CommandReply::success(bound)).await?;
        session.set_state(SessionState::Relaying);
        self.relay(session, outbound).await
    }

    async fn bind(&self, mut session: Session, target: TargetAddress) -> Result<()> {
        session.set_state(SessionState::BindListening);

        let listener = match TcpListener::bind(SocketAddr::new(self.bind_ip(&session), 0)).await {
            Ok(listener) => listener,
            Err(e) => return reject(&mut session, SocksError::Resource(e)).await,
        };
        let listen_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => return reject(&mut session, SocksError::Resource(e)).await,
        };

        session.write(&CommandReply::success(listen_addr)).await?;

        // DEBUG
        info!(
            session = session.id(),
            "BIND listening on {listen_addr}, expecting {target}"
        );

        // Exactly one inbound connection is accepted. The client may hang up
        // meanwhile, which ends the wait.
        let accept = within(self.config.command_timeout, "bind accept", async {
            listener
                .accept()
                .await
                .map_err(|e| SocksError::network(reply_for_io_error(&e), e))
        });
        let mut early = Vec::new();
        let accepted = session.watch_client(accept, &mut early).await;
        drop(listener);
        let (mut inbound, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => return reject(&mut session, e).await,
        };

        // DEBUG
        info!(session = session.id(), "BIND accepted {peer}");

        session.write(&CommandReply::success(peer)).await?;
        if !early.is_empty() {
            debug!(
                session = session.id(),
                bytes = early.len(),
                "forwarding data sent before the inbound connection"
            );
            inbound.write_all(&early).await.map_err(SocksError::Relay)?;
        }
        session.set_state(SessionState::BindRelaying);
        self.relay(session, inbound).await
    }

    async fn udp_associate(&self, mut session: Session, requested: TargetAddress) -> Result<()> {
        let client = ClientEndpoint::from_request(&requested, session.peer_addr());
        let local = SocketAddr::new(self.bind_ip(&session), 0);

        let association = match UdpAssociation::bind(local, client).await {
            Ok(association) => association,
            Err(e) => return reject(&mut session, SocksError::Resource(e)).await,
        };

        session
            .write(&CommandReply::success(association.local_addr()))
            .await?;
        session.set_state(SessionState::UdpAssociated);
        association.start();

        // The control connection only anchors the association from here on
        let result = session.hold_open(association.closed()).await;
        association.stop();

        // DEBUG
        info!(
            session = session.id(),
            "UDP association on {} closed",
            association.local_addr()
        );
        result
    }

    async fn relay(&self, session: Session, target: TcpStream) -> Result<()> {
        let (handle, client) = session.into_parts();
        let stats = Relay::new(self.config.buffer_size)
            .run(client, target, &handle)
            .await?;

        // DEBUG
        info!(
            session = handle.id(),
            "connection closed: {} bytes from client, {} bytes from server",
            stats.client_to_target,
            stats.target_to_client
        );
        Ok(())
    }

    fn bind_ip(&self, session: &Session) -> IpAddr {
        self.config
            .bind_ip
            .unwrap_or_else(|| session.local_addr().ip())
    }
}

/// connect_any resolves target and connects to the first address that
/// accepts. Failures map to the reply code of the last attempt.
async fn connect_any(target: &TargetAddress) -> Result<TcpStream> {
    let addrs = target
        .resolve_all()
        .await
        .map_err(|e| SocksError::network(ReplyCode::HostUnreachable, e))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("connect to {addr} failed: {e}");
                last_error = Some(e);
            }
        }
    }

    let e = last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {target}"))
    });
    Err(SocksError::network(reply_for_io_error(&e), e))
}

/// reject answers with the reply code for err, then returns err
async fn reject<T>(session: &mut Session, err: SocksError) -> Result<T> {
    if !matches!(err, SocksError::Closed) {
        session.write(&CommandReply::failure(err.reply_code())).await?;
    }
    Err(err)
}

/// within bounds fut by limit; expiry maps to TTL_EXPIRED
async fn within<T, F>(limit: Option<Duration>, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(limit) = limit else {
        return fut.await;
    };

    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SocksError::network(
            ReplyCode::TtlExpired,
            io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out after {limit:?}")),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserPass;
    use crate::hooks::{HookAbort, NoopHooks};
    use crate::method::{NoAuth, UserPassword};
    use crate::session::{SessionHandle, SessionRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio::time::timeout;

    fn dispatcher(methods: MethodRegistry, hooks: Arc<dyn SessionHooks>) -> Dispatcher {
        Dispatcher::new(Arc::new(methods), hooks, Arc::new(Config::default()))
    }

    fn spawn_session(
        dispatcher: Dispatcher,
        registry: &Arc<SessionRegistry>,
    ) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (server, client) = duplex(1024);
        let addr = SocketAddr::from(([127, 0, 0, 1], 1080));
        let session = registry.create(Box::new(server), addr, addr);
        let task = tokio::spawn(async move { dispatcher.run(session).await });
        (client, task)
    }

    async fn read_to_end(client: &mut DuplexStream) -> Vec<u8> {
        let mut rest = Vec::new();
        timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .expect("session not closed")
            .unwrap();
        rest
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn session_future_is_send() {
        let registry = SessionRegistry::new();
        let (server, _client) = duplex(64);
        let addr = SocketAddr::from(([127, 0, 0, 1], 1080));
        let session = registry.create(Box::new(server), addr, addr);
        let dispatcher = dispatcher(MethodRegistry::new().with(NoAuth), Arc::new(NoopHooks));

        let fut = dispatcher.run(session);
        assert_send(&fut);
    }

    #[tokio::test]
    async fn expired_command_maps_to_ttl_expired() {
        let err = within(
            Some(Duration::from_millis(50)),
            "connect",
            std::future::pending::<Result<()>>(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.reply_code(), ReplyCode::TtlExpired);
    }

    #[tokio::test]
    async fn no_timeout_waits_for_the_command() {
        let value = within(None, "connect", async { Ok(3u8) }).await.unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn no_acceptable_method_closes_after_reply() {
        let registry = SessionRegistry::new();
        let methods = MethodRegistry::new()
            .with(NoAuth)
            .with(UserPassword::server(Arc::new(UserPass::new("a", "b"))));
        let (mut client, task) = spawn_session(dispatcher(methods, Arc::new(NoopHooks)), &registry);

        client.write_all(&[0x05, 0x01, 0x01]).await.unwrap();
        assert_eq!(read_to_end(&mut client).await, vec![0x05, 0xFF]);
        task.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unsupported_command_is_rejected() {
        let registry = SessionRegistry::new();
        let (mut client, task) = spawn_session(
            dispatcher(MethodRegistry::new().with(NoAuth), Arc::new(NoopHooks)),
            &registry,
        );

        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x09, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let bytes = read_to_end(&mut client).await;
        assert_eq!(&bytes[..2], &[0x05, 0x00]);
        assert_eq!(&bytes[2..], &[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn bad_version_closes_without_reply() {
        let registry = SessionRegistry::new();
        let (mut client, task) = spawn_session(
            dispatcher(MethodRegistry::new().with(NoAuth), Arc::new(NoopHooks)),
            &registry,
        );

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        assert!(read_to_end(&mut client).await.is_empty());
        task.await.unwrap();
    }

    #[derive(Default)]
    struct RecordingHooks {
        closed: AtomicUsize,
    }

    impl SessionHooks for RecordingHooks {
        fn on_command_received(
            &self,
            _session: &SessionHandle,
            request: &CommandRequest,
        ) -> std::result::Result<(), HookAbort> {
            Err(HookAbort(format!("{} is blocked", request.target)))
        }

        fn on_session_close(&self, _session: &SessionHandle) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn hook_abort_sends_no_reply() {
        let registry = SessionRegistry::new();
        let hooks = Arc::new(RecordingHooks::default());
        let (mut client, task) = spawn_session(
            dispatcher(MethodRegistry::new().with(NoAuth), hooks.clone()),
            &registry,
        );

        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        assert_eq!(read_to_end(&mut client).await, vec![0x05, 0x00]);
        task.await.unwrap();
        assert_eq!(hooks.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authenticated_user_is_recorded() {
        struct CaptureUser(std::sync::Mutex<Option<String>>);

        impl SessionHooks for CaptureUser {
            fn on_command_received(
                &self,
                session: &SessionHandle,
                _request: &CommandRequest,
            ) -> std::result::Result<(), HookAbort> {
                *self.0.lock().unwrap() = session.attribute(USER_ATTRIBUTE);
                Err(HookAbort("stop here".into()))
            }
        }

        let registry = SessionRegistry::new();
        let hooks = Arc::new(CaptureUser(std::sync::Mutex::new(None)));
        let methods = MethodRegistry::new()
            .with(UserPassword::server(Arc::new(UserPass::new("alice", "secret"))));
        let (mut client, task) = spawn_session(dispatcher(methods, hooks.clone()), &registry);

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        client.write_all(&[0x01, 0x05]).await.unwrap();
        client.write_all(b"alice").await.unwrap();
        client.write_all(&[0x06]).await.unwrap();
        client.write_all(b"secret").await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        assert_eq!(read_to_end(&mut client).await, vec![0x05, 0x02, 0x01, 0x00]);
        task.await.unwrap();
        assert_eq!(hooks.0.lock().unwrap().as_deref(), Some("alice"));
    }
}
