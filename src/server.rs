use crate::{
    auth::{Authenticator, UserPass},
    config::Config,
    dispatcher::Dispatcher,
    hooks::{NoopHooks, SessionHooks},
    method::{MethodRegistry, NoAuth, UserPassword},
    session::SessionRegistry,
    transport::{Acceptor, PlainAcceptor},
};
use anyhow::{Result, anyhow, bail};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server {
    pub listen_addr: String,
    pub auth_config: Option<Arc<dyn Authenticator>>,
    config: Config,
    hooks: Arc<dyn SessionHooks>,
    acceptor: Arc<dyn Acceptor>,
    methods: Option<MethodRegistry>,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    listener: Option<TcpListener>,
}

/// ShutdownHandle stops a running server from any task
#[derive(Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
    registry: Arc<SessionRegistry>,
}

impl ShutdownHandle {
    /// shutdown stops accepting and hard-closes every live session.
    /// Returns how many sessions were closed.
    pub fn shutdown(&self) -> usize {
        self.token.cancel();
        self.registry.close_all()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            auth_config: None,
            config: Config::default(),
            hooks: Arc::new(NoopHooks),
            acceptor: Arc::new(PlainAcceptor),
            methods: None,
            registry: SessionRegistry::new(),
            shutdown: CancellationToken::new(),
            listener: None,
        }
    }

    /// with_auth applies the desired authentication
    pub fn with_auth(mut self, auth: Option<UserPass>) -> Self {
        self.auth_config = auth.map(|auth| Arc::new(auth) as Arc<dyn Authenticator>);
        self
    }

    /// with_authenticator plugs in an external credential backend
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.auth_config = Some(authenticator);
        self
    }

    /// with_methods replaces the method registry derived from the auth config
    pub fn with_methods(mut self, methods: MethodRegistry) -> Self {
        self.methods = Some(methods);
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_acceptor(mut self, acceptor: Arc<dyn Acceptor>) -> Self {
        self.acceptor = acceptor;
        self
    }

    /// sessions exposes the live session registry
    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
            registry: Arc::clone(&self.registry),
        }
    }

    /// shutdown stops accepting and hard-closes every session
    pub fn shutdown(&self) -> usize {
        self.shutdown_handle().shutdown()
    }

    /// bind to the listen address, fails when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("bind can only be called once");
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;

        // DEBUG
        info!("SOCKS5 proxy listening on {:?}", addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run handles server spinup and listens for incoming connections
    /// until shutdown
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("listener not bound"))?;

        let methods = self.method_registry();
        info!("supported methods: {:02x?}", methods.supported());
        let dispatcher = Dispatcher::new(
            Arc::new(methods),
            Arc::clone(&self.hooks),
            Arc::new(self.config.clone()),
        );

        // Listen for connections to proxy
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (inbound, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept error: {e}");
                    // Back off; descriptor exhaustion lasts until sessions close
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            // Clone for this connection
            let dispatcher = dispatcher.clone();
            let acceptor = Arc::clone(&self.acceptor);
            let registry = Arc::clone(&self.registry);
            let shutdown = self.shutdown.clone();

            // Spawn async task
            tokio::spawn(async move {
                // DEBUG
                info!("new client: {}", peer_addr);
                handle_connection(inbound, peer_addr, dispatcher, acceptor, registry, shutdown)
                    .await;
            });
        }

        // Closing the listener first keeps new sessions from appearing
        drop(listener);
        let closed = self.registry.close_all();
        info!("SOCKS5 proxy stopped, {closed} sessions closed");
        Ok(())
    }

    fn method_registry(&self) -> MethodRegistry {
        if let Some(methods) = &self.methods {
            return methods.clone();
        }

        match &self.auth_config {
            Some(authenticator) => {
                MethodRegistry::new().with(UserPassword::server(Arc::clone(authenticator)))
            }
            None => MethodRegistry::new().with(NoAuth),
        }
    }
}

/// handle_connection wraps an accepted connection in a session and runs it
async fn handle_connection(
    inbound: TcpStream,
    peer_addr: SocketAddr,
    dispatcher: Dispatcher,
    acceptor: Arc<dyn Acceptor>,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) {
    let local_addr = match inbound.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("connection error from {peer_addr}: {e}");
            return;
        }
    };

    let stream = match acceptor.accept(inbound).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("transport setup failed for {peer_addr}: {e}");
            return;
        }
    };

    let session = registry.create(stream, peer_addr, local_addr);

    // Shutdown may have swept the registry while the transport was set up
    if shutdown.is_cancelled() {
        session.close().await;
        return;
    }

    dispatcher.run(session).await;
}
