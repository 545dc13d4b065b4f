use crate::auth::{AuthOutcome, Authenticator, UserPass};
use crate::codec::{self, Decode, UserPassRequest, UserPassResponse};
use crate::error::{Result, SocksError};
use crate::protocol::{AuthMethod, AuthStatus};
use crate::session::{AsyncStream, Session};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Method is one SOCKS5 authentication method with both protocol roles
#[async_trait]
pub trait Method: Send + Sync {
    /// Method identifier byte
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    /// client_negotiate runs the client side of the subnegotiation
    async fn client_negotiate(&self, stream: &mut dyn AsyncStream) -> Result<()>;

    /// server_negotiate runs the server side of the subnegotiation
    async fn server_negotiate(&self, session: &mut Session) -> Result<AuthOutcome>;
}

/// NoAuth (0x00): nothing to negotiate
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl Method for NoAuth {
    fn id(&self) -> u8 {
        AuthMethod::NoAuth as u8
    }

    fn name(&self) -> &'static str {
        "NO AUTHENTICATION REQUIRED"
    }

    async fn client_negotiate(&self, _stream: &mut dyn AsyncStream) -> Result<()> {
        Ok(())
    }

    async fn server_negotiate(&self, _session: &mut Session) -> Result<AuthOutcome> {
        Ok(AuthOutcome::anonymous())
    }
}

/// UserPassword (0x02): RFC 1929 username/password subnegotiation
///
/// The server role needs an [`Authenticator`], the client role needs the
/// credentials to present.
#[derive(Clone, Default)]
pub struct UserPassword {
    authenticator: Option<Arc<dyn Authenticator>>,
    credentials: Option<UserPass>,
}

impl UserPassword {
    /// server builds the server role backed by authenticator
    pub fn server(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator: Some(authenticator),
            credentials: None,
        }
    }

    /// client builds the client role presenting credentials
    pub fn client(credentials: UserPass) -> Self {
        Self {
            authenticator: None,
            credentials: Some(credentials),
        }
    }
}

#[async_trait]
impl Method for UserPassword {
    fn id(&self) -> u8 {
        AuthMethod::UserPass as u8
    }

    fn name(&self) -> &'static str {
        "USERNAME/PASSWORD"
    }

    async fn client_negotiate(&self, stream: &mut dyn AsyncStream) -> Result<()> {
        let creds = self.credentials.as_ref().ok_or_else(|| {
            SocksError::Authentication("username/password selected but no credentials set".into())
        })?;

        let request = UserPassRequest {
            username: creds.username.clone(),
            password: creds.password.clone(),
        };
        codec::write_message(stream, &request).await?;

        let response = UserPassResponse::decode(stream).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(SocksError::Authentication(format!(
                "proxy rejected credentials (status {:#04x})",
                response.status
            )))
        }
    }

    async fn server_negotiate(&self, session: &mut Session) -> Result<AuthOutcome> {
        let request: UserPassRequest = session.read().await?;

        // Validate credentials
        let outcome = match &self.authenticator {
            Some(authenticator) => {
                authenticator
                    .authenticate(&request.username, &request.password)
                    .await
            }
            None => AuthOutcome::failure("username/password required but not configured"),
        };

        let status = if outcome.is_success() {
            AuthStatus::Success
        } else {
            AuthStatus::Failure
        };

        // The failure status goes out before the session is torn down
        session.write(&UserPassResponse::new(status)).await?;

        match outcome {
            AuthOutcome::Failure { reason } => Err(SocksError::Authentication(format!(
                "user {:?}: {reason}",
                request.username
            ))),
            success => Ok(success),
        }
    }
}

/// NoAcceptable (0xFF): the terminal "no acceptable methods" step
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAcceptable;

#[async_trait]
impl Method for NoAcceptable {
    fn id(&self) -> u8 {
        AuthMethod::NoAcceptable as u8
    }

    fn name(&self) -> &'static str {
        "NO ACCEPTABLE METHODS"
    }

    async fn client_negotiate(&self, _stream: &mut dyn AsyncStream) -> Result<()> {
        Err(SocksError::NoAcceptableMethods)
    }

    async fn server_negotiate(&self, session: &mut Session) -> Result<AuthOutcome> {
        session.handle().close();
        Err(SocksError::NoAcceptableMethods)
    }
}

/// MethodRegistry maps method ids to their implementation and performs
/// method selection
#[derive(Clone)]
pub struct MethodRegistry {
    methods: BTreeMap<u8, Arc<dyn Method>>,
    no_acceptable: Arc<dyn Method>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// MethodRegistry implementation block
impl MethodRegistry {
    /// new builds an empty registry; nothing is selectable until registered
    pub fn new() -> Self {
        Self {
            methods: BTreeMap::new(),
            no_acceptable: Arc::new(NoAcceptable),
        }
    }

    /// with registers method and returns the registry, for builder-style setup
    pub fn with(mut self, method: impl Method + 'static) -> Self {
        self.register(method);
        self
    }

    /// register adds method; a later registration for the same id replaces it
    pub fn register(&mut self, method: impl Method + 'static) {
        self.register_arc(Arc::new(method));
    }

    pub fn register_arc(&mut self, method: Arc<dyn Method>) {
        let id = method.id();
        // DEBUG
        debug!("registering method {:#04x} ({})", id, method.name());

        if id == AuthMethod::NoAcceptable as u8 {
            self.no_acceptable = method;
        } else {
            self.methods.insert(id, method);
        }
    }

    /// select returns the first id offered by the client that is supported,
    /// or 0xFF when none is. Client order is authoritative.
    pub fn select(&self, offered: &[u8]) -> u8 {
        offered
            .iter()
            .copied()
            .find(|id| self.methods.contains_key(id))
            .unwrap_or(AuthMethod::NoAcceptable as u8)
    }

    pub fn get(&self, id: u8) -> Option<Arc<dyn Method>> {
        self.methods.get(&id).cloned()
    }

    /// resolve returns the handler for a selected id, falling back to the
    /// no-acceptable-method handler
    pub fn resolve(&self, id: u8) -> Arc<dyn Method> {
        self.get(id)
            .unwrap_or_else(|| Arc::clone(&self.no_acceptable))
    }

    pub fn contains(&self, id: u8) -> bool {
        self.methods.contains_key(&id)
    }

    /// supported lists the registered ids in ascending order
    pub fn supported(&self) -> Vec<u8> {
        self.methods.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
