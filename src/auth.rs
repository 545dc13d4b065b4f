use async_trait::async_trait;
use std::fmt;

/// AuthOutcome is the verdict of an authentication strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authenticated; `user` names the principal when the method has one
    Success { user: Option<String> },
    Failure { reason: String },
}

impl AuthOutcome {
    pub fn anonymous() -> Self {
        AuthOutcome::Success { user: None }
    }

    pub fn user(name: impl Into<String>) -> Self {
        AuthOutcome::Success {
            user: Some(name.into()),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        AuthOutcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AuthOutcome::Success { .. })
    }
}

/// Authenticator verifies username/password credentials
///
/// Credential storage lives outside the engine; anything that can answer
/// this question can back the UsernamePassword method.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> AuthOutcome;
}

/// UserPass holds username/password credentials as dictated
/// server-side
#[derive(Clone, PartialEq, Eq)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl UserPass {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for UserPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPass")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A single configured credential pair acts as the simplest authenticator
#[async_trait]
impl Authenticator for UserPass {
    async fn authenticate(&self, username: &str, password: &str) -> AuthOutcome {
        // Validate credentials
        if username == self.username && password == self.password {
            AuthOutcome::user(username)
        } else {
            AuthOutcome::failure("invalid username or password")
        }
    }
}
