//! Session lifecycle hooks
//!
//! Admission filters and audit loggers plug in here. A hook that returns
//! [`HookAbort`] closes the session immediately, without a SOCKS reply.

use crate::codec::CommandRequest;
use crate::error::SocksError;
use crate::session::SessionHandle;
use thiserror::Error;

/// HookAbort asks the dispatcher to drop the session
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookAbort(pub String);

impl From<HookAbort> for SocksError {
    fn from(abort: HookAbort) -> Self {
        SocksError::Aborted(abort.0)
    }
}

pub trait SessionHooks: Send + Sync {
    /// Called before any byte is read from a new session
    fn on_session_create(&self, _session: &SessionHandle) -> Result<(), HookAbort> {
        Ok(())
    }

    /// Called once the command request has been decoded, before it runs
    fn on_command_received(
        &self,
        _session: &SessionHandle,
        _request: &CommandRequest,
    ) -> Result<(), HookAbort> {
        Ok(())
    }

    /// Called exactly once when the session is finished
    fn on_session_close(&self, _session: &SessionHandle) {}
}

/// NoopHooks accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}
