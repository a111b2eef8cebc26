// protocol/listener.rs - Agency-facing session interface

use std::any::Any;

use serde::Serialize;
use tracing::error;

use crate::message::{ContractMessage, SessionId};
use crate::observability::record_handler_failure;

use super::expiration::TimerId;
use super::registry::ContractorEntry;
use super::state_machine::{ContractState, Role, StateWait};

/// Snapshot of a session, kept by the agency after the session is gone
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub protocol_id: String,
    pub role: Role,
    pub state: ContractState,
    /// Manager sessions only
    pub contractors: Vec<ContractorEntry>,
}

/// A protocol session as seen by its agency.
///
/// The agency hands every message and timer event of a session to its
/// listener, one at a time, and unregisters the listener once it reports a
/// terminal state.
pub trait Listener: Send {
    fn session_id(&self) -> &SessionId;

    fn protocol_id(&self) -> &str;

    fn role(&self) -> Role;

    fn state(&self) -> ContractState;

    fn on_message(&mut self, msg: &ContractMessage);

    fn on_timer(&mut self, timer_id: TimerId);

    fn wait_for_state(&mut self, state: ContractState) -> StateWait;

    /// Cancel everything the session has scheduled
    fn terminate(&mut self);

    fn summary(&self) -> SessionSummary;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn is_terminal(&self) -> bool {
        self.role().is_terminal(self.state())
    }
}

/// Log a failed callback or protocol violation before the session goes to wtf
pub(crate) fn log_session_failure(
    role: Role,
    session_id: &SessionId,
    during: &str,
    err: &anyhow::Error,
) {
    error!(
        role = %role,
        session_id = %session_id,
        during,
        error = ?err,
        "Session failed, moving to wtf"
    );
    record_handler_failure(role.as_str());
}
