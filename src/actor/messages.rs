// actor/messages.rs - Messages understood by an agency actor

use actix::{Message, MessageResponse};

use crate::agency::{AgencyStats, ContractorFactory, InterestType};
use crate::message::{AgentId, ContractMessage, Recipient, SessionId};
use crate::protocol::{
    ContractState, ContractorMedium, HandlerResult, ManagerHandler, ManagerMedium, ProtocolError,
    SessionSummary,
};

/// Deliver a contract net message to an agent
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct DeliverMessage {
    pub message: ContractMessage,
}

/// Start a manager session, answers with its id
#[derive(Message)]
#[rtype(result = "SessionId")]
pub struct InitiateManager {
    pub handler: Box<dyn ManagerHandler>,
    pub recipients: Vec<Recipient>,
}

/// Answer announcements of a protocol
#[derive(Message)]
#[rtype(result = "()")]
pub struct RegisterInterest {
    pub protocol_id: String,
    pub interest_type: InterestType,
    pub factory: ContractorFactory,
}

/// Stop answering announcements of a protocol
#[derive(Message)]
#[rtype(result = "bool")]
pub struct RevokeInterest {
    pub protocol_id: String,
}

/// Resolve once a session reaches `state`
#[derive(Message, Debug)]
#[rtype(result = "Result<(), AgentError>")]
pub struct WaitForState {
    pub session_id: SessionId,
    pub state: ContractState,
}

/// Summary of a live or finished session
#[derive(Message, Debug)]
#[rtype(result = "Option<SessionSummary>")]
pub struct GetSummary {
    pub session_id: SessionId,
}

/// Query agent status
#[derive(Message)]
#[rtype(result = "AgentStatus")]
pub struct GetStatus;

pub type ManagerOperation = Box<dyn FnOnce(&mut ManagerMedium) -> HandlerResult + Send>;

pub type ContractorOperation = Box<dyn FnOnce(&mut ContractorMedium) -> HandlerResult + Send>;

/// Run an agent-initiated operation on a manager session
#[derive(Message)]
#[rtype(result = "Result<(), AgentError>")]
pub struct WithManager {
    pub session_id: SessionId,
    pub operation: ManagerOperation,
}

/// Run an agent-initiated operation (finalize, defect, ...) on a contractor session
#[derive(Message)]
#[rtype(result = "Result<(), AgentError>")]
pub struct WithContractor {
    pub session_id: SessionId,
    pub operation: ContractorOperation,
}

/// Request graceful shutdown
#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown {
    pub reason: ShutdownReason,
}

// =============================================================================
// Supporting Types
// =============================================================================

/// Agent error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Session {0} was destroyed before reaching the awaited state")]
    SessionDestroyed(SessionId),

    #[error("Actor mailbox error")]
    MailboxError,
}

impl From<actix::MailboxError> for AgentError {
    fn from(_: actix::MailboxError) -> Self {
        AgentError::MailboxError
    }
}

/// Shutdown reasons
#[derive(Clone, Debug)]
pub enum ShutdownReason {
    Requested,
    NodeShutdown,
    Error(String),
}

/// Agent runtime status
#[derive(Clone, Debug, MessageResponse)]
pub struct AgentStatus {
    pub agent_id: AgentId,
    pub active_sessions: usize,
    pub finished_sessions: usize,
    pub stats: AgencyStats,
    pub uptime_secs: u64,
}
