// protocol/context.rs - Per-agent collaborators shared by all sessions

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::config::ProtocolTimeouts;
use crate::message::{AgentId, ContractMessage, Recipient, Timestamp};
use crate::network::Transport;
use crate::observability::record_message_sent;

use super::expiration::{Clock, Scheduler};

/// Everything a session needs from the outside world
#[derive(Clone)]
pub struct AgentContext {
    pub agent: AgentId,
    pub transport: Arc<dyn Transport>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub timeouts: ProtocolTimeouts,
}

impl AgentContext {
    pub fn new(
        agent: AgentId,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        timeouts: ProtocolTimeouts,
    ) -> Self {
        Self {
            agent,
            transport,
            scheduler,
            clock,
            timeouts,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Deadline carried by notices that expect no reply
    pub fn notice_deadline(&self) -> Timestamp {
        self.now() + self.timeouts.message_ttl_ms
    }

    pub fn send(&self, recipients: &[Recipient], message: &ContractMessage) {
        trace!(
            from = %self.agent,
            session_id = %message.session_id,
            kind = message.body.kind_name(),
            recipients = recipients.len(),
            "Sending message"
        );
        record_message_sent(message.body.kind_name(), recipients.len());
        self.transport.send(recipients, message);
    }

    pub fn send_to(&self, agent: &AgentId, message: &ContractMessage) {
        self.send(&[Recipient::Agent(agent.clone())], message);
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent", &self.agent)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}
