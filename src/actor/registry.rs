// actor/registry.rs - Actor-addressed transport

use std::collections::BTreeSet;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::actor::messages::DeliverMessage;
use crate::message::{AgentId, ContractMessage, Recipient};
use crate::network::Transport;

/// Address book of running agency actors.
///
/// Delivery is a `do_send` into the target's mailbox, so a sender never
/// waits for the receiver and never re-enters itself.
#[derive(Default)]
pub struct ActorTransport {
    /// Agent name -> mailbox
    agents: DashMap<AgentId, actix::Recipient<DeliverMessage>>,

    /// Broadcast group -> members
    groups: DashMap<String, BTreeSet<AgentId>>,
}

impl ActorTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: AgentId, mailbox: actix::Recipient<DeliverMessage>) {
        debug!(agent = %agent, "Registering actor");
        self.agents.insert(agent, mailbox);
    }

    /// Forget an agent and drop it from every group
    pub fn deregister(&self, agent: &AgentId) {
        debug!(agent = %agent, "Deregistering actor");
        self.agents.remove(agent);
        for mut members in self.groups.iter_mut() {
            members.remove(agent);
        }
    }

    pub fn is_registered(&self, agent: &AgentId) -> bool {
        self.agents.contains_key(agent)
    }

    pub fn members(&self, group: &str) -> Vec<AgentId> {
        self.groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn deliver(&self, agent: &AgentId, message: &ContractMessage) {
        match self.agents.get(agent) {
            Some(mailbox) => {
                trace!(to = %agent, kind = message.body.kind_name(), "Delivering");
                mailbox.do_send(DeliverMessage {
                    message: message.clone(),
                });
            }
            None => debug!(to = %agent, "No actor registered for agent, dropping"),
        }
    }
}

impl Transport for ActorTransport {
    fn send(&self, recipients: &[Recipient], message: &ContractMessage) {
        for recipient in recipients {
            match recipient {
                Recipient::Agent(agent) => self.deliver(agent, message),
                Recipient::Broadcast(group) => {
                    for agent in self.members(group) {
                        self.deliver(&agent, message);
                    }
                }
            }
        }
    }

    fn subscribe(&self, agent: &AgentId, group: &str) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(agent.clone());
    }

    fn unsubscribe(&self, agent: &AgentId, group: &str) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(agent);
        }
    }
}
