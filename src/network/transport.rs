// network/transport.rs - Transport contract and in-memory network

use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::message::{AgentId, ContractMessage, Recipient};

/// Delivery of messages by recipient identity.
///
/// Sending only attempts delivery; nothing is acknowledged. Broadcast
/// recipients fan out to whoever is subscribed to the group at send time.
pub trait Transport: Send + Sync {
    fn send(&self, recipients: &[Recipient], message: &ContractMessage);

    /// Join a broadcast group
    fn subscribe(&self, _agent: &AgentId, _group: &str) {}

    /// Leave a broadcast group
    fn unsubscribe(&self, _agent: &AgentId, _group: &str) {}
}

#[derive(Debug, Default)]
struct EmuState {
    mailboxes: HashMap<AgentId, VecDeque<ContractMessage>>,
    groups: HashMap<String, BTreeSet<AgentId>>,
    sent: u64,
}

/// In-memory network: one FIFO mailbox per agent.
///
/// Messages are only queued by [`Transport::send`]; whoever drives the
/// simulation pops them and hands them to the right agency, so delivery never
/// re-enters the sender.
#[derive(Debug, Default)]
pub struct EmuNetwork {
    state: Mutex<EmuState>,
}

impl EmuNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the oldest message queued for `agent`
    pub fn pop(&self, agent: &AgentId) -> Option<ContractMessage> {
        self.state
            .lock()
            .mailboxes
            .get_mut(agent)
            .and_then(|queue| queue.pop_front())
    }

    /// Take every message queued for `agent`
    pub fn drain(&self, agent: &AgentId) -> Vec<ContractMessage> {
        self.state
            .lock()
            .mailboxes
            .get_mut(agent)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, agent: &AgentId) -> usize {
        self.state
            .lock()
            .mailboxes
            .get(agent)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Agents with at least one queued message, in name order
    pub fn agents_with_mail(&self) -> Vec<AgentId> {
        let state = self.state.lock();
        let mut agents: Vec<AgentId> = state
            .mailboxes
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(agent, _)| agent.clone())
            .collect();
        agents.sort();
        agents
    }

    pub fn members(&self, group: &str) -> Vec<AgentId> {
        self.state
            .lock()
            .groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of deliveries made
    pub fn sent(&self) -> u64 {
        self.state.lock().sent
    }
}

impl Transport for EmuNetwork {
    fn send(&self, recipients: &[Recipient], message: &ContractMessage) {
        let mut state = self.state.lock();
        let mut targets: Vec<AgentId> = Vec::new();
        for recipient in recipients {
            match recipient {
                Recipient::Agent(agent) => targets.push(agent.clone()),
                Recipient::Broadcast(group) => {
                    if let Some(members) = state.groups.get(group) {
                        targets.extend(members.iter().cloned());
                    } else {
                        debug!(group = %group, "Broadcast to a group without members");
                    }
                }
            }
        }

        for target in targets {
            trace!(to = %target, kind = message.body.kind_name(), "Queueing message");
            state
                .mailboxes
                .entry(target)
                .or_default()
                .push_back(message.clone());
            state.sent += 1;
        }
    }

    fn subscribe(&self, agent: &AgentId, group: &str) {
        self.state
            .lock()
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(agent.clone());
    }

    fn unsubscribe(&self, agent: &AgentId, group: &str) {
        if let Some(members) = self.state.lock().groups.get_mut(group) {
            members.remove(agent);
        }
    }
}
