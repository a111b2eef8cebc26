// protocol/registry.rs - Manager-side bookkeeping of contractors

//! One entry per contractor that answered an announcement, in first-contact
//! order. The sub-state mirrors the contractor's own state machine as far as
//! the manager can observe it, and only ever moves forward.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::message::{AgentId, ContractMessage};

use super::state_machine::{ContractState, ProtocolError};

/// Manager's view of one contractor
#[derive(Debug, Clone, Serialize)]
pub struct ContractorEntry {
    pub contractor: AgentId,
    pub state: ContractState,
    /// Last bid received, if any
    pub bid: Option<ContractMessage>,
    /// Grant sent to this contractor, if any
    pub grant: Option<ContractMessage>,
    /// Final report received, if any
    pub report: Option<ContractMessage>,
}

impl ContractorEntry {
    pub fn bids(&self) -> &[Value] {
        self.bid
            .as_ref()
            .and_then(ContractMessage::bid)
            .map(|bid| bid.bids.as_slice())
            .unwrap_or_default()
    }

    pub fn is_granted(&self) -> bool {
        self.grant.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContractorRegistry {
    entries: Vec<ContractorEntry>,
}

impl ContractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record first contact with `contractor`. Returns `false`, leaving the
    /// registry untouched, if the contractor already has an entry.
    pub fn register(&mut self, contractor: AgentId, state: ContractState, msg: &ContractMessage) -> bool {
        if self.get(&contractor).is_some() {
            return false;
        }
        let bid = matches!(state, ContractState::Bid).then(|| msg.clone());
        self.entries.push(ContractorEntry {
            contractor,
            state,
            bid,
            grant: None,
            report: None,
        });
        true
    }

    pub fn get(&self, contractor: &AgentId) -> Option<&ContractorEntry> {
        self.entries.iter().find(|e| &e.contractor == contractor)
    }

    pub fn get_mut(&mut self, contractor: &AgentId) -> Option<&mut ContractorEntry> {
        self.entries.iter_mut().find(|e| &e.contractor == contractor)
    }

    /// Move `contractor` to `to` if that is a forward edge of the contractor graph
    pub fn advance(&mut self, contractor: &AgentId, to: ContractState) -> bool {
        match self.get_mut(contractor) {
            Some(entry) if entry.state.contractor_can_advance(to) => {
                entry.state = to;
                true
            }
            Some(entry) => {
                warn!(
                    contractor = %contractor,
                    from = %entry.state,
                    to = %to,
                    "Refusing to move contractor backwards"
                );
                false
            }
            None => false,
        }
    }

    /// Check that `contractor` has an open bid containing `bid_index`
    pub fn validate_grant(&self, contractor: &AgentId, bid_index: usize) -> Result<(), ProtocolError> {
        let entry = self.require(contractor, ContractState::Bid)?;
        let available = entry.bids().len();
        if bid_index >= available {
            return Err(ProtocolError::BidIndexOutOfRange {
                index: bid_index,
                available,
            });
        }
        Ok(())
    }

    /// Look up `contractor` and check it is in `expected`
    pub fn require(
        &self,
        contractor: &AgentId,
        expected: ContractState,
    ) -> Result<&ContractorEntry, ProtocolError> {
        let entry = self
            .get(contractor)
            .ok_or_else(|| ProtocolError::UnknownContractor(contractor.to_string()))?;
        if entry.state != expected {
            return Err(ProtocolError::ContractorState {
                contractor: contractor.to_string(),
                state: entry.state,
                expected,
            });
        }
        Ok(entry)
    }

    pub fn with_state(&self, state: ContractState) -> impl Iterator<Item = &ContractorEntry> {
        self.entries.iter().filter(move |e| e.state == state)
    }

    pub fn count(&self, state: ContractState) -> usize {
        self.with_state(state).count()
    }

    /// Contractors in any of `states`, in registry order
    pub fn contractors_in(&self, states: &[ContractState]) -> Vec<AgentId> {
        self.entries
            .iter()
            .filter(|e| states.contains(&e.state))
            .map(|e| e.contractor.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContractorEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Bid, MessageBody, Reason, SessionId};
    use serde_json::json;

    fn bid_from(name: &str, bids: Vec<Value>) -> ContractMessage {
        ContractMessage::new(
            "dummy-contract",
            SessionId::from("s"),
            Some(AgentId::new(name)),
            100,
            MessageBody::Bid(Bid { bids }),
        )
    }

    #[test]
    fn test_first_contact_order_and_duplicates() {
        let mut registry = ContractorRegistry::new();
        let (a, b) = (AgentId::new("a"), AgentId::new("b"));
        assert!(registry.register(b.clone(), ContractState::Bid, &bid_from("b", vec![json!(3)])));
        let refusal = ContractMessage::new(
            "dummy-contract",
            SessionId::from("s"),
            Some(a.clone()),
            100,
            MessageBody::Refusal(Reason::default()),
        );
        assert!(registry.register(a.clone(), ContractState::Refused, &refusal));
        assert!(!registry.register(b.clone(), ContractState::Bid, &bid_from("b", vec![json!(1)])));

        let order: Vec<_> = registry.iter().map(|e| e.contractor.name.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(registry.get(&b).unwrap().bids(), &[json!(3)]);
        assert!(registry.get(&a).unwrap().bid.is_none());
        assert_eq!(registry.count(ContractState::Bid), 1);
    }

    #[test]
    fn test_advance_is_forward_only() {
        let mut registry = ContractorRegistry::new();
        let a = AgentId::new("a");
        registry.register(a.clone(), ContractState::Bid, &bid_from("a", vec![json!(1)]));

        assert!(registry.advance(&a, ContractState::Granted));
        assert!(!registry.advance(&a, ContractState::Bid));
        assert!(registry.advance(&a, ContractState::Completed));
        assert!(registry.advance(&a, ContractState::Cancelled));
        assert!(!registry.advance(&a, ContractState::Acknowledged));
        assert!(!registry.advance(&AgentId::new("ghost"), ContractState::Granted));
    }

    #[test]
    fn test_validate_grant() {
        let mut registry = ContractorRegistry::new();
        let a = AgentId::new("a");
        registry.register(a.clone(), ContractState::Bid, &bid_from("a", vec![json!(1), json!(2)]));

        assert!(registry.validate_grant(&a, 1).is_ok());
        assert_eq!(
            registry.validate_grant(&a, 2),
            Err(ProtocolError::BidIndexOutOfRange {
                index: 2,
                available: 2
            })
        );
        assert!(matches!(
            registry.validate_grant(&AgentId::new("ghost"), 0),
            Err(ProtocolError::UnknownContractor(_))
        ));

        registry.advance(&a, ContractState::Rejected);
        assert!(matches!(
            registry.validate_grant(&a, 0),
            Err(ProtocolError::ContractorState {
                state: ContractState::Rejected,
                ..
            })
        ));
    }
}
