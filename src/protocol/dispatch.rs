// protocol/dispatch.rs - Declarative event dispatch

//! Transition tables mapping `(message kind, state before)` to a decision.
//!
//! Each role builds one static [`DispatchTable`] whose actions are a
//! role-specific enum; the session matches on the resolved action to invoke
//! the concrete handler. A kind may map to several decisions as long as
//! exactly one of them accepts the current state.

use std::collections::HashMap;

use crate::message::MessageKind;

use super::state_machine::ContractState;

/// One row of a transition table
#[derive(Debug, Clone)]
pub struct Decision<A> {
    pub before: Vec<ContractState>,
    pub after: ContractState,
    pub action: A,
}

impl<A> Decision<A> {
    pub fn new(before: &[ContractState], after: ContractState, action: A) -> Self {
        Self {
            before: before.to_vec(),
            after,
            action,
        }
    }
}

/// Why an event was not dispatched. None of these are fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown event received, ignoring")]
    UnknownEvent,

    #[error("Received {kind} in state {state}, expected one of {expected:?}")]
    StateMismatch {
        kind: MessageKind,
        state: ContractState,
        expected: Vec<ContractState>,
    },

    #[error("Expected exactly one handler for {kind} in state {state}, found {found}")]
    Ambiguous {
        kind: MessageKind,
        state: ContractState,
        found: usize,
    },
}

impl DispatchError {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            DispatchError::UnknownEvent => "unknown_event",
            DispatchError::StateMismatch { .. } => "state_mismatch",
            DispatchError::Ambiguous { .. } => "ambiguous",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchTable<A> {
    entries: HashMap<MessageKind, Vec<Decision<A>>>,
}

impl<A> Default for DispatchTable<A> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<A> DispatchTable<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a decision for `kind`
    pub fn on(mut self, kind: MessageKind, decision: Decision<A>) -> Self {
        self.entries.entry(kind).or_default().push(decision);
        self
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Resolve the single decision accepting `state` for an event of `kind`
    pub fn resolve(
        &self,
        kind: Option<MessageKind>,
        state: ContractState,
    ) -> Result<&Decision<A>, DispatchError> {
        let kind = kind.ok_or(DispatchError::UnknownEvent)?;
        let decisions = self.entries.get(&kind).ok_or(DispatchError::UnknownEvent)?;

        if let [only] = decisions.as_slice() {
            if only.before.contains(&state) {
                return Ok(only);
            }
            return Err(DispatchError::StateMismatch {
                kind,
                state,
                expected: only.before.clone(),
            });
        }

        let mut matching = decisions.iter().filter(|d| d.before.contains(&state));
        match (matching.next(), matching.next()) {
            (Some(decision), None) => Ok(decision),
            (None, _) => Err(DispatchError::StateMismatch {
                kind,
                state,
                expected: decisions
                    .iter()
                    .flat_map(|d| d.before.iter().copied())
                    .collect(),
            }),
            (Some(_), Some(_)) => Err(DispatchError::Ambiguous {
                kind,
                state,
                found: 2 + matching.count(),
            }),
        }
    }
}
