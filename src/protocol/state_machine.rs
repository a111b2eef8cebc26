// protocol/state_machine.rs - Generic Protocol State Machine

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::message::{MessageKind, SessionId};

/// Protocol error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Expected state in {expected:?}, was {actual} instead")]
    InvalidState {
        expected: Vec<ContractState>,
        actual: ContractState,
    },

    #[error("Unknown contractor: {0}")]
    UnknownContractor(String),

    #[error("Contractor {contractor} is {state}, expected {expected}")]
    ContractorState {
        contractor: String,
        state: ContractState,
        expected: ContractState,
    },

    #[error("Bid index {index} out of range, {available} bid(s) available")]
    BidIndexOutOfRange { index: usize, available: usize },

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Session {session_id} is not a {expected} session")]
    WrongRole { session_id: SessionId, expected: Role },

    #[error("Message without a sender: {0}")]
    MissingSender(MessageKind),
}

/// Result type returned by agent callbacks
pub type HandlerResult = anyhow::Result<()>;

/// Role in a negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Manager,
    Contractor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Contractor => "contractor",
        }
    }

    /// States a session of this role may ever be in
    pub fn valid_states(&self) -> &'static [ContractState] {
        use ContractState::*;
        match self {
            Role::Manager => &[
                Initiated, Announced, Closed, Granted, Expired, Completed, Cancelled, Aborted, Wtf,
            ],
            Role::Contractor => &[
                Announced,
                Bid,
                Refused,
                Rejected,
                Granted,
                Completed,
                Cancelled,
                Defected,
                Acknowledged,
                Expired,
                Aborted,
                Wtf,
            ],
        }
    }

    /// States after which a session of this role is unregistered
    pub fn terminal_states(&self) -> &'static [ContractState] {
        use ContractState::*;
        match self {
            Role::Manager => &[Expired, Completed, Cancelled, Aborted, Wtf],
            Role::Contractor => &[
                Refused,
                Rejected,
                Expired,
                Cancelled,
                Defected,
                Acknowledged,
                Aborted,
                Wtf,
            ],
        }
    }

    pub fn is_valid(&self, state: ContractState) -> bool {
        self.valid_states().contains(&state)
    }

    pub fn is_terminal(&self, state: ContractState) -> bool {
        self.terminal_states().contains(&state)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract Net states, shared vocabulary of both roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    Initiated,
    Announced,
    Closed,
    Bid,
    Refused,
    Rejected,
    Granted,
    Completed,
    Cancelled,
    Defected,
    Acknowledged,
    Expired,
    Aborted,
    /// We don't know what happened: protocol violation or handler failure
    Wtf,
}

impl ContractState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractState::Initiated => "initiated",
            ContractState::Announced => "announced",
            ContractState::Closed => "closed",
            ContractState::Bid => "bid",
            ContractState::Refused => "refused",
            ContractState::Rejected => "rejected",
            ContractState::Granted => "granted",
            ContractState::Completed => "completed",
            ContractState::Cancelled => "cancelled",
            ContractState::Defected => "defected",
            ContractState::Acknowledged => "acknowledged",
            ContractState::Expired => "expired",
            ContractState::Aborted => "aborted",
            ContractState::Wtf => "wtf",
        }
    }

    /// Forward edges of the contractor graph, as tracked by the manager's registry
    pub fn contractor_can_advance(&self, to: ContractState) -> bool {
        use ContractState::*;
        matches!(
            (self, to),
            (Announced, Bid | Refused | Expired)
                | (Bid, Rejected | Granted | Expired | Cancelled)
                | (Granted, Completed | Cancelled | Defected | Aborted)
                | (Completed, Acknowledged | Cancelled | Aborted)
        )
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Future resolving once a session enters the awaited state.
///
/// Resolves to an error if the session is destroyed first.
#[derive(Debug)]
pub struct StateWait {
    rx: oneshot::Receiver<()>,
}

impl StateWait {
    /// Already satisfied, e.g. by a session that finished in the awaited state
    pub fn resolved() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Self { rx }
    }

    /// Can never be satisfied
    pub fn failed() -> Self {
        let (_, rx) = oneshot::channel();
        Self { rx }
    }
}

impl Future for StateWait {
    type Output = Result<(), oneshot::error::RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx)
    }
}

/// Current state plus state-change notifications.
///
/// Both protocol roles embed one of these; it is the only place a session's
/// state is mutated.
#[derive(Debug)]
pub struct StateMachine {
    role: Role,
    state: ContractState,
    waiters: HashMap<ContractState, Vec<oneshot::Sender<()>>>,
}

impl StateMachine {
    pub fn new(role: Role, initial: ContractState) -> Self {
        debug_assert!(role.is_valid(initial));
        Self {
            role,
            state: initial,
            waiters: HashMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ContractState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.role.is_terminal(self.state)
    }

    pub fn cmp_state(&self, states: &[ContractState]) -> bool {
        states.contains(&self.state)
    }

    pub fn ensure_state(&self, states: &[ContractState]) -> Result<(), ProtocolError> {
        if self.cmp_state(states) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidState {
                expected: states.to_vec(),
                actual: self.state,
            })
        }
    }

    /// Enter `state` and release everyone waiting for it, in registration order
    pub fn set_state(&mut self, state: ContractState) {
        debug_assert!(
            self.role.is_valid(state),
            "{} is not a {} state",
            state,
            self.role
        );
        if self.state != state {
            debug!(role = %self.role, from = %self.state, to = %state, "Changing state");
            self.state = state;
        }
        if let Some(waiters) = self.waiters.remove(&state) {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }

    pub fn wait_for_state(&mut self, state: ContractState) -> StateWait {
        let (tx, rx) = oneshot::channel();
        if self.state == state {
            let _ = tx.send(());
        } else {
            self.waiters.entry(state).or_default().push(tx);
        }
        StateWait { rx }
    }
}

/// State-machine capability of a protocol session
pub trait Stateful {
    fn machine(&self) -> &StateMachine;

    fn machine_mut(&mut self) -> &mut StateMachine;

    fn state(&self) -> ContractState {
        self.machine().state()
    }

    fn wait_for_state(&mut self, state: ContractState) -> StateWait {
        self.machine_mut().wait_for_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_wait_for_current_state_is_ready() {
        let mut machine = StateMachine::new(Role::Contractor, ContractState::Announced);
        let mut wait = task::spawn(machine.wait_for_state(ContractState::Announced));
        assert!(assert_ready!(wait.poll()).is_ok());
    }

    #[test]
    fn test_waiters_released_on_transition() {
        let mut machine = StateMachine::new(Role::Manager, ContractState::Initiated);
        let mut first = task::spawn(machine.wait_for_state(ContractState::Closed));
        let mut second = task::spawn(machine.wait_for_state(ContractState::Closed));
        assert_pending!(first.poll());

        machine.set_state(ContractState::Announced);
        assert_pending!(first.poll());

        // passing through releases waiters even if we do not settle there
        machine.set_state(ContractState::Closed);
        machine.set_state(ContractState::Granted);
        assert!(first.is_woken());
        assert!(assert_ready!(first.poll()).is_ok());
        assert!(assert_ready!(second.poll()).is_ok());
    }

    #[test]
    fn test_dropped_machine_fails_waiters() {
        let mut machine = StateMachine::new(Role::Manager, ContractState::Initiated);
        let mut wait = task::spawn(machine.wait_for_state(ContractState::Completed));
        drop(machine);
        assert!(assert_ready!(wait.poll()).is_err());
    }

    #[test]
    fn test_detached_waits() {
        let mut resolved = task::spawn(StateWait::resolved());
        assert!(assert_ready!(resolved.poll()).is_ok());
        let mut failed = task::spawn(StateWait::failed());
        assert!(assert_ready!(failed.poll()).is_err());
    }

    #[test]
    fn test_ensure_state() {
        let machine = StateMachine::new(Role::Contractor, ContractState::Bid);
        assert!(machine.ensure_state(&[ContractState::Bid]).is_ok());
        let err = machine
            .ensure_state(&[ContractState::Announced])
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidState {
                actual: ContractState::Bid,
                ..
            }
        ));
    }

    #[test]
    fn test_role_vocabularies() {
        assert!(!Role::Manager.is_valid(ContractState::Bid));
        assert!(!Role::Contractor.is_valid(ContractState::Initiated));
        assert!(Role::Contractor.is_terminal(ContractState::Defected));
        assert!(!Role::Manager.is_terminal(ContractState::Granted));
        for role in [Role::Manager, Role::Contractor] {
            for state in role.terminal_states() {
                assert!(role.is_valid(*state));
            }
        }
    }

    #[test]
    fn test_contractor_graph_is_forward_only() {
        assert!(ContractState::Bid.contractor_can_advance(ContractState::Granted));
        assert!(ContractState::Completed.contractor_can_advance(ContractState::Cancelled));
        assert!(!ContractState::Granted.contractor_can_advance(ContractState::Bid));
        assert!(!ContractState::Rejected.contractor_can_advance(ContractState::Granted));
    }
}
