// protocol/mod.rs - Contract Net Protocol Implementation

//! Contract Net negotiation: the manager and contractor roles, the
//! declarative dispatch core both are built on, and their timers.
//!
//! - `StateMachine` / `DispatchTable` - state bookkeeping and
//!   `(message kind, state) -> decision` tables
//! - `Expiration` - the single outstanding timer of a session
//! - `ManagerSession` / `ContractorSession` - the two roles, driven by
//!   agent-supplied `ManagerHandler` / `ContractorHandler` callbacks
//! - `ContractorRegistry` - what a manager knows about each contractor
//!
//! # Example
//!
//! ```ignore
//! use fipa_contract_net::protocol::*;
//!
//! struct Cheapest;
//!
//! impl ManagerHandler for Cheapest {
//!     fn protocol_id(&self) -> &str { "transport" }
//!
//!     fn initiate(&mut self, medium: &mut ManagerMedium) -> HandlerResult {
//!         medium.announce(json!({"from": "A", "to": "B"}))?;
//!         Ok(())
//!     }
//!
//!     fn closed(&mut self, medium: &mut ManagerMedium) -> HandlerResult {
//!         if let Some(best) = medium.registry().with_state(ContractState::Bid).next() {
//!             let best = best.contractor.clone();
//!             medium.grant(&best, Grant::new(0))?;
//!         }
//!         Ok(())
//!     }
//! }
//! ```

mod context;
mod contractor;
mod dispatch;
mod expiration;
mod listener;
mod manager;
mod registry;
mod state_machine;

pub use context::AgentContext;
pub use contractor::{ContractorHandler, ContractorMedium, ContractorSession, ContractorTimer};
pub use dispatch::{Decision, DispatchError, DispatchTable};
pub use expiration::{
    ArmedTimer, Clock, Expiration, ExpirationOwner, Expired, ManualClock, ManualScheduler,
    Scheduler, SystemClock, TimerEvent, TimerHandle, TimerId, TokioScheduler,
};
pub use listener::{Listener, SessionSummary};
pub use manager::{ManagerHandler, ManagerMedium, ManagerSession, ManagerTimer};
pub use registry::{ContractorEntry, ContractorRegistry};
pub use state_machine::{
    ContractState, HandlerResult, ProtocolError, Role, StateMachine, StateWait, Stateful,
};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::config::ProtocolTimeouts;
    use crate::message::{
        AgentId, Announcement, ContractMessage, MessageBody, MessageKind, SessionId, Timestamp,
    };
    use crate::network::EmuNetwork;

    /// Ordered record of the callbacks a test handler saw
    #[derive(Debug, Clone, Default)]
    pub struct Calls(Arc<Mutex<Vec<String>>>);

    impl Calls {
        pub fn push(&self, call: impl Into<String>) {
            self.0.lock().push(call.into());
        }

        pub fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    /// One agent wired to a virtual clock, a virtual scheduler and an
    /// emulated network, talking to a peer called `manager`
    pub struct TestBed {
        pub clock: Arc<ManualClock>,
        pub scheduler: Arc<ManualScheduler>,
        pub network: Arc<EmuNetwork>,
        pub manager: AgentId,
        pub session_id: SessionId,
        ctx: Arc<AgentContext>,
    }

    impl TestBed {
        pub fn new() -> Self {
            Self::for_agent("contractor")
        }

        pub fn for_agent(name: &str) -> Self {
            let clock = Arc::new(ManualClock::new(0));
            let scheduler = Arc::new(ManualScheduler::new());
            let network = Arc::new(EmuNetwork::new());
            let ctx = Arc::new(AgentContext::new(
                AgentId::new(name),
                network.clone(),
                scheduler.clone(),
                clock.clone(),
                ProtocolTimeouts::default(),
            ));
            Self {
                clock,
                scheduler,
                network,
                manager: AgentId::new("manager"),
                session_id: SessionId::from("s-1"),
                ctx,
            }
        }

        pub fn ctx(&self) -> Arc<AgentContext> {
            self.ctx.clone()
        }

        pub fn now(&self) -> Timestamp {
            self.clock.now()
        }

        pub fn from(&self, sender: &AgentId, expiration_time: Timestamp, body: MessageBody) -> ContractMessage {
            ContractMessage::new(
                "dummy-contract",
                self.session_id.clone(),
                Some(sender.clone()),
                expiration_time,
                body,
            )
        }

        pub fn from_manager(&self, expiration_time: Timestamp, body: MessageBody) -> ContractMessage {
            self.from(&self.manager, expiration_time, body)
        }

        pub fn announcement(&self, expiration_time: Timestamp) -> ContractMessage {
            self.from_manager(
                expiration_time,
                MessageBody::Announcement(Announcement::default()),
            )
        }

        /// Take everything sent to `to` and return the message kinds
        pub fn sent_kinds(&self, to: &AgentId) -> Vec<MessageKind> {
            self.network
                .drain(to)
                .iter()
                .filter_map(ContractMessage::kind)
                .collect()
        }

        /// Move the clock to `target`, firing due timers into `listener` on the way
        pub fn advance_to(&self, target: Timestamp, listener: &mut dyn Listener) {
            while let Some(deadline) = self.scheduler.next_deadline() {
                if deadline > target {
                    break;
                }
                self.clock.set(deadline.max(self.now()));
                for event in self.scheduler.due(deadline) {
                    listener.on_timer(event.timer_id);
                }
            }
            self.clock.set(target);
        }
    }
}
