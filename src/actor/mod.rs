// actor/mod.rs - Actor Module

//! Real-time agent runtime using Actix.
//!
//! - `AgencyActor` - runs one agent's [`crate::agency::Agency`], with timers
//!   scheduled on tokio and fed back through the actor's mailbox
//! - `ActorTransport` - delivers messages between agency actors by name and
//!   broadcast group
//!
//! # Example
//!
//! ```ignore
//! use fipa_contract_net::actor::*;
//!
//! let transport = Arc::new(ActorTransport::new());
//! let alice = AgencyActor::new(AgentId::new("alice"), transport.clone(), config).start();
//!
//! let session_id = alice.send(InitiateManager {
//!     handler: Box::new(Cheapest),
//!     recipients: vec![Recipient::broadcast("delivery")],
//! }).await?;
//!
//! alice.send(WaitForState {
//!     session_id,
//!     state: ContractState::Completed,
//! }).await??;
//! ```

mod agent_actor;
mod messages;
mod registry;

pub use agent_actor::AgencyActor;
pub use messages::*;
pub use registry::ActorTransport;
