// lib.rs - FIPA Contract Net Negotiation Engine
//
// Manager and contractor state machines for the FIPA Contract Net protocol,
// hosted by per-agent agencies on an emulated network or as actix actors.

#![doc = include_str!("../README.md")]

pub mod actor;
pub mod agency;
pub mod config;
pub mod message;
pub mod network;
pub mod observability;
pub mod protocol;

// Re-export commonly used types
pub use actor::{
    ActorTransport, AgencyActor, AgentError, AgentStatus, DeliverMessage, InitiateManager,
    RegisterInterest, ShutdownReason, WaitForState,
};

pub use agency::{Agency, AgencyStats, ContractorFactory, Emulation, InterestType};

pub use config::{AgencyConfig, ConfigError, ProtocolTimeouts};

pub use message::{AgentId, ContractMessage, MessageBody, MessageKind, Recipient, SessionId};

pub use protocol::{
    ContractState, ContractorHandler, ContractorMedium, HandlerResult, ManagerHandler,
    ManagerMedium, ProtocolError, Role,
};

pub use observability::{
    init_metrics, init_tracing, MetricsConfig, TracingConfig, TracingFormat,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::actor::{
        ActorTransport, AgencyActor, AgentError, GetSummary, InitiateManager, RegisterInterest,
        Shutdown, ShutdownReason, WaitForState, WithContractor, WithManager,
    };
    pub use crate::agency::{Agency, Emulation, InterestType};
    pub use crate::config::{AgencyConfig, ProtocolTimeouts};
    pub use crate::message::{
        AgentId, ContractMessage, Grant, MessageBody, MessageKind, Recipient, SessionId,
    };
    pub use crate::protocol::{
        ContractState, ContractorHandler, ContractorMedium, HandlerResult, ManagerHandler,
        ManagerMedium, ProtocolError, Role,
    };
}
