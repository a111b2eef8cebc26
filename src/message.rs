// message.rs - Contract Net wire messages

//! Wire entities exchanged between managers and contractors.
//!
//! Every message carries the session routing header (`session_id`,
//! `protocol_id`), the reply address of its sender and an absolute
//! `expiration_time` by which the sender expects a reply. The body is one of
//! the Contract Net message kinds; any other `type` tag decodes to
//! [`MessageBody::Unknown`], which every dispatch table ignores.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Milliseconds since the Unix epoch, as produced by a [`crate::protocol::Clock`].
pub type Timestamp = i64;

/// Agent identifier
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[display("{name}")]
pub struct AgentId {
    pub name: String,
}

impl AgentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Negotiation session identifier, shared by the manager and all of its contractors
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display, derive_more::From,
)]
pub struct SessionId(pub String);

impl SessionId {
    /// Fresh random session id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Addressing target: a single agent or a broadcast group of unknown size
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(AgentId),
    Broadcast(String),
}

impl Recipient {
    pub fn agent(name: impl Into<String>) -> Self {
        Recipient::Agent(AgentId::new(name))
    }

    pub fn broadcast(group: impl Into<String>) -> Self {
        Recipient::Broadcast(group.into())
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::Broadcast(_))
    }
}

impl From<AgentId> for Recipient {
    fn from(agent: AgentId) -> Self {
        Recipient::Agent(agent)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Agent(agent) => write!(f, "{}", agent),
            Recipient::Broadcast(group) => write!(f, "broadcast:{}", group),
        }
    }
}

/// Work offered by a manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(default)]
    pub payload: Value,
}

/// Offer(s) made by a contractor; a grant selects one by index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    #[serde(default)]
    pub bids: Vec<Value>,
}

/// Reason-carrying body shared by Refusal, Rejection and Cancellation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Reason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

/// Award of a contract to the bid at `bid_index`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub bid_index: usize,
    #[serde(default)]
    pub payload: Value,
    /// Period in milliseconds at which the contractor should send update reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_report: Option<u64>,
}

impl Grant {
    pub fn new(bid_index: usize) -> Self {
        Self {
            bid_index,
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_update_report(mut self, period_ms: u64) -> Self {
        self.update_report = Some(period_ms);
        self
    }
}

/// Progress or result of granted work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {}

/// Message body, tagged on the wire by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Announcement(Announcement),
    Bid(Bid),
    Refusal(Reason),
    Rejection(Reason),
    Grant(Grant),
    Cancellation(Reason),
    FinalReport(Report),
    UpdateReport(Report),
    Acknowledgement(Acknowledgement),
    #[serde(other)]
    Unknown,
}

/// Fieldless discriminant of [`MessageBody`], used as the dispatch key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Announcement,
    Bid,
    Refusal,
    Rejection,
    Grant,
    Cancellation,
    FinalReport,
    UpdateReport,
    Acknowledgement,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Announcement => "announcement",
            MessageKind::Bid => "bid",
            MessageKind::Refusal => "refusal",
            MessageKind::Rejection => "rejection",
            MessageKind::Grant => "grant",
            MessageKind::Cancellation => "cancellation",
            MessageKind::FinalReport => "final_report",
            MessageKind::UpdateReport => "update_report",
            MessageKind::Acknowledgement => "acknowledgement",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MessageBody {
    /// Dispatch key, `None` for bodies this protocol does not understand
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            MessageBody::Announcement(_) => Some(MessageKind::Announcement),
            MessageBody::Bid(_) => Some(MessageKind::Bid),
            MessageBody::Refusal(_) => Some(MessageKind::Refusal),
            MessageBody::Rejection(_) => Some(MessageKind::Rejection),
            MessageBody::Grant(_) => Some(MessageKind::Grant),
            MessageBody::Cancellation(_) => Some(MessageKind::Cancellation),
            MessageBody::FinalReport(_) => Some(MessageKind::FinalReport),
            MessageBody::UpdateReport(_) => Some(MessageKind::UpdateReport),
            MessageBody::Acknowledgement(_) => Some(MessageKind::Acknowledgement),
            MessageBody::Unknown => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind().map(|k| k.as_str()).unwrap_or("unknown")
    }
}

/// Complete Contract Net message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractMessage {
    pub message_id: String,
    pub protocol_id: String,
    pub session_id: SessionId,
    /// Reply address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<AgentId>,
    pub expiration_time: Timestamp,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl ContractMessage {
    pub fn new(
        protocol_id: impl Into<String>,
        session_id: SessionId,
        sender: Option<AgentId>,
        expiration_time: Timestamp,
        body: MessageBody,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            protocol_id: protocol_id.into(),
            session_id,
            sender,
            expiration_time,
            body,
        }
    }

    /// Build a reply in the same session, addressed back through `sender`
    pub fn reply(&self, sender: AgentId, expiration_time: Timestamp, body: MessageBody) -> Self {
        Self::new(
            self.protocol_id.clone(),
            self.session_id.clone(),
            Some(sender),
            expiration_time,
            body,
        )
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.body.kind()
    }

    pub fn bid(&self) -> Option<&Bid> {
        match &self.body {
            MessageBody::Bid(bid) => Some(bid),
            _ => None,
        }
    }

    pub fn grant(&self) -> Option<&Grant> {
        match &self.body {
            MessageBody::Grant(grant) => Some(grant),
            _ => None,
        }
    }

    pub fn report(&self) -> Option<&Report> {
        match &self.body {
            MessageBody::FinalReport(report) | MessageBody::UpdateReport(report) => Some(report),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Refusal(r) | MessageBody::Rejection(r) | MessageBody::Cancellation(r) => {
                r.reason.as_deref()
            }
            _ => None,
        }
    }
}
