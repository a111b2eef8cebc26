// protocol/contractor.rs - Contractor role of the Contract Net protocol

//! The contractor side of a negotiation.
//!
//! A [`ContractorSession`] is created by the agency when an announcement
//! arrives for a protocol the agent registered interest in. The agent's
//! [`ContractorHandler`] decides whether to bid, and later carries out the
//! granted work through the [`ContractorMedium`].
//!
//! ```text
//! announced --bid()--> bid --Grant--> granted --finalize()--> completed --Ack--> acknowledged
//!     |                 |               |                        |
//!  refuse()          Rejection       defect()               Cancellation
//!     v                 v               v                        v
//!  refused           rejected        defected                cancelled
//! ```

use std::any::Any;
use std::sync::{Arc, LazyLock};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::message::{
    AgentId, Bid, ContractMessage, MessageBody, MessageKind, Reason, Report, SessionId, Timestamp,
};
use crate::observability::{
    record_message_dropped, record_message_received, record_session_finished,
    record_session_started,
};

use super::context::AgentContext;
use super::dispatch::{Decision, DispatchTable};
use super::expiration::{Expiration, ExpirationOwner, TimerId};
use super::listener::{log_session_failure, Listener, SessionSummary};
use super::state_machine::{
    ContractState, HandlerResult, ProtocolError, Role, StateMachine, StateWait, Stateful,
};

/// Agent-side callbacks of a contractor.
///
/// Callbacks returning an error move the session to `wtf`.
pub trait ContractorHandler: Send {
    /// A new announcement; normally answered with [`ContractorMedium::bid`]
    /// or [`ContractorMedium::refuse`]
    fn announced(&mut self, medium: &mut ContractorMedium, announcement: &ContractMessage)
    -> HandlerResult;

    fn announce_expired(&mut self) -> HandlerResult {
        Ok(())
    }

    fn bid_expired(&mut self) -> HandlerResult {
        Ok(())
    }

    fn rejected(&mut self, _rejection: &ContractMessage) -> HandlerResult {
        Ok(())
    }

    fn granted(&mut self, medium: &mut ContractorMedium, grant: &ContractMessage) -> HandlerResult;

    fn cancelled(&mut self, _cancellation: &ContractMessage) -> HandlerResult {
        Ok(())
    }

    fn acknowledged(&mut self, _ack: &ContractMessage) -> HandlerResult {
        Ok(())
    }

    fn aborted(&mut self) -> HandlerResult {
        Ok(())
    }

    /// Payload of the next periodic update report, `None` skips this period
    fn update_report(&mut self) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractorTimer {
    Announce,
    Bid,
    Grant,
    Ack,
    UpdateReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContractorAction {
    OnRejection,
    OnGrant,
    OnCancellation,
    OnAcknowledgement,
}

static CONTRACTOR_TABLE: LazyLock<DispatchTable<ContractorAction>> = LazyLock::new(|| {
    DispatchTable::new()
        .on(
            MessageKind::Rejection,
            Decision::new(
                &[ContractState::Bid],
                ContractState::Rejected,
                ContractorAction::OnRejection,
            ),
        )
        .on(
            MessageKind::Grant,
            Decision::new(
                &[ContractState::Bid],
                ContractState::Granted,
                ContractorAction::OnGrant,
            ),
        )
        .on(
            MessageKind::Cancellation,
            Decision::new(
                &[ContractState::Granted],
                ContractState::Cancelled,
                ContractorAction::OnCancellation,
            ),
        )
        .on(
            MessageKind::Cancellation,
            Decision::new(
                &[ContractState::Completed],
                ContractState::Cancelled,
                ContractorAction::OnCancellation,
            ),
        )
        .on(
            MessageKind::Acknowledgement,
            Decision::new(
                &[ContractState::Completed],
                ContractState::Acknowledged,
                ContractorAction::OnAcknowledgement,
            ),
        )
});

/// What the contractor agent can see and do within one negotiation
#[derive(Debug)]
pub struct ContractorMedium {
    ctx: Arc<AgentContext>,
    session_id: SessionId,
    protocol_id: String,
    manager: AgentId,
    machine: StateMachine,
    expiration: Expiration<ContractorTimer>,
    reporter: Expiration<ContractorTimer>,
    announcement: ContractMessage,
    bids: Vec<Value>,
    grant: Option<ContractMessage>,
}

impl ContractorMedium {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    pub fn agent(&self) -> &AgentId {
        &self.ctx.agent
    }

    pub fn manager(&self) -> &AgentId {
        &self.manager
    }

    pub fn announcement(&self) -> &ContractMessage {
        &self.announcement
    }

    /// Bids sent to the manager
    pub fn bids(&self) -> &[Value] {
        &self.bids
    }

    pub fn grant(&self) -> Option<&ContractMessage> {
        self.grant.as_ref()
    }

    pub fn now(&self) -> Timestamp {
        self.ctx.now()
    }

    /// Offer `bids` to the manager and wait for its decision
    pub fn bid(&mut self, bids: Vec<Value>) -> Result<(), ProtocolError> {
        self.machine.ensure_state(&[ContractState::Announced])?;
        let deadline = self.ctx.now() + self.ctx.timeouts.bid_ms;
        self.send(deadline, MessageBody::Bid(Bid { bids: bids.clone() }));
        self.bids = bids;
        self.machine.set_state(ContractState::Bid);
        self.arm(deadline, ContractorTimer::Bid, Some(ContractState::Expired));
        Ok(())
    }

    /// Decline the announcement. Terminal.
    pub fn refuse(&mut self, reason: Option<String>) -> Result<(), ProtocolError> {
        self.machine.ensure_state(&[ContractState::Announced])?;
        self.send(
            self.ctx.notice_deadline(),
            MessageBody::Refusal(Reason { reason }),
        );
        self.cancel_timers();
        self.machine.set_state(ContractState::Refused);
        Ok(())
    }

    /// Report progress on granted work
    pub fn update_report(&mut self, payload: Value) -> Result<(), ProtocolError> {
        self.machine.ensure_state(&[ContractState::Granted])?;
        self.send(
            self.ctx.notice_deadline(),
            MessageBody::UpdateReport(Report { payload }),
        );
        Ok(())
    }

    /// Deliver the result of granted work and wait for the acknowledgement
    pub fn finalize(&mut self, payload: Value) -> Result<(), ProtocolError> {
        self.machine.ensure_state(&[ContractState::Granted])?;
        let deadline = self.ctx.now() + self.ctx.timeouts.ack_ms;
        self.send(deadline, MessageBody::FinalReport(Report { payload }));
        self.reporter.cancel();
        self.machine.set_state(ContractState::Completed);
        self.arm(deadline, ContractorTimer::Ack, Some(ContractState::Aborted));
        Ok(())
    }

    /// Walk away from granted work. Terminal.
    pub fn defect(&mut self, reason: Option<String>) -> Result<(), ProtocolError> {
        self.machine.ensure_state(&[ContractState::Granted])?;
        self.send(
            self.ctx.notice_deadline(),
            MessageBody::Cancellation(Reason { reason }),
        );
        self.cancel_timers();
        self.machine.set_state(ContractState::Defected);
        Ok(())
    }

    fn send(&self, expiration_time: Timestamp, body: MessageBody) {
        let msg = self
            .announcement
            .reply(self.ctx.agent.clone(), expiration_time, body);
        self.ctx.send_to(&self.manager, &msg);
    }

    fn arm(&mut self, deadline: Timestamp, kind: ContractorTimer, resulting: Option<ContractState>) {
        self.expiration.arm(
            self.ctx.scheduler.as_ref(),
            self.ctx.now(),
            self.ctx.agent.clone(),
            self.session_id.clone(),
            deadline,
            kind,
            resulting,
        );
    }

    fn arm_reporter(&mut self, period_ms: u64) {
        let deadline = self.ctx.now() + period_ms as i64;
        self.reporter.arm(
            self.ctx.scheduler.as_ref(),
            self.ctx.now(),
            self.ctx.agent.clone(),
            self.session_id.clone(),
            deadline,
            ContractorTimer::UpdateReport,
            None,
        );
    }

    fn cancel_timers(&mut self) {
        self.cancel_expiration_call();
        self.reporter.cancel();
    }

    fn fail(&mut self, during: &str, err: &anyhow::Error) {
        log_session_failure(Role::Contractor, &self.session_id, during, err);
        self.cancel_timers();
        self.machine.set_state(ContractState::Wtf);
    }
}

impl Stateful for ContractorMedium {
    fn machine(&self) -> &StateMachine {
        &self.machine
    }

    fn machine_mut(&mut self) -> &mut StateMachine {
        &mut self.machine
    }
}

impl ExpirationOwner for ContractorMedium {
    type Kind = ContractorTimer;

    fn expiration(&mut self) -> &mut Expiration<ContractorTimer> {
        &mut self.expiration
    }
}

/// A contractor negotiation: the medium plus the agent's handler
pub struct ContractorSession {
    medium: ContractorMedium,
    handler: Box<dyn ContractorHandler>,
    finished: bool,
}

impl ContractorSession {
    /// Session answering `announcement`; fails if the announcement has no reply address
    pub fn new(
        ctx: Arc<AgentContext>,
        handler: Box<dyn ContractorHandler>,
        announcement: &ContractMessage,
    ) -> Result<Self, ProtocolError> {
        let manager = announcement
            .sender
            .clone()
            .ok_or(ProtocolError::MissingSender(MessageKind::Announcement))?;

        Ok(Self {
            medium: ContractorMedium {
                ctx,
                session_id: announcement.session_id.clone(),
                protocol_id: announcement.protocol_id.clone(),
                manager,
                machine: StateMachine::new(Role::Contractor, ContractState::Announced),
                expiration: Expiration::default(),
                reporter: Expiration::default(),
                announcement: announcement.clone(),
                bids: Vec::new(),
                grant: None,
            },
            handler,
            finished: false,
        })
    }

    /// Arm the announce timer and hand the announcement to the handler
    pub fn start(&mut self) {
        record_session_started(Role::Contractor.as_str(), &self.medium.protocol_id);
        debug!(
            session_id = %self.medium.session_id,
            manager = %self.medium.manager,
            "Contractor session started"
        );
        let deadline = self.medium.announcement.expiration_time;
        self.medium
            .arm(deadline, ContractorTimer::Announce, Some(ContractState::Expired));
        let announcement = self.medium.announcement.clone();
        self.guarded("announced", |handler, medium| {
            handler.announced(medium, &announcement)
        });
        self.finish_if_terminal();
    }

    pub fn medium(&self) -> &ContractorMedium {
        &self.medium
    }

    /// Run an agent-initiated operation (finalize, defect, ...) inside the
    /// session's error boundary
    pub fn act<F>(&mut self, operation: F)
    where
        F: FnOnce(&mut ContractorMedium) -> HandlerResult,
    {
        if let Err(err) = operation(&mut self.medium) {
            self.medium.fail("act", &err);
        }
        self.finish_if_terminal();
    }

    fn guarded<F>(&mut self, callback: &'static str, f: F)
    where
        F: FnOnce(&mut dyn ContractorHandler, &mut ContractorMedium) -> HandlerResult,
    {
        if let Err(err) = f(self.handler.as_mut(), &mut self.medium) {
            self.medium.fail(callback, &err);
        }
    }

    fn check_grant(&self, msg: &ContractMessage) -> Result<(), ProtocolError> {
        let index = msg.grant().map(|g| g.bid_index).unwrap_or_default();
        let available = self.medium.bids.len();
        if index >= available {
            return Err(ProtocolError::BidIndexOutOfRange { index, available });
        }
        Ok(())
    }

    fn on_grant(&mut self, msg: &ContractMessage) {
        self.medium.grant = Some(msg.clone());
        self.medium.arm(
            msg.expiration_time,
            ContractorTimer::Grant,
            Some(ContractState::Aborted),
        );
        if let Some(period) = msg.grant().and_then(|g| g.update_report) {
            self.medium.arm_reporter(period);
        }
        self.guarded("granted", |handler, medium| handler.granted(medium, msg));
    }

    fn send_periodic_report(&mut self) {
        if self.medium.machine.state() != ContractState::Granted {
            return;
        }
        match self.handler.update_report() {
            Ok(Some(payload)) => {
                if let Err(err) = self.medium.update_report(payload) {
                    self.medium.fail("update_report", &err.into());
                }
            }
            Ok(None) => {}
            Err(err) => self.medium.fail("update_report", &err),
        }

        let period = self
            .medium
            .grant
            .as_ref()
            .and_then(|g| g.grant())
            .and_then(|g| g.update_report);
        if let (ContractState::Granted, Some(period)) = (self.medium.machine.state(), period) {
            self.medium.arm_reporter(period);
        }
        self.finish_if_terminal();
    }

    fn finish_if_terminal(&mut self) {
        if self.finished || !self.medium.machine.is_terminal() {
            return;
        }
        self.finished = true;
        self.medium.cancel_timers();
        let state = self.medium.machine.state();
        record_session_finished(Role::Contractor.as_str(), state.as_str());
        info!(
            session_id = %self.medium.session_id,
            protocol_id = %self.medium.protocol_id,
            state = %state,
            "Contractor session finished"
        );
    }
}

impl Listener for ContractorSession {
    fn session_id(&self) -> &SessionId {
        &self.medium.session_id
    }

    fn protocol_id(&self) -> &str {
        &self.medium.protocol_id
    }

    fn role(&self) -> Role {
        Role::Contractor
    }

    fn state(&self) -> ContractState {
        self.medium.machine.state()
    }

    fn on_message(&mut self, msg: &ContractMessage) {
        record_message_received(msg.body.kind_name());
        if msg.sender.as_ref().is_some_and(|s| s != &self.medium.manager) {
            warn!(
                session_id = %self.medium.session_id,
                sender = ?msg.sender,
                "Message from someone other than our manager, dropping"
            );
            record_message_dropped("foreign_sender");
            return;
        }

        let state = self.medium.machine.state();
        let decision = match CONTRACTOR_TABLE.resolve(msg.kind(), state) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(
                    session_id = %self.medium.session_id,
                    kind = msg.body.kind_name(),
                    state = %state,
                    "{}", err
                );
                record_message_dropped(err.reason());
                return;
            }
        };

        if decision.action == ContractorAction::OnGrant {
            if let Err(err) = self.check_grant(msg) {
                self.medium.fail("grant", &err.into());
                self.finish_if_terminal();
                return;
            }
        }

        self.medium.machine.set_state(decision.after);
        match decision.action {
            ContractorAction::OnGrant => self.on_grant(msg),
            ContractorAction::OnRejection => {
                self.medium.cancel_timers();
                self.guarded("rejected", |handler, _| handler.rejected(msg));
            }
            ContractorAction::OnCancellation => {
                self.medium.cancel_timers();
                self.guarded("cancelled", |handler, _| handler.cancelled(msg));
            }
            ContractorAction::OnAcknowledgement => {
                self.medium.cancel_timers();
                self.guarded("acknowledged", |handler, _| handler.acknowledged(msg));
            }
        }
        self.finish_if_terminal();
    }

    fn on_timer(&mut self, timer_id: TimerId) {
        if self.medium.reporter.is_current(timer_id) {
            self.medium.reporter.fire(timer_id);
            self.send_periodic_report();
            return;
        }

        let Some(expired) = self.medium.expiration.fire(timer_id) else {
            return;
        };
        debug!(
            session_id = %self.medium.session_id,
            kind = ?expired.kind,
            "Expiration call fired"
        );
        if let Some(state) = expired.resulting_state {
            self.medium.machine.set_state(state);
        }
        match expired.kind {
            ContractorTimer::Announce => {
                self.guarded("announce_expired", |handler, _| handler.announce_expired())
            }
            ContractorTimer::Bid => self.guarded("bid_expired", |handler, _| handler.bid_expired()),
            ContractorTimer::Grant | ContractorTimer::Ack => {
                self.guarded("aborted", |handler, _| handler.aborted())
            }
            ContractorTimer::UpdateReport => {}
        }
        self.finish_if_terminal();
    }

    fn wait_for_state(&mut self, state: ContractState) -> StateWait {
        self.medium.wait_for_state(state)
    }

    fn terminate(&mut self) {
        self.medium.cancel_timers();
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.medium.session_id.clone(),
            protocol_id: self.medium.protocol_id.clone(),
            role: Role::Contractor,
            state: self.medium.machine.state(),
            contractors: Vec::new(),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
