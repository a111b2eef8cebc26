// protocol/manager.rs - Manager role of the Contract Net protocol

//! The initiating side of a negotiation.
//!
//! A [`ManagerSession`] announces work to a set of recipients, collects bids
//! and refusals into its [`ContractorRegistry`], lets the agent grant or
//! reject each bid, then follows the granted contractors until all of them
//! complete, one of them defects or the grant deadline passes.
//!
//! Transitions that follow from the registry (closing once every expected
//! contractor replied, completing once every granted contractor reported,
//! cascading a cancellation) are evaluated after every event by
//! [`ManagerSession::advance`].

use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::message::{
    AgentId, Acknowledgement, Announcement, ContractMessage, Grant, MessageBody, MessageKind,
    Reason, Recipient, SessionId, Timestamp,
};
use crate::observability::{
    record_message_dropped, record_message_received, record_session_finished,
    record_session_started,
};

use super::context::AgentContext;
use super::dispatch::{Decision, DispatchTable};
use super::expiration::{Expiration, ExpirationOwner, TimerId};
use super::listener::{log_session_failure, Listener, SessionSummary};
use super::registry::{ContractorEntry, ContractorRegistry};
use super::state_machine::{
    ContractState, HandlerResult, ProtocolError, Role, StateMachine, StateWait, Stateful,
};

/// Agent-side callbacks of a manager.
///
/// Exactly one of `expired`, `cancelled`, `completed` or `aborted` is called
/// per session, unless the session fails and ends up in `wtf`.
pub trait ManagerHandler: Send {
    fn protocol_id(&self) -> &str;

    /// Called once the session is registered; normally calls
    /// [`ManagerMedium::announce`]
    fn initiate(&mut self, medium: &mut ManagerMedium) -> HandlerResult;

    /// A bid arrived while the announcement is open. Granting or rejecting
    /// from here is allowed.
    fn bid(&mut self, _medium: &mut ManagerMedium, _bid: &ContractMessage) -> HandlerResult {
        Ok(())
    }

    fn refused(&mut self, _medium: &mut ManagerMedium, _refusal: &ContractMessage) -> HandlerResult {
        Ok(())
    }

    /// Bidding is over. Open bids left after this returns are rejected.
    fn closed(&mut self, medium: &mut ManagerMedium) -> HandlerResult;

    /// Nobody bid, or the announcement was never sent
    fn expired(&mut self) -> HandlerResult {
        Ok(())
    }

    /// `None` when nothing was granted, otherwise the defector's cancellation
    fn cancelled(&mut self, _cancellation: Option<&ContractMessage>) -> HandlerResult {
        Ok(())
    }

    /// Final reports of every granted contractor, in registry order
    fn completed(&mut self, _reports: &[ContractMessage]) -> HandlerResult {
        Ok(())
    }

    /// Granted work was not reported in time
    fn aborted(&mut self) -> HandlerResult {
        Ok(())
    }

    fn update_report(&mut self, _report: &ContractMessage) -> HandlerResult {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerTimer {
    Initiate,
    Announce,
    Grant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerAction {
    OnBid,
    OnRefusal,
    OnFinalReport,
    OnUpdateReport,
    OnCancellation,
}

static MANAGER_TABLE: LazyLock<DispatchTable<ManagerAction>> = LazyLock::new(|| {
    let table = DispatchTable::new()
        .on(
            MessageKind::Bid,
            Decision::new(
                &[ContractState::Announced],
                ContractState::Announced,
                ManagerAction::OnBid,
            ),
        )
        .on(
            MessageKind::Refusal,
            Decision::new(
                &[ContractState::Announced],
                ContractState::Announced,
                ManagerAction::OnRefusal,
            ),
        );

    // contractors granted early may report before bidding is over
    [
        ContractState::Announced,
        ContractState::Closed,
        ContractState::Granted,
    ]
    .into_iter()
    .fold(table, |table, state| {
        table
            .on(
                MessageKind::FinalReport,
                Decision::new(&[state], state, ManagerAction::OnFinalReport),
            )
            .on(
                MessageKind::UpdateReport,
                Decision::new(&[state], state, ManagerAction::OnUpdateReport),
            )
            .on(
                MessageKind::Cancellation,
                Decision::new(&[state], state, ManagerAction::OnCancellation),
            )
    })
});

/// What the manager agent can see and do within one negotiation
#[derive(Debug)]
pub struct ManagerMedium {
    ctx: Arc<AgentContext>,
    session_id: SessionId,
    protocol_id: String,
    machine: StateMachine,
    expiration: Expiration<ManagerTimer>,
    recipients: Vec<Recipient>,
    expected_bids: Option<usize>,
    registry: ContractorRegistry,
    announcement: Option<ContractMessage>,
    pending_cancellation: Option<ContractMessage>,
}

impl ManagerMedium {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    pub fn agent(&self) -> &AgentId {
        &self.ctx.agent
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    /// Number of distinct replies expected, unknown when broadcasting
    pub fn expected_bids(&self) -> Option<usize> {
        self.expected_bids
    }

    pub fn registry(&self) -> &ContractorRegistry {
        &self.registry
    }

    pub fn announcement(&self) -> Option<&ContractMessage> {
        self.announcement.as_ref()
    }

    pub fn now(&self) -> Timestamp {
        self.ctx.now()
    }

    /// Send the announcement to every recipient and open bidding
    pub fn announce(&mut self, payload: Value) -> Result<(), ProtocolError> {
        self.machine.ensure_state(&[ContractState::Initiated])?;
        let deadline = self.ctx.now() + self.ctx.timeouts.announce_ms;
        let msg = self.message(deadline, MessageBody::Announcement(Announcement { payload }));
        self.ctx.send(&self.recipients, &msg);

        self.expected_bids = if self.recipients.iter().any(Recipient::is_broadcast) {
            None
        } else {
            let distinct: HashSet<&Recipient> = self.recipients.iter().collect();
            Some(distinct.len())
        };
        debug!(
            session_id = %self.session_id,
            expected_bids = ?self.expected_bids,
            deadline,
            "Announced"
        );

        self.announcement = Some(msg);
        self.machine.set_state(ContractState::Announced);
        self.arm(deadline, ManagerTimer::Announce, None);
        Ok(())
    }

    /// Grant one of `contractor`'s bids, work due `grant_ms` from now
    pub fn grant(&mut self, contractor: &AgentId, grant: Grant) -> Result<(), ProtocolError> {
        let deadline = self.ctx.now() + self.ctx.timeouts.grant_ms;
        self.grant_until(contractor, grant, deadline)
    }

    /// Grant one of `contractor`'s bids with an explicit deadline.
    ///
    /// Nothing is sent unless the contractor has an open bid containing
    /// `grant.bid_index`.
    pub fn grant_until(
        &mut self,
        contractor: &AgentId,
        grant: Grant,
        deadline: Timestamp,
    ) -> Result<(), ProtocolError> {
        self.machine
            .ensure_state(&[ContractState::Announced, ContractState::Closed])?;
        self.registry.validate_grant(contractor, grant.bid_index)?;

        let msg = self.message(deadline, MessageBody::Grant(grant));
        self.ctx.send_to(contractor, &msg);
        if let Some(entry) = self.registry.get_mut(contractor) {
            entry.grant = Some(msg);
        }
        self.registry.advance(contractor, ContractState::Granted);
        Ok(())
    }

    /// Turn down `contractor`'s open bid
    pub fn reject(&mut self, contractor: &AgentId, reason: Option<String>) -> Result<(), ProtocolError> {
        self.machine
            .ensure_state(&[ContractState::Announced, ContractState::Closed])?;
        self.registry.require(contractor, ContractState::Bid)?;
        self.send_rejection(contractor, reason);
        Ok(())
    }

    fn send_rejection(&mut self, contractor: &AgentId, reason: Option<String>) {
        let msg = self.message(
            self.ctx.notice_deadline(),
            MessageBody::Rejection(Reason { reason }),
        );
        self.ctx.send_to(contractor, &msg);
        self.registry.advance(contractor, ContractState::Rejected);
    }

    fn message(&self, expiration_time: Timestamp, body: MessageBody) -> ContractMessage {
        ContractMessage::new(
            self.protocol_id.clone(),
            self.session_id.clone(),
            Some(self.ctx.agent.clone()),
            expiration_time,
            body,
        )
    }

    fn arm(&mut self, deadline: Timestamp, kind: ManagerTimer, resulting: Option<ContractState>) {
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

    fn quorum_reached(&self) -> bool {
        let Some(expected) = self.expected_bids else {
            return false;
        };
        let replied: HashSet<&AgentId> = self
            .recipients
            .iter()
            .filter_map(|r| match r {
                Recipient::Agent(agent) if self.registry.get(agent).is_some() => Some(agent),
                _ => None,
            })
            .collect();
        replied.len() >= expected
    }

    /// Move to `granted`, with a timer at the latest grant deadline
    fn enter_granted(&mut self) {
        self.machine.set_state(ContractState::Granted);
        let deadline = self
            .registry
            .iter()
            .filter_map(|e| e.grant.as_ref())
            .map(|g| g.expiration_time)
            .max()
            .unwrap_or_else(|| self.ctx.now() + self.ctx.timeouts.grant_ms);
        self.arm(deadline, ManagerTimer::Grant, Some(ContractState::Aborted));
    }

    fn fail(&mut self, during: &str, err: &anyhow::Error) {
        log_session_failure(Role::Manager, &self.session_id, during, err);
        self.cancel_expiration_call();
        self.machine.set_state(ContractState::Wtf);
    }
}

impl Stateful for ManagerMedium {
    fn machine(&self) -> &StateMachine {
        &self.machine
    }

    fn machine_mut(&mut self) -> &mut StateMachine {
        &mut self.machine
    }
}

impl ExpirationOwner for ManagerMedium {
    type Kind = ManagerTimer;

    fn expiration(&mut self) -> &mut Expiration<ManagerTimer> {
        &mut self.expiration
    }
}

/// A manager negotiation: the medium plus the agent's handler
pub struct ManagerSession {
    medium: ManagerMedium,
    handler: Box<dyn ManagerHandler>,
    finished: bool,
}

impl ManagerSession {
    pub fn new(
        ctx: Arc<AgentContext>,
        handler: Box<dyn ManagerHandler>,
        recipients: Vec<Recipient>,
        session_id: SessionId,
    ) -> Self {
        let protocol_id = handler.protocol_id().to_string();
        Self {
            medium: ManagerMedium {
                ctx,
                session_id,
                protocol_id,
                machine: StateMachine::new(Role::Manager, ContractState::Initiated),
                expiration: Expiration::default(),
                recipients,
                expected_bids: None,
                registry: ContractorRegistry::new(),
                announcement: None,
                pending_cancellation: None,
            },
            handler,
            finished: false,
        }
    }

    /// Arm the initiate timer and let the handler announce
    pub fn start(&mut self) {
        record_session_started(Role::Manager.as_str(), &self.medium.protocol_id);
        info!(
            session_id = %self.medium.session_id,
            protocol_id = %self.medium.protocol_id,
            recipients = self.medium.recipients.len(),
            "Manager session started"
        );
        let deadline = self.medium.ctx.now() + self.medium.ctx.timeouts.initiate_ms;
        self.medium
            .arm(deadline, ManagerTimer::Initiate, Some(ContractState::Expired));
        self.guarded("initiate", |handler, medium| handler.initiate(medium));
        self.advance();
    }

    pub fn medium(&self) -> &ManagerMedium {
        &self.medium
    }

    /// Run an agent-initiated operation inside the session's error boundary
    pub fn act<F>(&mut self, operation: F)
    where
        F: FnOnce(&mut ManagerMedium) -> HandlerResult,
    {
        if let Err(err) = operation(&mut self.medium) {
            self.medium.fail("act", &err);
        }
        self.advance();
    }

    /// Apply every transition that follows from the current registry
    pub fn advance(&mut self) {
        loop {
            let before = self.medium.machine.state();
            match before {
                ContractState::Announced if self.medium.quorum_reached() => self.close(),
                ContractState::Granted => self.evaluate_grants(),
                _ => {}
            }
            if self.medium.machine.state() == before {
                break;
            }
        }
        self.finish_if_terminal();
    }

    fn guarded<F>(&mut self, callback: &'static str, f: F)
    where
        F: FnOnce(&mut dyn ManagerHandler, &mut ManagerMedium) -> HandlerResult,
    {
        if let Err(err) = f(self.handler.as_mut(), &mut self.medium) {
            self.medium.fail(callback, &err);
        }
    }

    fn close(&mut self) {
        self.medium.cancel_expiration_call();
        if !self.medium.registry.iter().any(|e| e.bid.is_some()) {
            self.medium.machine.set_state(ContractState::Expired);
            self.guarded("expired", |handler, _| handler.expired());
            return;
        }

        self.medium.machine.set_state(ContractState::Closed);
        self.guarded("closed", |handler, medium| handler.closed(medium));
        if self.medium.machine.state() != ContractState::Closed {
            return;
        }

        for contractor in self.medium.registry.contractors_in(&[ContractState::Bid]) {
            debug!(contractor = %contractor, "Rejecting bid left open");
            self.medium.send_rejection(&contractor, None);
        }

        if self.medium.registry.iter().any(ContractorEntry::is_granted) {
            self.medium.enter_granted();
        } else {
            self.medium.machine.set_state(ContractState::Cancelled);
            self.guarded("cancelled", |handler, _| handler.cancelled(None));
        }
    }

    fn evaluate_grants(&mut self) {
        if let Some(cancellation) = self.medium.pending_cancellation.take() {
            self.cascade(cancellation);
            return;
        }
        let all_completed = {
            let mut granted = self.medium.registry.iter().filter(|e| e.is_granted()).peekable();
            granted.peek().is_some() && granted.all(|e| e.state == ContractState::Completed)
        };
        if all_completed {
            self.complete();
        }
    }

    fn complete(&mut self) {
        self.medium.cancel_expiration_call();
        let reports: Vec<ContractMessage> = self
            .medium
            .registry
            .iter()
            .filter(|e| e.is_granted())
            .filter_map(|e| e.report.clone())
            .collect();
        self.medium.machine.set_state(ContractState::Completed);

        for contractor in self.medium.registry.contractors_in(&[ContractState::Completed]) {
            let ack = self.medium.message(
                self.medium.ctx.notice_deadline(),
                MessageBody::Acknowledgement(Acknowledgement {}),
            );
            self.medium.ctx.send_to(&contractor, &ack);
            self.medium
                .registry
                .advance(&contractor, ContractState::Acknowledged);
        }
        self.guarded("completed", |handler, _| handler.completed(&reports));
    }

    /// A granted contractor defected: cancel everyone else still working
    fn cascade(&mut self, cancellation: ContractMessage) {
        self.medium.cancel_expiration_call();
        info!(
            session_id = %self.medium.session_id,
            defector = ?cancellation.sender,
            "Contractor defected, cancelling the others"
        );

        let reason = cancellation.reason().map(str::to_string);
        for contractor in self
            .medium
            .registry
            .contractors_in(&[ContractState::Granted, ContractState::Completed])
        {
            let msg = self.medium.message(
                self.medium.ctx.notice_deadline(),
                MessageBody::Cancellation(Reason {
                    reason: reason.clone(),
                }),
            );
            self.medium.ctx.send_to(&contractor, &msg);
            self.medium
                .registry
                .advance(&contractor, ContractState::Cancelled);
        }
        for contractor in self.medium.registry.contractors_in(&[ContractState::Bid]) {
            self.medium.send_rejection(&contractor, None);
        }

        self.medium.machine.set_state(ContractState::Cancelled);
        self.guarded("cancelled", |handler, _| {
            handler.cancelled(Some(&cancellation))
        });
    }

    fn on_bid(&mut self, sender: &AgentId, msg: &ContractMessage, state: ContractState) {
        if !self.medium.registry.register(sender.clone(), state, msg) {
            warn!(
                session_id = %self.medium.session_id,
                contractor = %sender,
                kind = msg.body.kind_name(),
                "Contractor already replied, dropping"
            );
            record_message_dropped("duplicate");
            return;
        }
        if state == ContractState::Bid {
            self.guarded("bid", |handler, medium| handler.bid(medium, msg));
        } else {
            self.guarded("refused", |handler, medium| handler.refused(medium, msg));
        }
    }

    /// Check that `sender` is a contractor currently in one of `states`
    fn expect_contractor(&self, sender: &AgentId, kind: MessageKind, states: &[ContractState]) -> bool {
        match self.medium.registry.get(sender) {
            Some(entry) if states.contains(&entry.state) => true,
            entry => {
                warn!(
                    session_id = %self.medium.session_id,
                    contractor = %sender,
                    kind = %kind,
                    contractor_state = ?entry.map(|e| e.state),
                    "Unexpected message from contractor, dropping"
                );
                record_message_dropped("contractor_state");
                false
            }
        }
    }

    fn finish_if_terminal(&mut self) {
        if self.finished || !self.medium.machine.is_terminal() {
            return;
        }
        self.finished = true;
        self.medium.cancel_expiration_call();
        let state = self.medium.machine.state();
        record_session_finished(Role::Manager.as_str(), state.as_str());
        info!(
            session_id = %self.medium.session_id,
            protocol_id = %self.medium.protocol_id,
            state = %state,
            contractors = self.medium.registry.len(),
            "Manager session finished"
        );
    }
}

impl Listener for ManagerSession {
    fn session_id(&self) -> &SessionId {
        &self.medium.session_id
    }

    fn protocol_id(&self) -> &str {
        &self.medium.protocol_id
    }

    fn role(&self) -> Role {
        Role::Manager
    }

    fn state(&self) -> ContractState {
        self.medium.machine.state()
    }

    fn on_message(&mut self, msg: &ContractMessage) {
        record_message_received(msg.body.kind_name());
        let state = self.medium.machine.state();
        let decision = match MANAGER_TABLE.resolve(msg.kind(), state) {
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
        let Some(sender) = msg.sender.as_ref() else {
            warn!(
                session_id = %self.medium.session_id,
                kind = msg.body.kind_name(),
                "Message without a sender, dropping"
            );
            record_message_dropped("missing_sender");
            return;
        };

        self.medium.machine.set_state(decision.after);
        match decision.action {
            ManagerAction::OnBid => self.on_bid(sender, msg, ContractState::Bid),
            ManagerAction::OnRefusal => self.on_bid(sender, msg, ContractState::Refused),
            ManagerAction::OnFinalReport => {
                if self.expect_contractor(sender, MessageKind::FinalReport, &[ContractState::Granted]) {
                    if let Some(entry) = self.medium.registry.get_mut(sender) {
                        entry.report = Some(msg.clone());
                    }
                    self.medium
                        .registry
                        .advance(sender, ContractState::Completed);
                }
            }
            ManagerAction::OnUpdateReport => {
                if self.expect_contractor(sender, MessageKind::UpdateReport, &[ContractState::Granted]) {
                    self.guarded("update_report", |handler, _| handler.update_report(msg));
                }
            }
            ManagerAction::OnCancellation => {
                if self.expect_contractor(
                    sender,
                    MessageKind::Cancellation,
                    &[ContractState::Granted, ContractState::Completed],
                ) {
                    self.medium
                        .registry
                        .advance(sender, ContractState::Cancelled);
                    if self.medium.pending_cancellation.is_none() {
                        self.medium.pending_cancellation = Some(msg.clone());
                    }
                }
            }
        }
        self.advance();
    }

    fn on_timer(&mut self, timer_id: TimerId) {
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
            ManagerTimer::Initiate => self.guarded("expired", |handler, _| handler.expired()),
            ManagerTimer::Announce => self.close(),
            ManagerTimer::Grant => self.guarded("aborted", |handler, _| handler.aborted()),
        }
        self.advance();
    }

    fn wait_for_state(&mut self, state: ContractState) -> StateWait {
        self.medium.wait_for_state(state)
    }

    fn terminate(&mut self) {
        self.medium.cancel_expiration_call();
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.medium.session_id.clone(),
            protocol_id: self.medium.protocol_id.clone(),
            role: Role::Manager,
            state: self.medium.machine.state(),
            contractors: self.medium.registry.iter().cloned().collect(),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
