// agency/mod.rs - Per-agent host of negotiation sessions

//! An [`Agency`] owns every live session of one agent.
//!
//! Inbound messages and timer events are routed to sessions by session id.
//! An announcement for an unknown session starts a contractor session if the
//! agent registered interest in its protocol. Sessions that reach a terminal
//! state are unregistered and remembered as a [`SessionSummary`].
//!
//! The agency is synchronous: it processes one event to completion before the
//! next. [`Emulation`] drives several agencies over an in-memory network with
//! a virtual clock; [`crate::actor::AgencyActor`] runs one inside an actix
//! actor in real time.

mod emu;

pub use emu::Emulation;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AgencyConfig;
use crate::message::{AgentId, ContractMessage, MessageBody, Recipient, SessionId};
use crate::network::Transport;
use crate::observability::record_message_dropped;
use crate::protocol::{
    AgentContext, Clock, ContractState, ContractorHandler, ContractorMedium, ContractorSession,
    HandlerResult, Listener, ManagerHandler, ManagerMedium, ManagerSession, ProtocolError, Role,
    Scheduler, SessionSummary, StateWait, TimerEvent,
};

/// Builds the handler of a new contractor session from its announcement
pub type ContractorFactory = Box<dyn Fn(&ContractMessage) -> Box<dyn ContractorHandler> + Send>;

/// How announcements reach an interested agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestType {
    /// Only announcements addressed to the agent by name
    Private,
    /// Also announcements broadcast to the protocol's group
    Public,
}

struct Interest {
    interest_type: InterestType,
    factory: ContractorFactory,
}

/// Agency statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgencyStats {
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub timers_fired: u64,
    pub sessions_started: u64,
    pub sessions_finished: u64,
}

/// Host of one agent's sessions
pub struct Agency {
    ctx: Arc<AgentContext>,
    config: AgencyConfig,
    sessions: HashMap<SessionId, Box<dyn Listener>>,
    interests: HashMap<String, Interest>,
    history: VecDeque<SessionSummary>,
    stats: AgencyStats,
}

impl Agency {
    pub fn new(
        agent: AgentId,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        config: AgencyConfig,
    ) -> Self {
        let ctx = AgentContext::new(agent, transport, scheduler, clock, config.timeouts);
        Self {
            ctx: Arc::new(ctx),
            config,
            sessions: HashMap::new(),
            interests: HashMap::new(),
            history: VecDeque::new(),
            stats: AgencyStats::default(),
        }
    }

    pub fn agent(&self) -> &AgentId {
        &self.ctx.agent
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub fn config(&self) -> &AgencyConfig {
        &self.config
    }

    pub fn stats(&self) -> AgencyStats {
        self.stats
    }

    /// Start a manager negotiation with `recipients`
    pub fn initiate_manager(
        &mut self,
        handler: Box<dyn ManagerHandler>,
        recipients: Vec<Recipient>,
    ) -> SessionId {
        let session_id = SessionId::generate();
        let mut session =
            ManagerSession::new(self.ctx.clone(), handler, recipients, session_id.clone());
        session.start();
        self.register(Box::new(session));
        session_id
    }

    /// Answer announcements of `protocol_id` with handlers built by `factory`.
    ///
    /// Replaces any earlier interest in the same protocol.
    pub fn register_interest<F>(
        &mut self,
        protocol_id: impl Into<String>,
        interest_type: InterestType,
        factory: F,
    ) where
        F: Fn(&ContractMessage) -> Box<dyn ContractorHandler> + Send + 'static,
    {
        let protocol_id = protocol_id.into();
        self.revoke_interest(&protocol_id);
        if interest_type == InterestType::Public {
            self.ctx.transport.subscribe(&self.ctx.agent, &protocol_id);
        }
        info!(
            agent = %self.ctx.agent,
            protocol_id = %protocol_id,
            ?interest_type,
            "Registered interest"
        );
        self.interests.insert(
            protocol_id,
            Interest {
                interest_type,
                factory: Box::new(factory),
            },
        );
    }

    /// Stop answering new announcements of `protocol_id`. Running sessions
    /// are not affected.
    pub fn revoke_interest(&mut self, protocol_id: &str) -> bool {
        let Some(interest) = self.interests.remove(protocol_id) else {
            return false;
        };
        if interest.interest_type == InterestType::Public {
            self.ctx.transport.unsubscribe(&self.ctx.agent, protocol_id);
        }
        debug!(agent = %self.ctx.agent, protocol_id, "Revoked interest");
        true
    }

    pub fn has_interest(&self, protocol_id: &str) -> bool {
        self.interests.contains_key(protocol_id)
    }

    /// Route an inbound message to its session
    pub fn deliver(&mut self, msg: &ContractMessage) {
        let now = self.ctx.now();
        if self.config.drop_expired_messages && msg.expiration_time < now {
            self.drop_message(msg, "expired");
            return;
        }

        let is_announcement = matches!(msg.body, MessageBody::Announcement(_));
        if is_announcement && msg.sender.as_ref() == Some(&self.ctx.agent) {
            self.drop_message(msg, "self_announcement");
            return;
        }

        if let Some(session) = self.sessions.get_mut(&msg.session_id) {
            self.stats.messages_delivered += 1;
            session.on_message(msg);
            self.reap(&msg.session_id);
            return;
        }

        if !is_announcement {
            self.drop_message(msg, "unknown_session");
        } else if self.finished(&msg.session_id).is_some() {
            self.drop_message(msg, "duplicate_announcement");
        } else {
            self.accept_announcement(msg);
        }
    }

    fn accept_announcement(&mut self, msg: &ContractMessage) {
        let Some(interest) = self.interests.get(&msg.protocol_id) else {
            self.drop_message(msg, "no_interest");
            return;
        };

        let handler = (interest.factory)(msg);
        match ContractorSession::new(self.ctx.clone(), handler, msg) {
            Ok(mut session) => {
                self.stats.messages_delivered += 1;
                session.start();
                self.register(Box::new(session));
            }
            Err(err) => {
                warn!(agent = %self.ctx.agent, session_id = %msg.session_id, "{}", err);
                self.drop_message(msg, "missing_sender");
            }
        }
    }

    /// Hand a fired timer to its session. Events of finished sessions are dropped.
    pub fn fire_timer(&mut self, event: &TimerEvent) {
        if event.owner != self.ctx.agent {
            warn!(
                agent = %self.ctx.agent,
                owner = %event.owner,
                timer = %event.timer_id,
                "Timer event for another agent, dropping"
            );
            return;
        }
        match self.sessions.get_mut(&event.session_id) {
            Some(session) => {
                self.stats.timers_fired += 1;
                session.on_timer(event.timer_id);
                self.reap(&event.session_id);
            }
            None => debug!(
                session_id = %event.session_id,
                timer = %event.timer_id,
                "Timer for a finished session, dropping"
            ),
        }
    }

    /// Future resolving once `session_id` enters `state`.
    ///
    /// For a finished session it resolves immediately if the session ended in
    /// `state`, and fails otherwise.
    pub fn wait_for_state(
        &mut self,
        session_id: &SessionId,
        state: ContractState,
    ) -> Result<StateWait, ProtocolError> {
        if let Some(session) = self.sessions.get_mut(session_id) {
            return Ok(session.wait_for_state(state));
        }
        match self.finished(session_id) {
            Some(summary) if summary.state == state => Ok(StateWait::resolved()),
            Some(_) => Ok(StateWait::failed()),
            None => Err(ProtocolError::UnknownSession(session_id.clone())),
        }
    }

    /// Current state of a live session, or final state of a remembered one
    pub fn session_state(&self, session_id: &SessionId) -> Option<ContractState> {
        match self.sessions.get(session_id) {
            Some(session) => Some(session.state()),
            None => self.finished(session_id).map(|s| s.state),
        }
    }

    pub fn summary(&self, session_id: &SessionId) -> Option<SessionSummary> {
        match self.sessions.get(session_id) {
            Some(session) => Some(session.summary()),
            None => self.finished(session_id).cloned(),
        }
    }

    /// Finished sessions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &SessionSummary> {
        self.history.iter()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    /// Run `operation` on a live manager session, e.g. a late grant
    pub fn with_manager<F>(&mut self, session_id: &SessionId, operation: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut ManagerMedium) -> HandlerResult,
    {
        let session = self.live_session(session_id, Role::Manager)?;
        let manager = session
            .as_any_mut()
            .downcast_mut::<ManagerSession>()
            .ok_or_else(|| wrong_role(session_id, Role::Manager))?;
        manager.act(operation);
        self.reap(session_id);
        Ok(())
    }

    /// Run `operation` on a live contractor session, e.g. finalize or defect
    pub fn with_contractor<F>(
        &mut self,
        session_id: &SessionId,
        operation: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut ContractorMedium) -> HandlerResult,
    {
        let session = self.live_session(session_id, Role::Contractor)?;
        let contractor = session
            .as_any_mut()
            .downcast_mut::<ContractorSession>()
            .ok_or_else(|| wrong_role(session_id, Role::Contractor))?;
        contractor.act(operation);
        self.reap(session_id);
        Ok(())
    }

    /// Cancel the timers of every live session and discard them. Pending
    /// waiters fail.
    pub fn shutdown(&mut self) {
        let live = self.sessions.len();
        for (_, mut session) in self.sessions.drain() {
            session.terminate();
        }
        let protocols: Vec<String> = self.interests.keys().cloned().collect();
        for protocol_id in protocols {
            self.revoke_interest(&protocol_id);
        }
        info!(agent = %self.ctx.agent, discarded = live, "Agency shut down");
    }

    fn live_session(
        &mut self,
        session_id: &SessionId,
        role: Role,
    ) -> Result<&mut Box<dyn Listener>, ProtocolError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ProtocolError::UnknownSession(session_id.clone()))?;
        if session.role() != role {
            return Err(wrong_role(session_id, role));
        }
        Ok(session)
    }

    fn register(&mut self, session: Box<dyn Listener>) {
        self.stats.sessions_started += 1;
        let session_id = session.session_id().clone();
        debug!(
            agent = %self.ctx.agent,
            session_id = %session_id,
            role = %session.role(),
            state = %session.state(),
            "Registered session"
        );
        self.sessions.insert(session_id.clone(), session);
        self.reap(&session_id);
    }

    /// Unregister `session_id` if it reached a terminal state
    fn reap(&mut self, session_id: &SessionId) {
        let finished = self
            .sessions
            .get(session_id)
            .is_some_and(|session| session.is_terminal());
        if !finished {
            return;
        }
        if let Some(session) = self.sessions.remove(session_id) {
            self.stats.sessions_finished += 1;
            debug!(
                agent = %self.ctx.agent,
                session_id = %session_id,
                state = %session.state(),
                "Unregistered session"
            );
            self.history.push_back(session.summary());
            while self.history.len() > self.config.history_limit {
                self.history.pop_front();
            }
        }
    }

    fn finished(&self, session_id: &SessionId) -> Option<&SessionSummary> {
        self.history.iter().rev().find(|s| &s.session_id == session_id)
    }

    fn drop_message(&mut self, msg: &ContractMessage, reason: &'static str) {
        self.stats.messages_dropped += 1;
        warn!(
            agent = %self.ctx.agent,
            session_id = %msg.session_id,
            kind = msg.body.kind_name(),
            reason,
            "Dropping message"
        );
        record_message_dropped(reason);
    }
}

fn wrong_role(session_id: &SessionId, expected: Role) -> ProtocolError {
    ProtocolError::WrongRole {
        session_id: session_id.clone(),
        expected,
    }
}
