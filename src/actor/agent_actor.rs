// actor/agent_actor.rs - Agency Actor

use std::sync::Arc;
use std::time::Instant;

use actix::prelude::*;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, instrument};

use crate::actor::messages::*;
use crate::actor::ActorTransport;
use crate::agency::Agency;
use crate::config::AgencyConfig;
use crate::message::AgentId;
use crate::protocol::{Clock, SystemClock, TimerEvent, TokioScheduler};

/// Actor running one agent's [`Agency`] in real time.
///
/// Deliveries, timer events and API calls all go through the actor's mailbox,
/// so the agency sees one event at a time.
pub struct AgencyActor {
    agency: Agency,

    transport: Arc<ActorTransport>,

    /// Fired timers, taken over by the actor's stream once started
    timers: Option<mpsc::UnboundedReceiver<TimerEvent>>,

    start_time: Instant,
}

impl AgencyActor {
    /// Create an agency for `agent` on the wall clock
    pub fn new(agent: AgentId, transport: Arc<ActorTransport>, config: AgencyConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(TokioScheduler::new(clock.clone(), tx));
        let agency = Agency::new(agent, transport.clone(), scheduler, clock, config);
        Self {
            agency,
            transport,
            timers: Some(rx),
            start_time: Instant::now(),
        }
    }

    pub fn agent(&self) -> &AgentId {
        self.agency.agent()
    }
}

impl Actor for AgencyActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(agent = %self.agent(), "Agency starting");
        if let Some(rx) = self.timers.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx));
        }
        self.transport
            .register(self.agent().clone(), ctx.address().recipient());
    }

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        info!(agent = %self.agent(), "Agency stopping");
        self.agency.shutdown();
        self.transport.deregister(self.agency.agent());
        Running::Stop
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        debug!(agent = %self.agent(), "Agency stopped");
    }
}

// =============================================================================
// Message Handlers
// =============================================================================

impl StreamHandler<TimerEvent> for AgencyActor {
    fn handle(&mut self, event: TimerEvent, _ctx: &mut Self::Context) {
        self.agency.fire_timer(&event);
    }
}

impl Handler<DeliverMessage> for AgencyActor {
    type Result = ();

    #[instrument(skip_all, fields(agent = %self.agent(), session_id = %msg.message.session_id))]
    fn handle(&mut self, msg: DeliverMessage, _ctx: &mut Self::Context) {
        self.agency.deliver(&msg.message);
    }
}

impl Handler<InitiateManager> for AgencyActor {
    type Result = MessageResult<InitiateManager>;

    fn handle(&mut self, msg: InitiateManager, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.agency.initiate_manager(msg.handler, msg.recipients))
    }
}

impl Handler<RegisterInterest> for AgencyActor {
    type Result = ();

    fn handle(&mut self, msg: RegisterInterest, _ctx: &mut Self::Context) {
        self.agency
            .register_interest(msg.protocol_id, msg.interest_type, msg.factory);
    }
}

impl Handler<RevokeInterest> for AgencyActor {
    type Result = bool;

    fn handle(&mut self, msg: RevokeInterest, _ctx: &mut Self::Context) -> bool {
        self.agency.revoke_interest(&msg.protocol_id)
    }
}

impl Handler<WaitForState> for AgencyActor {
    type Result = ResponseFuture<Result<(), AgentError>>;

    fn handle(&mut self, msg: WaitForState, _ctx: &mut Self::Context) -> Self::Result {
        let wait = self.agency.wait_for_state(&msg.session_id, msg.state);
        let session_id = msg.session_id;
        Box::pin(async move {
            wait?
                .await
                .map_err(|_| AgentError::SessionDestroyed(session_id))
        })
    }
}

impl Handler<GetSummary> for AgencyActor {
    type Result = MessageResult<GetSummary>;

    fn handle(&mut self, msg: GetSummary, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.agency.summary(&msg.session_id))
    }
}

impl Handler<GetStatus> for AgencyActor {
    type Result = AgentStatus;

    fn handle(&mut self, _msg: GetStatus, _ctx: &mut Self::Context) -> Self::Result {
        AgentStatus {
            agent_id: self.agent().clone(),
            active_sessions: self.agency.active_sessions(),
            finished_sessions: self.agency.history().count(),
            stats: self.agency.stats(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Handler<WithManager> for AgencyActor {
    type Result = Result<(), AgentError>;

    fn handle(&mut self, msg: WithManager, _ctx: &mut Self::Context) -> Self::Result {
        self.agency.with_manager(&msg.session_id, msg.operation)?;
        Ok(())
    }
}

impl Handler<WithContractor> for AgencyActor {
    type Result = Result<(), AgentError>;

    fn handle(&mut self, msg: WithContractor, _ctx: &mut Self::Context) -> Self::Result {
        self.agency.with_contractor(&msg.session_id, msg.operation)?;
        Ok(())
    }
}

impl Handler<Shutdown> for AgencyActor {
    type Result = ();

    fn handle(&mut self, msg: Shutdown, ctx: &mut Self::Context) {
        info!(agent = %self.agent(), reason = ?msg.reason, "Shutdown requested");
        ctx.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{json, Value};

    use crate::agency::InterestType;
    use crate::config::ProtocolTimeouts;
    use crate::message::{ContractMessage, Grant, Recipient, SessionId};
    use crate::protocol::{
        ContractState, ContractorHandler, ContractorMedium, HandlerResult, ManagerHandler,
        ManagerMedium,
    };

    struct Cheapest;

    impl ManagerHandler for Cheapest {
        fn protocol_id(&self) -> &str {
            "delivery"
        }

        fn initiate(&mut self, medium: &mut ManagerMedium) -> HandlerResult {
            medium.announce(json!({"parcel": 42}))?;
            Ok(())
        }

        fn closed(&mut self, medium: &mut ManagerMedium) -> HandlerResult {
            let winner = medium
                .registry()
                .with_state(ContractState::Bid)
                .min_by_key(|e| e.bids().first().and_then(Value::as_i64).unwrap_or(i64::MAX))
                .map(|e| e.contractor.clone());
            if let Some(contractor) = winner {
                medium.grant(&contractor, Grant::new(0))?;
            }
            Ok(())
        }
    }

    struct Courier {
        price: i64,
    }

    impl ContractorHandler for Courier {
        fn announced(&mut self, medium: &mut ContractorMedium, _: &ContractMessage) -> HandlerResult {
            medium.bid(vec![json!(self.price)])?;
            Ok(())
        }

        fn granted(&mut self, medium: &mut ContractorMedium, _: &ContractMessage) -> HandlerResult {
            medium.finalize(json!({"delivered": true}))?;
            Ok(())
        }
    }

    fn config() -> AgencyConfig {
        AgencyConfig::default().with_timeouts(ProtocolTimeouts::uniform(2_000))
    }

    async fn courier(transport: &Arc<ActorTransport>, name: &str, price: i64) -> Addr<AgencyActor> {
        let addr = AgencyActor::new(AgentId::new(name), transport.clone(), config()).start();
        addr.send(RegisterInterest {
            protocol_id: "delivery".into(),
            interest_type: InterestType::Public,
            factory: Box::new(move |_: &ContractMessage| -> Box<dyn ContractorHandler> {
                Box::new(Courier { price })
            }),
        })
        .await
        .unwrap();
        addr
    }

    #[actix_rt::test]
    async fn test_negotiation_between_actors() {
        let transport = Arc::new(ActorTransport::new());
        let bob = courier(&transport, "bob", 12).await;
        let carol = courier(&transport, "carol", 8).await;
        let alice = AgencyActor::new(AgentId::new("alice"), transport.clone(), config()).start();

        let session_id = alice
            .send(InitiateManager {
                handler: Box::new(Cheapest),
                recipients: vec![Recipient::agent("bob"), Recipient::agent("carol")],
            })
            .await
            .unwrap();

        let done = alice.send(WaitForState {
            session_id: session_id.clone(),
            state: ContractState::Completed,
        });
        tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .expect("negotiation did not complete")
            .unwrap()
            .unwrap();

        let summary = alice
            .send(GetSummary {
                session_id: session_id.clone(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.state, ContractState::Completed);
        let carol_entry = summary
            .contractors
            .iter()
            .find(|e| e.contractor.name == "carol")
            .unwrap();
        assert_eq!(carol_entry.state, ContractState::Acknowledged);

        // the acknowledgement reaches carol asynchronously
        let acknowledged = carol.send(WaitForState {
            session_id: session_id.clone(),
            state: ContractState::Acknowledged,
        });
        tokio::time::timeout(Duration::from_secs(5), acknowledged)
            .await
            .expect("carol was never acknowledged")
            .unwrap()
            .unwrap();

        let status = bob.send(GetStatus).await.unwrap();
        assert_eq!(status.active_sessions, 0);
        assert_eq!(status.finished_sessions, 1);
        assert_eq!(
            bob.send(GetSummary { session_id })
                .await
                .unwrap()
                .map(|s| s.state),
            Some(ContractState::Rejected)
        );
    }

    #[actix_rt::test]
    async fn test_shutdown_fails_pending_waits() {
        let transport = Arc::new(ActorTransport::new());
        let alice = AgencyActor::new(AgentId::new("alice"), transport.clone(), config()).start();
        assert!(transport.is_registered(&AgentId::new("alice")));

        // nobody answers, the session stays open until its announce deadline
        let session_id = alice
            .send(InitiateManager {
                handler: Box::new(Cheapest),
                recipients: vec![Recipient::agent("ghost")],
            })
            .await
            .unwrap();
        let pending = alice.send(WaitForState {
            session_id: session_id.clone(),
            state: ContractState::Completed,
        });

        alice
            .send(Shutdown {
                reason: ShutdownReason::Requested,
            })
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("wait was never resolved");
        assert!(matches!(result, Ok(Err(AgentError::SessionDestroyed(_)))));
        assert!(!transport.is_registered(&AgentId::new("alice")));
    }

    #[actix_rt::test]
    async fn test_operations_on_unknown_sessions() {
        let transport = Arc::new(ActorTransport::new());
        let alice = AgencyActor::new(AgentId::new("alice"), transport, config()).start();
        let result = alice
            .send(WithContractor {
                session_id: SessionId::from("nope"),
                operation: Box::new(|medium: &mut ContractorMedium| -> HandlerResult {
                    medium.finalize(Value::Null)?;
                    Ok(())
                }),
            })
            .await
            .unwrap();
        assert!(matches!(result, Err(AgentError::Protocol(_))));
        assert!(
            !alice
                .send(RevokeInterest {
                    protocol_id: "delivery".into()
                })
                .await
                .unwrap()
        );
    }
}
