// agency/emu.rs - Deterministic multi-agent emulation

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::AgencyConfig;
use crate::message::{AgentId, ContractMessage, Recipient, Timestamp};
use crate::network::{EmuNetwork, Transport};
use crate::protocol::{Clock, ManualClock, ManualScheduler, TimerEvent};

use super::Agency;

/// Several agencies on one in-memory network, sharing a virtual clock.
///
/// Messages travel instantly but are only delivered when the emulation is
/// driven with [`Emulation::deliver_all`] or [`Emulation::advance_to`].
/// Agents without an agency act as raw endpoints: tests post messages on
/// their behalf and read their mail with [`Emulation::take_mail`].
pub struct Emulation {
    clock: Arc<ManualClock>,
    scheduler: Arc<ManualScheduler>,
    network: Arc<EmuNetwork>,
    config: AgencyConfig,
    agencies: BTreeMap<AgentId, Agency>,
}

impl Emulation {
    pub fn new(config: AgencyConfig) -> Self {
        Self {
            clock: Arc::new(ManualClock::new(0)),
            scheduler: Arc::new(ManualScheduler::new()),
            network: Arc::new(EmuNetwork::new()),
            config,
            agencies: BTreeMap::new(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn network(&self) -> &EmuNetwork {
        &self.network
    }

    pub fn scheduler(&self) -> &ManualScheduler {
        &self.scheduler
    }

    /// Add an agency for `name`; an existing one is kept
    pub fn spawn_agency(&mut self, name: &str) -> AgentId {
        let agent = AgentId::new(name);
        if !self.agencies.contains_key(&agent) {
            let agency = Agency::new(
                agent.clone(),
                self.network.clone(),
                self.scheduler.clone(),
                self.clock.clone(),
                self.config.clone(),
            );
            self.agencies.insert(agent.clone(), agency);
        }
        agent
    }

    pub fn agency(&self, agent: &AgentId) -> Option<&Agency> {
        self.agencies.get(agent)
    }

    pub fn agency_mut(&mut self, agent: &AgentId) -> Option<&mut Agency> {
        self.agencies.get_mut(agent)
    }

    /// Send `msg` from a raw endpoint
    pub fn post(&self, recipients: &[Recipient], msg: &ContractMessage) {
        self.network.send(recipients, msg);
    }

    /// Everything queued for a raw endpoint
    pub fn take_mail(&self, agent: &AgentId) -> Vec<ContractMessage> {
        self.network.drain(agent)
    }

    /// Deliver queued messages and due timers until nothing is left to do at
    /// the current time. Mail is drained after every timer event. Returns
    /// the number of events handled.
    pub fn deliver_all(&mut self) -> usize {
        let mut handled = self.drain_mail();
        loop {
            let due = self.scheduler.due(self.clock.now());
            if due.is_empty() {
                break;
            }
            for event in due {
                self.fire(&event);
                handled += 1 + self.drain_mail();
            }
        }
        handled
    }

    /// Move the virtual clock to `target`, handling every timer on the way
    pub fn advance_to(&mut self, target: Timestamp) {
        self.deliver_all();
        while let Some(deadline) = self.scheduler.next_deadline() {
            if deadline > target {
                break;
            }
            self.clock.set(deadline.max(self.clock.now()));
            self.deliver_all();
        }
        self.clock.set(target.max(self.clock.now()));
        self.deliver_all();
    }

    pub fn advance(&mut self, millis: i64) {
        self.advance_to(self.clock.now() + millis);
    }

    pub fn shutdown_all(&mut self) {
        for agency in self.agencies.values_mut() {
            agency.shutdown();
        }
    }

    fn drain_mail(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let mut progressed = false;
            for agent in self.network.agents_with_mail() {
                let Some(agency) = self.agencies.get_mut(&agent) else {
                    continue;
                };
                while let Some(msg) = self.network.pop(&agent) {
                    trace!(to = %agent, kind = msg.body.kind_name(), "Delivering");
                    agency.deliver(&msg);
                    delivered += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return delivered;
            }
        }
    }

    fn fire(&mut self, event: &TimerEvent) {
        match self.agencies.get_mut(&event.owner) {
            Some(agency) => agency.fire_timer(event),
            None => debug!(owner = %event.owner, "Timer for an unknown agency"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    use crate::agency::InterestType;
    use crate::message::{Announcement, Grant, MessageBody, MessageKind, SessionId};
    use crate::protocol::testing::Calls;
    use crate::protocol::{
        ContractState, ContractorHandler, ContractorMedium, HandlerResult, ManagerHandler,
        ManagerMedium, ProtocolError,
    };

    const PROTOCOL: &str = "transport";

    /// Announces a route and grants the cheapest bid
    struct LowestBid {
        calls: Calls,
    }

    impl ManagerHandler for LowestBid {
        fn protocol_id(&self) -> &str {
            PROTOCOL
        }

        fn initiate(&mut self, medium: &mut ManagerMedium) -> HandlerResult {
            medium.announce(json!({"from": "A", "to": "B"}))?;
            Ok(())
        }

        fn bid(&mut self, _medium: &mut ManagerMedium, bid: &ContractMessage) -> HandlerResult {
            self.calls.push(format!("bid:{}", sender(bid)));
            Ok(())
        }

        fn refused(&mut self, _medium: &mut ManagerMedium, refusal: &ContractMessage) -> HandlerResult {
            self.calls.push(format!("refused:{}", sender(refusal)));
            Ok(())
        }

        fn closed(&mut self, medium: &mut ManagerMedium) -> HandlerResult {
            self.calls.push("closed");
            let winner = medium
                .registry()
                .with_state(ContractState::Bid)
                .filter_map(|e| {
                    let price = e.bids().first().and_then(Value::as_i64)?;
                    Some((price, e.contractor.clone()))
                })
                .min();
            if let Some((_, contractor)) = winner {
                medium.grant(&contractor, Grant::new(0))?;
            }
            Ok(())
        }

        fn expired(&mut self) -> HandlerResult {
            self.calls.push("expired");
            Ok(())
        }

        fn cancelled(&mut self, cancellation: Option<&ContractMessage>) -> HandlerResult {
            let by = cancellation.map(sender).unwrap_or_default();
            self.calls.push(format!("cancelled:{by}"));
            Ok(())
        }

        fn completed(&mut self, reports: &[ContractMessage]) -> HandlerResult {
            self.calls.push(format!("completed:{}", reports.len()));
            Ok(())
        }

        fn aborted(&mut self) -> HandlerResult {
            self.calls.push("aborted");
            Ok(())
        }
    }

    /// Never announces
    struct Mute;

    impl ManagerHandler for Mute {
        fn protocol_id(&self) -> &str {
            PROTOCOL
        }

        fn initiate(&mut self, _medium: &mut ManagerMedium) -> HandlerResult {
            Ok(())
        }

        fn closed(&mut self, _medium: &mut ManagerMedium) -> HandlerResult {
            Ok(())
        }
    }

    /// Bids a fixed price, or refuses without one
    struct Pricer {
        price: Option<i64>,
        finish: bool,
        calls: Calls,
    }

    impl ContractorHandler for Pricer {
        fn announced(
            &mut self,
            medium: &mut ContractorMedium,
            _announcement: &ContractMessage,
        ) -> HandlerResult {
            match self.price {
                Some(price) => medium.bid(vec![json!(price)])?,
                None => medium.refuse(Some("busy".into()))?,
            }
            Ok(())
        }

        fn granted(&mut self, medium: &mut ContractorMedium, _grant: &ContractMessage) -> HandlerResult {
            self.calls.push("granted");
            if self.finish {
                medium.finalize(json!({"delivered": true}))?;
            }
            Ok(())
        }

        fn rejected(&mut self, _rejection: &ContractMessage) -> HandlerResult {
            self.calls.push("rejected");
            Ok(())
        }

        fn cancelled(&mut self, _cancellation: &ContractMessage) -> HandlerResult {
            self.calls.push("cancelled");
            Ok(())
        }

        fn acknowledged(&mut self, _ack: &ContractMessage) -> HandlerResult {
            self.calls.push("acknowledged");
            Ok(())
        }

        fn aborted(&mut self) -> HandlerResult {
            self.calls.push("aborted");
            Ok(())
        }
    }

    struct Faulty;

    impl ContractorHandler for Faulty {
        fn announced(
            &mut self,
            _medium: &mut ContractorMedium,
            _announcement: &ContractMessage,
        ) -> HandlerResult {
            anyhow::bail!("no capacity model")
        }

        fn granted(&mut self, _medium: &mut ContractorMedium, _grant: &ContractMessage) -> HandlerResult {
            Ok(())
        }
    }

    fn sender(msg: &ContractMessage) -> String {
        msg.sender.as_ref().map(|s| s.name.clone()).unwrap_or_default()
    }

    fn contractor(
        emu: &mut Emulation,
        name: &str,
        interest: InterestType,
        price: Option<i64>,
        finish: bool,
    ) -> (AgentId, Calls) {
        let agent = emu.spawn_agency(name);
        let calls = Calls::default();
        let seen = calls.clone();
        emu.agency_mut(&agent)
            .unwrap()
            .register_interest(PROTOCOL, interest, move |_| {
                Box::new(Pricer {
                    price,
                    finish,
                    calls: seen.clone(),
                })
            });
        (agent, calls)
    }

    fn manager(emu: &mut Emulation, handler: Box<dyn ManagerHandler>, recipients: Vec<Recipient>) -> (AgentId, SessionId) {
        let alice = emu.spawn_agency("alice");
        let id = emu
            .agency_mut(&alice)
            .unwrap()
            .initiate_manager(handler, recipients);
        (alice, id)
    }

    fn state_of(emu: &Emulation, agent: &AgentId, id: &SessionId) -> Option<ContractState> {
        emu.agency(agent).unwrap().session_state(id)
    }

    #[test]
    fn test_full_negotiation_lowest_bid_wins() {
        let mut emu = Emulation::new(AgencyConfig::default());
        let (bob, bob_calls) = contractor(&mut emu, "bob", InterestType::Private, Some(10), true);
        let (carol, carol_calls) = contractor(&mut emu, "carol", InterestType::Private, Some(7), true);
        let (dave, dave_calls) = contractor(&mut emu, "dave", InterestType::Private, None, true);
        let calls = Calls::default();
        let (alice, id) = manager(
            &mut emu,
            Box::new(LowestBid {
                calls: calls.clone(),
            }),
            vec![
                Recipient::from(bob.clone()),
                Recipient::from(carol.clone()),
                Recipient::from(dave.clone()),
            ],
        );

        emu.deliver_all();

        // every recipient replied, so nothing waited for the announce deadline
        assert_eq!(emu.now(), 0);
        assert_eq!(
            calls.take(),
            vec!["bid:bob", "bid:carol", "refused:dave", "closed", "completed:1"]
        );
        assert_eq!(state_of(&emu, &alice, &id), Some(ContractState::Completed));
        assert_eq!(state_of(&emu, &bob, &id), Some(ContractState::Rejected));
        assert_eq!(state_of(&emu, &carol, &id), Some(ContractState::Acknowledged));
        assert_eq!(state_of(&emu, &dave, &id), Some(ContractState::Refused));
        assert_eq!(bob_calls.take(), vec!["rejected"]);
        assert_eq!(carol_calls.take(), vec!["granted", "acknowledged"]);
        assert!(dave_calls.take().is_empty());

        let summary = emu.agency(&alice).unwrap().summary(&id).unwrap();
        let states: Vec<(String, ContractState)> = summary
            .contractors
            .iter()
            .map(|e| (e.contractor.name.clone(), e.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("bob".to_string(), ContractState::Rejected),
                ("carol".to_string(), ContractState::Acknowledged),
                ("dave".to_string(), ContractState::Refused),
            ]
        );
        assert_eq!(emu.scheduler().pending(), 0);
    }

    #[test]
    fn test_broadcast_waits_for_announce_deadline() {
        let mut emu = Emulation::new(AgencyConfig::default());
        let (bob, _) = contractor(&mut emu, "bob", InterestType::Public, Some(10), true);
        let (carol, _) = contractor(&mut emu, "carol", InterestType::Public, Some(7), true);
        let calls = Calls::default();
        let (alice, id) = manager(
            &mut emu,
            Box::new(LowestBid {
                calls: calls.clone(),
            }),
            vec![Recipient::broadcast(PROTOCOL)],
        );

        emu.advance_to(9_999);
        assert_eq!(state_of(&emu, &alice, &id), Some(ContractState::Announced));
        assert_eq!(calls.take(), vec!["bid:bob", "bid:carol"]);

        emu.advance_to(10_000);
        assert_eq!(calls.take(), vec!["closed", "completed:1"]);
        assert_eq!(state_of(&emu, &bob, &id), Some(ContractState::Rejected));
        assert_eq!(state_of(&emu, &carol, &id), Some(ContractState::Acknowledged));
    }

    #[test]
    fn test_missing_final_report_aborts_both_sides() {
        let mut emu = Emulation::new(AgencyConfig::default());
        let (carol, carol_calls) = contractor(&mut emu, "carol", InterestType::Private, Some(7), false);
        let calls = Calls::default();
        let (alice, id) = manager(
            &mut emu,
            Box::new(LowestBid {
                calls: calls.clone(),
            }),
            vec![Recipient::from(carol.clone())],
        );

        emu.deliver_all();
        assert_eq!(state_of(&emu, &alice, &id), Some(ContractState::Granted));
        assert_eq!(state_of(&emu, &carol, &id), Some(ContractState::Granted));

        emu.advance_to(10_000);
        assert_eq!(state_of(&emu, &alice, &id), Some(ContractState::Aborted));
        assert_eq!(state_of(&emu, &carol, &id), Some(ContractState::Aborted));
        assert_eq!(calls.take(), vec!["bid:carol", "closed", "aborted"]);
        assert_eq!(carol_calls.take(), vec!["granted", "aborted"]);
    }

    #[test]
    fn test_defection_cancels_other_contractors() {
        let mut emu = Emulation::new(AgencyConfig::default());
        let crew: Vec<AgentId> = ["bob", "carol", "dave"]
            .into_iter()
            .map(|name| contractor(&mut emu, name, InterestType::Private, Some(5), false).0)
            .collect();

        /// Grants everybody
        struct Everyone {
            calls: Calls,
        }

        impl ManagerHandler for Everyone {
            fn protocol_id(&self) -> &str {
                PROTOCOL
            }

            fn initiate(&mut self, medium: &mut ManagerMedium) -> HandlerResult {
                medium.announce(Value::Null)?;
                Ok(())
            }

            fn closed(&mut self, medium: &mut ManagerMedium) -> HandlerResult {
                for contractor in medium.registry().contractors_in(&[ContractState::Bid]) {
                    medium.grant(&contractor, Grant::new(0))?;
                }
                Ok(())
            }

            fn cancelled(&mut self, cancellation: Option<&ContractMessage>) -> HandlerResult {
                self.calls.push(format!("cancelled:{}", sender(cancellation.unwrap())));
                Ok(())
            }
        }

        let calls = Calls::default();
        let recipients = crew.iter().cloned().map(Recipient::from).collect();
        let (alice, id) = manager(
            &mut emu,
            Box::new(Everyone {
                calls: calls.clone(),
            }),
            recipients,
        );
        emu.deliver_all();
        assert_eq!(state_of(&emu, &alice, &id), Some(ContractState::Granted));

        let (bob, carol, dave) = (&crew[0], &crew[1], &crew[2]);
        emu.agency_mut(bob)
            .unwrap()
            .with_contractor(&id, |medium| Ok(medium.finalize(json!("done"))?))
            .unwrap();
        emu.agency_mut(carol)
            .unwrap()
            .with_contractor(&id, |medium| Ok(medium.defect(Some("truck broke down".into()))?))
            .unwrap();
        emu.deliver_all();

        assert_eq!(calls.take(), vec!["cancelled:carol"]);
        assert_eq!(state_of(&emu, &alice, &id), Some(ContractState::Cancelled));
        assert_eq!(state_of(&emu, bob, &id), Some(ContractState::Cancelled));
        assert_eq!(state_of(&emu, carol, &id), Some(ContractState::Defected));
        assert_eq!(state_of(&emu, dave, &id), Some(ContractState::Cancelled));

        let summary = emu.agency(&alice).unwrap().summary(&id).unwrap();
        assert!(
            summary
                .contractors
                .iter()
                .all(|e| e.state == ContractState::Cancelled)
        );
    }

    #[test]
    fn test_grant_for_unsent_bid_index_is_a_violation() {
        let mut emu = Emulation::new(AgencyConfig::default());
        let (bob, _) = contractor(&mut emu, "bob", InterestType::Private, Some(3), true);
        let endpoint = AgentId::new("mgr");

        let announcement = ContractMessage::new(
            PROTOCOL,
            SessionId::from("s-raw"),
            Some(endpoint.clone()),
            5_000,
            MessageBody::Announcement(Announcement::default()),
        );
        emu.post(&[Recipient::from(bob.clone())], &announcement);
        emu.deliver_all();

        let replies = emu.take_mail(&endpoint);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind(), Some(MessageKind::Bid));
        assert_eq!(replies[0].bid().unwrap().bids, vec![json!(3)]);

        let grant = announcement.reply(endpoint.clone(), 8_000, MessageBody::Grant(Grant::new(5)));
        emu.post(&[Recipient::from(bob.clone())], &grant);
        emu.deliver_all();

        let id = SessionId::from("s-raw");
        assert_eq!(state_of(&emu, &bob, &id), Some(ContractState::Wtf));
        assert_eq!(emu.agency(&bob).unwrap().active_sessions(), 0);
        assert!(emu.take_mail(&endpoint).is_empty());
    }

    #[test]
    fn test_failing_handler_leaves_siblings_alone() {
        let mut emu = Emulation::new(AgencyConfig::default());
        let bob = emu.spawn_agency("bob");
        emu.agency_mut(&bob)
            .unwrap()
            .register_interest(PROTOCOL, InterestType::Private, |_| Box::new(Faulty));
        let (carol, _) = contractor(&mut emu, "carol", InterestType::Private, Some(7), true);
        let calls = Calls::default();
        let (alice, id) = manager(
            &mut emu,
            Box::new(LowestBid {
                calls: calls.clone(),
            }),
            vec![Recipient::from(bob.clone()), Recipient::from(carol.clone())],
        );

        emu.deliver_all();
        assert_eq!(state_of(&emu, &bob, &id), Some(ContractState::Wtf));
        assert_eq!(state_of(&emu, &alice, &id), Some(ContractState::Announced));

        emu.advance_to(10_000);
        assert_eq!(state_of(&emu, &alice, &id), Some(ContractState::Completed));
        assert_eq!(state_of(&emu, &carol, &id), Some(ContractState::Acknowledged));
        assert_eq!(calls.take(), vec!["bid:carol", "closed", "completed:1"]);
    }

    #[test]
    fn test_initiate_timeout_unregisters_manager() {
        let mut emu = Emulation::new(AgencyConfig::default());
        let (alice, id) = manager(&mut emu, Box::new(Mute), vec![Recipient::agent("bob")]);

        emu.advance_to(9_999);
        assert_eq!(state_of(&emu, &alice, &id), Some(ContractState::Initiated));

        emu.advance_to(10_000);
        let agency = emu.agency_mut(&alice).unwrap();
        assert_eq!(agency.active_sessions(), 0);
        assert_eq!(agency.session_state(&id), Some(ContractState::Expired));

        let mut expired =
            tokio_test::task::spawn(agency.wait_for_state(&id, ContractState::Expired).unwrap());
        assert!(tokio_test::assert_ready!(expired.poll()).is_ok());
        let mut completed =
            tokio_test::task::spawn(agency.wait_for_state(&id, ContractState::Completed).unwrap());
        assert!(tokio_test::assert_ready!(completed.poll()).is_err());
    }

    #[test]
    fn test_wait_for_state_resolves_when_driven() {
        let mut emu = Emulation::new(AgencyConfig::default());
        let (carol, _) = contractor(&mut emu, "carol", InterestType::Private, Some(7), true);
        let (alice, id) = manager(
            &mut emu,
            Box::new(LowestBid {
                calls: Calls::default(),
            }),
            vec![Recipient::from(carol)],
        );

        let wait = emu
            .agency_mut(&alice)
            .unwrap()
            .wait_for_state(&id, ContractState::Completed)
            .unwrap();
        let mut wait = tokio_test::task::spawn(wait);
        tokio_test::assert_pending!(wait.poll());

        emu.deliver_all();
        assert!(wait.is_woken());
        assert!(tokio_test::assert_ready!(wait.poll()).is_ok());

        let err = emu
            .agency_mut(&alice)
            .unwrap()
            .wait_for_state(&SessionId::from("nope"), ContractState::Completed)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownSession(_)));
    }

    #[test]
    fn test_announcement_replayed_after_finish_is_dropped() {
        let mut emu = Emulation::new(AgencyConfig::default());
        let (dave, _) = contractor(&mut emu, "dave", InterestType::Private, None, true);
        let endpoint = AgentId::new("mgr");
        let announcement = ContractMessage::new(
            PROTOCOL,
            SessionId::from("s-raw"),
            Some(endpoint.clone()),
            5_000,
            MessageBody::Announcement(Announcement::default()),
        );

        emu.post(&[Recipient::from(dave.clone())], &announcement);
        emu.deliver_all();
        emu.post(&[Recipient::from(dave.clone())], &announcement);
        emu.deliver_all();

        let agency = emu.agency(&dave).unwrap();
        assert_eq!(agency.history().count(), 1);
        assert_eq!(agency.stats().messages_dropped, 1);
        assert_eq!(agency.stats().sessions_started, 1);
        let kinds: Vec<_> = emu.take_mail(&endpoint).iter().filter_map(|m| m.kind()).collect();
        assert_eq!(kinds, vec![MessageKind::Refusal]);
    }

    #[test]
    fn test_shutdown_cancels_every_timer() {
        let mut emu = Emulation::new(AgencyConfig::default());
        let (bob, _) = contractor(&mut emu, "bob", InterestType::Private, Some(1), true);
        let (alice, id) = manager(
            &mut emu,
            Box::new(LowestBid {
                calls: Calls::default(),
            }),
            vec![Recipient::from(bob.clone()), Recipient::agent("nobody")],
        );
        emu.deliver_all();
        assert_eq!(state_of(&emu, &alice, &id), Some(ContractState::Announced));
        assert_eq!(state_of(&emu, &bob, &id), Some(ContractState::Bid));
        assert_eq!(emu.scheduler().pending(), 2);

        emu.shutdown_all();
        assert_eq!(emu.scheduler().pending(), 0);
        assert_eq!(emu.agency(&alice).unwrap().active_sessions(), 0);
        assert_eq!(emu.agency(&bob).unwrap().active_sessions(), 0);

        emu.advance_to(60_000);
        assert_eq!(emu.network().pending(&alice), 0);
    }
}
