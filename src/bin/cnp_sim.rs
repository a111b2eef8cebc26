// bin/cnp_sim.rs - Contract Net Simulation Binary

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix::{Actor, System};
use anyhow::{Context as _, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use fipa_contract_net::actor::{
    ActorTransport, AgencyActor, GetSummary, InitiateManager, RegisterInterest, Shutdown,
    ShutdownReason,
};
use fipa_contract_net::observability::{init_metrics, init_tracing, MetricsConfig, TracingConfig};
use fipa_contract_net::prelude::*;

const PROTOCOL: &str = "cnp-sim";

/// Contract Net Simulation
#[derive(Parser, Debug)]
#[command(name = "cnp-sim")]
#[command(author = "SavageS")]
#[command(version)]
#[command(about = "Run one Contract Net manager against N simulated contractors", long_about = None)]
struct Args {
    /// Number of contractors
    #[arg(short = 'n', long, default_value = "5")]
    contractors: usize,

    /// Announce to the broadcast group instead of each contractor by name
    #[arg(long)]
    broadcast: bool,

    /// Probability that a contractor refuses the announcement
    #[arg(long, default_value = "0.2")]
    refuse_rate: f64,

    /// Probability that the winning contractor walks away from the work
    #[arg(long, default_value = "0.0")]
    defect_rate: f64,

    /// Use the same timeout for every protocol phase, in milliseconds
    #[arg(long)]
    timeout_ms: Option<i64>,

    /// Random seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, compact, json)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Enable metrics server
    #[arg(long)]
    metrics: bool,

    /// Metrics listen address
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_addr: String,
}

/// How the manager's session ended
#[derive(Debug)]
enum Outcome {
    Completed(Vec<Value>),
    Cancelled(Option<String>),
    Expired,
    Aborted,
}

/// Grants the cheapest bid and reports the outcome
struct Buyer {
    outcome: mpsc::UnboundedSender<Outcome>,
}

impl Buyer {
    fn finish(&self, outcome: Outcome) -> HandlerResult {
        self.outcome
            .send(outcome)
            .map_err(|_| anyhow::anyhow!("simulation is no longer listening"))
    }
}

impl ManagerHandler for Buyer {
    fn protocol_id(&self) -> &str {
        PROTOCOL
    }

    fn initiate(&mut self, medium: &mut ManagerMedium) -> HandlerResult {
        medium.announce(json!({"task": "haul", "tons": 12}))?;
        Ok(())
    }

    fn bid(&mut self, _medium: &mut ManagerMedium, bid: &ContractMessage) -> HandlerResult {
        info!(from = ?bid.sender, bids = ?bid.bid().map(|b| &b.bids), "Bid received");
        Ok(())
    }

    fn closed(&mut self, medium: &mut ManagerMedium) -> HandlerResult {
        let cheapest = medium
            .registry()
            .with_state(ContractState::Bid)
            .filter_map(|e| {
                let price = e.bids().first().and_then(Value::as_u64)?;
                Some((price, e.contractor.clone()))
            })
            .min();
        if let Some((price, contractor)) = cheapest {
            info!(contractor = %contractor, price, "Granting cheapest bid");
            medium.grant(&contractor, Grant::new(0))?;
        }
        Ok(())
    }

    fn expired(&mut self) -> HandlerResult {
        self.finish(Outcome::Expired)
    }

    fn cancelled(&mut self, cancellation: Option<&ContractMessage>) -> HandlerResult {
        let reason = cancellation.and_then(|c| c.reason()).map(str::to_string);
        self.finish(Outcome::Cancelled(reason))
    }

    fn completed(&mut self, reports: &[ContractMessage]) -> HandlerResult {
        let payloads = reports
            .iter()
            .filter_map(|r| r.report().map(|r| r.payload.clone()))
            .collect();
        self.finish(Outcome::Completed(payloads))
    }

    fn aborted(&mut self) -> HandlerResult {
        self.finish(Outcome::Aborted)
    }
}

/// Bids a fixed price, or refuses
struct Hauler {
    price: Option<u64>,
    defects: bool,
}

impl ContractorHandler for Hauler {
    fn announced(&mut self, medium: &mut ContractorMedium, _announcement: &ContractMessage) -> HandlerResult {
        match self.price {
            Some(price) => medium.bid(vec![json!(price)])?,
            None => medium.refuse(Some("fleet busy".into()))?,
        }
        Ok(())
    }

    fn granted(&mut self, medium: &mut ContractorMedium, _grant: &ContractMessage) -> HandlerResult {
        if self.defects {
            medium.defect(Some("truck broke down".into()))?;
        } else {
            let payload = json!({"hauler": medium.agent().name, "price": self.price});
            medium.finalize(payload)?;
        }
        Ok(())
    }
}

#[actix_rt::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = args.log_format.parse().map_err(anyhow::Error::msg)?;
    init_tracing(
        TracingConfig::default()
            .with_level(&args.log_level)
            .with_format(format),
    );

    if args.metrics {
        let listen_addr: SocketAddr = args.metrics_addr.parse()?;
        match init_metrics(MetricsConfig { listen_addr }) {
            Ok(()) => info!(addr = %listen_addr, "Metrics recorder initialized"),
            Err(e) => warn!(error = %e, "Failed to initialize metrics"),
        }
    }

    let mut config = AgencyConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(ms) = args.timeout_ms {
        config = config.with_timeouts(ProtocolTimeouts::uniform(ms));
    }
    info!(contractors = args.contractors, timeouts = ?config.timeouts, "Starting simulation");

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let transport = Arc::new(ActorTransport::new());

    let mut contractors = Vec::with_capacity(args.contractors);
    let mut registrations = Vec::with_capacity(args.contractors);
    for i in 0..args.contractors {
        let agent = AgentId::new(format!("hauler-{i}"));
        let price = (!rng.random_bool(args.refuse_rate.clamp(0.0, 1.0)))
            .then(|| rng.random_range(100..1_000u64));
        let defects = rng.random_bool(args.defect_rate.clamp(0.0, 1.0));
        info!(agent = %agent, ?price, defects, "Spawning contractor");

        let addr = AgencyActor::new(agent.clone(), transport.clone(), config.clone()).start();
        registrations.push(addr.send(RegisterInterest {
            protocol_id: PROTOCOL.into(),
            interest_type: InterestType::Public,
            factory: Box::new(move |_: &ContractMessage| -> Box<dyn ContractorHandler> {
                Box::new(Hauler { price, defects })
            }),
        }));
        contractors.push((agent, addr));
    }
    for registered in futures::future::join_all(registrations).await {
        registered?;
    }

    let recipients = if args.broadcast {
        vec![Recipient::broadcast(PROTOCOL)]
    } else {
        contractors
            .iter()
            .map(|(agent, _)| Recipient::from(agent.clone()))
            .collect()
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = AgencyActor::new(AgentId::new("buyer"), transport.clone(), config.clone()).start();
    let session_id = manager
        .send(InitiateManager {
            handler: Box::new(Buyer { outcome: tx }),
            recipients,
        })
        .await?;
    info!(session_id = %session_id, "Negotiation started");

    let t = &config.timeouts;
    let horizon = t.initiate_ms.max(t.announce_ms) + t.grant_ms + t.ack_ms;
    let outcome = tokio::time::timeout(Duration::from_millis(horizon.max(0) as u64 + 1_000), rx.recv())
        .await
        .context("negotiation did not finish in time")?
        .context("manager session ended without an outcome")?;

    match &outcome {
        Outcome::Completed(reports) => println!("completed: {}", Value::from(reports.clone())),
        Outcome::Cancelled(reason) => println!("cancelled: {}", reason.as_deref().unwrap_or("-")),
        Outcome::Expired => println!("expired: no bids"),
        Outcome::Aborted => println!("aborted: work not reported in time"),
    }
    if let Some(summary) = manager.send(GetSummary { session_id }).await? {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    // let the last acknowledgements land before stopping everyone
    tokio::time::sleep(Duration::from_millis(50)).await;
    let everyone = contractors.iter().map(|(_, addr)| addr).chain([&manager]);
    for addr in everyone {
        addr.do_send(Shutdown {
            reason: ShutdownReason::NodeShutdown,
        });
    }
    System::current().stop();
    Ok(())
}
