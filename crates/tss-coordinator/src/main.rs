//! TSS coordinator tooling
//!
//! `schedule` prints coordinator rotation for a validator list, `simulate`
//! runs one coordinator tick against in-memory collaborators.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tss_coordinator::memory::{
    LoopbackTransport, MemoryChain, MemoryEventStore, MemoryKeyshareStore, MockEngine,
};
use tss_coordinator::{
    coordinator_for, threshold, AckOutcome, Collaborators, Coordinator, CoordinatorConfig,
    MessageType, ProtocolEvent, ProtocolType, TssKey, Validator, ValidatorStatus,
    DEFAULT_COORDINATOR_RANGE,
};

#[derive(Parser)]
#[command(name = "tss-coordinator")]
#[command(about = "Epoch-rotated TSS coordinator for validator sets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Print the coordinator for consecutive epochs
    Schedule {
        /// Validators as address[:status]
        ///
        /// Status is one of active, pending_join, pending_leave, inactive.
        #[arg(short, long, value_delimiter = ',', required = true)]
        validators: Vec<String>,

        /// Blocks per epoch
        #[arg(short, long, default_value_t = DEFAULT_COORDINATOR_RANGE)]
        range: u64,

        /// First block height
        #[arg(long, default_value = "0")]
        from: u64,

        /// Number of epochs to print
        #[arg(short, long, default_value = "10")]
        epochs: u64,
    },

    /// Run one coordinator tick with auto-acking in-memory participants
    Simulate {
        /// Config file (party_id is overridden with the elected coordinator)
        #[arg(short, long, env = "TSS_COORDINATOR_CONFIG")]
        config: Option<PathBuf>,

        /// ACTIVE validators
        #[arg(short, long, default_value = "4")]
        active: usize,

        /// PENDING_JOIN validators
        #[arg(long, default_value = "0")]
        pending_join: usize,

        /// PENDING_LEAVE validators
        #[arg(long, default_value = "0")]
        pending_leave: usize,

        /// Events to coordinate, in order
        #[arg(short, long, value_delimiter = ',', default_value = "keygen,sign,sign")]
        events: Vec<String>,

        /// Block height of the tick
        #[arg(long, default_value = "1000")]
        height: u64,

        /// Blocks per epoch, overrides the config file
        #[arg(short, long)]
        range: Option<u64>,

        /// Peers whose sends fail
        #[arg(long, value_delimiter = ',')]
        drop_peer: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("tss_coordinator=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Schedule {
            validators,
            range,
            from,
            epochs,
        } => schedule(&validators, range, from, epochs),
        Command::Simulate {
            config,
            active,
            pending_join,
            pending_leave,
            events,
            height,
            range,
            drop_peer,
        } => {
            let mut config = match config {
                Some(path) => CoordinatorConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => CoordinatorConfig::new("unset"),
            };
            if let Some(range) = range {
                config.coordinator_range = range;
            }
            let validators = simulated_validators(active, pending_join, pending_leave);
            simulate(config, validators, &events, height, &drop_peer).await
        }
    }
}

fn parse_status(s: &str) -> Result<ValidatorStatus> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "active" => ValidatorStatus::Active,
        "pending_join" => ValidatorStatus::PendingJoin,
        "pending_leave" => ValidatorStatus::PendingLeave,
        "inactive" => ValidatorStatus::Inactive,
        other => bail!("unknown validator status {}", other),
    })
}

fn parse_validator(spec: &str) -> Result<Validator> {
    let (address, status) = match spec.split_once(':') {
        Some((address, status)) => (address, parse_status(status)?),
        None => (spec, ValidatorStatus::Active),
    };
    if address.is_empty() {
        bail!("empty validator address in {:?}", spec);
    }
    Ok(Validator::new(address, format!("peer-{}", address), status))
}

fn schedule(specs: &[String], range: u64, from: u64, epochs: u64) -> Result<()> {
    if range == 0 {
        bail!("range must be positive");
    }
    let validators = specs.iter().map(|s| parse_validator(s)).collect::<Result<Vec<_>>>()?;

    let first_epoch = from / range;
    println!("=== Coordinator schedule (range {}) ===", range);
    for epoch in first_epoch..first_epoch + epochs {
        let start = epoch * range;
        let coordinator = coordinator_for(&validators, range, start).unwrap_or_else(|| "-".into());
        println!("blocks {:>8}..{:<8} -> {}", start, start + range - 1, coordinator);
    }
    Ok(())
}

fn simulated_validators(
    active: usize,
    pending_join: usize,
    pending_leave: usize,
) -> Vec<Validator> {
    let group = |prefix: &str, count: usize, status: ValidatorStatus| {
        (0..count)
            .map(|i| {
                let address = format!("{}-{}", prefix, i);
                Validator::new(address.clone(), format!("peer-{}", address), status)
            })
            .collect::<Vec<_>>()
    };

    let mut validators = group("val", active, ValidatorStatus::Active);
    validators.extend(group("join", pending_join, ValidatorStatus::PendingJoin));
    validators.extend(group("leave", pending_leave, ValidatorStatus::PendingLeave));
    validators
}

async fn simulate(
    mut config: CoordinatorConfig,
    validators: Vec<Validator>,
    event_names: &[String],
    height: u64,
    drop_peers: &[String],
) -> Result<()> {
    const KEY_ID: &str = "sim-key";
    const DEST_CHAIN: &str = "eip155:11155111";

    let range = config.coordinator_range.max(1);
    let Some(coordinator_party) = coordinator_for(&validators, range, height) else {
        bail!("no validators to simulate");
    };
    config.party_id = coordinator_party.clone();
    config.validate()?;

    let chain = Arc::new(MemoryChain::new());
    chain.set_height(height);
    chain.set_validators(validators.clone());
    chain.set_tss_key(Some(TssKey {
        key_id: KEY_ID.into(),
        public_key: vec![0x02; 33],
    }));
    chain.add_chain(DEST_CHAIN, 1_000_000_000, 0, 0);

    let keyshares = Arc::new(MemoryKeyshareStore::new());
    keyshares.insert(KEY_ID, vec![0x11; 64]);

    let events = Arc::new(MemoryEventStore::new());
    let event_height = height.saturating_sub(config.min_event_age_blocks);
    for (i, name) in event_names.iter().enumerate() {
        let protocol: ProtocolType = name.to_ascii_uppercase().parse()?;
        let payload = match protocol {
            ProtocolType::Sign => serde_json::to_vec(&serde_json::json!({
                "tx_id": format!("0x{:064x}", i),
                "destination_chain": DEST_CHAIN,
                "recipient": "0x000000000000000000000000000000000000dead",
                "amount": "1000000",
                "gas_limit": "21000",
            }))?,
            _ => Vec::new(),
        };
        events.insert(ProtocolEvent::new(format!("evt-{}", i), protocol, event_height, payload));
    }

    let transport = Arc::new(LoopbackTransport::new());
    for peer in drop_peers {
        transport.fail_peer(peer);
    }

    let coordinator = Coordinator::new(
        config,
        Collaborators {
            chain: chain.clone(),
            events,
            keyshares,
            clients: chain,
            engine: Arc::new(MockEngine::new()),
            transport: transport.clone(),
        },
    );

    println!("=== Simulation ===");
    println!("Height: {}", height);
    println!("Validators: {}", validators.len());
    println!("Coordinator: {}", coordinator_party);
    let signers = coordinator.eligible_validators(ProtocolType::Sign).len();
    println!("Sign threshold: {}", threshold(signers));

    let summary = coordinator.poll_once().await?;
    println!(
        "Setups sent: {}, deferred: {}, failed: {}",
        summary.setups_sent, summary.deferred, summary.failed
    );

    for (peer, msg) in transport.sent_of_type(MessageType::Setup) {
        match coordinator.handle_ack(&peer, &msg.event_id).await {
            Ok(AckOutcome::Completed { participants }) => {
                let nonce = msg
                    .signing_metadata
                    .as_ref()
                    .map(|m| format!(" (nonce {})", m.nonce))
                    .unwrap_or_default();
                println!(
                    "{}: handshake complete with {} participants{}",
                    msg.event_id,
                    participants.len(),
                    nonce
                );
            }
            Ok(_) => {}
            Err(e) => println!("{}: ack from {} rejected: {}", msg.event_id, peer, e),
        }
    }

    let pending = coordinator.pending_handshakes();
    if !pending.is_empty() {
        println!("Still awaiting acks: {}", pending.join(", "));
    }
    println!("Begin messages sent: {}", transport.sent_of_type(MessageType::Begin).len());

    Ok(())
}
