//! Plays one two-party mental poker deal over an in-memory ledger.
//!
//! Both participants run in this process and talk only through the shared
//! ledger: they exchange signing keys, agree on turn order and a prime,
//! shuffle, then each draws two cards. The first player finally discards one
//! card, which both sides open.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use mental_poker::cipher::Card;
use mental_poker::ledger::{ClientId, InMemoryLedger, Transport};
use mental_poker::{PokerSession, ProtocolConfig};

const LOG_TARGET: &str = "bin::mental_poker_demo";
const HAND_SIZE: usize = 2;

#[derive(Debug, Parser)]
#[command(name = "mental_poker_demo")]
#[command(about = "Deal a hand of mental poker between two local participants", long_about = None)]
struct Args {
    /// JSON protocol config file; defaults apply when omitted
    #[arg(long, env = "MENTAL_POKER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the prime size in bits
    #[arg(long, env = "MENTAL_POKER_KEY_BITS")]
    key_bits: Option<u64>,

    /// Override the per-step timeout in milliseconds
    #[arg(long, env = "MENTAL_POKER_STEP_TIMEOUT_MS")]
    step_timeout_ms: Option<u64>,

    /// Seed for deterministic runs
    #[arg(long, env = "MENTAL_POKER_SEED")]
    seed: Option<u64>,

    /// Toggle structured (JSON) logs
    #[arg(long, env = "MENTAL_POKER_LOG_JSON", default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    let args = Args::parse();
    init_tracing(args.json)?;
    let config = build_config(&args).context("failed to build protocol config")?;
    let mut rng = args
        .seed
        .map(StdRng::seed_from_u64)
        .unwrap_or_else(StdRng::from_entropy);
    play(config, rng.gen(), rng.gen()).await
}

fn load_dotenv() {
    let manifest_env = env!("CARGO_MANIFEST_DIR");
    let manifest_env_path = PathBuf::from(manifest_env).join(".env");
    dotenv::from_filename(manifest_env_path).ok();
    dotenv::dotenv().ok();
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::fmt().with_env_filter(filter).with_target(false);

    if json {
        builder.json().flatten_event(true).init();
    } else {
        builder.compact().init();
    }

    Ok(())
}

fn build_config(args: &Args) -> Result<ProtocolConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            ProtocolConfig::from_json_str(&raw)
                .with_context(|| format!("invalid config in {}", path.display()))?
        }
        None => ProtocolConfig::default(),
    };
    if let Some(bits) = args.key_bits {
        config.key_bits = bits;
    }
    if let Some(timeout) = args.step_timeout_ms {
        config.step_timeout_ms = timeout;
    }
    config.validate()?;
    Ok(config)
}

async fn play(config: ProtocolConfig, alice_seed: [u8; 32], bob_seed: [u8; 32]) -> Result<()> {
    let ledger = InMemoryLedger::new();
    let transport: Arc<dyn Transport> = ledger.clone();
    let started = Instant::now();

    let (alice, bob) = tokio::join!(
        PokerSession::establish(
            Arc::clone(&transport),
            config.clone(),
            ClientId::new("alice"),
            alice_seed,
        ),
        PokerSession::establish(
            Arc::clone(&transport),
            config.clone(),
            ClientId::new("bob"),
            bob_seed,
        ),
    );
    let alice = alice.context("alice failed to set up")?;
    let bob = bob.context("bob failed to set up")?;
    info!(
        target = LOG_TARGET,
        elapsed_ms = started.elapsed().as_millis() as u64,
        prime_bits = alice.shared_prime().bits(),
        entries = ledger.len(),
        "shuffle complete"
    );

    let (mut first, mut second) = if alice.turn_order()[0] == *alice.client_id() {
        (alice, bob)
    } else {
        (bob, alice)
    };

    for position in 0..HAND_SIZE {
        deal_one(&mut first, &mut second, position).await?;
    }
    for position in HAND_SIZE..2 * HAND_SIZE {
        deal_one(&mut second, &mut first, position).await?;
    }

    let (discarded, observed) = tokio::join!(first.discard(0), second.observe_discard());
    let discarded = discarded.context("discard failed")?;
    let (position, seen) = observed.context("observing the discard failed")?;
    info!(
        target = LOG_TARGET,
        player = %first.client_id(),
        position,
        card = %seen,
        matches = discarded == seen,
        "discard opened"
    );

    println!("turn order: {}", format_ids(first.turn_order()));
    for session in [&first, &second] {
        let hand: Vec<&Card> = session.hand().values().collect();
        let public: Vec<&Card> = session.public_cards().values().collect();
        println!(
            "{}: hand [{}] public [{}]",
            session.client_id(),
            format_cards(&hand),
            format_cards(&public)
        );
    }
    println!(
        "ledger entries: {}, elapsed: {:?}",
        ledger.len(),
        started.elapsed()
    );
    Ok(())
}

async fn deal_one(
    drawer: &mut PokerSession,
    server: &mut PokerSession,
    position: usize,
) -> Result<()> {
    let (card, served) = tokio::join!(drawer.draw(position), server.serve_draw());
    served.with_context(|| format!("{} failed to serve position {position}", server.client_id()))?;
    let card = card.with_context(|| format!("{} failed to draw position {position}", drawer.client_id()))?;
    info!(
        target = LOG_TARGET,
        player = %drawer.client_id(),
        position,
        card = %card,
        "card dealt"
    );
    Ok(())
}

fn format_cards(cards: &[&Card]) -> String {
    cards
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_ids(ids: &[ClientId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
