use num_bigint::BigUint;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::cipher::SharedPrime;
use crate::error::{ProtocolError, ProtocolResult, Violation};
use crate::ledger::messages::{Action, ActionKind, ActionPayload};
use crate::ledger::types::ClientId;
use crate::machine::{unexpected, Sequence, Step};
use crate::number_theory::{random_prime, PrimeSearchBudget};

const LOG_TARGET: &str = "mental_poker::protocol::turn_order";

/// State for agreeing on turn order and the shared prime.
///
/// Each party proposes a prime. Post order on the ledger is the turn order
/// and the first poster's prime is adopted after re-validation.
#[derive(Debug)]
pub struct TurnOrderContext {
    pub client_id: ClientId,
    pub participants: usize,
    pub key_bits: u64,
    /// Our proposal, found ahead of time by [`search_candidate_prime`].
    pub candidate: BigUint,
    pub rounds: usize,
    pub rng: StdRng,
    pub turn_order: Vec<ClientId>,
    pub shared_prime: Option<SharedPrime>,
}

impl TurnOrderContext {
    pub fn new(
        client_id: ClientId,
        participants: usize,
        key_bits: u64,
        candidate: BigUint,
        rounds: usize,
        rng: StdRng,
    ) -> Self {
        Self {
            client_id,
            participants,
            key_bits,
            candidate,
            rounds,
            rng,
            turn_order: Vec::with_capacity(participants),
            shared_prime: None,
        }
    }

    /// The agreed prime, once the sequence has completed.
    pub fn agreed_prime(&self) -> ProtocolResult<&SharedPrime> {
        self.shared_prime
            .as_ref()
            .ok_or_else(|| ProtocolError::Local("turn order has not completed".into()))
    }
}

/// Runs the random prime search on the blocking pool. At large key sizes the
/// search takes long enough to stall other tasks on the same worker.
pub async fn search_candidate_prime(
    key_bits: u64,
    budget: PrimeSearchBudget,
    mut rng: StdRng,
) -> ProtocolResult<BigUint> {
    let found = tokio::task::spawn_blocking(move || random_prime(key_bits, &budget, &mut rng))
        .await
        .map_err(|err| ProtocolError::Local(format!("prime search task failed: {err}")))?;
    Ok(found?)
}

pub fn turn_order_sequence(participants: usize) -> Sequence<TurnOrderContext> {
    Sequence::new()
        .then(Step::local("post-candidate-prime", post_candidate_prime))
        .repeat(Step::remote("record-turn", record_turn), participants)
        .then(Step::local("check-turn-order", check_complete))
}

fn post_candidate_prime(ctx: &mut TurnOrderContext) -> ProtocolResult<Option<ActionPayload>> {
    if ctx.candidate.bits() != ctx.key_bits {
        return Err(ProtocolError::Local(format!(
            "candidate prime has {} bits, expected {}",
            ctx.candidate.bits(),
            ctx.key_bits
        )));
    }
    let prime = ctx.candidate.clone();
    debug!(
        target = LOG_TARGET,
        client_id = %ctx.client_id,
        bits = ctx.key_bits,
        "proposing candidate prime"
    );
    Ok(Some(ActionPayload::TurnOrderAndPrimePost { prime }))
}

fn record_turn(action: &Action, ctx: &mut TurnOrderContext) -> ProtocolResult<()> {
    let ActionPayload::TurnOrderAndPrimePost { prime } = &action.payload else {
        return Err(unexpected(action, ActionKind::TurnOrderAndPrimePost).into());
    };
    let sender = &action.sender_id;
    if ctx.turn_order.contains(sender) {
        return Err(Violation::DuplicateSender {
            kind: ActionKind::TurnOrderAndPrimePost.as_str(),
            sender: sender.clone(),
        }
        .into());
    }

    if ctx.shared_prime.is_none() {
        let adopted = validate_prime(sender, prime, ctx)?;
        ctx.shared_prime = Some(adopted);
    }
    ctx.turn_order.push(sender.clone());
    Ok(())
}

fn validate_prime(
    sender: &ClientId,
    prime: &BigUint,
    ctx: &mut TurnOrderContext,
) -> Result<SharedPrime, Violation> {
    if prime.bits() != ctx.key_bits {
        return Err(Violation::InvalidModulus {
            sender: sender.clone(),
            reason: format!("expected {} bits, got {}", ctx.key_bits, prime.bits()),
        });
    }
    SharedPrime::new(prime.clone(), ctx.rounds, &mut ctx.rng).map_err(|err| {
        Violation::InvalidModulus {
            sender: sender.clone(),
            reason: err.to_string(),
        }
    })
}

fn check_complete(ctx: &mut TurnOrderContext) -> ProtocolResult<Option<ActionPayload>> {
    if ctx.turn_order.len() != ctx.participants || !ctx.turn_order.contains(&ctx.client_id) {
        return Err(Violation::MissingSender {
            expected: ctx.participants,
            found: ctx.turn_order.len(),
        }
        .into());
    }
    let prime = ctx.agreed_prime()?;
    info!(
        target = LOG_TARGET,
        client_id = %ctx.client_id,
        first = %ctx.turn_order[0],
        prime_bits = prime.bits(),
        "turn order agreed"
    );
    Ok(None)
}
