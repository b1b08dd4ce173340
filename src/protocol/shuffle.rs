//! Two-phase commutative shuffle.
//!
//! Phase 1: in turn order, each party encrypts every card under one fresh key
//! and permutes the deck. Phase 2: in turn order, each party strips its
//! phase-1 key and re-encrypts every position under its own per-card key.
//! Afterwards each position is locked by one key from each party.

use std::collections::HashSet;

use num_bigint::BigUint;
use rand::{rngs::StdRng, seq::SliceRandom};
use tracing::{debug, info};

use crate::cipher::{
    decrypt_all, encrypt, encrypt_all, generate_key_pair, Card, CardCodec, CipherError,
    CipherKeyPair, SharedPrime,
};
use crate::config::{ConfigError, SUPPORTED_PARTICIPANTS};
use crate::error::{ProtocolError, ProtocolResult, Violation};
use crate::ledger::messages::{Action, ActionKind, ActionPayload};
use crate::ledger::types::ClientId;
use crate::machine::{expect_sender, unexpected, Sequence, Step};

const LOG_TARGET: &str = "mental_poker::protocol::shuffle";

pub struct ShuffleContext {
    pub client_id: ClientId,
    pub prime: SharedPrime,
    pub rng: StdRng,
    /// The latest deck posted to the ledger, or the encoded plaintext deck
    /// before the first post.
    pub deck: Vec<BigUint>,
    deck_size: usize,
    phase_one_key: Option<CipherKeyPair>,
    card_keys: Vec<CipherKeyPair>,
}

impl std::fmt::Debug for ShuffleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShuffleContext")
            .field("client_id", &self.client_id)
            .field("deck_size", &self.deck_size)
            .field("holds_phase_one_key", &self.phase_one_key.is_some())
            .field("card_keys", &self.card_keys.len())
            .finish_non_exhaustive()
    }
}

impl ShuffleContext {
    pub fn new(
        client_id: ClientId,
        prime: SharedPrime,
        cards: &[Card],
        rng: StdRng,
    ) -> Result<Self, CipherError> {
        let deck = CardCodec::new(prime.clone()).encode_deck(cards)?;
        Ok(Self {
            client_id,
            prime,
            rng,
            deck_size: deck.len(),
            deck,
            phase_one_key: None,
            card_keys: Vec::new(),
        })
    }

    pub fn deck_size(&self) -> usize {
        self.deck_size
    }

    /// Our per-card keys, indexed by deck position. Empty until our phase 2.
    pub fn card_keys(&self) -> &[CipherKeyPair] {
        &self.card_keys
    }

    /// Hands the shuffled deck and our per-card keys to the dealing stage.
    pub fn into_parts(self) -> (Vec<BigUint>, Vec<CipherKeyPair>) {
        (self.deck, self.card_keys)
    }
}

/// Builds the shuffle script for `local` given the agreed turn order.
pub fn shuffle_sequence(
    turn_order: &[ClientId],
    local: &ClientId,
) -> Result<Sequence<ShuffleContext>, ConfigError> {
    if turn_order.len() != SUPPORTED_PARTICIPANTS {
        return Err(ConfigError::validation(format!(
            "shuffle needs exactly {SUPPORTED_PARTICIPANTS} participants, got {}",
            turn_order.len()
        )));
    }
    if !turn_order.contains(local) {
        return Err(ConfigError::validation(format!(
            "{local} is not in the turn order"
        )));
    }

    let phase_one = turn_order.iter().map(|party| {
        let mut part = Sequence::new();
        if party == local {
            part = part.then(Step::local("phase1-shuffle", phase_one_shuffle));
        }
        part.then(adopt_deck("phase1-adopt-deck", ActionKind::ShufflePhase1Post, party))
    });
    let phase_two = turn_order.iter().map(|party| {
        let mut part = Sequence::new();
        if party == local {
            part = part.then(Step::local("phase2-rekey", phase_two_rekey));
        }
        part.then(adopt_deck("phase2-adopt-deck", ActionKind::ShufflePhase2Post, party))
    });
    let done = Sequence::new().then(Step::local("shuffle-complete", shuffle_complete));

    Ok(Sequence::concat(phase_one.chain(phase_two).chain(std::iter::once(done))))
}

fn phase_one_shuffle(ctx: &mut ShuffleContext) -> ProtocolResult<Option<ActionPayload>> {
    let key = generate_key_pair(&ctx.prime, &mut ctx.rng);
    let mut deck = encrypt_all(&ctx.deck, &key, &ctx.prime)?;
    deck.shuffle(&mut ctx.rng);
    ctx.phase_one_key = Some(key);
    debug!(
        target = LOG_TARGET,
        client_id = %ctx.client_id,
        cards = deck.len(),
        "encrypted and permuted deck"
    );
    Ok(Some(ActionPayload::ShufflePhase1Post { deck }))
}

fn phase_two_rekey(ctx: &mut ShuffleContext) -> ProtocolResult<Option<ActionPayload>> {
    let key = ctx
        .phase_one_key
        .take()
        .ok_or_else(|| ProtocolError::Local("phase-one key missing before re-keying".into()))?;
    let stripped = decrypt_all(&ctx.deck, &key, &ctx.prime)?;

    let card_keys: Vec<CipherKeyPair> = stripped
        .iter()
        .map(|_| generate_key_pair(&ctx.prime, &mut ctx.rng))
        .collect();
    let deck = stripped
        .iter()
        .zip(&card_keys)
        .map(|(card, key)| encrypt(card, key))
        .collect::<Result<Vec<_>, _>>()?;
    ctx.card_keys = card_keys;

    debug!(
        target = LOG_TARGET,
        client_id = %ctx.client_id,
        cards = deck.len(),
        "re-keyed every position"
    );
    Ok(Some(ActionPayload::ShufflePhase2Post { deck }))
}

fn adopt_deck(name: &'static str, phase: ActionKind, party: &ClientId) -> Step<ShuffleContext> {
    let party = party.clone();
    Step::remote(name, move |action, ctx: &mut ShuffleContext| {
        let deck = posted_deck(action, phase)?;
        expect_sender(action, &party)?;
        validate_deck(&action.sender_id, deck, ctx)?;
        ctx.deck = deck.to_vec();
        Ok(())
    })
}

fn posted_deck(action: &Action, phase: ActionKind) -> Result<&[BigUint], Violation> {
    match (&action.payload, phase) {
        (ActionPayload::ShufflePhase1Post { deck }, ActionKind::ShufflePhase1Post)
        | (ActionPayload::ShufflePhase2Post { deck }, ActionKind::ShufflePhase2Post) => {
            Ok(deck.as_slice())
        }
        _ => Err(unexpected(action, phase)),
    }
}

fn validate_deck(
    sender: &ClientId,
    deck: &[BigUint],
    ctx: &ShuffleContext,
) -> Result<(), Violation> {
    if deck.len() != ctx.deck_size {
        return Err(Violation::OutOfRange {
            sender: sender.clone(),
            reason: format!("deck has {} cards, expected {}", deck.len(), ctx.deck_size),
        });
    }
    if let Some(index) = deck.iter().position(|card| !ctx.prime.contains(card)) {
        return Err(Violation::OutOfRange {
            sender: sender.clone(),
            reason: format!("card at position {index} is outside [1, p)"),
        });
    }
    let distinct: HashSet<&BigUint> = deck.iter().collect();
    if distinct.len() != deck.len() {
        return Err(Violation::Malformed {
            sender: sender.clone(),
            reason: "deck repeats a ciphertext".into(),
        });
    }
    Ok(())
}

fn shuffle_complete(ctx: &mut ShuffleContext) -> ProtocolResult<Option<ActionPayload>> {
    if ctx.card_keys.len() != ctx.deck_size {
        return Err(ProtocolError::Local("shuffle ended without per-card keys".into()));
    }
    info!(
        target = LOG_TARGET,
        client_id = %ctx.client_id,
        cards = ctx.deck_size,
        "shuffle complete"
    );
    Ok(None)
}
