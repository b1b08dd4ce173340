//! Per-card key disclosure after the shuffle.
//!
//! Every deck position is locked by one key from each party. Drawing asks the
//! peer for its key at one position; discarding reveals our own key for a card
//! we hold. A key for any other position is never disclosed, and a peer that
//! discloses one unasked is a violation.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use num_bigint::BigUint;
use tracing::{debug, info};

use crate::cipher::{decrypt, Card, CardCodec, CipherKeyPair, SharedPrime};
use crate::error::{ProtocolError, ProtocolResult, Violation};
use crate::ledger::messages::{Action, ActionKind, ActionPayload, DisclosedKey};
use crate::ledger::types::{ClientId, DeckPosition};
use crate::machine::{expect_sender, unexpected, Sequence, Step};

const LOG_TARGET: &str = "mental_poker::protocol::deal";

/// Dealing state for one party, carried across draw and discard runs.
pub struct DealContext {
    pub client_id: ClientId,
    pub peer: ClientId,
    prime: SharedPrime,
    codec: CardCodec,
    labels: HashSet<Card>,
    deck: Vec<BigUint>,
    own_keys: Vec<CipherKeyPair>,
    hand: BTreeMap<DeckPosition, Card>,
    peer_hand: BTreeSet<DeckPosition>,
    public: BTreeMap<DeckPosition, Card>,
    pending_draw: Option<DeckPosition>,
    pending_serve: Option<DeckPosition>,
}

impl std::fmt::Debug for DealContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DealContext")
            .field("client_id", &self.client_id)
            .field("peer", &self.peer)
            .field("hand", &self.hand.keys().collect::<Vec<_>>())
            .field("peer_hand", &self.peer_hand)
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl DealContext {
    pub fn new(
        client_id: ClientId,
        peer: ClientId,
        prime: SharedPrime,
        cards: &[Card],
        deck: Vec<BigUint>,
        own_keys: Vec<CipherKeyPair>,
    ) -> ProtocolResult<Self> {
        if deck.len() != cards.len() || own_keys.len() != cards.len() {
            return Err(ProtocolError::Local(format!(
                "deal needs {} cards and keys, got {} and {}",
                cards.len(),
                deck.len(),
                own_keys.len()
            )));
        }
        for key in &own_keys {
            key.ensure_modulus(&prime)?;
        }
        Ok(Self {
            client_id,
            peer,
            codec: CardCodec::new(prime.clone()),
            prime,
            labels: cards.iter().cloned().collect(),
            deck,
            own_keys,
            hand: BTreeMap::new(),
            peer_hand: BTreeSet::new(),
            public: BTreeMap::new(),
            pending_draw: None,
            pending_serve: None,
        })
    }

    pub fn hand(&self) -> &BTreeMap<DeckPosition, Card> {
        &self.hand
    }

    /// Positions the peer has drawn and not yet discarded.
    pub fn peer_hand(&self) -> &BTreeSet<DeckPosition> {
        &self.peer_hand
    }

    pub fn public_cards(&self) -> &BTreeMap<DeckPosition, Card> {
        &self.public
    }

    pub fn deck(&self) -> &[BigUint] {
        &self.deck
    }

    #[cfg(test)]
    pub(crate) fn own_key(&self, position: DeckPosition) -> Option<&CipherKeyPair> {
        self.own_keys.get(position)
    }

    pub fn is_dealt(&self, position: DeckPosition) -> bool {
        self.hand.contains_key(&position)
            || self.peer_hand.contains(&position)
            || self.public.contains_key(&position)
    }

    /// Removes both parties' keys from `position` and decodes the card.
    fn reveal(
        &self,
        sender: &ClientId,
        position: DeckPosition,
        key: &DisclosedKey,
    ) -> Result<Card, Violation> {
        let malformed = |reason: String| Violation::Malformed {
            sender: sender.clone(),
            reason,
        };
        let peer_key = key
            .clone()
            .into_key_pair(&self.prime)
            .map_err(|err| malformed(format!("disclosed key for position {position}: {err}")))?;
        let locked = &self.deck[position];
        let card = decrypt(locked, &peer_key)
            .and_then(|half| decrypt(&half, &self.own_keys[position]))
            .and_then(|plain| self.codec.decode(&plain))
            .map_err(|err| malformed(format!("position {position} does not open: {err}")))?;
        if !self.labels.contains(&card) {
            return Err(malformed(format!(
                "position {position} opens to a card outside the deck"
            )));
        }
        Ok(card)
    }

    fn check_position(&self, sender: &ClientId, position: DeckPosition) -> Result<(), Violation> {
        if position >= self.deck.len() {
            return Err(Violation::OutOfRange {
                sender: sender.clone(),
                reason: format!("position {position} is past the deck of {}", self.deck.len()),
            });
        }
        if self.is_dealt(position) {
            return Err(Violation::OutOfRange {
                sender: sender.clone(),
                reason: format!("position {position} was already dealt"),
            });
        }
        Ok(())
    }
}

/// Requester side: ask the peer for its key at `position` and open the card.
pub fn draw_sequence(position: DeckPosition) -> Sequence<DealContext> {
    Sequence::new()
        .then(Step::local("request-draw", move |ctx: &mut DealContext| {
            let local = ctx.client_id.clone();
            ctx.check_position(&local, position)
                .map_err(|err| ProtocolError::Local(err.to_string()))?;
            ctx.pending_draw = Some(position);
            Ok(Some(ActionPayload::DrawRequest { position }))
        }))
        .then(Step::remote("own-draw-request", |action, ctx: &mut DealContext| {
            let ActionPayload::DrawRequest { position } = &action.payload else {
                return Err(unexpected(action, ActionKind::DrawRequest).into());
            };
            expect_sender(action, &ctx.client_id)?;
            expect_pending(ctx.pending_draw, *position, &action.sender_id)
        }))
        .then(Step::remote("receive-draw-response", receive_draw_response))
}

fn receive_draw_response(action: &Action, ctx: &mut DealContext) -> ProtocolResult<()> {
    let ActionPayload::DrawResponse { position, key } = &action.payload else {
        return Err(unexpected(action, ActionKind::DrawResponse).into());
    };
    expect_sender(action, &ctx.peer)?;
    if ctx.pending_draw != Some(*position) {
        return Err(Violation::UnsolicitedDisclosure {
            sender: action.sender_id.clone(),
            position: *position,
        }
        .into());
    }

    let card = ctx.reveal(&action.sender_id, *position, key)?;
    ctx.pending_draw = None;
    info!(
        target = LOG_TARGET,
        client_id = %ctx.client_id,
        position,
        "drew card"
    );
    ctx.hand.insert(*position, card);
    Ok(())
}

/// Discloser side: answer one draw request with our key for that position
/// only.
pub fn serve_draw_sequence() -> Sequence<DealContext> {
    Sequence::new()
        .then(Step::remote("receive-draw-request", |action, ctx: &mut DealContext| {
            let ActionPayload::DrawRequest { position } = &action.payload else {
                return Err(unexpected(action, ActionKind::DrawRequest).into());
            };
            expect_sender(action, &ctx.peer)?;
            ctx.check_position(&action.sender_id, *position)?;
            ctx.pending_serve = Some(*position);
            Ok(())
        }))
        .then(Step::local("disclose-card-key", |ctx: &mut DealContext| {
            let position = ctx
                .pending_serve
                .ok_or_else(|| ProtocolError::Local("no draw request to serve".into()))?;
            let key = DisclosedKey::from(&ctx.own_keys[position]);
            debug!(
                target = LOG_TARGET,
                client_id = %ctx.client_id,
                position,
                "disclosing card key to peer"
            );
            Ok(Some(ActionPayload::DrawResponse { position, key }))
        }))
        .then(Step::remote("own-draw-response", |action, ctx: &mut DealContext| {
            let ActionPayload::DrawResponse { position, .. } = &action.payload else {
                return Err(unexpected(action, ActionKind::DrawResponse).into());
            };
            expect_sender(action, &ctx.client_id)?;
            expect_pending(ctx.pending_serve, *position, &action.sender_id)?;
            ctx.pending_serve = None;
            ctx.peer_hand.insert(*position);
            Ok(())
        }))
}

/// Holder side: reveal our key for a card in our hand, making it public.
///
/// The card leaves our hand only once the post is back from the ledger.
pub fn discard_sequence(position: DeckPosition) -> Sequence<DealContext> {
    Sequence::new()
        .then(Step::local("post-discard", move |ctx: &mut DealContext| {
            if !ctx.hand.contains_key(&position) {
                return Err(ProtocolError::Local(format!(
                    "position {position} is not in our hand"
                )));
            }
            let key = DisclosedKey::from(&ctx.own_keys[position]);
            Ok(Some(ActionPayload::DiscardPost { position, key }))
        }))
        .then(Step::remote("own-discard", move |action, ctx: &mut DealContext| {
            let ActionPayload::DiscardPost { position: posted, .. } = &action.payload else {
                return Err(unexpected(action, ActionKind::DiscardPost).into());
            };
            expect_sender(action, &ctx.client_id)?;
            expect_pending(Some(position), *posted, &action.sender_id)?;
            let card = ctx.hand.remove(&position).ok_or_else(|| {
                ProtocolError::Local(format!("position {position} left our hand mid-discard"))
            })?;
            ctx.public.insert(position, card);
            Ok(())
        }))
}

/// Opponent side: open a card the peer discarded from its hand.
pub fn observe_discard_sequence() -> Sequence<DealContext> {
    Sequence::new().then(Step::remote("receive-discard", receive_discard))
}

fn receive_discard(action: &Action, ctx: &mut DealContext) -> ProtocolResult<()> {
    let ActionPayload::DiscardPost { position, key } = &action.payload else {
        return Err(unexpected(action, ActionKind::DiscardPost).into());
    };
    expect_sender(action, &ctx.peer)?;
    if !ctx.peer_hand.contains(position) {
        return Err(Violation::UnsolicitedDisclosure {
            sender: action.sender_id.clone(),
            position: *position,
        }
        .into());
    }

    let card = ctx.reveal(&action.sender_id, *position, key)?;
    ctx.peer_hand.remove(position);
    info!(
        target = LOG_TARGET,
        client_id = %ctx.client_id,
        position,
        card = %card,
        "peer discarded"
    );
    ctx.public.insert(*position, card);
    Ok(())
}

/// Our own post must echo the position we are working on.
fn expect_pending(
    pending: Option<DeckPosition>,
    posted: DeckPosition,
    sender: &ClientId,
) -> ProtocolResult<()> {
    if pending != Some(posted) {
        return Err(Violation::OutOfRange {
            sender: sender.clone(),
            reason: format!("posted position {posted} does not match {pending:?}"),
        }
        .into());
    }
    Ok(())
}
