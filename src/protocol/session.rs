use std::collections::BTreeMap;
use std::sync::Arc;

use num_bigint::BigUint;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;

use crate::cipher::{Card, SharedPrime};
use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, ProtocolResult};
use crate::ledger::queue::ActionQueue;
use crate::ledger::signed::SignedTransport;
use crate::ledger::transport::Transport;
use crate::ledger::types::{ClientId, DeckPosition};
use crate::machine::{run, RunOptions};
use crate::signing::{generate_signing_key_pair, signing_parameters};

use super::deal::{
    discard_sequence, draw_sequence, observe_discard_sequence, serve_draw_sequence, DealContext,
};
use super::key_exchange::{key_exchange_sequence, KeyExchangeContext};
use super::shuffle::{shuffle_sequence, ShuffleContext};
use super::turn_order::{search_candidate_prime, turn_order_sequence, TurnOrderContext};

const LOG_TARGET: &str = "mental_poker::protocol::session";

/// One participant's game after setup: signed transport, agreed turn order
/// and prime, and a shuffled deck ready to deal.
#[derive(Debug)]
pub struct PokerSession {
    client_id: ClientId,
    queue: ActionQueue,
    options: RunOptions,
    turn_order: Vec<ClientId>,
    prime: SharedPrime,
    deal: DealContext,
}

impl PokerSession {
    /// Runs key exchange, the signed upgrade, turn order and the shuffle.
    /// Each step is bounded by the configured step timeout.
    pub async fn establish(
        transport: Arc<dyn Transport>,
        config: ProtocolConfig,
        client_id: ClientId,
        rng_seed: [u8; 32],
    ) -> ProtocolResult<Self> {
        let options = RunOptions::with_timeout(config.step_timeout());
        Self::establish_with_options(transport, config, client_id, rng_seed, options).await
    }

    pub async fn establish_with_options(
        transport: Arc<dyn Transport>,
        config: ProtocolConfig,
        client_id: ClientId,
        rng_seed: [u8; 32],
        options: RunOptions,
    ) -> ProtocolResult<Self> {
        config.validate()?;
        let mut rng = StdRng::from_seed(rng_seed);

        let params = Arc::new(
            signing_parameters().map_err(|err| ProtocolError::Signing(err.to_string()))?,
        );
        let signing_key = generate_signing_key_pair(&params, &mut rng)
            .map_err(|err| ProtocolError::Signing(err.to_string()))?;

        // Keys travel unsigned; everything after is signed.
        let unsigned = ActionQueue::attach(client_id.clone(), Arc::clone(&transport))?;
        let mut exchange =
            KeyExchangeContext::new(client_id.clone(), signing_key.clone(), config.participants);
        run(
            &key_exchange_sequence(config.participants),
            &unsigned,
            &mut exchange,
            &options,
        )
        .await?;
        let cursor = unsigned.cursor();
        drop(unsigned);

        let signed = SignedTransport::new(
            transport,
            client_id.clone(),
            signing_key,
            params,
            exchange.key_store.freeze(),
            rng.gen(),
        )?;
        let queue = ActionQueue::attach_at(client_id.clone(), Arc::new(signed), cursor)?;

        let budget = config.prime_search_budget();
        let candidate =
            search_candidate_prime(config.key_bits, budget, fork_rng(&mut rng)).await?;
        let mut ordering = TurnOrderContext::new(
            client_id.clone(),
            config.participants,
            config.key_bits,
            candidate,
            budget.rounds,
            fork_rng(&mut rng),
        );
        run(
            &turn_order_sequence(config.participants),
            &queue,
            &mut ordering,
            &options,
        )
        .await?;
        let prime = ordering.agreed_prime()?.clone();
        let turn_order = ordering.turn_order;
        let peer = turn_order
            .iter()
            .find(|id| **id != client_id)
            .cloned()
            .ok_or_else(|| ProtocolError::Local("turn order has no peer".into()))?;

        let cards = config.deck_cards();
        let mut shuffle =
            ShuffleContext::new(client_id.clone(), prime.clone(), &cards, fork_rng(&mut rng))?;
        run(
            &shuffle_sequence(&turn_order, &client_id)?,
            &queue,
            &mut shuffle,
            &options,
        )
        .await?;
        let (deck, own_keys) = shuffle.into_parts();
        let deal = DealContext::new(client_id.clone(), peer, prime.clone(), &cards, deck, own_keys)?;

        info!(
            target = LOG_TARGET,
            client_id = %client_id,
            first = %turn_order[0],
            cards = cards.len(),
            "session established"
        );
        Ok(Self {
            client_id,
            queue,
            options,
            turn_order,
            prime,
            deal,
        })
    }

    /// Asks the peer to reveal `position` to us. The peer must be running
    /// [`PokerSession::serve_draw`].
    pub async fn draw(&mut self, position: DeckPosition) -> ProtocolResult<Card> {
        run(&draw_sequence(position), &self.queue, &mut self.deal, &self.options).await?;
        self.deal
            .hand()
            .get(&position)
            .cloned()
            .ok_or_else(|| ProtocolError::Local(format!("position {position} missing after draw")))
    }

    /// Answers the peer's next draw request. Returns the position served.
    pub async fn serve_draw(&mut self) -> ProtocolResult<DeckPosition> {
        let before = self.deal.peer_hand().clone();
        run(&serve_draw_sequence(), &self.queue, &mut self.deal, &self.options).await?;
        self.deal
            .peer_hand()
            .difference(&before)
            .next()
            .copied()
            .ok_or_else(|| ProtocolError::Local("served draw left no trace".into()))
    }

    /// Reveals a card from our hand to the peer.
    pub async fn discard(&mut self, position: DeckPosition) -> ProtocolResult<Card> {
        run(&discard_sequence(position), &self.queue, &mut self.deal, &self.options).await?;
        self.deal
            .public_cards()
            .get(&position)
            .cloned()
            .ok_or_else(|| {
                ProtocolError::Local(format!("position {position} missing after discard"))
            })
    }

    /// Opens the card the peer discards next.
    pub async fn observe_discard(&mut self) -> ProtocolResult<(DeckPosition, Card)> {
        let before: Vec<DeckPosition> = self.deal.public_cards().keys().copied().collect();
        run(&observe_discard_sequence(), &self.queue, &mut self.deal, &self.options).await?;
        self.deal
            .public_cards()
            .iter()
            .find(|(position, _)| !before.contains(position))
            .map(|(position, card)| (*position, card.clone()))
            .ok_or_else(|| ProtocolError::Local("observed discard left no trace".into()))
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn peer(&self) -> &ClientId {
        &self.deal.peer
    }

    pub fn hand(&self) -> &BTreeMap<DeckPosition, Card> {
        self.deal.hand()
    }

    pub fn public_cards(&self) -> &BTreeMap<DeckPosition, Card> {
        self.deal.public_cards()
    }

    pub fn turn_order(&self) -> &[ClientId] {
        &self.turn_order
    }

    pub fn shared_prime(&self) -> &SharedPrime {
        &self.prime
    }

    /// The shuffled, doubly locked deck as posted on the ledger.
    pub fn deck(&self) -> &[BigUint] {
        self.deal.deck()
    }

    pub fn run_options(&self) -> &RunOptions {
        &self.options
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    #[cfg(test)]
    pub(crate) fn deal_state(&self) -> &DealContext {
        &self.deal
    }
}

fn fork_rng(rng: &mut StdRng) -> StdRng {
    StdRng::from_seed(rng.gen())
}
