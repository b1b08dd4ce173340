use tracing::info;

use crate::error::{ProtocolError, ProtocolResult, Violation};
use crate::ledger::messages::{Action, ActionKind, ActionPayload};
use crate::ledger::signed::KeyStore;
use crate::ledger::types::ClientId;
use crate::machine::{unexpected, Sequence, Step};
use crate::signing::{decode_public_key, SigningKeyPair};

const LOG_TARGET: &str = "mental_poker::protocol::key_exchange";

/// State for one key-exchange run over the unsigned transport.
#[derive(Debug)]
pub struct KeyExchangeContext {
    pub client_id: ClientId,
    pub signing_key: SigningKeyPair,
    pub participants: usize,
    pub key_store: KeyStore,
    /// Participants in the order their keys were observed.
    pub observed: Vec<ClientId>,
}

impl KeyExchangeContext {
    pub fn new(client_id: ClientId, signing_key: SigningKeyPair, participants: usize) -> Self {
        Self {
            client_id,
            signing_key,
            participants,
            key_store: KeyStore::new(),
            observed: Vec::with_capacity(participants),
        }
    }
}

/// Posts our signing key, records one key per participant, then checks that
/// every participant, ourselves included, was heard from.
pub fn key_exchange_sequence(participants: usize) -> Sequence<KeyExchangeContext> {
    Sequence::new()
        .then(Step::local("post-signing-key", post_signing_key))
        .repeat(Step::remote("record-signing-key", record_signing_key), participants)
        .then(Step::local("check-key-exchange", check_complete))
}

fn post_signing_key(ctx: &mut KeyExchangeContext) -> ProtocolResult<Option<ActionPayload>> {
    let public_key = ctx
        .signing_key
        .public_hex()
        .map_err(|err| ProtocolError::Signing(err.to_string()))?;
    Ok(Some(ActionPayload::KeyExchangeKeyPost { public_key }))
}

fn record_signing_key(action: &Action, ctx: &mut KeyExchangeContext) -> ProtocolResult<()> {
    let ActionPayload::KeyExchangeKeyPost { public_key } = &action.payload else {
        return Err(unexpected(action, ActionKind::KeyExchangeKeyPost).into());
    };
    let sender = &action.sender_id;

    let key = decode_public_key(public_key).map_err(|err| Violation::Malformed {
        sender: sender.clone(),
        reason: format!("signing key: {err}"),
    })?;
    if *sender == ctx.client_id && key != ctx.signing_key.public {
        return Err(Violation::Malformed {
            sender: sender.clone(),
            reason: "key posted under our identity is not ours".into(),
        }
        .into());
    }
    if !ctx.key_store.insert(sender.clone(), key) {
        return Err(Violation::DuplicateSender {
            kind: ActionKind::KeyExchangeKeyPost.as_str(),
            sender: sender.clone(),
        }
        .into());
    }
    ctx.observed.push(sender.clone());
    Ok(())
}

fn check_complete(ctx: &mut KeyExchangeContext) -> ProtocolResult<Option<ActionPayload>> {
    if !ctx.key_store.contains(&ctx.client_id) {
        return Err(Violation::UnknownSender(ctx.client_id.clone()).into());
    }
    if ctx.key_store.len() != ctx.participants {
        return Err(Violation::MissingSender {
            expected: ctx.participants,
            found: ctx.key_store.len(),
        }
        .into());
    }
    info!(
        target = LOG_TARGET,
        client_id = %ctx.client_id,
        participants = ctx.participants,
        "signing keys exchanged"
    );
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::messages::Envelope;
    use crate::ledger::queue::ActionQueue;
    use crate::ledger::transport::{InMemoryLedger, Transport};
    use crate::machine::{run, RunOptions};
    use crate::signing::{generate_signing_key_pair, signing_parameters};
    use rand::{rngs::StdRng, SeedableRng};

    fn signing_key(seed: u64) -> SigningKeyPair {
        let params = signing_parameters().unwrap();
        generate_signing_key_pair(&params, &mut StdRng::seed_from_u64(seed)).unwrap()
    }

    async fn post_key(ledger: &InMemoryLedger, sender: &str, key: &SigningKeyPair) {
        let action = Action::new(
            ClientId::new(sender),
            ActionPayload::KeyExchangeKeyPost {
                public_key: key.public_hex().unwrap(),
            },
        );
        ledger.post(Envelope::unsigned(action)).await.unwrap();
    }

    #[tokio::test]
    async fn two_parties_learn_each_others_keys() {
        let ledger = InMemoryLedger::new();
        let alice_key = signing_key(1);
        let bob_key = signing_key(2);

        let alice_queue = ActionQueue::attach(ClientId::new("alice"), ledger.clone()).unwrap();
        let bob_queue = ActionQueue::attach(ClientId::new("bob"), ledger.clone()).unwrap();
        let mut alice = KeyExchangeContext::new(ClientId::new("alice"), alice_key.clone(), 2);
        let mut bob = KeyExchangeContext::new(ClientId::new("bob"), bob_key.clone(), 2);

        let sequence = key_exchange_sequence(2);
        let options = RunOptions::default();
        let (a, b) = tokio::join!(
            run(&sequence, &alice_queue, &mut alice, &options),
            run(&sequence, &bob_queue, &mut bob, &options)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(alice.key_store.get(&ClientId::new("bob")), Some(&bob_key.public));
        assert_eq!(bob.key_store.get(&ClientId::new("alice")), Some(&alice_key.public));
        assert_eq!(alice.observed, bob.observed);
        assert_eq!(alice_queue.cursor(), 2);
    }

    #[tokio::test]
    async fn duplicate_sender_is_a_violation() {
        let ledger = InMemoryLedger::new();
        let mallory_key = signing_key(3);
        post_key(&ledger, "mallory", &mallory_key).await;
        post_key(&ledger, "mallory", &mallory_key).await;

        let queue = ActionQueue::attach(ClientId::new("alice"), ledger.clone()).unwrap();
        let mut ctx = KeyExchangeContext::new(ClientId::new("alice"), signing_key(4), 2);
        let sequence =
            Sequence::new().repeat(Step::remote("record-signing-key", record_signing_key), 2);
        let err = run(&sequence, &queue, &mut ctx, &RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&Violation::DuplicateSender {
                kind: "key-exchange-key-post",
                sender: ClientId::new("mallory"),
            })
        );
        assert_eq!(ctx.key_store.len(), 1);
    }

    #[tokio::test]
    async fn missing_self_is_reported_after_repeat() {
        let ledger = InMemoryLedger::new();
        post_key(&ledger, "bob", &signing_key(5)).await;
        post_key(&ledger, "carol", &signing_key(6)).await;

        let queue = ActionQueue::attach(ClientId::new("alice"), ledger.clone()).unwrap();
        let mut ctx = KeyExchangeContext::new(ClientId::new("alice"), signing_key(7), 2);
        let sequence = Sequence::new()
            .repeat(Step::remote("record-signing-key", record_signing_key), 2)
            .then(Step::local("check-key-exchange", check_complete));
        let err = run(&sequence, &queue, &mut ctx, &RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&Violation::UnknownSender(ClientId::new("alice")))
        );
    }

    #[tokio::test]
    async fn malformed_and_impersonated_keys_are_rejected() {
        let ledger = InMemoryLedger::new();
        ledger
            .post(Envelope::unsigned(Action::new(
                ClientId::new("bob"),
                ActionPayload::KeyExchangeKeyPost {
                    public_key: "zz".into(),
                },
            )))
            .await
            .unwrap();
        let queue = ActionQueue::attach(ClientId::new("alice"), ledger.clone()).unwrap();
        let mut ctx = KeyExchangeContext::new(ClientId::new("alice"), signing_key(8), 2);
        let step = Sequence::new().then(Step::remote("record-signing-key", record_signing_key));
        let err = run(&step, &queue, &mut ctx, &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.violation(), Some(Violation::Malformed { .. })));

        let ledger = InMemoryLedger::new();
        post_key(&ledger, "alice", &signing_key(9)).await;
        let queue = ActionQueue::attach(ClientId::new("alice"), ledger.clone()).unwrap();
        let mut ctx = KeyExchangeContext::new(ClientId::new("alice"), signing_key(10), 2);
        let err = run(&step, &queue, &mut ctx, &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.violation(), Some(Violation::Malformed { .. })));
        assert!(ctx.key_store.is_empty());
    }
}
