use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{ProtocolError, Violation};
use crate::signing::{sign, verify, SigningKeyPair, SigningParameters, SigningPublicKey};

use super::messages::{BoundAction, Envelope, LedgerEntry, SessionId};
use super::serialization::canonical_serialize_bytes;
use super::transport::{EntryFeed, Transport, TransportError};
use super::types::{ClientId, LedgerSequence};

const LOG_TARGET: &str = "mental_poker::ledger::signed";
const SESSION_TAG: &[u8] = b"mental-poker/session/v1";

/// Signing public keys by participant. Filled during key exchange, then frozen.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    keys: BTreeMap<ClientId, SigningPublicKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a participant's key. A second key for the same participant is
    /// refused.
    pub fn insert(&mut self, client_id: ClientId, key: SigningPublicKey) -> bool {
        if self.keys.contains_key(&client_id) {
            return false;
        }
        self.keys.insert(client_id, key);
        true
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&SigningPublicKey> {
        self.keys.get(client_id)
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.keys.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn participants(&self) -> impl Iterator<Item = &ClientId> {
        self.keys.keys()
    }

    /// Read-only shared view used by the signed transport.
    pub fn freeze(self) -> Arc<KeyStore> {
        Arc::new(self)
    }

    /// Hash of every `(participant, key)` pair in id order. Signing keys are
    /// generated per session, so two sessions never share an id.
    pub fn session_id(&self) -> Result<SessionId, TransportError> {
        let mut hasher = Sha256::new();
        hasher.update(SESSION_TAG);
        for (client_id, key) in &self.keys {
            let key_bytes = canonical_serialize_bytes(key)
                .map_err(|err| TransportError::Signing(err.to_string()))?;
            hasher.update((client_id.as_str().len() as u32).to_be_bytes());
            hasher.update(client_id.as_str().as_bytes());
            hasher.update((key_bytes.len() as u32).to_be_bytes());
            hasher.update(&key_bytes);
        }
        Ok(hasher.finalize().into())
    }
}

/// Decorates a transport with per-action signatures.
///
/// Outbound envelopes are signed with the local key over a [`BoundAction`]:
/// the action, the session id, and a nonce that grows with every post.
/// Inbound envelopes are verified against the sender's key from the
/// [`KeyStore`]; an unsigned, unknown, badly signed, or replayed envelope
/// ends the feed with a [`Violation`].
pub struct SignedTransport {
    inner: Arc<dyn Transport>,
    client_id: ClientId,
    signing_key: SigningKeyPair,
    params: Arc<SigningParameters>,
    key_store: Arc<KeyStore>,
    session_id: SessionId,
    rng: Mutex<StdRng>,
    // Held across the inner post so nonces reach the ledger in order.
    next_nonce: tokio::sync::Mutex<u64>,
}

impl SignedTransport {
    pub fn new(
        inner: Arc<dyn Transport>,
        client_id: ClientId,
        signing_key: SigningKeyPair,
        params: Arc<SigningParameters>,
        key_store: Arc<KeyStore>,
        rng_seed: [u8; 32],
    ) -> Result<Self, TransportError> {
        let session_id = key_store.session_id()?;
        Ok(Self {
            inner,
            client_id,
            signing_key,
            params,
            key_store,
            session_id,
            rng: Mutex::new(StdRng::from_seed(rng_seed)),
            next_nonce: tokio::sync::Mutex::new(0),
        })
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.key_store
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

/// Checks one inbound entry's signature against the key store and session.
/// Returns the nonce the entry was signed under.
pub fn verify_entry(
    entry: &LedgerEntry,
    params: &SigningParameters,
    key_store: &KeyStore,
    session_id: &SessionId,
) -> Result<u64, Violation> {
    let sender = &entry.envelope.action.sender_id;
    let public = key_store
        .get(sender)
        .ok_or_else(|| Violation::UnknownSender(sender.clone()))?;
    let signature = entry
        .envelope
        .signature
        .as_deref()
        .ok_or_else(|| Violation::MissingSignature(sender.clone()))?;
    let nonce = entry
        .envelope
        .nonce
        .ok_or_else(|| Violation::InvalidSignature(sender.clone()))?;
    let bound = BoundAction {
        session_id,
        nonce,
        action: &entry.envelope.action,
    };
    match verify(&bound, signature, params, public) {
        Ok(true) => Ok(nonce),
        Ok(false) | Err(_) => Err(Violation::InvalidSignature(sender.clone())),
    }
}

/// Highest nonce seen per sender. A verified entry must carry a nonce above
/// its sender's previous one.
#[derive(Debug, Default)]
pub struct NonceTracker {
    last: HashMap<ClientId, u64>,
}

impl NonceTracker {
    pub fn observe(&mut self, sender: &ClientId, nonce: u64) -> Result<(), Violation> {
        match self.last.get(sender) {
            Some(last) if nonce <= *last => Err(Violation::ReplayedAction {
                sender: sender.clone(),
                nonce,
            }),
            _ => {
                self.last.insert(sender.clone(), nonce);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Transport for SignedTransport {
    async fn post(&self, envelope: Envelope) -> Result<LedgerSequence, TransportError> {
        if envelope.action.sender_id != self.client_id {
            return Err(TransportError::Signing(format!(
                "refusing to sign an action for {}",
                envelope.action.sender_id
            )));
        }
        let mut next_nonce = self.next_nonce.lock().await;
        let nonce = *next_nonce;
        let signature = {
            let bound = BoundAction {
                session_id: &self.session_id,
                nonce,
                action: &envelope.action,
            };
            let mut rng = self.rng.lock();
            sign(&bound, &self.params, &self.signing_key.secret, &mut *rng)
                .map_err(|err| TransportError::Signing(err.to_string()))?
        };
        // A failed post still burns the nonce; gaps are allowed.
        *next_nonce += 1;
        let signed = Envelope {
            action: envelope.action,
            nonce: Some(nonce),
            signature: Some(signature),
        };
        self.inner.post(signed).await
    }

    fn subscribe(&self, from: LedgerSequence) -> Result<EntryFeed, TransportError> {
        let params = Arc::clone(&self.params);
        let key_store = Arc::clone(&self.key_store);
        let session_id = self.session_id;
        let client_id = self.client_id.clone();
        let mut nonces = NonceTracker::default();
        let feed = self.inner.subscribe(from)?;

        Ok(feed
            .map(move |item| {
                let entry = item?;
                let checked = verify_entry(&entry, &params, &key_store, &session_id)
                    .and_then(|nonce| nonces.observe(&entry.envelope.action.sender_id, nonce));
                if let Err(violation) = checked {
                    warn!(
                        target = LOG_TARGET,
                        client_id = %client_id,
                        sequence = entry.sequence,
                        error = %violation,
                        "rejecting inbound action"
                    );
                    return Err(ProtocolError::PeerViolation(violation));
                }
                Ok(entry)
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::messages::{Action, ActionPayload};
    use crate::ledger::queue::ActionQueue;
    use crate::ledger::transport::InMemoryLedger;
    use crate::signing::{generate_signing_key_pair, signing_parameters};

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        params: Arc<SigningParameters>,
        alice: SigningKeyPair,
        bob: SigningKeyPair,
        store: Arc<KeyStore>,
    }

    fn fixture() -> Fixture {
        let params = Arc::new(signing_parameters().unwrap());
        let mut rng = StdRng::seed_from_u64(21);
        let alice = generate_signing_key_pair(&params, &mut rng).unwrap();
        let bob = generate_signing_key_pair(&params, &mut rng).unwrap();
        let mut store = KeyStore::new();
        assert!(store.insert(ClientId::new("alice"), alice.public));
        assert!(store.insert(ClientId::new("bob"), bob.public));
        Fixture {
            ledger: InMemoryLedger::new(),
            params,
            alice,
            bob,
            store: store.freeze(),
        }
    }

    fn signed(fx: &Fixture, id: &str, key: &SigningKeyPair) -> Arc<SignedTransport> {
        Arc::new(
            SignedTransport::new(
                fx.ledger.clone(),
                ClientId::new(id),
                key.clone(),
                Arc::clone(&fx.params),
                Arc::clone(&fx.store),
                [7u8; 32],
            )
            .unwrap(),
        )
    }

    fn draw(sender: &str, position: usize) -> Action {
        Action::new(ClientId::new(sender), ActionPayload::DrawRequest { position })
    }

    #[test]
    fn key_store_refuses_second_key() {
        let fx = fixture();
        let mut store = KeyStore::new();
        assert!(store.insert(ClientId::new("alice"), fx.alice.public));
        assert!(!store.insert(ClientId::new("alice"), fx.bob.public));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn signed_actions_are_delivered_to_peers() {
        let fx = fixture();
        let alice = signed(&fx, "alice", &fx.alice);
        let bob = signed(&fx, "bob", &fx.bob);
        let bob_queue = ActionQueue::attach(ClientId::new("bob"), bob).unwrap();

        alice.post(Envelope::unsigned(draw("alice", 3))).await.unwrap();
        assert_eq!(bob_queue.dequeue().await.unwrap(), draw("alice", 3));
        assert!(fx.ledger.entries()[0].envelope.signature.is_some());
    }

    #[tokio::test]
    async fn unsigned_actions_are_rejected() {
        let fx = fixture();
        let bob_queue =
            ActionQueue::attach(ClientId::new("bob"), signed(&fx, "bob", &fx.bob)).unwrap();

        fx.ledger.post(Envelope::unsigned(draw("alice", 0))).await.unwrap();
        let err = bob_queue.dequeue().await.unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&Violation::MissingSignature(ClientId::new("alice")))
        );
    }

    #[tokio::test]
    async fn tampered_actions_are_rejected() {
        let fx = fixture();
        let alice = signed(&fx, "alice", &fx.alice);
        let bob_queue =
            ActionQueue::attach(ClientId::new("bob"), signed(&fx, "bob", &fx.bob)).unwrap();

        alice.post(Envelope::unsigned(draw("alice", 1))).await.unwrap();
        let mut forged = fx.ledger.entries()[0].envelope.clone();
        forged.action = draw("alice", 2);
        fx.ledger.post(forged).await.unwrap();

        assert_eq!(bob_queue.dequeue().await.unwrap(), draw("alice", 1));
        let err = bob_queue.dequeue().await.unwrap_err();
        assert!(err.is_peer_violation());
        assert_eq!(
            err.violation(),
            Some(&Violation::InvalidSignature(ClientId::new("alice")))
        );
    }

    #[tokio::test]
    async fn impersonation_is_rejected() {
        let fx = fixture();
        let bob_queue =
            ActionQueue::attach(ClientId::new("bob"), signed(&fx, "bob", &fx.bob)).unwrap();

        // bob's key signing an action that claims to come from alice
        let mut rng = StdRng::seed_from_u64(3);
        let action = draw("alice", 0);
        let bound = BoundAction {
            session_id: &fx.store.session_id().unwrap(),
            nonce: 0,
            action: &action,
        };
        let signature = sign(&bound, &fx.params, &fx.bob.secret, &mut rng).unwrap();
        fx.ledger
            .post(Envelope {
                action,
                nonce: Some(0),
                signature: Some(signature),
            })
            .await
            .unwrap();

        let err = bob_queue.dequeue().await.unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&Violation::InvalidSignature(ClientId::new("alice")))
        );
    }

    #[tokio::test]
    async fn unknown_senders_are_rejected() {
        let fx = fixture();
        let bob_queue =
            ActionQueue::attach(ClientId::new("bob"), signed(&fx, "bob", &fx.bob)).unwrap();
        fx.ledger
            .post(Envelope {
                action: draw("mallory", 0),
                nonce: Some(0),
                signature: Some("00".into()),
            })
            .await
            .unwrap();
        let err = bob_queue.dequeue().await.unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&Violation::UnknownSender(ClientId::new("mallory")))
        );
    }

    #[tokio::test]
    async fn reposted_actions_are_rejected_as_replays() {
        let fx = fixture();
        let alice = signed(&fx, "alice", &fx.alice);
        let bob_queue =
            ActionQueue::attach(ClientId::new("bob"), signed(&fx, "bob", &fx.bob)).unwrap();

        alice.post(Envelope::unsigned(draw("alice", 1))).await.unwrap();
        alice.post(Envelope::unsigned(draw("alice", 2))).await.unwrap();
        let replay = fx.ledger.entries()[0].envelope.clone();
        assert_eq!(replay.nonce, Some(0));
        fx.ledger.post(replay).await.unwrap();

        assert_eq!(bob_queue.dequeue().await.unwrap(), draw("alice", 1));
        assert_eq!(bob_queue.dequeue().await.unwrap(), draw("alice", 2));
        let err = bob_queue.dequeue().await.unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&Violation::ReplayedAction {
                sender: ClientId::new("alice"),
                nonce: 0,
            })
        );
    }

    #[tokio::test]
    async fn actions_from_another_session_do_not_verify() {
        let fx = fixture();
        let alice = signed(&fx, "alice", &fx.alice);
        alice.post(Envelope::unsigned(draw("alice", 1))).await.unwrap();
        let foreign = fx.ledger.entries()[0].clone();

        // same alice key, different bob key: a different session
        let mut rng = StdRng::seed_from_u64(99);
        let other_bob = generate_signing_key_pair(&fx.params, &mut rng).unwrap();
        let mut store = KeyStore::new();
        store.insert(ClientId::new("alice"), fx.alice.public);
        store.insert(ClientId::new("bob"), other_bob.public);
        let other_session = store.session_id().unwrap();
        assert_ne!(&other_session, alice.session_id());

        let verified = verify_entry(&foreign, &fx.params, &fx.store, alice.session_id());
        assert_eq!(verified, Ok(0));
        assert_eq!(
            verify_entry(&foreign, &fx.params, &store, &other_session),
            Err(Violation::InvalidSignature(ClientId::new("alice")))
        );
    }

    #[test]
    fn nonces_must_grow_per_sender() {
        let mut tracker = NonceTracker::default();
        let (alice, bob) = (ClientId::new("alice"), ClientId::new("bob"));
        assert!(tracker.observe(&alice, 0).is_ok());
        assert!(tracker.observe(&bob, 0).is_ok());
        assert!(tracker.observe(&alice, 3).is_ok());
        assert!(tracker.observe(&alice, 3).is_err());
        assert!(tracker.observe(&alice, 1).is_err());
        assert!(tracker.observe(&bob, 1).is_ok());
    }

    #[tokio::test]
    async fn signing_for_someone_else_is_refused() {
        let fx = fixture();
        let alice = signed(&fx, "alice", &fx.alice);
        let err = alice
            .post(Envelope::unsigned(draw("bob", 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Signing(_)));
        assert!(fx.ledger.is_empty());
    }
}
