use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::cipher::{CipherError, CipherKeyPair, SharedPrime};
use crate::signing::{Signable, TranscriptBuilder};

use super::types::{ClientId, DeckPosition, LedgerSequence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    KeyExchangeKeyPost,
    TurnOrderAndPrimePost,
    #[serde(rename = "shuffle-phase1-post")]
    ShufflePhase1Post,
    #[serde(rename = "shuffle-phase2-post")]
    ShufflePhase2Post,
    DrawRequest,
    DrawResponse,
    DiscardPost,
}

impl ActionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ActionKind::KeyExchangeKeyPost => "key-exchange-key-post",
            ActionKind::TurnOrderAndPrimePost => "turn-order-and-prime-post",
            ActionKind::ShufflePhase1Post => "shuffle-phase1-post",
            ActionKind::ShufflePhase2Post => "shuffle-phase2-post",
            ActionKind::DrawRequest => "draw-request",
            ActionKind::DrawResponse => "draw-response",
            ActionKind::DiscardPost => "discard-post",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-card key revealed to the opponent. The modulus is implied by the
/// shared prime and is not repeated on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisclosedKey {
    #[serde(with = "crate::ledger::serialization::biguint_string")]
    pub public: BigUint,
    #[serde(with = "crate::ledger::serialization::biguint_string")]
    pub private: BigUint,
}

impl fmt::Debug for DisclosedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisclosedKey").finish_non_exhaustive()
    }
}

impl DisclosedKey {
    pub fn into_key_pair(self, prime: &SharedPrime) -> Result<CipherKeyPair, CipherError> {
        CipherKeyPair::from_parts(prime, self.public, self.private)
    }
}

impl From<&CipherKeyPair> for DisclosedKey {
    fn from(key: &CipherKeyPair) -> Self {
        Self {
            public: key.public.clone(),
            private: key.private.clone(),
        }
    }
}

/// Kind-specific action body, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ActionPayload {
    #[serde(rename = "key-exchange-key-post")]
    KeyExchangeKeyPost {
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    #[serde(rename = "turn-order-and-prime-post")]
    TurnOrderAndPrimePost {
        #[serde(with = "crate::ledger::serialization::biguint_string")]
        prime: BigUint,
    },
    #[serde(rename = "shuffle-phase1-post")]
    ShufflePhase1Post {
        #[serde(with = "crate::ledger::serialization::biguint_vec")]
        deck: Vec<BigUint>,
    },
    #[serde(rename = "shuffle-phase2-post")]
    ShufflePhase2Post {
        #[serde(with = "crate::ledger::serialization::biguint_vec")]
        deck: Vec<BigUint>,
    },
    #[serde(rename = "draw-request")]
    DrawRequest { position: DeckPosition },
    #[serde(rename = "draw-response")]
    DrawResponse {
        position: DeckPosition,
        key: DisclosedKey,
    },
    #[serde(rename = "discard-post")]
    DiscardPost {
        position: DeckPosition,
        key: DisclosedKey,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::KeyExchangeKeyPost { .. } => ActionKind::KeyExchangeKeyPost,
            ActionPayload::TurnOrderAndPrimePost { .. } => ActionKind::TurnOrderAndPrimePost,
            ActionPayload::ShufflePhase1Post { .. } => ActionKind::ShufflePhase1Post,
            ActionPayload::ShufflePhase2Post { .. } => ActionKind::ShufflePhase2Post,
            ActionPayload::DrawRequest { .. } => ActionKind::DrawRequest,
            ActionPayload::DrawResponse { .. } => ActionKind::DrawResponse,
            ActionPayload::DiscardPost { .. } => ActionKind::DiscardPost,
        }
    }
}

/// An immutable ledger message: `{ senderId, kind, ...payload }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "senderId")]
    pub sender_id: ClientId,
    #[serde(flatten)]
    pub payload: ActionPayload,
}

impl Action {
    pub fn new(sender_id: ClientId, payload: ActionPayload) -> Self {
        Self { sender_id, payload }
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}

impl Signable for Action {
    fn domain_kind(&self) -> &'static str {
        "ledger/action_v1"
    }

    fn write_transcript(&self, builder: &mut TranscriptBuilder) {
        self.sender_id.write_transcript(builder);
        builder.append_str(self.kind().as_str());
        match &self.payload {
            ActionPayload::KeyExchangeKeyPost { public_key } => builder.append_str(public_key),
            ActionPayload::TurnOrderAndPrimePost { prime } => builder.append_biguint(prime),
            ActionPayload::ShufflePhase1Post { deck } | ActionPayload::ShufflePhase2Post { deck } => {
                builder.append_u64(deck.len() as u64);
                for card in deck {
                    builder.append_biguint(card);
                }
            }
            ActionPayload::DrawRequest { position } => builder.append_u64(*position as u64),
            ActionPayload::DrawResponse { position, key }
            | ActionPayload::DiscardPost { position, key } => {
                builder.append_u64(*position as u64);
                builder.append_biguint(&key.public);
                builder.append_biguint(&key.private);
            }
        }
    }
}

/// Digest naming one session: every participant and its signing key.
pub type SessionId = [u8; 32];

/// What a transport signature covers: the action, the session it belongs to,
/// and the sender's running nonce. A signed action cannot be replayed into
/// another session or a second time within the same one.
#[derive(Debug, Clone, Copy)]
pub struct BoundAction<'a> {
    pub session_id: &'a SessionId,
    pub nonce: u64,
    pub action: &'a Action,
}

impl Signable for BoundAction<'_> {
    fn domain_kind(&self) -> &'static str {
        "ledger/bound_action_v1"
    }

    fn write_transcript(&self, builder: &mut TranscriptBuilder) {
        builder.append_bytes(self.session_id);
        builder.append_u64(self.nonce);
        self.action.write_transcript(builder);
    }
}

/// What the ledger stores: an action plus an optional transport signature
/// and the nonce it was signed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Envelope {
    pub fn unsigned(action: Action) -> Self {
        Self {
            action,
            nonce: None,
            signature: None,
        }
    }
}

/// An envelope together with its position in the ledger's total order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence: LedgerSequence,
    pub envelope: Envelope,
}
