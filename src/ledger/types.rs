use std::fmt;

use serde::{Deserialize, Serialize};

use crate::signing::{Signable, TranscriptBuilder};

/// Identity of a participant on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        ClientId::new(id)
    }
}

impl Signable for ClientId {
    fn domain_kind(&self) -> &'static str {
        "ledger/client_id_v1"
    }

    fn write_transcript(&self, builder: &mut TranscriptBuilder) {
        builder.append_str(&self.0);
    }
}

/// Zero-based position of an entry in the ledger's total order.
pub type LedgerSequence = u64;

/// Index of a card in the shuffled deck.
pub type DeckPosition = usize;
