use std::fmt;

use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Serialize};

use super::{CipherError, SharedPrime};

/// A plaintext card, identified by its label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Card(String);

impl Card {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn label(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Card {
    fn from(label: &str) -> Self {
        Card::new(label)
    }
}

/// Maps card labels to integers under a shared prime and back.
///
/// A label is read as a big-endian integer over its UTF-8 bytes. Encodings
/// must fall in `[2, p - 2]`: 0, 1 and p - 1 are fixed points of modular
/// exponentiation and would survive encryption unchanged.
#[derive(Debug, Clone)]
pub struct CardCodec {
    prime: SharedPrime,
}

impl CardCodec {
    pub fn new(prime: SharedPrime) -> Self {
        Self { prime }
    }

    pub fn encode(&self, card: &Card) -> Result<BigUint, CipherError> {
        let value = BigUint::from_bytes_be(card.label().as_bytes());
        let upper = self.prime.value() - BigUint::one();
        if value < BigUint::from(2u32) || value >= upper {
            return Err(CipherError::CardTooLarge(card.label().to_string()));
        }
        Ok(value)
    }

    pub fn encode_deck(&self, cards: &[Card]) -> Result<Vec<BigUint>, CipherError> {
        cards.iter().map(|card| self.encode(card)).collect()
    }

    pub fn decode(&self, value: &BigUint) -> Result<Card, CipherError> {
        let bytes = value.to_bytes_be();
        String::from_utf8(bytes)
            .map(Card)
            .map_err(|_| CipherError::UndecodableCard)
    }
}

/// Largest label byte length that always encodes below a prime of `bits` bits.
pub(crate) fn max_label_bytes(bits: u64) -> usize {
    (bits.saturating_sub(2) / 8) as usize
}
