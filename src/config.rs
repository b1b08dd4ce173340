use std::collections::HashSet;
use std::time::Duration;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cipher::{max_label_bytes, Card};
use crate::number_theory::PrimeSearchBudget;

/// Smallest prime size accepted for a session. Leaves room for multi-byte
/// card labels below the prime.
pub const MIN_KEY_BITS: u64 = 32;

pub const DEFAULT_KEY_BITS: u64 = 256;
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

/// The shuffle and deal sequences are pairwise.
pub const SUPPORTED_PARTICIPANTS: usize = 2;

const RANKS: [&str; 13] = [
    "2", "3", "4", "5", "6", "7", "8", "9", "10", "J", "Q", "K", "A",
];
const SUITS: [&str; 4] = ["♣", "♦", "♥", "♠"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid protocol config: {0}")]
    Validation(String),

    #[error("failed to parse protocol config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Session parameters every participant must agree on out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Bit length of each candidate shared prime.
    pub key_bits: u64,
    /// Card labels in their initial, unshuffled order.
    pub deck: Vec<String>,
    pub miller_rabin_rounds: usize,
    pub prime_search: PrimeSearchBudget,
    pub step_timeout_ms: u64,
    pub participants: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let prime_search = PrimeSearchBudget::default();
        Self {
            key_bits: DEFAULT_KEY_BITS,
            deck: standard_deck_labels(),
            miller_rabin_rounds: prime_search.rounds,
            prime_search,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            participants: SUPPORTED_PARTICIPANTS,
        }
    }
}

impl ProtocolConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ProtocolConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.participants != SUPPORTED_PARTICIPANTS {
            return Err(ConfigError::validation(format!(
                "participants must be {SUPPORTED_PARTICIPANTS}, got {}",
                self.participants
            )));
        }
        if self.key_bits < MIN_KEY_BITS {
            return Err(ConfigError::validation(format!(
                "key_bits must be at least {MIN_KEY_BITS}"
            )));
        }
        if self.miller_rabin_rounds == 0 {
            return Err(ConfigError::validation(
                "miller_rabin_rounds must be greater than zero",
            ));
        }
        if self.prime_search.candidates_per_attempt == 0 || self.prime_search.max_attempts == 0 {
            return Err(ConfigError::validation(
                "prime_search budget must allow at least one candidate",
            ));
        }
        if self.step_timeout_ms == 0 {
            return Err(ConfigError::validation(
                "step_timeout_ms must be greater than zero",
            ));
        }
        if self.deck.len() < self.participants {
            return Err(ConfigError::validation(
                "deck must hold at least one card per participant",
            ));
        }

        let max_bytes = max_label_bytes(self.key_bits);
        let mut seen = HashSet::new();
        for label in &self.deck {
            let bytes = label.as_bytes();
            if bytes.first().map_or(true, |byte| *byte == 0) {
                return Err(ConfigError::validation(format!(
                    "card label {label:?} is empty or starts with a NUL byte"
                )));
            }
            if bytes.len() > max_bytes {
                return Err(ConfigError::validation(format!(
                    "card label {label:?} needs {} bytes; {}-bit keys fit {max_bytes}",
                    bytes.len(),
                    self.key_bits
                )));
            }
            if BigUint::from_bytes_be(bytes) < BigUint::from(2u32) {
                return Err(ConfigError::validation(format!(
                    "card label {label:?} encodes to a fixed point of the cipher"
                )));
            }
            if !seen.insert(label.as_str()) {
                return Err(ConfigError::validation(format!(
                    "duplicate card label {label:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn deck_size(&self) -> usize {
        self.deck.len()
    }

    pub fn deck_cards(&self) -> Vec<Card> {
        self.deck.iter().map(|label| Card::new(label.as_str())).collect()
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Search budget with the configured Miller-Rabin round count.
    pub fn prime_search_budget(&self) -> PrimeSearchBudget {
        PrimeSearchBudget {
            rounds: self.miller_rabin_rounds,
            ..self.prime_search
        }
    }
}

/// The 52 labels of a standard deck, `"2♣"` through `"A♠"`.
pub fn standard_deck_labels() -> Vec<String> {
    SUITS
        .iter()
        .flat_map(|suit| RANKS.iter().map(move |rank| format!("{rank}{suit}")))
        .collect()
}
