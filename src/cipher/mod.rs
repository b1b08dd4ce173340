//! Commutative (SRA-style) exponentiation cipher over a shared prime.
//!
//! Encryption raises a value to the public exponent modulo the shared prime;
//! decryption raises it to the private exponent. Because exponentiation
//! commutes, keys from different parties can be applied and removed in any
//! order as long as every key was generated over the same prime.

mod card;

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::Rng;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::number_theory::{
    gcd, is_probable_prime, mod_inverse, modpow, DEFAULT_MILLER_RABIN_ROUNDS, MIN_PRIME_BITS,
};

pub use card::{Card, CardCodec};
pub(crate) use card::max_label_bytes;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("modulus is not a probable prime")]
    CompositeModulus,

    #[error("modulus of {bits} bits is below the minimum of {MIN_PRIME_BITS}")]
    ModulusTooSmall { bits: u64 },

    #[error("key modulus does not match the shared prime")]
    ModulusMismatch,

    #[error("value must lie in [1, p)")]
    ValueOutOfRange,

    #[error("exponents are not inverses modulo p - 1")]
    InvalidKeyPair,

    #[error("card label `{0}` does not fit under the shared prime")]
    CardTooLarge(String),

    #[error("value does not decode to a card label")]
    UndecodableCard,
}

/// A prime every party agreed on. Constructing one runs Miller-Rabin, so a
/// `SharedPrime` is never a known composite. Deserializing runs the same
/// check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedPrime(#[serde(with = "crate::ledger::serialization::biguint_string")] BigUint);

impl<'de> Deserialize<'de> for SharedPrime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = crate::ledger::serialization::biguint_string::deserialize(deserializer)?;
        SharedPrime::new(value, DEFAULT_MILLER_RABIN_ROUNDS, &mut rand::thread_rng())
            .map_err(DeError::custom)
    }
}

impl SharedPrime {
    pub fn new<R: Rng + ?Sized>(
        value: BigUint,
        rounds: usize,
        rng: &mut R,
    ) -> Result<Self, CipherError> {
        let bits = value.bits();
        if bits < MIN_PRIME_BITS {
            return Err(CipherError::ModulusTooSmall { bits });
        }
        if !is_probable_prime(&value, rounds, rng) {
            return Err(CipherError::CompositeModulus);
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> &BigUint {
        &self.0
    }

    pub fn bits(&self) -> u64 {
        self.0.bits()
    }

    /// True when `value` is a valid plaintext or ciphertext under this prime.
    pub fn contains(&self, value: &BigUint) -> bool {
        !value.is_zero() && *value < self.0
    }
}

/// Local key material. It only leaves the process as a [`DisclosedKey`],
/// which is re-validated by [`CipherKeyPair::from_parts`] on arrival.
///
/// [`DisclosedKey`]: crate::ledger::DisclosedKey
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKeyPair {
    pub modulus: BigUint,
    pub public: BigUint,
    pub private: BigUint,
}

// Exponents stay out of logs.
impl std::fmt::Debug for CipherKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKeyPair")
            .field("modulus_bits", &self.modulus.bits())
            .finish_non_exhaustive()
    }
}

impl CipherKeyPair {
    /// Rebuilds a key pair received from a peer, checking that the exponents
    /// are inverses modulo `p - 1` for the shared prime.
    pub fn from_parts(
        prime: &SharedPrime,
        public: BigUint,
        private: BigUint,
    ) -> Result<Self, CipherError> {
        let phi = prime.value() - BigUint::one();
        if public.is_zero() || private.is_zero() || public >= phi || private >= phi {
            return Err(CipherError::InvalidKeyPair);
        }
        if !((&public * &private) % &phi).is_one() {
            return Err(CipherError::InvalidKeyPair);
        }
        Ok(Self {
            modulus: prime.value().clone(),
            public,
            private,
        })
    }

    pub fn ensure_modulus(&self, prime: &SharedPrime) -> Result<(), CipherError> {
        if self.modulus != *prime.value() {
            return Err(CipherError::ModulusMismatch);
        }
        Ok(())
    }
}

/// Draws a fresh key pair: a random public exponent coprime to `p - 1` and
/// its inverse.
pub fn generate_key_pair<R: Rng + ?Sized>(prime: &SharedPrime, rng: &mut R) -> CipherKeyPair {
    let modulus = prime.value().clone();
    let phi = &modulus - BigUint::one();
    let low = BigUint::from(3u32);
    loop {
        let public = rng.gen_biguint_range(&low, &phi);
        if !gcd(&public, &phi).is_one() {
            continue;
        }
        if let Some(private) = mod_inverse(&public, &phi) {
            return CipherKeyPair {
                modulus,
                public,
                private,
            };
        }
    }
}

pub fn encrypt(value: &BigUint, key: &CipherKeyPair) -> Result<BigUint, CipherError> {
    apply(value, &key.public, &key.modulus)
}

pub fn decrypt(value: &BigUint, key: &CipherKeyPair) -> Result<BigUint, CipherError> {
    apply(value, &key.private, &key.modulus)
}

fn apply(value: &BigUint, exponent: &BigUint, modulus: &BigUint) -> Result<BigUint, CipherError> {
    if value.is_zero() || value >= modulus {
        return Err(CipherError::ValueOutOfRange);
    }
    modpow(value, exponent, modulus).map_err(|_| CipherError::ValueOutOfRange)
}

/// Encrypts every card of `deck` with `key` after checking the key belongs to
/// `prime`.
pub fn encrypt_all(
    deck: &[BigUint],
    key: &CipherKeyPair,
    prime: &SharedPrime,
) -> Result<Vec<BigUint>, CipherError> {
    key.ensure_modulus(prime)?;
    deck.iter().map(|card| encrypt(card, key)).collect()
}

pub fn decrypt_all(
    deck: &[BigUint],
    key: &CipherKeyPair,
    prime: &SharedPrime,
) -> Result<Vec<BigUint>, CipherError> {
    key.ensure_modulus(prime)?;
    deck.iter().map(|card| decrypt(card, key)).collect()
}
