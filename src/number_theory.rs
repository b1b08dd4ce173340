//! Arbitrary-precision number theory used by the commutative cipher.

use num_bigint::{BigInt, BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Signed, Zero};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const LOG_TARGET: &str = "mental_poker::number_theory";

/// 40 Miller-Rabin rounds bound the false-positive rate by 4^-40 = 2^-80.
pub const DEFAULT_MILLER_RABIN_ROUNDS: usize = 40;

/// Smallest accepted bit length for generated primes.
pub const MIN_PRIME_BITS: u64 = 8;

const SMALL_PRIMES: [u32; 24] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NumberTheoryError {
    #[error("modulus must be non-zero")]
    ZeroModulus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrimeSearchError {
    #[error("prime bit length {0} is below the minimum of {MIN_PRIME_BITS}")]
    BitLengthTooSmall(u64),

    #[error("no {bits}-bit prime found after {attempts} attempts of {candidates} candidates")]
    Exhausted {
        bits: u64,
        attempts: usize,
        candidates: usize,
    },
}

/// Bounds on the random prime search. Each attempt uses a freshly seeded RNG.
///
/// `rounds` is not part of the serialized form; a session fills it from its
/// own Miller-Rabin setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeSearchBudget {
    pub candidates_per_attempt: usize,
    pub max_attempts: usize,
    #[serde(skip, default = "default_rounds")]
    pub rounds: usize,
}

fn default_rounds() -> usize {
    DEFAULT_MILLER_RABIN_ROUNDS
}

impl Default for PrimeSearchBudget {
    fn default() -> Self {
        Self {
            candidates_per_attempt: 10_000,
            max_attempts: 8,
            rounds: DEFAULT_MILLER_RABIN_ROUNDS,
        }
    }
}

pub fn modpow(
    base: &BigUint,
    exponent: &BigUint,
    modulus: &BigUint,
) -> Result<BigUint, NumberTheoryError> {
    if modulus.is_zero() {
        return Err(NumberTheoryError::ZeroModulus);
    }
    Ok(base.modpow(exponent, modulus))
}

pub fn gcd(a: &BigUint, b: &BigUint) -> BigUint {
    a.gcd(b)
}

/// Multiplicative inverse of `a` modulo `m`, if one exists.
pub fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    if m.is_zero() {
        return None;
    }
    let m_signed = BigInt::from(m.clone());
    let (mut old_r, mut r) = (BigInt::from(a % m), m_signed.clone());
    let (mut old_s, mut s) = (BigInt::one(), BigInt::zero());

    while !r.is_zero() {
        let quotient = &old_r / &r;
        let next_r = &old_r - &quotient * &r;
        old_r = std::mem::replace(&mut r, next_r);
        let next_s = &old_s - &quotient * &s;
        old_s = std::mem::replace(&mut s, next_s);
    }

    if !old_r.is_one() {
        return None;
    }

    let mut inverse = old_s % &m_signed;
    if inverse.is_negative() {
        inverse += &m_signed;
    }
    inverse.to_biguint()
}

/// Miller-Rabin with `rounds` random bases, preceded by trial division.
pub fn is_probable_prime<R: Rng + ?Sized>(n: &BigUint, rounds: usize, rng: &mut R) -> bool {
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    if *n == two {
        return true;
    }
    if n.is_even() {
        return false;
    }
    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }

    let one = BigUint::one();
    let n_minus_one = n - &one;
    let mut d = n_minus_one.clone();
    let mut s = 0u64;
    while d.is_even() {
        d >>= 1;
        s += 1;
    }

    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
            if x == one {
                return false;
            }
        }
        return false;
    }
    true
}

/// Generates a probable prime of exactly `bits` bits.
///
/// Every attempt reseeds a local RNG from `rng` and tests up to
/// `budget.candidates_per_attempt` odd candidates with the top bit set. The
/// search never returns a candidate that failed primality testing; when the
/// budget is spent it reports [`PrimeSearchError::Exhausted`].
pub fn random_prime<R: Rng + ?Sized>(
    bits: u64,
    budget: &PrimeSearchBudget,
    rng: &mut R,
) -> Result<BigUint, PrimeSearchError> {
    if bits < MIN_PRIME_BITS {
        return Err(PrimeSearchError::BitLengthTooSmall(bits));
    }

    for attempt in 0..budget.max_attempts {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        let mut attempt_rng = StdRng::from_seed(seed);

        for _ in 0..budget.candidates_per_attempt {
            let mut candidate = attempt_rng.gen_biguint(bits);
            candidate |= BigUint::one() << (bits - 1);
            candidate |= BigUint::one();
            if is_probable_prime(&candidate, budget.rounds, &mut attempt_rng) {
                debug!(target = LOG_TARGET, bits, attempt, "found probable prime");
                return Ok(candidate);
            }
        }

        warn!(
            target = LOG_TARGET,
            bits,
            attempt,
            candidates = budget.candidates_per_attempt,
            "prime search attempt exhausted; reseeding"
        );
    }

    Err(PrimeSearchError::Exhausted {
        bits,
        attempts: budget.max_attempts,
        candidates: budget.candidates_per_attempt,
    })
}
