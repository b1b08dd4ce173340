/// Helpers shared across test modules.
pub mod serde {
    use std::fmt::Debug;

    /// Assert that a value survives a serde_json round-trip using structural equality.
    pub fn assert_round_trip_eq<T>(value: &T)
    where
        T: ::serde::Serialize + ::serde::de::DeserializeOwned + PartialEq + Debug,
    {
        let json = serde_json::to_string(value)
            .expect("serialization should succeed during round-trip testing");
        let restored: T = serde_json::from_str(&json)
            .expect("deserialization should succeed during round-trip testing");
        assert_eq!(restored, *value, "serde_json round-trip altered the value");
    }

    /// Assert that serde_json emits the same payload before and after round-tripping.
    pub fn assert_round_trip_json<T>(value: &T)
    where
        T: ::serde::Serialize + ::serde::de::DeserializeOwned,
    {
        let json = serde_json::to_value(value)
            .expect("serialization to value should succeed during round-trip testing");
        let restored: T = serde_json::from_value(json.clone())
            .expect("deserialization from value should succeed during round-trip testing");
        let json_after = serde_json::to_value(restored)
            .expect("re-serialization should succeed during round-trip testing");
        assert_eq!(
            json_after, json,
            "serde_json round-trip altered the payload"
        );
    }
}

/// Ledger and cipher fixtures for protocol tests.
pub mod fixtures {
    use rand::{rngs::StdRng, SeedableRng};

    use crate::cipher::SharedPrime;
    use crate::ledger::messages::{Action, ActionPayload, Envelope};
    use crate::ledger::transport::{InMemoryLedger, Transport};
    use crate::ledger::types::{ClientId, LedgerSequence};
    use crate::number_theory::{random_prime, PrimeSearchBudget, DEFAULT_MILLER_RABIN_ROUNDS};

    /// A 64-bit shared prime drawn from `rng`.
    pub fn shared_prime_from(rng: &mut StdRng) -> SharedPrime {
        let value = random_prime(64, &PrimeSearchBudget::default(), rng)
            .expect("64-bit prime search should succeed");
        SharedPrime::new(value, DEFAULT_MILLER_RABIN_ROUNDS, rng)
            .expect("freshly generated prime should validate")
    }

    pub fn shared_prime(seed: u64) -> SharedPrime {
        shared_prime_from(&mut StdRng::seed_from_u64(seed))
    }

    /// Posts an unsigned action straight onto the ledger, bypassing any queue.
    pub async fn post_unsigned(
        ledger: &InMemoryLedger,
        sender: &str,
        payload: ActionPayload,
    ) -> LedgerSequence {
        ledger
            .post(Envelope::unsigned(Action::new(ClientId::new(sender), payload)))
            .await
            .expect("in-memory post should succeed")
    }
}
