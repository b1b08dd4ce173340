use anyhow::{anyhow, Result};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

/// Canonically serializes any arkworks type into a compressed byte vector.
pub fn canonical_serialize_bytes<T>(value: &T) -> Result<Vec<u8>>
where
    T: CanonicalSerialize,
{
    let mut buf = Vec::new();
    value
        .serialize_compressed(&mut buf)
        .map_err(|err| anyhow!("canonical serialize failed: {err}"))?;
    Ok(buf)
}

/// Canonically serializes any arkworks type into a lowercase hex string without a prefix.
pub fn canonical_serialize_hex<T>(value: &T) -> Result<String>
where
    T: CanonicalSerialize,
{
    let buf = canonical_serialize_bytes(value)?;
    Ok(hex::encode(buf))
}

/// Canonically deserializes a value from a hex string (accepts optional 0x prefix).
pub fn canonical_deserialize_hex<T>(value: &str) -> Result<T>
where
    T: CanonicalDeserialize,
{
    let bytes = decode_hex_bytes(value)?;
    canonical_deserialize_bytes(&bytes)
}

/// Canonically deserializes a value from compressed bytes.
pub fn canonical_deserialize_bytes<T>(bytes: &[u8]) -> Result<T>
where
    T: CanonicalDeserialize,
{
    T::deserialize_compressed(&mut &bytes[..])
        .map_err(|err| anyhow!("canonical deserialize failed: {err}"))
}

pub(crate) fn decode_hex_bytes(value: &str) -> Result<Vec<u8>> {
    let trimmed = value.trim();
    let without_prefix = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if without_prefix.is_empty() {
        return Err(anyhow!("hex string is empty"));
    }
    hex::decode(without_prefix).map_err(|err| anyhow!("failed to decode hex: {err}"))
}

/// Serde helpers for arbitrary-precision integers encoded as decimal strings.
pub mod biguint_string {
    use num_bigint::BigUint;
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &BigUint, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_biguint(&s).map_err(DeError::custom)
    }
}

/// Serde helpers for `Vec<BigUint>` encoded as a list of decimal strings.
pub mod biguint_vec {
    use num_bigint::BigUint;
    use serde::de::Error as DeError;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(values: &[BigUint], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&value.to_str_radix(10))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<BigUint>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| super::parse_biguint(s).map_err(DeError::custom))
            .collect()
    }
}

/// Parses a non-negative decimal integer; rejects signs, whitespace and empty input.
pub fn parse_biguint(value: &str) -> Result<num_bigint::BigUint> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(anyhow!("`{value}` is not a decimal integer"));
    }
    num_bigint::BigUint::parse_bytes(value.as_bytes(), 10)
        .ok_or_else(|| anyhow!("`{value}` is not a decimal integer"))
}
