//! Transport authentication: canonical transcripts and Schnorr signatures.
//!
//! Signatures never protect card secrecy; they only bind an action to the
//! participant that posted it.

use anyhow::{anyhow, Result};
use ark_crypto_primitives::signature::{
    schnorr::{self, Schnorr},
    SignatureScheme,
};
use ark_ec::AffineRepr;
use ark_grumpkin::Projective as SigningCurve;
use ark_serialize::CanonicalDeserialize;
use num_bigint::BigUint;
use rand::{rngs::StdRng, Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::ledger::serialization::{
    canonical_deserialize_hex, canonical_serialize_bytes, canonical_serialize_hex,
    decode_hex_bytes,
};

const DOMAIN_TAG: &[u8] = b"mental-poker/action/v1";
const PARAMETERS_SEED_TAG: &[u8] = b"mental-poker/schnorr-parameters/v1";

pub type SigningScheme = Schnorr<SigningCurve, Sha256>;
pub type SigningParameters = <SigningScheme as SignatureScheme>::Parameters;
pub type SigningPublicKey = <SigningScheme as SignatureScheme>::PublicKey;
pub type SigningSecretKey = <SigningScheme as SignatureScheme>::SecretKey;
pub type Signature = <SigningScheme as SignatureScheme>::Signature;

/// Builder for canonical action transcripts.
pub struct TranscriptBuilder {
    buffer: Vec<u8>,
}

impl TranscriptBuilder {
    pub fn new(kind: &'static str) -> Self {
        let mut buffer = Vec::with_capacity(128);
        buffer.extend_from_slice(DOMAIN_TAG);
        buffer.extend_from_slice(&(kind.len() as u16).to_be_bytes());
        buffer.extend_from_slice(kind.as_bytes());
        Self { buffer }
    }

    pub fn append_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn append_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buffer
            .extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buffer.extend_from_slice(bytes);
    }

    pub fn append_str(&mut self, value: &str) {
        self.append_bytes(value.as_bytes());
    }

    pub fn append_biguint(&mut self, value: &BigUint) {
        self.append_bytes(&value.to_bytes_be());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Values that can be signed into a canonical transcript.
pub trait Signable {
    /// Logical kind string used for domain separation.
    fn domain_kind(&self) -> &'static str;

    /// Append this value's canonical representation into the transcript builder.
    fn write_transcript(&self, builder: &mut TranscriptBuilder);

    /// Obtain canonical signing bytes.
    fn to_signing_bytes(&self) -> Vec<u8> {
        let mut builder = TranscriptBuilder::new(self.domain_kind());
        self.write_transcript(&mut builder);
        builder.finish()
    }
}

impl Signable for u64 {
    fn domain_kind(&self) -> &'static str {
        "primitive/u64_v1"
    }

    fn write_transcript(&self, builder: &mut TranscriptBuilder) {
        builder.append_u64(*self);
    }
}

impl Signable for String {
    fn domain_kind(&self) -> &'static str {
        "primitive/string_v1"
    }

    fn write_transcript(&self, builder: &mut TranscriptBuilder) {
        builder.append_str(self);
    }
}

/// Schnorr parameters shared by every participant.
///
/// Derived from a fixed domain seed so that all parties verify against the
/// same generator and salt without an extra negotiation round.
pub fn signing_parameters() -> Result<SigningParameters> {
    let seed: [u8; 32] = Sha256::digest(PARAMETERS_SEED_TAG).into();
    let mut rng = StdRng::from_seed(seed);
    SigningScheme::setup(&mut rng).map_err(|e| anyhow!("schnorr setup failed: {e}"))
}

/// A participant's signing identity.
#[derive(Clone)]
pub struct SigningKeyPair {
    pub public: SigningPublicKey,
    pub secret: SigningSecretKey,
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public", &encode_public_key(&self.public).unwrap_or_default())
            .finish_non_exhaustive()
    }
}

impl SigningKeyPair {
    pub fn public_hex(&self) -> Result<String> {
        encode_public_key(&self.public)
    }
}

pub fn generate_signing_key_pair<R: Rng>(
    params: &SigningParameters,
    rng: &mut R,
) -> Result<SigningKeyPair> {
    let (public, secret) =
        SigningScheme::keygen(params, rng).map_err(|e| anyhow!("schnorr keygen failed: {e}"))?;
    Ok(SigningKeyPair { public, secret })
}

/// Signs `payload` and returns the hex-encoded signature.
pub fn sign<T, R>(
    payload: &T,
    params: &SigningParameters,
    secret: &SigningSecretKey,
    rng: &mut R,
) -> Result<String>
where
    T: Signable,
    R: Rng,
{
    let transcript = payload.to_signing_bytes();
    let signature = SigningScheme::sign(params, secret, &transcript, rng)
        .map_err(|e| anyhow!("signature error: {e}"))?;
    encode_signature(&signature)
}

/// Checks a hex-encoded signature over `payload`. Malformed signatures are
/// reported as `Ok(false)`.
pub fn verify<T>(
    payload: &T,
    signature_hex: &str,
    params: &SigningParameters,
    public: &SigningPublicKey,
) -> Result<bool>
where
    T: Signable,
{
    let Ok(signature) = decode_signature(signature_hex) else {
        return Ok(false);
    };
    let transcript = payload.to_signing_bytes();
    SigningScheme::verify(params, public, &transcript, &signature)
        .map_err(|e| anyhow!("signature error: {e}"))
}

pub fn encode_public_key(public: &SigningPublicKey) -> Result<String> {
    canonical_serialize_hex(public)
}

/// Decodes a public key and rejects the identity point.
pub fn decode_public_key(value: &str) -> Result<SigningPublicKey> {
    let point: SigningPublicKey = canonical_deserialize_hex(value)?;
    if point.is_zero() {
        return Err(anyhow!("public key is the identity point"));
    }
    Ok(point)
}

fn encode_signature(signature: &Signature) -> Result<String> {
    let mut bytes = canonical_serialize_bytes(&signature.prover_response)?;
    bytes.extend(canonical_serialize_bytes(&signature.verifier_challenge)?);
    Ok(hex::encode(bytes))
}

fn decode_signature(value: &str) -> Result<Signature> {
    let bytes = decode_hex_bytes(value)?;
    let mut reader = &bytes[..];
    let prover_response = CanonicalDeserialize::deserialize_compressed(&mut reader)
        .map_err(|err| anyhow!("signature decode failed: {err}"))?;
    let verifier_challenge = CanonicalDeserialize::deserialize_compressed(&mut reader)
        .map_err(|err| anyhow!("signature decode failed: {err}"))?;
    if !reader.is_empty() {
        return Err(anyhow!("trailing bytes after signature"));
    }
    Ok(schnorr::Signature {
        prover_response,
        verifier_challenge,
    })
}
