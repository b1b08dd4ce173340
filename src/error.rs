use std::time::Duration;

use thiserror::Error;

use crate::cipher::CipherError;
use crate::config::ConfigError;
use crate::ledger::queue::QueueError;
use crate::ledger::transport::TransportError;
use crate::ledger::types::ClientId;
use crate::number_theory::PrimeSearchError;

/// A peer broke the protocol. Every variant is fatal to the current run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("expected `{expected}` action, got `{found}` from {sender}")]
    UnexpectedAction {
        expected: &'static str,
        found: &'static str,
        sender: ClientId,
    },

    #[error("expected action from {expected}, got one from {found}")]
    UnexpectedSender { expected: ClientId, found: ClientId },

    #[error("duplicate `{kind}` action from {sender}")]
    DuplicateSender { kind: &'static str, sender: ClientId },

    #[error("no key registered for sender {0}")]
    UnknownSender(ClientId),

    #[error("expected {expected} participants, heard from {found}")]
    MissingSender { expected: usize, found: usize },

    #[error("action from {0} carries no signature")]
    MissingSignature(ClientId),

    #[error("signature from {0} failed verification")]
    InvalidSignature(ClientId),

    #[error("{sender} replayed an action signed under nonce {nonce}")]
    ReplayedAction { sender: ClientId, nonce: u64 },

    #[error("{sender} posted an invalid modulus: {reason}")]
    InvalidModulus { sender: ClientId, reason: String },

    #[error("{sender} disclosed a key for position {position} it was not asked to reveal")]
    UnsolicitedDisclosure { sender: ClientId, position: usize },

    #[error("{sender} sent out-of-range payload: {reason}")]
    OutOfRange { sender: ClientId, reason: String },

    #[error("{sender} sent malformed payload: {reason}")]
    Malformed { sender: ClientId, reason: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("peer violated protocol: {0}")]
    PeerViolation(#[from] Violation),

    #[error("peer unresponsive: step `{step}` waited {waited:?}")]
    PeerUnresponsive { step: &'static str, waited: Duration },

    #[error("protocol run cancelled")]
    Cancelled,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    PrimeSearch(#[from] PrimeSearchError),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("local invariant broken: {0}")]
    Local(String),
}

impl ProtocolError {
    /// True when the run ended because the peer misbehaved, as opposed to a
    /// local, transport, or timeout failure.
    pub fn is_peer_violation(&self) -> bool {
        matches!(self, ProtocolError::PeerViolation(_))
    }

    pub fn violation(&self) -> Option<&Violation> {
        match self {
            ProtocolError::PeerViolation(violation) => Some(violation),
            _ => None,
        }
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
