use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::error::ProtocolError;

use super::messages::{Envelope, LedgerEntry};
use super::types::LedgerSequence;

const LOG_TARGET: &str = "mental_poker::ledger::transport";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("ledger closed")]
    Closed,

    #[error("cursor {requested} is past the end of the ledger ({len} entries)")]
    CursorOutOfRange {
        requested: LedgerSequence,
        len: LedgerSequence,
    },

    #[error("failed to sign outbound action: {0}")]
    Signing(String),
}

/// Entries delivered to a subscriber: history from the requested cursor,
/// then live appends, in ledger order. An `Err` item ends the feed.
pub type EntryFeed = BoxStream<'static, Result<LedgerEntry, ProtocolError>>;

/// The ordering ledger as seen by one participant.
///
/// Implementations must deliver every appended envelope to every subscriber,
/// including the one that appended it, in one total order.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, envelope: Envelope) -> Result<LedgerSequence, TransportError>;

    /// Feed starting at ledger sequence `from`. History and live appends are
    /// joined without gaps or duplicates.
    fn subscribe(&self, from: LedgerSequence) -> Result<EntryFeed, TransportError>;
}

/// Reference ledger kept in process memory. Shared by all simulated parties.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    subscribers: Vec<mpsc::UnboundedSender<LedgerEntry>>,
    closed: bool,
}

impl InMemoryLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of every entry appended so far.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting appends and ends every live feed.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    fn append(&self, envelope: Envelope) -> Result<LedgerSequence, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let sequence = state.entries.len() as LedgerSequence;
        let entry = LedgerEntry { sequence, envelope };
        state.entries.push(entry.clone());
        state
            .subscribers
            .retain(|subscriber| subscriber.send(entry.clone()).is_ok());
        debug!(
            target = LOG_TARGET,
            sequence,
            sender = %entry.envelope.action.sender_id,
            kind = %entry.envelope.action.kind(),
            "appended action"
        );
        Ok(sequence)
    }
}

#[async_trait]
impl Transport for InMemoryLedger {
    async fn post(&self, envelope: Envelope) -> Result<LedgerSequence, TransportError> {
        self.append(envelope)
    }

    fn subscribe(&self, from: LedgerSequence) -> Result<EntryFeed, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let history = {
            let mut state = self.state.lock();
            let len = state.entries.len() as LedgerSequence;
            if from > len {
                return Err(TransportError::CursorOutOfRange {
                    requested: from,
                    len,
                });
            }
            if !state.closed {
                state.subscribers.push(tx);
            }
            state.entries[from as usize..].to_vec()
        };

        let live = UnboundedReceiverStream::new(rx);
        Ok(stream::iter(history).chain(live).map(Ok).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::messages::{Action, ActionPayload};
    use crate::ledger::types::ClientId;

    fn request(sender: &str, position: usize) -> Envelope {
        Envelope::unsigned(Action::new(
            ClientId::new(sender),
            ActionPayload::DrawRequest { position },
        ))
    }

    #[tokio::test]
    async fn appends_are_numbered_in_order() {
        let ledger = InMemoryLedger::new();
        assert_eq!(ledger.post(request("a", 0)).await.unwrap(), 0);
        assert_eq!(ledger.post(request("b", 1)).await.unwrap(), 1);
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_history_then_live_appends() {
        let ledger = InMemoryLedger::new();
        ledger.post(request("a", 0)).await.unwrap();
        let mut feed = ledger.subscribe(0).unwrap();
        ledger.post(request("b", 1)).await.unwrap();

        let first = feed.next().await.unwrap().unwrap();
        let second = feed.next().await.unwrap().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.envelope.action.sender_id, ClientId::new("b"));
    }

    #[tokio::test]
    async fn subscribe_from_cursor_skips_earlier_entries() {
        let ledger = InMemoryLedger::new();
        for i in 0..3 {
            ledger.post(request("a", i)).await.unwrap();
        }
        let mut feed = ledger.subscribe(2).unwrap();
        assert_eq!(feed.next().await.unwrap().unwrap().sequence, 2);
        assert!(matches!(
            ledger.subscribe(4),
            Err(TransportError::CursorOutOfRange { requested: 4, len: 3 })
        ));
    }

    #[tokio::test]
    async fn closed_ledger_rejects_appends_and_ends_feeds() {
        let ledger = InMemoryLedger::new();
        let mut feed = ledger.subscribe(0).unwrap();
        ledger.close();
        assert!(matches!(
            ledger.post(request("a", 0)).await,
            Err(TransportError::Closed)
        ));
        assert!(feed.next().await.is_none());
    }
}
