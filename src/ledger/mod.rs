pub mod messages;
pub mod queue;
pub mod serialization;
pub mod signed;
pub mod transport;
pub mod types;

pub use messages::{Action, ActionKind, ActionPayload, DisclosedKey, Envelope, LedgerEntry};
pub use queue::{ActionQueue, FifoInbox, PendingEntry, QueueError};
pub use signed::{KeyStore, SignedTransport};
pub use transport::{EntryFeed, InMemoryLedger, Transport, TransportError};
pub use types::{ClientId, DeckPosition, LedgerSequence};
