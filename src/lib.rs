pub mod cipher;
pub mod config;
pub mod error;
pub mod ledger;
pub mod machine;
pub mod number_theory;
pub mod protocol;
pub mod signing;
pub mod tokio_tools;

#[cfg(test)]
pub mod test_utils;

pub use config::ProtocolConfig;
pub use error::{ProtocolError, ProtocolResult, Violation};
pub use protocol::PokerSession;
