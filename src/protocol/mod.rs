//! The Mental Poker sequences: key exchange, turn order and shared prime,
//! two-phase shuffle, and per-card dealing.

pub mod deal;
pub mod key_exchange;
pub mod session;
pub mod shuffle;
pub mod turn_order;


pub use deal::{
    discard_sequence, draw_sequence, observe_discard_sequence, serve_draw_sequence, DealContext,
};
pub use key_exchange::{key_exchange_sequence, KeyExchangeContext};
pub use session::PokerSession;
pub use shuffle::{shuffle_sequence, ShuffleContext};
pub use turn_order::{turn_order_sequence, TurnOrderContext};
