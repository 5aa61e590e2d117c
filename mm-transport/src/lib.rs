//! Messaging-transport boundary for Murmur.
//!
//! The core never touches platform object shapes; it sees only the narrow
//! `Transport` capability trait plus `InboundEvent`.

mod telegram;
mod traits;
mod types;

pub use telegram::TelegramTransport;
pub use traits::Transport;
pub use types::{ConversationId, Destination, GroupId, InboundEvent, MessageId, SenderId};
