//! Rate-limited outbound notification delivery

pub mod backoff;
pub mod delivery;
pub mod join_buffer;
pub mod messages;
pub mod sink;

pub use backoff::Backoff;
pub use delivery::NotificationDelivery;
pub use join_buffer::JoinBatch;
pub use sink::{LoggingSink, MessagingSink, SendOptions, SendOutcome, ThrottleScope};

use crate::games::rounds::RoundOutcome;
use crate::games::types::{ChatId, EndReason, Game};
use std::time::Duration;

/// Game events the engine reports to the chat.
///
/// Implementations only enqueue; they never block the caller on delivery.
pub trait GameNotifier: Send + Sync {
    fn game_created(&self, game: &Game, join_window: Duration);
    fn player_joined(&self, chat_id: ChatId, username: &str, player_count: usize, max_players: u32);
    /// Arm countdown messages for a start `until_start` from now
    fn countdown(&self, chat_id: ChatId, until_start: Duration);
    fn cancel_scheduled(&self, chat_id: ChatId);
    fn game_started(&self, game: &Game);
    fn draw_result(&self, chat_id: ChatId, outcome: &RoundOutcome);
    fn winners(&self, game: &Game);
    fn game_ended(&self, chat_id: ChatId, reason: EndReason);
    fn game_paused(&self, chat_id: ChatId);
    fn game_resumed(&self, chat_id: ChatId);
    /// Release all per-chat notification state
    fn release(&self, chat_id: ChatId);
}
