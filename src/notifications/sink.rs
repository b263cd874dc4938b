use crate::games::types::ChatId;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Markdown,
    Html,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub parse_mode: Option<ParseMode>,
    /// Deliver without a sound/notification
    pub silent: bool,
}

/// Whether a throttle applies to one chat or to the whole bot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleScope {
    Chat,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { message_id: Option<i64> },
    Throttled { retry_after: Duration, scope: ThrottleScope },
    Failed { reason: String },
}

/// Outbound chat messaging
#[async_trait]
pub trait MessagingSink: Send + Sync {
    async fn send(&self, chat_id: ChatId, text: &str, options: &SendOptions) -> SendOutcome;
}

/// Sink that writes every message to the log; used by the simulator
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl MessagingSink for LoggingSink {
    async fn send(&self, chat_id: ChatId, text: &str, _options: &SendOptions) -> SendOutcome {
        tracing::info!(chat_id, "📨 {}", text);
        SendOutcome::Delivered { message_id: None }
    }
}
