//! In-memory collaborators for tests and the `simulate` command

use crate::errors::{ExternalServiceError, LotteryResult};
use crate::escrow::ledger::{
    AddressSubscription, ConfirmationStatus, LedgerClient, PaymentUriEncoder, WalletResolver,
};
use crate::escrow::types::{ObservedTransfer, Token};
use crate::games::rounds::RoundOutcome;
use crate::games::types::{ChatId, EndReason, Game, UserId};
use crate::games::vrf_engine::{DrawSeed, RandomnessSource, VRFResult};
use crate::notifications::{GameNotifier, MessagingSink, SendOptions, SendOutcome};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One delivered message
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub text: String,
    pub at: Instant,
}

/// Messaging sink that records deliveries and replays scripted outcomes
#[derive(Default)]
pub struct RecordingSink {
    scripted: DashMap<ChatId, VecDeque<SendOutcome>>,
    delivered: DashMap<ChatId, Vec<SentMessage>>,
    attempts: DashMap<ChatId, usize>,
    next_message_id: AtomicU64,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next send to `chat_id`; unscripted sends are delivered
    pub fn push_outcome(&self, chat_id: ChatId, outcome: SendOutcome) {
        self.scripted.entry(chat_id).or_default().push_back(outcome);
    }

    pub fn sent(&self, chat_id: ChatId) -> Vec<SentMessage> {
        self.delivered
            .get(&chat_id)
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn texts(&self, chat_id: ChatId) -> Vec<String> {
        self.sent(chat_id).into_iter().map(|m| m.text).collect()
    }

    /// Every send call, delivered or not
    pub fn attempts(&self, chat_id: ChatId) -> usize {
        self.attempts.get(&chat_id).map_or(0, |n| *n)
    }
}

#[async_trait]
impl MessagingSink for RecordingSink {
    async fn send(&self, chat_id: ChatId, text: &str, _options: &SendOptions) -> SendOutcome {
        *self.attempts.entry(chat_id).or_insert(0) += 1;

        let scripted = self
            .scripted
            .get_mut(&chat_id)
            .and_then(|mut queue| queue.pop_front());
        let outcome = scripted.unwrap_or_else(|| SendOutcome::Delivered {
            message_id: Some(self.next_message_id.fetch_add(1, Ordering::SeqCst) as i64),
        });

        if let SendOutcome::Delivered { .. } = outcome {
            self.delivered.entry(chat_id).or_default().push(SentMessage {
                text: text.to_string(),
                at: Instant::now(),
            });
        }
        outcome
    }
}

/// Engine event as seen by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    Created,
    Joined { username: String, player_count: usize },
    Countdown(Duration),
    CancelScheduled,
    Started,
    Draw { round: u32, drawn: u64 },
    Winners,
    Ended(EndReason),
    Paused,
    Resumed,
    Released,
}

/// Notifier that records engine events per chat
#[derive(Default)]
pub struct RecordingNotifier {
    events: DashMap<ChatId, Vec<NotifierEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self, chat_id: ChatId) -> Vec<NotifierEvent> {
        self.events.get(&chat_id).map(|e| e.clone()).unwrap_or_default()
    }

    fn record(&self, chat_id: ChatId, event: NotifierEvent) {
        self.events.entry(chat_id).or_default().push(event);
    }
}

impl GameNotifier for RecordingNotifier {
    fn game_created(&self, game: &Game, _join_window: Duration) {
        self.record(game.chat_id, NotifierEvent::Created);
    }

    fn player_joined(&self, chat_id: ChatId, username: &str, player_count: usize, _max_players: u32) {
        self.record(
            chat_id,
            NotifierEvent::Joined {
                username: username.to_string(),
                player_count,
            },
        );
    }

    fn countdown(&self, chat_id: ChatId, until_start: Duration) {
        self.record(chat_id, NotifierEvent::Countdown(until_start));
    }

    fn cancel_scheduled(&self, chat_id: ChatId) {
        self.record(chat_id, NotifierEvent::CancelScheduled);
    }

    fn game_started(&self, game: &Game) {
        self.record(game.chat_id, NotifierEvent::Started);
    }

    fn draw_result(&self, chat_id: ChatId, outcome: &RoundOutcome) {
        self.record(
            chat_id,
            NotifierEvent::Draw {
                round: outcome.round,
                drawn: outcome.drawn,
            },
        );
    }

    fn winners(&self, game: &Game) {
        self.record(game.chat_id, NotifierEvent::Winners);
    }

    fn game_ended(&self, chat_id: ChatId, reason: EndReason) {
        self.record(chat_id, NotifierEvent::Ended(reason));
    }

    fn game_paused(&self, chat_id: ChatId) {
        self.record(chat_id, NotifierEvent::Paused);
    }

    fn game_resumed(&self, chat_id: ChatId) {
        self.record(chat_id, NotifierEvent::Resumed);
    }

    fn release(&self, chat_id: ChatId) {
        self.record(chat_id, NotifierEvent::Released);
    }
}

/// Randomness that replays queued values, falling back to `min`.
///
/// Values outside the requested range also fall back to `min`.
#[derive(Default)]
pub struct ScriptedRandomness {
    values: Mutex<VecDeque<u64>>,
}

impl ScriptedRandomness {
    pub fn new(values: Vec<u64>) -> Self {
        Self {
            values: Mutex::new(values.into()),
        }
    }
}

impl RandomnessSource for ScriptedRandomness {
    fn draw(&self, min: u64, max: u64, seed: &DrawSeed) -> LotteryResult<VRFResult> {
        let next = self
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        let value = next.filter(|v| (min..=max).contains(v)).unwrap_or(min);
        Ok(VRFResult {
            value,
            random_bytes: hex::encode(value.to_le_bytes()),
            proof: format!("scripted:{}", seed),
            public_key: String::new(),
            input_message: seed.to_string(),
            timestamp: Utc::now(),
        })
    }
}

/// A transfer made through [`MockLedger::send_tokens`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransfer {
    pub to: String,
    pub amount: u64,
    pub token: String,
    pub signature: String,
}

/// Ledger double: scripted confirmation statuses and injectable escrow transfers
#[derive(Default)]
pub struct MockLedger {
    statuses: DashMap<String, ConfirmationStatus>,
    subscribers: DashMap<u64, (String, mpsc::UnboundedSender<ObservedTransfer>)>,
    balances: DashMap<String, u64>,
    sent: Mutex<Vec<SentTransfer>>,
    next_id: AtomicU64,
    fail_sends: AtomicBool,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, signature: &str, status: ConfirmationStatus) {
        self.statuses.insert(signature.to_string(), status);
    }

    pub fn set_balance(&self, address: &str, amount: u64) {
        self.balances.insert(address.to_string(), amount);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Deliver a transfer to every subscriber of `address`; returns how many received it
    pub fn push_transfer(&self, address: &str, transfer: ObservedTransfer) -> usize {
        self.subscribers
            .iter()
            .filter(|entry| entry.value().0 == address)
            .filter(|entry| entry.value().1.send(transfer.clone()).is_ok())
            .count()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn sent(&self) -> Vec<SentTransfer> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn get_balance(&self, address: &str, _token: &Token) -> LotteryResult<u64> {
        Ok(self.balances.get(address).map_or(0, |b| *b))
    }

    async fn send_tokens(&self, to: &str, amount: u64, token: &Token) -> LotteryResult<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ExternalServiceError::Ledger(format!("transfer of {} to {} rejected", amount, to)).into());
        }
        let signature = format!("mock-tx-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.statuses.insert(signature.clone(), ConfirmationStatus::Finalized);
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SentTransfer {
                to: to.to_string(),
                amount,
                token: token.symbol.clone(),
                signature: signature.clone(),
            });
        Ok(signature)
    }

    fn subscribe_address(&self, address: &str) -> LotteryResult<AddressSubscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(id, (address.to_string(), sender));
        Ok(AddressSubscription { id, receiver })
    }

    fn unsubscribe(&self, subscription_id: u64) {
        self.subscribers.remove(&subscription_id);
    }

    async fn confirmation_status(&self, signature: &str) -> LotteryResult<ConfirmationStatus> {
        Ok(self
            .statuses
            .get(signature)
            .map(|s| s.clone())
            .unwrap_or(ConfirmationStatus::NotFound))
    }
}

/// Fixed user -> wallet table
#[derive(Default)]
pub struct StaticWalletResolver {
    wallets: DashMap<UserId, String>,
}

impl StaticWalletResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wallet(self, user_id: UserId, wallet: &str) -> Self {
        self.wallets.insert(user_id, wallet.to_string());
        self
    }
}

#[async_trait]
impl WalletResolver for StaticWalletResolver {
    async fn primary_wallet(&self, user_id: UserId) -> LotteryResult<Option<String>> {
        Ok(self.wallets.get(&user_id).map(|w| w.clone()))
    }
}

/// Presentation is the URI itself
#[derive(Default)]
pub struct PlainUriEncoder {
    failing: bool,
}

impl PlainUriEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { failing: true }
    }
}

#[async_trait]
impl PaymentUriEncoder for PlainUriEncoder {
    async fn encode(&self, uri: &str) -> LotteryResult<String> {
        if self.failing {
            return Err(ExternalServiceError::Encoder("encoder unavailable".to_string()).into());
        }
        Ok(uri.to_string())
    }
}
