use crate::config::NotificationSettings;
use crate::games::rounds::RoundOutcome;
use crate::games::types::{ChatId, EndReason, Game};
use crate::notifications::backoff::Backoff;
use crate::notifications::join_buffer::{JoinBatch, JoinBuffer};
use crate::notifications::messages;
use crate::notifications::sink::{MessagingSink, SendOptions, SendOutcome, ThrottleScope};
use crate::notifications::GameNotifier;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Outgoing {
    text: String,
    options: SendOptions,
}

/// Bot-wide throttle shared by every chat worker
struct GlobalThrottle {
    backoff: Backoff,
    until: Option<Instant>,
}

struct ChatQueue {
    sender: mpsc::UnboundedSender<Outgoing>,
    worker: JoinHandle<()>,
}

struct DeliveryInner {
    sink: Arc<dyn MessagingSink>,
    settings: NotificationSettings,
    queues: DashMap<ChatId, ChatQueue>,
    /// Workers of closed queues still sending what was enqueued before cleanup
    draining: DashMap<ChatId, JoinHandle<()>>,
    /// Countdowns and join flushes
    scheduled: DashMap<ChatId, Vec<JoinHandle<()>>>,
    join_buffers: DashMap<ChatId, JoinBuffer>,
    global: Arc<Mutex<GlobalThrottle>>,
}

/// Rate-limited outbound delivery: one ordered queue and worker per chat
#[derive(Clone)]
pub struct NotificationDelivery {
    inner: Arc<DeliveryInner>,
}

impl NotificationDelivery {
    pub fn new(sink: Arc<dyn MessagingSink>, settings: NotificationSettings) -> Self {
        let floor = Duration::from_millis(settings.backoff_floor_ms);
        let ceiling = Duration::from_millis(settings.backoff_ceiling_ms);
        Self {
            inner: Arc::new(DeliveryInner {
                sink,
                settings,
                queues: DashMap::new(),
                draining: DashMap::new(),
                scheduled: DashMap::new(),
                join_buffers: DashMap::new(),
                global: Arc::new(Mutex::new(GlobalThrottle {
                    backoff: Backoff::new(floor, ceiling),
                    until: None,
                })),
            }),
        }
    }

    /// Queue `text` behind everything already queued for the chat
    pub fn enqueue(&self, chat_id: ChatId, text: String) {
        self.enqueue_with(chat_id, text, SendOptions::default());
    }

    pub fn enqueue_with(&self, chat_id: ChatId, text: String, options: SendOptions) {
        let queue = self
            .inner
            .queues
            .entry(chat_id)
            .or_insert_with(|| self.spawn_worker(chat_id));
        if queue.sender.send(Outgoing { text, options }).is_err() {
            tracing::warn!(chat_id, "Chat queue closed, message dropped");
        }
    }

    /// Flush buffered joins first so the chat sees events in order
    fn enqueue_in_order(&self, chat_id: ChatId, text: String) {
        self.flush_joins(chat_id);
        self.enqueue(chat_id, text);
    }

    fn spawn_worker(&self, chat_id: ChatId) -> ChatQueue {
        let (sender, receiver) = mpsc::unbounded_channel();
        let previous = self.inner.draining.remove(&chat_id).map(|(_, handle)| handle);
        let worker = tokio::spawn(run_chat_worker(
            chat_id,
            receiver,
            previous,
            self.inner.sink.clone(),
            self.inner.global.clone(),
            self.inner.settings.clone(),
        ));
        tracing::debug!(chat_id, "Chat delivery worker started");
        ChatQueue { sender, worker }
    }

    /// Coalesce a join into the chat's join buffer
    pub fn announce_player_join(
        &self,
        chat_id: ChatId,
        username: &str,
        player_count: usize,
        max_players: u32,
    ) -> JoinBatch {
        let window = Duration::from_millis(self.inner.settings.join_buffer_window_ms);
        let (ready, fresh) = {
            let mut buffer = self.inner.join_buffers.entry(chat_id).or_default();
            let ready = buffer.push(
                username,
                player_count,
                max_players,
                self.inner.settings.join_batch_size,
                window,
                Instant::now(),
            );
            (ready, buffer.is_fresh())
        };

        match ready {
            Some(batch) => {
                let text = messages::join_batch(&batch.usernames, batch.player_count, batch.max_players);
                self.enqueue(chat_id, text.clone());
                JoinBatch::Ready(text)
            }
            None => {
                if fresh {
                    let delivery = self.clone();
                    self.track(
                        chat_id,
                        tokio::spawn(async move {
                            tokio::time::sleep(window).await;
                            delivery.flush_joins(chat_id);
                        }),
                    );
                }
                JoinBatch::Buffering
            }
        }
    }

    /// Send whatever joins are buffered for the chat
    pub fn flush_joins(&self, chat_id: ChatId) -> Option<String> {
        let batch = self
            .inner
            .join_buffers
            .get_mut(&chat_id)
            .and_then(|mut buffer| buffer.take())?;
        let text = messages::join_batch(&batch.usernames, batch.player_count, batch.max_players);
        self.enqueue(chat_id, text.clone());
        Some(text)
    }

    /// Arm one message per configured mark that lies before the start
    pub fn schedule_countdown_notifications(&self, chat_id: ChatId, until_start: Duration) {
        let marks: Vec<u64> = self.inner.settings.countdown_marks_secs.clone();
        for mark in marks {
            let mark = Duration::from_secs(mark);
            if mark >= until_start {
                continue;
            }
            let delivery = self.clone();
            self.track(
                chat_id,
                tokio::spawn(async move {
                    tokio::time::sleep(until_start - mark).await;
                    delivery.enqueue_in_order(chat_id, messages::countdown(mark));
                }),
            );
        }
    }

    pub fn announce_game_created(&self, game: &Game, join_window: Duration) {
        self.enqueue_in_order(game.chat_id, messages::game_created(game, join_window));
    }

    pub fn announce_game_started(&self, game: &Game) {
        self.enqueue_in_order(game.chat_id, messages::game_started(game));
    }

    pub fn announce_draw_result(&self, chat_id: ChatId, outcome: &RoundOutcome) {
        self.enqueue_in_order(chat_id, messages::draw_result(outcome));
    }

    pub fn announce_winners(&self, game: &Game) {
        self.enqueue_in_order(game.chat_id, messages::winners(game));
    }

    pub fn announce_game_ended(&self, chat_id: ChatId, reason: EndReason) {
        self.enqueue_in_order(chat_id, messages::game_ended(reason));
    }

    pub fn announce_game_paused(&self, chat_id: ChatId) {
        self.enqueue_in_order(chat_id, messages::game_paused());
    }

    pub fn announce_game_resumed(&self, chat_id: ChatId) {
        self.enqueue_in_order(chat_id, messages::game_resumed());
    }

    fn track(&self, chat_id: ChatId, handle: JoinHandle<()>) {
        let mut tasks = self.inner.scheduled.entry(chat_id).or_default();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Abort countdowns and pending join flushes of the chat
    pub fn cancel_scheduled(&self, chat_id: ChatId) {
        if let Some((_, tasks)) = self.inner.scheduled.remove(&chat_id) {
            for task in tasks {
                task.abort();
            }
        }
    }

    /// Release all state of the chat; already-queued messages still drain
    pub fn cleanup(&self, chat_id: ChatId) {
        self.cancel_scheduled(chat_id);
        self.inner.join_buffers.remove(&chat_id);
        if let Some((_, queue)) = self.inner.queues.remove(&chat_id) {
            drop(queue.sender);
            self.inner.draining.insert(chat_id, queue.worker);
            tracing::debug!(chat_id, "Chat queue closed");
        }
    }

    /// Close every queue and wait (bounded) for them to drain
    pub async fn shutdown(&self, grace: Duration) {
        let chats: Vec<ChatId> = self.inner.queues.iter().map(|e| *e.key()).collect();
        for chat_id in chats {
            self.cleanup(chat_id);
        }

        let draining: Vec<ChatId> = self.inner.draining.iter().map(|e| *e.key()).collect();
        let handles: Vec<JoinHandle<()>> = draining
            .into_iter()
            .filter_map(|chat_id| self.inner.draining.remove(&chat_id).map(|(_, h)| h))
            .collect();

        if tokio::time::timeout(grace, futures::future::join_all(handles)).await.is_err() {
            tracing::warn!("Notification queues did not drain within {:?}", grace);
        }
    }

    pub fn has_queue(&self, chat_id: ChatId) -> bool {
        self.inner.queues.contains_key(&chat_id)
    }

    pub fn scheduled_count(&self, chat_id: ChatId) -> usize {
        self.inner
            .scheduled
            .get(&chat_id)
            .map_or(0, |tasks| tasks.iter().filter(|t| !t.is_finished()).count())
    }
}

async fn run_chat_worker(
    chat_id: ChatId,
    mut receiver: mpsc::UnboundedReceiver<Outgoing>,
    previous: Option<JoinHandle<()>>,
    sink: Arc<dyn MessagingSink>,
    global: Arc<Mutex<GlobalThrottle>>,
    settings: NotificationSettings,
) {
    // Messages of an earlier game in this chat go first
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let floor = Duration::from_millis(settings.backoff_floor_ms);
    let mut backoff = Backoff::new(floor, Duration::from_millis(settings.backoff_ceiling_ms));
    let mut next_send_at = Instant::now();

    while let Some(message) = receiver.recv().await {
        let mut attempts = 0u32;
        loop {
            let global_until = global.lock().await.until;
            let wait_until = match global_until {
                Some(until) if until > next_send_at => until,
                _ => next_send_at,
            };
            tokio::time::sleep_until(wait_until).await;

            attempts += 1;
            match sink.send(chat_id, &message.text, &message.options).await {
                SendOutcome::Delivered { .. } => {
                    backoff.on_success();
                    {
                        let mut global = global.lock().await;
                        global.backoff.on_success();
                        if global.until.is_some_and(|until| until <= Instant::now()) {
                            global.until = None;
                        }
                    }
                    next_send_at = Instant::now() + floor;
                    break;
                }
                SendOutcome::Throttled { retry_after, scope: ThrottleScope::Chat } => {
                    let delay = backoff.on_throttle(retry_after);
                    next_send_at = Instant::now() + delay;
                    tracing::warn!(chat_id, attempts, ?delay, "Chat throttled, backing off");
                }
                SendOutcome::Throttled { retry_after, scope: ThrottleScope::Global } => {
                    let mut global = global.lock().await;
                    let delay = global.backoff.on_throttle(retry_after);
                    global.until = Some(Instant::now() + delay);
                    tracing::warn!(chat_id, attempts, ?delay, "Global throttle, all chats backing off");
                }
                SendOutcome::Failed { reason } => {
                    tracing::warn!(chat_id, %reason, "Message delivery failed, dropping");
                    break;
                }
            }

            if attempts >= settings.max_send_attempts {
                tracing::warn!(chat_id, attempts, "Message still throttled after max attempts, dropping");
                break;
            }
        }
    }

    tracing::debug!(chat_id, "Chat delivery worker finished");
}

impl GameNotifier for NotificationDelivery {
    fn game_created(&self, game: &Game, join_window: Duration) {
        self.announce_game_created(game, join_window);
    }

    fn player_joined(&self, chat_id: ChatId, username: &str, player_count: usize, max_players: u32) {
        self.announce_player_join(chat_id, username, player_count, max_players);
    }

    fn countdown(&self, chat_id: ChatId, until_start: Duration) {
        self.schedule_countdown_notifications(chat_id, until_start);
    }

    fn cancel_scheduled(&self, chat_id: ChatId) {
        NotificationDelivery::cancel_scheduled(self, chat_id);
    }

    fn game_started(&self, game: &Game) {
        self.announce_game_started(game);
    }

    fn draw_result(&self, chat_id: ChatId, outcome: &RoundOutcome) {
        self.announce_draw_result(chat_id, outcome);
    }

    fn winners(&self, game: &Game) {
        self.announce_winners(game);
    }

    fn game_ended(&self, chat_id: ChatId, reason: EndReason) {
        self.announce_game_ended(chat_id, reason);
    }

    fn game_paused(&self, chat_id: ChatId) {
        self.announce_game_paused(chat_id);
    }

    fn game_resumed(&self, chat_id: ChatId) {
        self.announce_game_resumed(chat_id);
    }

    fn release(&self, chat_id: ChatId) {
        self.cleanup(chat_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    fn settings() -> NotificationSettings {
        NotificationSettings {
            backoff_floor_ms: 100,
            backoff_ceiling_ms: 5_000,
            max_send_attempts: 3,
            join_batch_size: 3,
            join_buffer_window_ms: 1_000,
            countdown_marks_secs: vec![240, 120, 60, 30],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_delivered_in_order() {
        let sink = Arc::new(RecordingSink::new());
        let delivery = NotificationDelivery::new(sink.clone(), settings());

        for i in 0..5 {
            delivery.enqueue(1, format!("msg {}", i));
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        let texts = sink.texts(1);
        assert_eq!(texts, (0..5).map(|i| format!("msg {}", i)).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_spaced_by_floor() {
        let sink = Arc::new(RecordingSink::new());
        let delivery = NotificationDelivery::new(sink.clone(), settings());

        delivery.enqueue(1, "a".to_string());
        delivery.enqueue(1, "b".to_string());
        tokio::time::sleep(Duration::from_secs(1)).await;

        let sent = sink.sent(1);
        assert_eq!(sent.len(), 2);
        assert!(sent[1].at.duration_since(sent[0].at) >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_throttle_retries_after_delay() {
        let sink = Arc::new(RecordingSink::new());
        sink.push_outcome(
            1,
            SendOutcome::Throttled {
                retry_after: Duration::from_secs(2),
                scope: ThrottleScope::Chat,
            },
        );
        let delivery = NotificationDelivery::new(sink.clone(), settings());

        let start = Instant::now();
        delivery.enqueue(1, "hello".to_string());
        tokio::time::sleep(Duration::from_secs(5)).await;

        let sent = sink.sent(1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sink.attempts(1), 2);
        assert!(sent[0].at.duration_since(start) >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_throttle_pauses_other_chats() {
        let sink = Arc::new(RecordingSink::new());
        sink.push_outcome(
            1,
            SendOutcome::Throttled {
                retry_after: Duration::from_secs(3),
                scope: ThrottleScope::Global,
            },
        );
        let delivery = NotificationDelivery::new(sink.clone(), settings());

        let start = Instant::now();
        delivery.enqueue(1, "first".to_string());
        tokio::time::sleep(Duration::from_millis(10)).await;
        delivery.enqueue(2, "other chat".to_string());
        tokio::time::sleep(Duration::from_secs(5)).await;

        let other = sink.sent(2);
        assert_eq!(other.len(), 1);
        assert!(other[0].at.duration_since(start) >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_message_dropped_next_delivered() {
        let sink = Arc::new(RecordingSink::new());
        sink.push_outcome(1, SendOutcome::Failed { reason: "chat not found".to_string() });
        let delivery = NotificationDelivery::new(sink.clone(), settings());

        delivery.enqueue(1, "lost".to_string());
        delivery.enqueue(1, "kept".to_string());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(sink.texts(1), vec!["kept".to_string()]);
        assert_eq!(sink.attempts(1), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let sink = Arc::new(RecordingSink::new());
        for _ in 0..3 {
            sink.push_outcome(
                1,
                SendOutcome::Throttled {
                    retry_after: Duration::from_millis(100),
                    scope: ThrottleScope::Chat,
                },
            );
        }
        let delivery = NotificationDelivery::new(sink.clone(), settings());

        delivery.enqueue(1, "never".to_string());
        delivery.enqueue(1, "after".to_string());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(sink.texts(1), vec!["after".to_string()]);
        assert_eq!(sink.attempts(1), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joins_coalesce_and_flush_after_window() {
        let sink = Arc::new(RecordingSink::new());
        let delivery = NotificationDelivery::new(sink.clone(), settings());

        assert_eq!(delivery.announce_player_join(1, "alice", 1, 50), JoinBatch::Buffering);
        assert_eq!(delivery.announce_player_join(1, "bob", 2, 50), JoinBatch::Buffering);
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let texts = sink.texts(1);
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("alice, bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_batch_ready_at_batch_size() {
        let sink = Arc::new(RecordingSink::new());
        let delivery = NotificationDelivery::new(sink.clone(), settings());

        delivery.announce_player_join(1, "a", 1, 50);
        delivery.announce_player_join(1, "b", 2, 50);
        match delivery.announce_player_join(1, "c", 3, 50) {
            JoinBatch::Ready(text) => assert!(text.contains("a, b, c")),
            JoinBatch::Buffering => panic!("batch should be ready"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_drains_queue_and_cancels_countdowns() {
        let sink = Arc::new(RecordingSink::new());
        let mut config = settings();
        config.join_buffer_window_ms = 10_000;
        let delivery = NotificationDelivery::new(sink.clone(), config);

        delivery.schedule_countdown_notifications(1, Duration::from_secs(300));
        assert!(delivery.scheduled_count(1) > 0);
        delivery.enqueue(1, "queued before cleanup".to_string());
        delivery.announce_player_join(1, "late", 1, 50);

        delivery.cleanup(1);
        assert!(!delivery.has_queue(1));
        assert_eq!(delivery.scheduled_count(1), 0);

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(sink.texts(1), vec!["queued before cleanup".to_string()]);

        // Safe without any state
        delivery.cleanup(99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_marks_before_start_only() {
        let sink = Arc::new(RecordingSink::new());
        let mut config = settings();
        config.countdown_marks_secs = vec![240, 60];
        let delivery = NotificationDelivery::new(sink.clone(), config);

        delivery.schedule_countdown_notifications(1, Duration::from_secs(120));
        tokio::time::sleep(Duration::from_secs(121)).await;

        assert_eq!(sink.texts(1), vec!["⏰ Game starts in 1 minute!".to_string()]);
    }
}
