use crate::games::types::ChatId;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Kinds of per-chat timers; at most one of each kind per chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    JoinDeadline,
    AutoStart,
    NextRound,
    Eviction,
}

struct ScheduledTask {
    id: u64,
    handle: JoinHandle<()>,
}

/// Thread-safe table of every timer a chat has armed
#[derive(Default)]
pub struct TaskTable {
    /// Map of chat_id -> (kind -> task)
    tasks: DashMap<ChatId, HashMap<TimerKind, ScheduledTask>>,
    next_id: AtomicU64,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `task(id)` after `delay`, replacing (and aborting) any timer of the same kind.
    ///
    /// The task receives its generation id so it can `release` its own entry
    /// once it fires.
    pub fn schedule<F, Fut>(&self, chat_id: ChatId, kind: TimerKind, delay: Duration, task: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Hold the entry while spawning so a zero-delay task cannot release before insert
        let mut entry = self.tasks.entry(chat_id).or_default();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task(id).await;
        });

        if let Some(previous) = entry.insert(kind, ScheduledTask { id, handle }) {
            previous.handle.abort();
        }
        tracing::trace!(chat_id, ?kind, id, ?delay, "Timer armed");
        id
    }

    /// Remove the entry if it still belongs to timer `id`.
    ///
    /// Returns false when the timer was cancelled or replaced, in which case
    /// the caller should treat its firing as stale.
    pub fn release(&self, chat_id: ChatId, kind: TimerKind, id: u64) -> bool {
        let Some(mut entry) = self.tasks.get_mut(&chat_id) else {
            return false;
        };
        match entry.get(&kind) {
            Some(task) if task.id == id => {
                entry.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&self, chat_id: ChatId, kind: TimerKind) -> bool {
        let Some(mut entry) = self.tasks.get_mut(&chat_id) else {
            return false;
        };
        match entry.remove(&kind) {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every timer of the chat in one step
    pub fn cancel_all(&self, chat_id: ChatId) -> usize {
        match self.tasks.remove(&chat_id) {
            Some((_, tasks)) => {
                let count = tasks.len();
                for (_, task) in tasks {
                    task.handle.abort();
                }
                if count > 0 {
                    tracing::debug!(chat_id, count, "Cancelled chat timers");
                }
                count
            }
            None => 0,
        }
    }

    pub fn shutdown(&self) {
        let chats: Vec<ChatId> = self.tasks.iter().map(|e| *e.key()).collect();
        for chat_id in chats {
            self.cancel_all(chat_id);
        }
    }

    pub fn is_armed(&self, chat_id: ChatId, kind: TimerKind) -> bool {
        self.tasks
            .get(&chat_id)
            .is_some_and(|entry| entry.contains_key(&kind))
    }

    /// Get number of armed timers for a chat
    pub fn pending_count(&self, chat_id: ChatId) -> usize {
        self.tasks.get(&chat_id).map_or(0, |entry| entry.len())
    }
}
