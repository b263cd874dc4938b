use crate::games::snapshot::{to_snapshot, GameSnapshot};
use crate::games::types::{ChatId, Game};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-chat slot; holding its lock makes the holder the chat's only mutator
pub type GameSlot = Arc<Mutex<Option<Game>>>;

/// Thread-safe map of chat id to the chat's current game
#[derive(Default)]
pub struct GameRegistry {
    slots: DashMap<ChatId, GameSlot>,
}

impl GameRegistry {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Registry pre-filled with restored games (no locking needed at startup)
    pub fn from_games(games: Vec<Game>) -> Self {
        let slots = DashMap::new();
        for game in games {
            slots.insert(game.chat_id, Arc::new(Mutex::new(Some(game))));
        }
        Self { slots }
    }

    /// Slot for `chat_id`, created empty on first use
    pub fn slot(&self, chat_id: ChatId) -> GameSlot {
        self.slots
            .entry(chat_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Slot for `chat_id` only if one exists
    pub fn existing_slot(&self, chat_id: ChatId) -> Option<GameSlot> {
        self.slots.get(&chat_id).map(|slot| slot.clone())
    }

    pub fn chat_ids(&self) -> Vec<ChatId> {
        self.slots.iter().map(|entry| *entry.key()).collect()
    }

    /// Lock every slot in turn and project the games it holds
    pub async fn snapshot_all(&self) -> Vec<GameSnapshot> {
        // Collect first so no DashMap guard is held across an await
        let slots: Vec<GameSlot> = self.slots.iter().map(|entry| entry.value().clone()).collect();

        let mut games = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(ref game) = *slot.lock().await {
                games.push(to_snapshot(game));
            }
        }
        games.sort_by_key(|g| g.chat_id);
        games
    }

    /// Put restored games into their chat slots
    pub async fn restore(&self, games: Vec<Game>) {
        for game in games {
            let slot = self.slot(game.chat_id);
            *slot.lock().await = Some(game);
        }
    }

    /// Drop the chat's game if it is still `game_id`; returns whether it was removed
    pub async fn evict(&self, chat_id: ChatId, game_id: &str) -> bool {
        let Some(slot) = self.existing_slot(chat_id) else {
            return false;
        };
        let mut guard = slot.lock().await;
        match *guard {
            Some(ref game) if game.id == game_id && game.state.is_finished() => {
                *guard = None;
                true
            }
            _ => false,
        }
    }

    pub async fn game_count(&self) -> usize {
        let slots: Vec<GameSlot> = self.slots.iter().map(|entry| entry.value().clone()).collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::types::GameState;

    #[tokio::test]
    async fn test_slot_is_shared_per_chat() {
        let registry = GameRegistry::new();
        let a = registry.slot(7);
        let b = registry.slot(7);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.existing_slot(8).is_none());
    }

    #[tokio::test]
    async fn test_evict_only_matching_finished_game() {
        let registry = GameRegistry::new();
        let mut game = Game::new(7, 1, 10, 1, 2.0);
        let game_id = game.id.clone();
        registry.restore(vec![game.clone()]).await;

        assert!(!registry.evict(7, &game_id).await, "live game must stay");

        game.state = GameState::Finished;
        registry.restore(vec![game]).await;
        assert!(!registry.evict(7, "other-game").await);
        assert!(registry.evict(7, &game_id).await);
        assert_eq!(registry.game_count().await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_all_skips_empty_slots() {
        let registry = GameRegistry::new();
        registry.slot(1);
        registry.restore(vec![Game::new(2, 1, 10, 1, 2.0)]).await;

        let snapshots = registry.snapshot_all().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].chat_id, 2);
    }
}
