//! Plain serializable projection of games used at the persistence boundary

use crate::errors::{LotteryResult, StorageError};
use crate::games::types::{
    ChatId, EndReason, Game, GameState, NumberRange, Payout, Player, PrizeInfo, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub id: String,
    pub chat_id: ChatId,
    pub state: GameState,
    pub creator_id: UserId,
    pub players: Vec<Player>,
    pub number_selections: BTreeMap<UserId, Vec<u64>>,
    pub max_players: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_range: Option<NumberRange>,
    pub winner_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prize_info: Option<PrizeInfo>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub selection_multiplier: f64,

    // Resume fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<GameState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub drawn_numbers: Vec<u64>,
    #[serde(default)]
    pub eliminations: BTreeMap<UserId, u32>,
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub draw_counter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_fee: Option<u64>,
    #[serde(default)]
    pub blocked: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout: Option<Payout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

/// Everything the registry held at one save
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub games: Vec<GameSnapshot>,
}

impl RegistrySnapshot {
    pub fn new(games: Vec<GameSnapshot>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            games,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

pub fn to_snapshot(game: &Game) -> GameSnapshot {
    GameSnapshot {
        id: game.id.clone(),
        chat_id: game.chat_id,
        state: game.state,
        creator_id: game.creator_id,
        players: game.players.clone(),
        number_selections: game.selections.clone(),
        max_players: game.max_players,
        number_range: game.number_range,
        winner_count: game.winner_count,
        prize_info: game.prize.clone(),
        created_at: game.created_at,
        started_at: game.started_at,
        ended_at: game.ended_at,
        selection_multiplier: game.selection_multiplier,
        paused_from: game.paused_from,
        paused_at: game.paused_at,
        start_deadline: game.start_deadline,
        drawn_numbers: game.drawn_numbers.clone(),
        eliminations: game.eliminations.clone(),
        round: game.round,
        draw_counter: game.draw_counter,
        entry_fee: game.entry_fee,
        blocked: game.blocked.clone(),
        payout: game.payout.clone(),
        end_reason: game.end_reason,
    }
}

/// Rebuild a game, rejecting snapshots that break the game invariants
pub fn from_snapshot(snapshot: GameSnapshot) -> LotteryResult<Game> {
    let corrupted = |msg: String| StorageError::CorruptedData(format!("game {}: {}", snapshot.id, msg));

    if snapshot.players.len() > snapshot.max_players as usize {
        return Err(corrupted(format!(
            "{} players exceed max {}",
            snapshot.players.len(),
            snapshot.max_players
        ))
        .into());
    }
    if let Some(unknown) = snapshot
        .number_selections
        .keys()
        .find(|id| !snapshot.players.iter().any(|p| p.id == **id))
    {
        return Err(corrupted(format!("selection for unknown player {}", unknown)).into());
    }
    if snapshot.state == GameState::Paused && snapshot.paused_from.is_none() {
        return Err(corrupted("paused without a state to resume to".to_string()).into());
    }

    Ok(Game {
        id: snapshot.id,
        chat_id: snapshot.chat_id,
        state: snapshot.state,
        creator_id: snapshot.creator_id,
        players: snapshot.players,
        max_players: snapshot.max_players,
        winner_count: snapshot.winner_count,
        number_range: snapshot.number_range,
        selections: snapshot.number_selections,
        created_at: snapshot.created_at,
        started_at: snapshot.started_at,
        ended_at: snapshot.ended_at,
        selection_multiplier: snapshot.selection_multiplier,
        prize: snapshot.prize_info,
        paused_from: snapshot.paused_from,
        paused_at: snapshot.paused_at,
        start_deadline: snapshot.start_deadline,
        drawn_numbers: snapshot.drawn_numbers,
        eliminations: snapshot.eliminations,
        round: snapshot.round,
        draw_counter: snapshot.draw_counter,
        entry_fee: snapshot.entry_fee,
        blocked: snapshot.blocked,
        payout: snapshot.payout,
        end_reason: snapshot.end_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drawing_game() -> Game {
        let mut game = Game::new(-1001, 42, 10, 1, 2.0);
        for id in 1..=3 {
            game.players.push(Player {
                id,
                username: format!("user{}", id),
                joined_at: Utc::now(),
            });
        }
        game.state = GameState::Drawing;
        game.number_range = Some(NumberRange { min: 1, max: 6 });
        game.selections.insert(1, vec![2]);
        game.selections.insert(2, vec![5]);
        game.selections.insert(3, vec![6]);
        game.drawn_numbers = vec![5];
        game.eliminations.insert(2, 1);
        game.round = 1;
        game.draw_counter = 5;
        game.started_at = Some(Utc::now());
        game.prize = Some(PrizeInfo {
            total: 3_000,
            per_survivor: 3_000,
            proof: "ab".repeat(96),
        });
        game
    }

    #[test]
    fn test_round_trip_through_json() {
        let game = drawing_game();
        let json = serde_json::to_string(&to_snapshot(&game)).expect("serialize");
        let restored = from_snapshot(serde_json::from_str(&json).expect("deserialize")).expect("restore");

        assert_eq!(restored, game);
        assert_eq!(restored.remaining_pool(), vec![1, 2, 3, 4, 6]);
    }

    #[test]
    fn test_snapshot_uses_camel_case_shape() {
        let value = serde_json::to_value(to_snapshot(&drawing_game())).expect("serialize");

        assert!(value.get("chatId").is_some());
        assert!(value.get("numberSelections").is_some());
        assert!(value.get("winnerCount").is_some());
        assert_eq!(value["state"], "DRAWING");
        assert!(value["players"][0].get("joinedAt").is_some());
    }

    #[test]
    fn test_rejects_overfull_roster() {
        let mut snapshot = to_snapshot(&drawing_game());
        snapshot.max_players = 2;
        assert!(from_snapshot(snapshot).is_err());
    }
}
