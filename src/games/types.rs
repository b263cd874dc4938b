use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Chat group identifier (one live game per chat)
pub type ChatId = i64;

/// Stable chat user identifier
pub type UserId = i64;

/// Game lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameState {
    Waiting,
    Drawing,
    Paused,
    Finished,
}

impl GameState {
    /// Legal transitions of the regular lifecycle.
    ///
    /// Admin end-game is handled separately and may finish from any
    /// non-finished state.
    pub fn can_transition_to(&self, next: GameState) -> bool {
        matches!(
            (self, next),
            (GameState::Waiting, GameState::Drawing)
                | (GameState::Waiting, GameState::Paused)
                | (GameState::Drawing, GameState::Paused)
                | (GameState::Drawing, GameState::Finished)
                | (GameState::Paused, GameState::Waiting)
                | (GameState::Paused, GameState::Drawing)
                | (GameState::Waiting, GameState::Finished)
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, GameState::Finished)
    }
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameState::Waiting => write!(f, "WAITING"),
            GameState::Drawing => write!(f, "DRAWING"),
            GameState::Paused => write!(f, "PAUSED"),
            GameState::Finished => write!(f, "FINISHED"),
        }
    }
}

/// Why a game reached FINISHED
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Active players dropped to the winner count
    Completed,
    /// Every number in the range was drawn
    PoolExhausted,
    /// Join deadline passed with too few players
    InsufficientPlayers,
    /// Ended by an admin
    Admin,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Completed => write!(f, "completed"),
            EndReason::PoolExhausted => write!(f, "number pool exhausted"),
            EndReason::InsufficientPlayers => write!(f, "not enough players"),
            EndReason::Admin => write!(f, "ended by admin"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: UserId,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

/// Inclusive number range players draw from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NumberRange {
    pub min: u64,
    pub max: u64,
}

impl NumberRange {
    pub fn len(&self) -> u64 {
        self.max.saturating_sub(self.min) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.max < self.min
    }

    pub fn contains(&self, n: u64) -> bool {
        n >= self.min && n <= self.max
    }
}

/// Prize computed once at game start
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrizeInfo {
    pub total: u64,
    /// Expected split: `floor(total / winner_count)`
    pub per_survivor: u64,
    /// Proof of the randomness draw that produced (or accompanied) the prize
    pub proof: String,
}

/// Realised split at finish
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub survivors: Vec<UserId>,
    pub prize_per_survivor: u64,
    /// Undistributed leftover of the integer split, kept for the treasury
    pub remainder: u64,
}

/// Options accepted by `create_game`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameConfig {
    pub creator_id: UserId,
    pub max_players: Option<u32>,
    pub winner_count: Option<u32>,
    pub selection_multiplier: Option<f64>,
    /// Paid game entry fee in token base units
    pub entry_fee: Option<u64>,
    pub blocked_users: Vec<UserId>,
}

/// One chat-scoped round of the survival lottery
#[derive(Debug, Clone, PartialEq)]
pub struct Game {
    pub id: String,
    pub chat_id: ChatId,
    pub state: GameState,
    pub creator_id: UserId,
    pub players: Vec<Player>,
    pub max_players: u32,
    pub winner_count: u32,
    pub number_range: Option<NumberRange>,
    pub selections: BTreeMap<UserId, Vec<u64>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub selection_multiplier: f64,
    pub prize: Option<PrizeInfo>,
    pub paused_from: Option<GameState>,
    pub paused_at: Option<DateTime<Utc>>,
    pub start_deadline: Option<DateTime<Utc>>,
    pub drawn_numbers: Vec<u64>,
    /// Player id to the round they were eliminated in
    pub eliminations: BTreeMap<UserId, u32>,
    pub round: u32,
    pub draw_counter: u64,
    pub entry_fee: Option<u64>,
    pub blocked: BTreeSet<UserId>,
    pub payout: Option<Payout>,
    pub end_reason: Option<EndReason>,
}

impl Game {
    pub fn new(
        chat_id: ChatId,
        creator_id: UserId,
        max_players: u32,
        winner_count: u32,
        selection_multiplier: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id,
            state: GameState::Waiting,
            creator_id,
            players: Vec::new(),
            max_players,
            winner_count,
            number_range: None,
            selections: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            selection_multiplier,
            prize: None,
            paused_from: None,
            paused_at: None,
            start_deadline: None,
            drawn_numbers: Vec::new(),
            eliminations: BTreeMap::new(),
            round: 0,
            draw_counter: 0,
            entry_fee: None,
            blocked: BTreeSet::new(),
            payout: None,
            end_reason: None,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn has_player(&self, user_id: UserId) -> bool {
        self.players.iter().any(|p| p.id == user_id)
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players as usize
    }

    pub fn is_paid(&self) -> bool {
        self.entry_fee.is_some()
    }

    pub fn username(&self, user_id: UserId) -> Option<&str> {
        self.players
            .iter()
            .find(|p| p.id == user_id)
            .map(|p| p.username.as_str())
    }

    /// Players not yet eliminated, in join order
    pub fn active_players(&self) -> Vec<&Player> {
        self.players
            .iter()
            .filter(|p| !self.eliminations.contains_key(&p.id))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.players
            .iter()
            .filter(|p| !self.eliminations.contains_key(&p.id))
            .count()
    }

    /// Numbers of the range that have not been drawn yet, ascending
    pub fn remaining_pool(&self) -> Vec<u64> {
        let Some(range) = self.number_range else {
            return Vec::new();
        };
        let drawn: BTreeSet<u64> = self.drawn_numbers.iter().copied().collect();
        (range.min..=range.max).filter(|n| !drawn.contains(n)).collect()
    }

    /// Winners once finished (empty before payout is recorded)
    pub fn winners(&self) -> &[UserId] {
        self.payout
            .as_ref()
            .map(|p| p.survivors.as_slice())
            .unwrap_or(&[])
    }

    /// Read-only projection for status queries
    pub fn status(&self) -> GameStatus {
        GameStatus {
            game_id: self.id.clone(),
            chat_id: self.chat_id,
            state: self.state,
            player_count: self.players.len(),
            max_players: self.max_players,
            winner_count: self.winner_count,
            active_count: self.active_count(),
            remaining_pool: self.remaining_pool().len(),
            round: self.round,
            number_range: self.number_range,
            prize: self.prize.clone(),
            entry_fee: self.entry_fee,
            winners: self.winners().to_vec(),
            end_reason: self.end_reason,
        }
    }
}

/// Status view returned by `get_status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameStatus {
    pub game_id: String,
    pub chat_id: ChatId,
    pub state: GameState,
    pub player_count: usize,
    pub max_players: u32,
    pub winner_count: u32,
    pub active_count: usize,
    pub remaining_pool: usize,
    pub round: u32,
    pub number_range: Option<NumberRange>,
    pub prize: Option<PrizeInfo>,
    pub entry_fee: Option<u64>,
    pub winners: Vec<UserId>,
    pub end_reason: Option<EndReason>,
}

/// Default survivor count: one per ten seats, at least one
pub fn default_winner_count(max_players: u32) -> u32 {
    max_players.div_ceil(10).max(1)
}
