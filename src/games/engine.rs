//! Game state machine and elimination loop.
//!
//! Every mutation happens while holding the chat's slot lock; timers only carry
//! the chat and game id and re-check the state when they fire, so a stale
//! timer is a no-op.

use crate::config::GameSettings;
use crate::errors::{LotteryResult, StateConflictError, ValidationError};
use crate::game_store::Persistence;
use crate::games::registry::GameRegistry;
use crate::games::rounds;
use crate::games::timers::{TaskTable, TimerKind};
use crate::games::types::{
    default_winner_count, ChatId, EndReason, Game, GameConfig, GameState, GameStatus, Payout, Player, UserId,
};
use crate::games::vrf_engine::RandomnessSource;
use crate::notifications::GameNotifier;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;

/// Confirms that a payment entitles a user to join a paid game
#[async_trait]
pub trait EntryVerifier: Send + Sync {
    async fn verify_entry(
        &self,
        payment_id: &str,
        user_id: UserId,
        game_id: &str,
        min_amount: u64,
    ) -> LotteryResult<()>;
}

/// Moves escrowed entry fees once a paid game is over
#[async_trait]
pub trait GameSettlement: Send + Sync {
    /// Send each survivor their share; calling it again never pays a winner twice
    async fn pay_winners(&self, game_id: &str, payout: &Payout) -> LotteryResult<()>;

    /// Return the entry fees of a game that ended without a draw; returns how many were refunded
    async fn refund_entrants(&self, game_id: &str, reason: EndReason) -> LotteryResult<usize>;
}

/// A join command
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub user_id: UserId,
    pub username: String,
    /// Required for paid games
    pub payment_id: Option<String>,
}

impl JoinRequest {
    pub fn new(user_id: UserId, username: &str) -> Self {
        Self {
            user_id,
            username: username.to_string(),
            payment_id: None,
        }
    }

    pub fn with_payment(mut self, payment_id: &str) -> Self {
        self.payment_id = Some(payment_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartTrigger {
    Deadline,
    Capacity,
    Admin,
}

/// Collaborators the engine is wired with
pub struct EngineParts {
    pub registry: Arc<GameRegistry>,
    pub randomness: Arc<dyn RandomnessSource>,
    pub notifier: Arc<dyn GameNotifier>,
    pub persistence: Arc<Persistence>,
    pub entry_verifier: Option<Arc<dyn EntryVerifier>>,
    pub settlement: Option<Arc<dyn GameSettlement>>,
}

struct EngineInner {
    settings: GameSettings,
    treasury_fee_percent: u8,
    registry: Arc<GameRegistry>,
    randomness: Arc<dyn RandomnessSource>,
    notifier: Arc<dyn GameNotifier>,
    persistence: Arc<Persistence>,
    entry_verifier: Option<Arc<dyn EntryVerifier>>,
    settlement: Option<Arc<dyn GameSettlement>>,
    timers: TaskTable,
}

#[derive(Clone)]
pub struct GameEngine {
    inner: Arc<EngineInner>,
}

impl GameEngine {
    pub fn new(settings: GameSettings, treasury_fee_percent: u8, parts: EngineParts) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                settings,
                treasury_fee_percent,
                registry: parts.registry,
                randomness: parts.randomness,
                notifier: parts.notifier,
                persistence: parts.persistence,
                entry_verifier: parts.entry_verifier,
                settlement: parts.settlement,
                timers: TaskTable::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<GameRegistry> {
        &self.inner.registry
    }

    pub fn timers(&self) -> &TaskTable {
        &self.inner.timers
    }

    fn join_window(&self) -> Duration {
        Duration::from_secs(self.inner.settings.join_deadline_minutes * 60)
    }

    fn round_delay(&self) -> Duration {
        Duration::from_millis(self.inner.settings.round_delay_ms)
    }

    fn auto_start_delay(&self) -> Duration {
        Duration::from_secs(self.inner.settings.auto_start_delay_secs)
    }

    fn retention(&self) -> Duration {
        Duration::from_secs(self.inner.settings.retention_minutes * 60)
    }

    /// Create a WAITING game for the chat
    pub async fn create_game(&self, chat_id: ChatId, config: GameConfig) -> LotteryResult<GameStatus> {
        let settings = &self.inner.settings;

        let max_players = config.max_players.unwrap_or(settings.default_max_players);
        if max_players < settings.min_players || max_players > settings.max_players_limit {
            return Err(ValidationError::InvalidGameConfig(format!(
                "max players must be between {} and {}",
                settings.min_players, settings.max_players_limit
            ))
            .into());
        }

        let winner_count = match config.winner_count {
            Some(w) if w == 0 || w >= max_players => {
                return Err(ValidationError::InvalidGameConfig(format!(
                    "survivor count must be between 1 and {}",
                    max_players - 1
                ))
                .into());
            }
            Some(w) => w,
            None => settings
                .survivor_override
                .map(|w| w.clamp(1, max_players - 1))
                .unwrap_or_else(|| default_winner_count(max_players)),
        };

        let multiplier = config.selection_multiplier.unwrap_or(settings.selection_multiplier);
        if !(settings.min_selection_multiplier..=settings.max_selection_multiplier).contains(&multiplier) {
            return Err(ValidationError::InvalidGameConfig(format!(
                "selection multiplier must be between {} and {}",
                settings.min_selection_multiplier, settings.max_selection_multiplier
            ))
            .into());
        }

        if let Some(fee) = config.entry_fee {
            if fee == 0 {
                return Err(ValidationError::InvalidAmount(fee).into());
            }
            if self.inner.entry_verifier.is_none() {
                return Err(ValidationError::InvalidGameConfig("paid games are not enabled".to_string()).into());
            }
        }

        let slot = self.inner.registry.slot(chat_id);
        let mut guard = slot.lock().await;

        if let Some(ref existing) = *guard {
            if !existing.state.is_finished() {
                return Err(StateConflictError::GameInProgress {
                    chat_id,
                    state: existing.state.to_string(),
                }
                .into());
            }
            // Replacing a finished game drops its eviction timer
            self.inner.timers.cancel_all(chat_id);
        }

        let window = self.join_window();
        let mut game = Game::new(chat_id, config.creator_id, max_players, winner_count, multiplier);
        game.entry_fee = config.entry_fee;
        game.blocked = config.blocked_users.into_iter().collect();
        game.start_deadline = Some(Utc::now() + chrono_duration(window));

        let status = game.status();
        self.inner.notifier.game_created(&game, window);
        self.inner.notifier.countdown(chat_id, window);
        self.arm(chat_id, TimerKind::JoinDeadline, window, &game.id);

        tracing::info!(
            chat_id,
            game_id = %game.id,
            max_players,
            winner_count,
            multiplier,
            paid = game.is_paid(),
            "Game created"
        );
        *guard = Some(game);
        drop(guard);

        self.persist().await;
        Ok(status)
    }

    /// Add a player to the chat's WAITING game
    pub async fn join_game(&self, chat_id: ChatId, request: JoinRequest) -> LotteryResult<GameStatus> {
        let slot = self
            .inner
            .registry
            .existing_slot(chat_id)
            .ok_or(ValidationError::GameNotFound { chat_id })?;
        let mut guard = slot.lock().await;
        let game = guard.as_mut().ok_or(ValidationError::GameNotFound { chat_id })?;

        if game.state != GameState::Waiting {
            return Err(StateConflictError::InvalidGameTransition {
                operation: "join",
                state: game.state.to_string(),
            }
            .into());
        }
        if game.blocked.contains(&request.user_id) {
            return Err(ValidationError::UserBlocked { user_id: request.user_id }.into());
        }
        if game.has_player(request.user_id) {
            return Err(ValidationError::AlreadyJoined { user_id: request.user_id }.into());
        }
        if game.is_full() {
            return Err(ValidationError::GameFull {
                max_players: game.max_players,
            }
            .into());
        }

        if let Some(entry_fee) = game.entry_fee {
            let payment_id = request.payment_id.as_deref().ok_or(ValidationError::PaymentRequired)?;
            let verifier = self
                .inner
                .entry_verifier
                .as_ref()
                .ok_or(ValidationError::InvalidGameConfig("paid games are not enabled".to_string()))?;
            verifier
                .verify_entry(payment_id, request.user_id, &game.id, entry_fee)
                .await?;
        }

        game.players.push(Player {
            id: request.user_id,
            username: request.username.clone(),
            joined_at: Utc::now(),
        });
        let player_count = game.players.len();
        self.inner
            .notifier
            .player_joined(chat_id, &request.username, player_count, game.max_players);

        tracing::debug!(chat_id, user_id = request.user_id, player_count, "Player joined");

        if game.is_full() {
            tracing::info!(chat_id, "Game full, auto-start armed");
            self.arm(chat_id, TimerKind::AutoStart, self.auto_start_delay(), &game.id);
        }

        let status = game.status();
        drop(guard);

        self.persist().await;
        Ok(status)
    }

    /// Admin start: skips the deadline, never the player-count check
    pub async fn force_start(&self, chat_id: ChatId) -> LotteryResult<GameStatus> {
        let slot = self
            .inner
            .registry
            .existing_slot(chat_id)
            .ok_or(ValidationError::GameNotFound { chat_id })?;
        let mut guard = slot.lock().await;
        let game = guard.as_mut().ok_or(ValidationError::GameNotFound { chat_id })?;

        if game.state != GameState::Waiting {
            return Err(StateConflictError::InvalidGameTransition {
                operation: "start",
                state: game.state.to_string(),
            }
            .into());
        }

        self.start_locked(game, StartTrigger::Admin)?;
        let status = game.status();
        drop(guard);

        self.persist().await;
        Ok(status)
    }

    pub async fn pause_game(&self, chat_id: ChatId) -> LotteryResult<GameStatus> {
        let slot = self
            .inner
            .registry
            .existing_slot(chat_id)
            .ok_or(ValidationError::GameNotFound { chat_id })?;
        let mut guard = slot.lock().await;
        let game = guard.as_mut().ok_or(ValidationError::GameNotFound { chat_id })?;

        if !game.state.can_transition_to(GameState::Paused) {
            return Err(StateConflictError::InvalidGameTransition {
                operation: "pause",
                state: game.state.to_string(),
            }
            .into());
        }

        game.paused_from = Some(game.state);
        game.paused_at = Some(Utc::now());
        game.state = GameState::Paused;

        self.inner.timers.cancel_all(chat_id);
        self.inner.notifier.cancel_scheduled(chat_id);
        self.inner.notifier.game_paused(chat_id);
        tracing::info!(chat_id, paused_from = ?game.paused_from, "Game paused");

        let status = game.status();
        drop(guard);

        self.persist().await;
        Ok(status)
    }

    pub async fn resume_game(&self, chat_id: ChatId) -> LotteryResult<GameStatus> {
        let slot = self
            .inner
            .registry
            .existing_slot(chat_id)
            .ok_or(ValidationError::GameNotFound { chat_id })?;
        let mut guard = slot.lock().await;
        let game = guard.as_mut().ok_or(ValidationError::GameNotFound { chat_id })?;

        let resume_to = match (game.state, game.paused_from) {
            (GameState::Paused, Some(from)) => from,
            _ => {
                return Err(StateConflictError::InvalidGameTransition {
                    operation: "resume",
                    state: game.state.to_string(),
                }
                .into());
            }
        };

        let paused_at = game.paused_at.take().unwrap_or_else(Utc::now);
        game.paused_from = None;
        game.state = resume_to;
        self.inner.notifier.game_resumed(chat_id);

        match resume_to {
            GameState::Drawing => {
                self.arm(chat_id, TimerKind::NextRound, self.round_delay(), &game.id);
            }
            _ => {
                // Shift the deadline by the time spent paused
                let remaining = game
                    .start_deadline
                    .map(|deadline| (deadline - paused_at).to_std().unwrap_or(Duration::ZERO))
                    .unwrap_or_else(|| self.join_window());
                game.start_deadline = Some(Utc::now() + chrono_duration(remaining));
                self.inner.notifier.countdown(chat_id, remaining);
                self.arm(chat_id, TimerKind::JoinDeadline, remaining, &game.id);
                if game.is_full() {
                    self.arm(chat_id, TimerKind::AutoStart, self.auto_start_delay(), &game.id);
                }
            }
        }
        tracing::info!(chat_id, state = %game.state, "Game resumed");

        let status = game.status();
        drop(guard);

        self.persist().await;
        Ok(status)
    }

    /// Admin end: any non-finished state goes to FINISHED, prizes untouched
    pub async fn end_game(&self, chat_id: ChatId) -> LotteryResult<GameStatus> {
        let slot = self
            .inner
            .registry
            .existing_slot(chat_id)
            .ok_or(ValidationError::GameNotFound { chat_id })?;
        let mut guard = slot.lock().await;
        let game = guard.as_mut().ok_or(ValidationError::GameNotFound { chat_id })?;

        if game.state.is_finished() {
            return Err(StateConflictError::InvalidGameTransition {
                operation: "end",
                state: game.state.to_string(),
            }
            .into());
        }

        game.state = GameState::Finished;
        game.ended_at = Some(Utc::now());
        game.end_reason = Some(EndReason::Admin);
        game.paused_from = None;
        game.paused_at = None;
        self.inner.notifier.game_ended(chat_id, EndReason::Admin);
        self.release_chat(game);
        self.settle(game);
        tracing::info!(chat_id, game_id = %game.id, "Game ended by admin");

        let status = game.status();
        drop(guard);

        self.persist().await;
        Ok(status)
    }

    /// Add a user to the block list; drops them from a WAITING roster.
    ///
    /// Returns whether a player was removed.
    pub async fn block_user(&self, chat_id: ChatId, user_id: UserId) -> LotteryResult<bool> {
        let slot = self
            .inner
            .registry
            .existing_slot(chat_id)
            .ok_or(ValidationError::GameNotFound { chat_id })?;
        let mut guard = slot.lock().await;
        let game = guard.as_mut().ok_or(ValidationError::GameNotFound { chat_id })?;

        if game.state.is_finished() {
            return Err(StateConflictError::InvalidGameTransition {
                operation: "block users in",
                state: game.state.to_string(),
            }
            .into());
        }

        game.blocked.insert(user_id);
        let removed = if game.state == GameState::Waiting && game.has_player(user_id) {
            game.players.retain(|p| p.id != user_id);
            // A full roster armed auto-start; it must not fire below capacity
            if !game.is_full() {
                self.inner.timers.cancel(chat_id, TimerKind::AutoStart);
            }
            true
        } else {
            false
        };
        tracing::info!(chat_id, user_id, removed, "User blocked");
        drop(guard);

        self.persist().await;
        Ok(removed)
    }

    pub async fn get_status(&self, chat_id: ChatId) -> LotteryResult<GameStatus> {
        let slot = self
            .inner
            .registry
            .existing_slot(chat_id)
            .ok_or(ValidationError::GameNotFound { chat_id })?;
        let guard = slot.lock().await;
        guard
            .as_ref()
            .map(Game::status)
            .ok_or_else(|| ValidationError::GameNotFound { chat_id }.into())
    }

    /// Re-arm timers for games restored from a snapshot; returns how many were re-armed
    pub async fn recover(&self) -> usize {
        let mut armed = 0;
        for chat_id in self.inner.registry.chat_ids() {
            let Some(slot) = self.inner.registry.existing_slot(chat_id) else {
                continue;
            };
            let guard = slot.lock().await;
            let Some(ref game) = *guard else {
                continue;
            };

            match game.state {
                GameState::Waiting => {
                    let remaining = game
                        .start_deadline
                        .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                        .unwrap_or(Duration::ZERO);
                    if !remaining.is_zero() {
                        self.inner.notifier.countdown(chat_id, remaining);
                    }
                    self.arm(chat_id, TimerKind::JoinDeadline, remaining, &game.id);
                    if game.is_full() {
                        self.arm(chat_id, TimerKind::AutoStart, self.auto_start_delay(), &game.id);
                    }
                }
                GameState::Drawing => {
                    self.arm(chat_id, TimerKind::NextRound, self.round_delay(), &game.id);
                }
                GameState::Finished => {
                    let elapsed = game
                        .ended_at
                        .and_then(|ended| (Utc::now() - ended).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    let delay = self.retention().saturating_sub(elapsed);
                    self.arm(chat_id, TimerKind::Eviction, delay, &game.id);
                }
                GameState::Paused => continue,
            }
            tracing::info!(chat_id, game_id = %game.id, state = %game.state, "Game recovered");
            armed += 1;
        }
        armed
    }

    /// Cancel every timer; games stay in the registry for the next snapshot
    pub fn shutdown(&self) {
        self.inner.timers.shutdown();
    }

    /// Move a WAITING game to DRAWING (or end it when too few players are left at the deadline)
    fn start_locked(&self, game: &mut Game, trigger: StartTrigger) -> LotteryResult<()> {
        let chat_id = game.chat_id;
        let min_players = self.inner.settings.min_players;

        if game.players.len() < min_players as usize {
            if trigger == StartTrigger::Deadline {
                tracing::info!(chat_id, players = game.players.len(), "Deadline passed without enough players");
                self.finish_locked(game, EndReason::InsufficientPlayers);
                return Ok(());
            }
            return Err(ValidationError::NotEnoughPlayers {
                have: game.players.len(),
                need: min_players,
            }
            .into());
        }

        // Prepare on a copy so a failed draw leaves the game untouched
        let mut next = game.clone();
        next.number_range = Some(rounds::compute_range(next.players.len(), next.selection_multiplier));
        let randomness = self.inner.randomness.as_ref();
        let prize = if next.is_paid() {
            rounds::paid_prize(&mut next, randomness, self.inner.treasury_fee_percent)?
        } else {
            rounds::draw_prize(
                &mut next,
                randomness,
                self.inner.settings.prize_min,
                self.inner.settings.prize_max,
            )?
        };
        next.prize = Some(prize);
        rounds::assign_numbers(&mut next, randomness)?;
        next.state = GameState::Drawing;
        next.started_at = Some(Utc::now());
        next.start_deadline = None;
        *game = next;

        self.inner.timers.cancel(chat_id, TimerKind::JoinDeadline);
        self.inner.timers.cancel(chat_id, TimerKind::AutoStart);
        self.inner.notifier.cancel_scheduled(chat_id);
        self.inner.notifier.game_started(game);
        self.arm(chat_id, TimerKind::NextRound, self.round_delay(), &game.id);

        tracing::info!(
            chat_id,
            game_id = %game.id,
            ?trigger,
            players = game.players.len(),
            range = ?game.number_range,
            "Game started"
        );
        Ok(())
    }

    /// Record survivors and payout, then release every chat resource
    fn finish_locked(&self, game: &mut Game, reason: EndReason) {
        game.state = GameState::Finished;
        game.ended_at = Some(Utc::now());
        game.end_reason = Some(reason);

        match reason {
            EndReason::Completed | EndReason::PoolExhausted => {
                let survivors: Vec<UserId> = game.active_players().iter().map(|p| p.id).collect();
                let total = game.prize.as_ref().map_or(0, |p| p.total);
                let payout = rounds::compute_payout(total, survivors);
                tracing::info!(
                    chat_id = game.chat_id,
                    game_id = %game.id,
                    survivors = ?payout.survivors,
                    prize_per_survivor = payout.prize_per_survivor,
                    remainder = payout.remainder,
                    ?reason,
                    "Game finished"
                );
                game.payout = Some(payout);
                self.inner.notifier.winners(game);
            }
            _ => {
                tracing::info!(chat_id = game.chat_id, game_id = %game.id, ?reason, "Game finished");
                self.inner.notifier.game_ended(game.chat_id, reason);
            }
        }

        self.release_chat(game);
        self.settle(game);
    }

    /// Hand a finished paid game to the escrow side: survivors are paid, cancelled entries refunded
    fn settle(&self, game: &Game) {
        let Some(settlement) = self.inner.settlement.clone() else {
            return;
        };
        if !game.is_paid() {
            return;
        }
        let Some(reason) = game.end_reason else {
            return;
        };

        let chat_id = game.chat_id;
        let game_id = game.id.clone();
        let payout = game.payout.clone();
        tokio::spawn(async move {
            let result = match (reason, payout) {
                (EndReason::Completed | EndReason::PoolExhausted, Some(payout)) => {
                    settlement.pay_winners(&game_id, &payout).await
                }
                (EndReason::InsufficientPlayers | EndReason::Admin, _) => settlement
                    .refund_entrants(&game_id, reason)
                    .await
                    .map(|refunded| tracing::info!(chat_id, %game_id, refunded, "Entry fees refunded")),
                _ => Ok(()),
            };
            if let Err(e) = result {
                tracing::error!(chat_id, %game_id, ?reason, "Settlement failed: {}", e);
            }
        });
    }

    fn release_chat(&self, game: &Game) {
        self.inner.timers.cancel_all(game.chat_id);
        self.inner.notifier.release(game.chat_id);
        self.arm(game.chat_id, TimerKind::Eviction, self.retention(), &game.id);
    }

    fn arm(&self, chat_id: ChatId, kind: TimerKind, delay: Duration, game_id: &str) {
        let engine = self.clone();
        let game_id = game_id.to_string();
        self.inner.timers.schedule(chat_id, kind, delay, move |timer_id| async move {
            // Release first so actions that cancel chat timers never abort this task
            if !engine.inner.timers.release(chat_id, kind, timer_id) {
                return;
            }
            engine.on_timer(chat_id, kind, game_id).await;
        });
    }

    fn on_timer(&self, chat_id: ChatId, kind: TimerKind, game_id: String) -> BoxFuture<'static, ()> {
        let engine = self.clone();
        async move {
            let result = match kind {
                TimerKind::JoinDeadline => engine.start_from_timer(chat_id, &game_id, StartTrigger::Deadline).await,
                TimerKind::AutoStart => engine.start_from_timer(chat_id, &game_id, StartTrigger::Capacity).await,
                TimerKind::NextRound => engine.play_round(chat_id, &game_id).await,
                TimerKind::Eviction => {
                    if engine.inner.registry.evict(chat_id, &game_id).await {
                        tracing::debug!(chat_id, %game_id, "Finished game evicted");
                        engine.persist().await;
                    }
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!(chat_id, ?kind, %game_id, "Timer action failed: {}", e);
            }
        }
        .boxed()
    }

    async fn start_from_timer(&self, chat_id: ChatId, game_id: &str, trigger: StartTrigger) -> LotteryResult<()> {
        let Some(slot) = self.inner.registry.existing_slot(chat_id) else {
            return Ok(());
        };
        let mut guard = slot.lock().await;
        let game = match guard.as_mut() {
            Some(game) if game.id == game_id && game.state == GameState::Waiting => game,
            _ => {
                tracing::debug!(chat_id, game_id, ?trigger, "Stale start timer ignored");
                return Ok(());
            }
        };

        self.start_locked(game, trigger)?;
        drop(guard);

        self.persist().await;
        Ok(())
    }

    /// One elimination round; re-arms itself until the game finishes
    async fn play_round(&self, chat_id: ChatId, game_id: &str) -> LotteryResult<()> {
        let Some(slot) = self.inner.registry.existing_slot(chat_id) else {
            return Ok(());
        };
        let mut guard = slot.lock().await;
        let game = match guard.as_mut() {
            Some(game) if game.id == game_id && game.state == GameState::Drawing => game,
            _ => {
                tracing::debug!(chat_id, game_id, "Stale round timer ignored");
                return Ok(());
            }
        };

        if let Some(reason) = rounds::termination_reason(game) {
            self.finish_locked(game, reason);
        } else {
            match rounds::run_elimination_round(game, self.inner.randomness.as_ref()) {
                Ok(Some(outcome)) => {
                    tracing::debug!(
                        chat_id,
                        round = outcome.round,
                        drawn = outcome.drawn,
                        eliminated = outcome.eliminated.len(),
                        remaining = outcome.remaining_active,
                        "Elimination round"
                    );
                    self.inner.notifier.draw_result(chat_id, &outcome);
                    match rounds::termination_reason(game) {
                        Some(reason) => self.finish_locked(game, reason),
                        None => self.arm(chat_id, TimerKind::NextRound, self.round_delay(), game_id),
                    }
                }
                Ok(None) => self.finish_locked(game, EndReason::PoolExhausted),
                Err(e) => {
                    // Nothing was committed; try again next tick
                    self.arm(chat_id, TimerKind::NextRound, self.round_delay(), game_id);
                    return Err(e);
                }
            }
        }
        drop(guard);

        self.persist().await;
        Ok(())
    }

    async fn persist(&self) {
        if let Err(e) = self.inner.persistence.save_snapshot().await {
            tracing::warn!("Failed to save registry snapshot: {}", e);
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LotteryConfig;
    use crate::game_store::MemoryStore;
    use crate::games::vrf_engine::VRFGameEngine;
    use crate::testing::{NotifierEvent, RecordingNotifier, ScriptedRandomness};

    struct Harness {
        engine: GameEngine,
        notifier: Arc<RecordingNotifier>,
        store: Arc<MemoryStore>,
    }

    fn harness_with(randomness: Arc<dyn RandomnessSource>) -> Harness {
        let config = LotteryConfig::testing();
        let registry = Arc::new(GameRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let persistence = Arc::new(Persistence::new(registry.clone(), store.clone()));
        let engine = GameEngine::new(
            config.game,
            config.payment.treasury_fee_percent,
            EngineParts {
                registry,
                randomness,
                notifier: notifier.clone(),
                persistence,
                entry_verifier: None,
                settlement: None,
            },
        );
        Harness { engine, notifier, store }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(VRFGameEngine::new_random()))
    }

    fn config(max_players: u32) -> GameConfig {
        GameConfig {
            creator_id: 1,
            max_players: Some(max_players),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_rejects_second_live_game() {
        let h = harness();
        let status = h.engine.create_game(10, config(10)).await.expect("create");
        assert_eq!(status.state, GameState::Waiting);
        assert_eq!(status.winner_count, 1);

        let err = h.engine.create_game(10, config(10)).await.expect_err("conflict");
        assert!(matches!(
            err,
            crate::errors::LotteryError::StateConflict(StateConflictError::GameInProgress { .. })
        ));
        assert!(h.store.save_count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_validates_config() {
        let h = harness();
        assert!(h.engine.create_game(1, config(1)).await.is_err());
        assert!(h.engine.create_game(1, config(500)).await.is_err());

        let mut bad_winners = config(10);
        bad_winners.winner_count = Some(10);
        assert!(h.engine.create_game(1, bad_winners).await.is_err());

        let mut bad_multiplier = config(10);
        bad_multiplier.selection_multiplier = Some(9.0);
        assert!(h.engine.create_game(1, bad_multiplier).await.is_err());

        let mut paid = config(10);
        paid.entry_fee = Some(1_000);
        assert!(h.engine.create_game(1, paid).await.is_err(), "no entry verifier wired");
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_validations_do_not_mutate() {
        let h = harness();
        let mut cfg = config(2);
        cfg.blocked_users = vec![66];
        h.engine.create_game(5, cfg).await.expect("create");

        h.engine.join_game(5, JoinRequest::new(7, "seven")).await.expect("join");
        assert!(h.engine.join_game(5, JoinRequest::new(7, "seven")).await.is_err());
        assert!(h.engine.join_game(5, JoinRequest::new(66, "blocked")).await.is_err());
        h.engine.join_game(5, JoinRequest::new(8, "eight")).await.expect("join");
        assert!(h.engine.join_game(5, JoinRequest::new(9, "nine")).await.is_err());

        let status = h.engine.get_status(5).await.expect("status");
        assert_eq!(status.player_count, 2);
        assert!(h.engine.timers().is_armed(5, TimerKind::AutoStart));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_unknown_chat() {
        let h = harness();
        let err = h.engine.join_game(404, JoinRequest::new(1, "a")).await.expect_err("missing");
        assert!(err.is_user_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_with_too_few_players_ends_game() {
        let h = harness();
        h.engine.create_game(3, config(10)).await.expect("create");
        h.engine.join_game(3, JoinRequest::new(1, "solo")).await.expect("join");

        tokio::time::sleep(Duration::from_secs(61)).await;

        let status = h.engine.get_status(3).await.expect("status");
        assert_eq!(status.state, GameState::Finished);
        assert_eq!(status.end_reason, Some(EndReason::InsufficientPlayers));
        assert!(status.winners.is_empty());
        assert!(h.notifier.events(3).contains(&NotifierEvent::Ended(EndReason::InsufficientPlayers)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_start_requires_min_players() {
        let h = harness();
        h.engine.create_game(4, config(10)).await.expect("create");
        h.engine.join_game(4, JoinRequest::new(1, "a")).await.expect("join");

        let err = h.engine.force_start(4).await.expect_err("not enough");
        assert!(matches!(
            err,
            crate::errors::LotteryError::Validation(ValidationError::NotEnoughPlayers { have: 1, need: 2 })
        ));
        assert_eq!(h.engine.get_status(4).await.expect("status").state, GameState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_game_runs_to_completion() {
        let h = harness();
        h.engine.create_game(9, config(4)).await.expect("create");
        for (id, name) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
            h.engine.join_game(9, JoinRequest::new(id, name)).await.expect("join");
        }

        tokio::time::sleep(Duration::from_secs(5)).await;

        let status = h.engine.get_status(9).await.expect("status");
        assert_eq!(status.state, GameState::Finished);
        assert!(status.active_count <= 1);
        assert!(status.round >= 3);
        let events = h.notifier.events(9);
        assert!(events.contains(&NotifierEvent::Started));
        assert!(events.contains(&NotifierEvent::Winners));
        assert!(events.contains(&NotifierEvent::Released));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_drawing() {
        // Prize, four assignments, then every elimination draw picks index 0
        let h = harness_with(Arc::new(ScriptedRandomness::new(vec![5_000, 0, 0, 0, 0])));
        h.engine.create_game(2, config(4)).await.expect("create");
        for id in 1..=4 {
            h.engine.join_game(2, JoinRequest::new(id, &format!("p{}", id))).await.expect("join");
        }
        h.engine.force_start(2).await.expect("start");

        let paused = h.engine.pause_game(2).await.expect("pause");
        assert_eq!(paused.state, GameState::Paused);
        assert_eq!(h.engine.timers().pending_count(2), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.engine.get_status(2).await.expect("status").round, 0, "no rounds while paused");

        assert!(h.engine.pause_game(2).await.is_err());
        let resumed = h.engine.resume_game(2).await.expect("resume");
        assert_eq!(resumed.state, GameState::Drawing);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.engine.get_status(2).await.expect("status").state, GameState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_waiting_shifts_deadline() {
        let h = harness();
        h.engine.create_game(6, config(10)).await.expect("create");
        for id in 1..=2 {
            h.engine.join_game(6, JoinRequest::new(id, "p")).await.expect("join");
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        h.engine.pause_game(6).await.expect("pause");
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.engine.get_status(6).await.expect("status").state, GameState::Paused);

        h.engine.resume_game(6).await.expect("resume");
        assert!(h.engine.timers().is_armed(6, TimerKind::JoinDeadline));
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_ne!(h.engine.get_status(6).await.expect("status").state, GameState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_game_keeps_prize_and_releases_chat() {
        let h = harness();
        h.engine.create_game(8, config(10)).await.expect("create");
        let ended = h.engine.end_game(8).await.expect("end");

        assert_eq!(ended.state, GameState::Finished);
        assert_eq!(ended.end_reason, Some(EndReason::Admin));
        assert!(ended.prize.is_none());
        assert!(h.engine.end_game(8).await.is_err());
        assert!(h.engine.timers().is_armed(8, TimerKind::Eviction));

        // A finished chat accepts a new game
        h.engine.create_game(8, config(10)).await.expect("recreate");
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_game_evicted_after_retention() {
        let h = harness();
        h.engine.create_game(12, config(10)).await.expect("create");
        h.engine.end_game(12).await.expect("end");

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(h.engine.get_status(12).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_user_removes_waiting_player() {
        let h = harness();
        h.engine.create_game(11, config(10)).await.expect("create");
        h.engine.join_game(11, JoinRequest::new(5, "spam")).await.expect("join");

        assert!(h.engine.block_user(11, 5).await.expect("block"));
        assert_eq!(h.engine.get_status(11).await.expect("status").player_count, 0);
        assert!(h.engine.join_game(11, JoinRequest::new(5, "spam")).await.is_err());
    }
}
