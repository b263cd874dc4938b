//! Round mechanics: range sizing, number assignment, elimination draws and payout math.
//!
//! Everything here operates on a `&mut Game` the caller already holds the chat
//! lock for; no timers or I/O.

use crate::errors::{LotteryResult, ValidationError};
use crate::escrow::types::treasury_fee;
use crate::games::types::{EndReason, Game, NumberRange, Payout, PrizeInfo, UserId};
use crate::games::vrf_engine::{DrawPurpose, DrawSeed, RandomnessSource, VRFResult};

/// Outcome of one elimination round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    pub round: u32,
    pub drawn: u64,
    /// (player id, username) of every holder of the drawn number
    pub eliminated: Vec<(UserId, String)>,
    pub remaining_active: usize,
    pub remaining_pool: usize,
    pub proof: String,
}

/// Range `[1, floor(players × multiplier)]`, never smaller than the roster
pub fn compute_range(player_count: usize, multiplier: f64) -> NumberRange {
    let scaled = (player_count as f64 * multiplier).floor() as u64;
    NumberRange {
        min: 1,
        max: scaled.max(player_count as u64).max(1),
    }
}

/// Next seed for `game`; bumps the monotonic draw counter
pub fn next_seed(game: &mut Game, purpose: DrawPurpose) -> DrawSeed {
    game.draw_counter += 1;
    DrawSeed {
        game_id: game.id.clone(),
        purpose,
        round: game.round,
        counter: game.draw_counter,
    }
}

/// Draw the prize for a free game from the configured range
pub fn draw_prize(
    game: &mut Game,
    randomness: &dyn RandomnessSource,
    prize_min: u64,
    prize_max: u64,
) -> LotteryResult<PrizeInfo> {
    let seed = next_seed(game, DrawPurpose::Prize);
    let draw = randomness.draw(prize_min, prize_max, &seed)?;
    Ok(prize_info(draw.value, game.winner_count, draw))
}

/// Prize for a paid game: pooled entry fees minus the treasury cut.
///
/// A draw is still made so the start of every game carries a proof.
pub fn paid_prize(
    game: &mut Game,
    randomness: &dyn RandomnessSource,
    fee_percent: u8,
) -> LotteryResult<PrizeInfo> {
    let entry_fee = game.entry_fee.unwrap_or(0);
    let pooled = entry_fee
        .checked_mul(game.players.len() as u64)
        .ok_or(ValidationError::InvalidAmount(entry_fee))?;
    let total = pooled - treasury_fee(pooled, fee_percent);

    let seed = next_seed(game, DrawPurpose::Prize);
    let draw = randomness.draw(0, u64::from(u32::MAX), &seed)?;
    Ok(prize_info(total, game.winner_count, draw))
}

fn prize_info(total: u64, winner_count: u32, draw: VRFResult) -> PrizeInfo {
    PrizeInfo {
        total,
        per_survivor: total / u64::from(winner_count.max(1)),
        proof: draw.proof,
    }
}

/// Give every player one distinct number by shuffling without replacement.
///
/// One randomness call per pick: the pick is an index into the shrinking pool.
pub fn assign_numbers(game: &mut Game, randomness: &dyn RandomnessSource) -> LotteryResult<()> {
    let range = game
        .number_range
        .ok_or(ValidationError::InvalidGameConfig("number range not set".to_string()))?;
    if range.len() < game.players.len() as u64 {
        return Err(ValidationError::InvalidRange {
            min: range.min,
            max: range.max,
        }
        .into());
    }

    let mut pool: Vec<u64> = (range.min..=range.max).collect();
    let player_ids: Vec<UserId> = game.players.iter().map(|p| p.id).collect();
    game.selections.clear();

    for player_id in player_ids {
        let seed = next_seed(game, DrawPurpose::Assignment);
        let draw = randomness.draw(0, (pool.len() - 1) as u64, &seed)?;
        let number = pool.swap_remove(draw.value as usize);
        game.selections.insert(player_id, vec![number]);
    }

    Ok(())
}

/// Draw one number from the remaining pool and eliminate every active holder.
///
/// Returns `None` when the pool is already empty.
pub fn run_elimination_round(
    game: &mut Game,
    randomness: &dyn RandomnessSource,
) -> LotteryResult<Option<RoundOutcome>> {
    let pool = game.remaining_pool();
    if pool.is_empty() {
        return Ok(None);
    }

    // Only commit the round and counter once the draw succeeded
    let round = game.round + 1;
    let seed = DrawSeed {
        game_id: game.id.clone(),
        purpose: DrawPurpose::Elimination,
        round,
        counter: game.draw_counter + 1,
    };
    let draw = randomness.draw(0, (pool.len() - 1) as u64, &seed)?;
    game.round = round;
    game.draw_counter = seed.counter;
    let drawn = pool[draw.value as usize];
    game.drawn_numbers.push(drawn);

    let eliminated: Vec<(UserId, String)> = game
        .active_players()
        .into_iter()
        .filter(|p| {
            game.selections
                .get(&p.id)
                .is_some_and(|numbers| numbers.contains(&drawn))
        })
        .map(|p| (p.id, p.username.clone()))
        .collect();

    for (player_id, _) in &eliminated {
        game.eliminations.insert(*player_id, round);
    }

    Ok(Some(RoundOutcome {
        round,
        drawn,
        eliminated,
        remaining_active: game.active_count(),
        remaining_pool: pool.len() - 1,
        proof: draw.proof,
    }))
}

/// Why the elimination loop should stop now, if it should
pub fn termination_reason(game: &Game) -> Option<EndReason> {
    if game.active_count() <= game.winner_count as usize {
        return Some(EndReason::Completed);
    }
    if game.remaining_pool().is_empty() {
        return Some(EndReason::PoolExhausted);
    }
    None
}

/// Split `total` across the survivors; the integer remainder is kept aside
pub fn compute_payout(total: u64, survivors: Vec<UserId>) -> Payout {
    let n = survivors.len().max(1) as u64;
    let prize_per_survivor = total / n;
    let remainder = if survivors.is_empty() {
        total
    } else {
        total - prize_per_survivor * n
    };
    Payout {
        survivors,
        prize_per_survivor,
        remainder,
    }
}
