//! Chat message texts

use crate::games::rounds::RoundOutcome;
use crate::games::types::{EndReason, Game};
use std::time::Duration;

pub fn game_created(game: &Game, join_window: Duration) -> String {
    let mut text = format!(
        "🎲 New survival lottery! Up to {} players, {} survivor(s) split the prize.\nJoin within {}.",
        game.max_players,
        game.winner_count,
        human_duration(join_window)
    );
    if let Some(fee) = game.entry_fee {
        text.push_str(&format!("\nEntry fee: {} (paid into escrow before joining)", fee));
    }
    text
}

pub fn join_batch(usernames: &[String], player_count: usize, max_players: u32) -> String {
    let names = usernames.join(", ");
    if usernames.len() == 1 {
        format!("👤 {} joined ({}/{})", names, player_count, max_players)
    } else {
        format!("👥 {} joined ({}/{})", names, player_count, max_players)
    }
}

pub fn countdown(until_start: Duration) -> String {
    format!("⏰ Game starts in {}!", human_duration(until_start))
}

pub fn game_started(game: &Game) -> String {
    let mut text = format!("🚀 Game started with {} players!", game.players.len());
    if let Some(range) = game.number_range {
        text.push_str(&format!("\nNumbers: {}-{}", range.min, range.max));
    }
    if let Some(ref prize) = game.prize {
        text.push_str(&format!(
            "\nPrize pool: {} ({} per survivor)\nProof: {}…",
            prize.total,
            prize.per_survivor,
            prize.proof.get(..16).unwrap_or(&prize.proof)
        ));
    }

    let mut assignments: Vec<String> = game
        .players
        .iter()
        .filter_map(|p| {
            game.selections
                .get(&p.id)
                .and_then(|numbers| numbers.first())
                .map(|n| format!("{} → #{}", p.username, n))
        })
        .collect();
    if !assignments.is_empty() {
        assignments.sort();
        text.push('\n');
        text.push_str(&assignments.join("\n"));
    }
    text
}

pub fn draw_result(outcome: &RoundOutcome) -> String {
    let mut text = format!("🎯 Round {}: number {} drawn.", outcome.round, outcome.drawn);
    if outcome.eliminated.is_empty() {
        text.push_str(" Nobody held it.");
    } else {
        let names: Vec<&str> = outcome.eliminated.iter().map(|(_, name)| name.as_str()).collect();
        text.push_str(&format!(" Eliminated: {}.", names.join(", ")));
    }
    text.push_str(&format!(" {} still in.", outcome.remaining_active));
    text
}

pub fn winners(game: &Game) -> String {
    let Some(ref payout) = game.payout else {
        return "🏁 Game over.".to_string();
    };
    if payout.survivors.is_empty() {
        return "🏁 Game over. Nobody survived.".to_string();
    }
    let names: Vec<&str> = payout
        .survivors
        .iter()
        .map(|id| game.username(*id).unwrap_or("unknown"))
        .collect();
    format!(
        "🏆 Winners: {}! Each receives {}.",
        names.join(", "),
        payout.prize_per_survivor
    )
}

pub fn game_ended(reason: EndReason) -> String {
    match reason {
        EndReason::InsufficientPlayers => "❌ Not enough players joined. Game cancelled.".to_string(),
        EndReason::Admin => "🛑 The game was ended by an admin.".to_string(),
        other => format!("🏁 Game over ({}).", other),
    }
}

pub fn game_paused() -> String {
    "⏸️ Game paused.".to_string()
}

pub fn game_resumed() -> String {
    "▶️ Game resumed!".to_string()
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        let minutes = secs / 60;
        format!("{} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        format!("{} second{}", secs, if secs == 1 { "" } else { "s" })
    }
}
