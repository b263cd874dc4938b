//! Survival lottery command line

use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc, time::Duration};
use survival_lottery::{
    config::{ConfigLoader, LotteryConfig},
    errors::{ConfigurationError, LotteryResult},
    game_store::{load_snapshot, MemoryStore, PaymentStore, Persistence, RocksStore, SnapshotStore},
    games::{EngineParts, GameConfig, GameEngine, GameState, JoinRequest, VRFGameEngine},
    notifications::{LoggingSink, NotificationDelivery},
};
use tracing_subscriber::EnvFilter;

/// Survival lottery CLI
#[derive(Parser)]
#[command(name = "survival-lottery")]
#[command(about = "Chat survival lottery with verifiable draws")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the effective values
    CheckConfig,

    /// List the games and payments stored in a data directory
    InspectSnapshot {
        /// Data directory (defaults to storage.data_directory)
        #[arg(short, long)]
        data_dir: Option<String>,
    },

    /// Run one free game end to end with simulated players
    Simulate {
        /// Number of simulated players
        #[arg(short, long, default_value = "10")]
        players: u32,

        /// Survivor count (defaults to one per ten seats)
        #[arg(short, long)]
        survivors: Option<u32>,

        /// Pause between elimination rounds
        #[arg(short, long, default_value = "200")]
        round_delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> LotteryResult<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(ref path) = cli.config {
        loader = loader.with_path(path);
    }
    let config = loader.load()?;

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config
            .monitoring
            .log_filter
            .clone()
            .unwrap_or_else(|| config.monitoring.log_level.as_filter().to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::CheckConfig => check_config(&config),
        Commands::InspectSnapshot { data_dir } => inspect_snapshot(&config, data_dir),
        Commands::Simulate {
            players,
            survivors,
            round_delay_ms,
        } => simulate(config, players, survivors, round_delay_ms).await,
    }
}

fn check_config(config: &LotteryConfig) -> LotteryResult<()> {
    config.validate().map_err(ConfigurationError::from)?;
    println!("{}", serde_json::to_string_pretty(config)?);
    println!("✅ Configuration is valid");
    Ok(())
}

fn inspect_snapshot(config: &LotteryConfig, data_dir: Option<String>) -> LotteryResult<()> {
    let path = data_dir.unwrap_or_else(|| config.storage.data_directory.clone());
    let store = RocksStore::open(&path, false)?;

    match store.load()? {
        Some(snapshot) => {
            println!(
                "📦 Snapshot v{} saved at {} with {} game(s)",
                snapshot.version,
                snapshot.saved_at,
                snapshot.games.len()
            );
            for game in &snapshot.games {
                println!(
                    "  chat {:>14}  {:<8}  players {}/{}  survivors {}  game {}",
                    game.chat_id,
                    game.state,
                    game.players.len(),
                    game.max_players,
                    game.winner_count,
                    game.id
                );
            }
        }
        None => println!("📭 No registry snapshot in {}", path),
    }

    let payments = store.load_payments()?;
    println!("💳 {} payment record(s)", payments.len());
    for payment in &payments {
        println!(
            "  {}  user {:>12}  {} {}  {}",
            payment.id,
            payment.user_id,
            payment.token.format_amount(payment.amount),
            payment.token.symbol,
            payment.status
        );
    }
    Ok(())
}

async fn simulate(mut config: LotteryConfig, players: u32, survivors: Option<u32>, round_delay_ms: u64) -> LotteryResult<()> {
    config.game.round_delay_ms = round_delay_ms;
    config.validate().map_err(ConfigurationError::from)?;

    let store: Arc<dyn SnapshotStore> = if config.storage.in_memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RocksStore::open(
            &config.storage.data_directory,
            config.storage.clear_on_start,
        )?)
    };
    let registry = Arc::new(load_snapshot(store.as_ref())?);
    let persistence = Arc::new(Persistence::new(registry.clone(), store));
    let auto_save = persistence.start_auto_save(config.snapshot_interval());

    let randomness = Arc::new(VRFGameEngine::from_config(&config.randomness)?);
    tracing::info!(public_key = %randomness.public_key_hex(), "VRF key loaded");

    let delivery = NotificationDelivery::new(Arc::new(LoggingSink), config.notification.clone());
    let engine = GameEngine::new(
        config.game.clone(),
        config.payment.treasury_fee_percent,
        EngineParts {
            registry,
            randomness,
            notifier: Arc::new(delivery.clone()),
            persistence,
            entry_verifier: None,
            settlement: None,
        },
    );
    engine.recover().await;

    let chat_id = 1;
    engine
        .create_game(
            chat_id,
            GameConfig {
                creator_id: 1,
                max_players: Some(players),
                winner_count: survivors,
                ..Default::default()
            },
        )
        .await?;
    for i in 1..=players {
        engine
            .join_game(chat_id, JoinRequest::new(i64::from(i), &format!("player{}", i)))
            .await?;
    }
    engine.force_start(chat_id).await?;

    let status = loop {
        tokio::time::sleep(Duration::from_millis(round_delay_ms.max(10))).await;
        let status = engine.get_status(chat_id).await?;
        if status.state == GameState::Finished {
            break status;
        }
    };

    println!("🏁 Game {} finished after {} round(s)", status.game_id, status.round);
    if let Some(ref prize) = status.prize {
        println!("💰 Prize pool {} ({} per survivor)", prize.total, prize.per_survivor);
    }
    println!("🏆 Survivors: {:?}", status.winners);

    engine.shutdown();
    delivery.shutdown(Duration::from_secs(2)).await;
    auto_save.stop().await;
    Ok(())
}
