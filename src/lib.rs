//! Survival lottery
//!
//! Chat-scoped elimination games: players join during a window, each gets a
//! distinct number, and verifiable random draws eliminate holders until only
//! the survivors remain. Paid games gate entry on an escrow payment.

pub mod config;
pub mod errors;
pub mod escrow;
pub mod game_store;
pub mod games;
pub mod notifications;
pub mod storage;
pub mod testing;

pub use config::{ConfigLoader, LotteryConfig};
pub use errors::{LotteryError, LotteryResult};
pub use escrow::PaymentManager;
pub use game_store::{load_snapshot, MemoryStore, Persistence, RocksStore};
pub use games::{GameEngine, GameRegistry, VRFGameEngine};
pub use notifications::NotificationDelivery;
