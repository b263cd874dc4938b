//! Durable game registry snapshots and payment records.
//!
//! Values are JSON under prefixed keys, stored either in RocksDB or in memory.

use crate::{
    errors::{LotteryResult, StorageError},
    escrow::types::{PaymentRequest, WinningsRecord},
    games::registry::GameRegistry,
    games::snapshot::{from_snapshot, RegistrySnapshot, SNAPSHOT_VERSION},
    storage::OptimizedStorage,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

const REGISTRY_SNAPSHOT_KEY: &[u8] = b"registry:snapshot";
const PAYMENT_PREFIX: &str = "payment:";
const WINNINGS_PREFIX: &str = "winnings:";

fn payment_key(payment_id: &str) -> Vec<u8> {
    format!("{}{}", PAYMENT_PREFIX, payment_id).into_bytes()
}

fn winnings_key(game_id: &str) -> Vec<u8> {
    format!("{}{}", WINNINGS_PREFIX, game_id).into_bytes()
}

/// Load/save of the whole game registry
pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> LotteryResult<Option<RegistrySnapshot>>;
    fn save(&self, snapshot: &RegistrySnapshot) -> LotteryResult<()>;
}

/// Per-payment records
pub trait PaymentStore: Send + Sync {
    fn save_payment(&self, payment: &PaymentRequest) -> LotteryResult<()>;
    fn load_payment(&self, payment_id: &str) -> LotteryResult<Option<PaymentRequest>>;
    fn load_payments(&self) -> LotteryResult<Vec<PaymentRequest>>;
    fn save_winnings(&self, record: &WinningsRecord) -> LotteryResult<()>;
    fn load_winnings(&self, game_id: &str) -> LotteryResult<Option<WinningsRecord>>;
}

fn encode<T: serde::Serialize>(what: &str, value: &T) -> LotteryResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| StorageError::WriteFailed(format!("Failed to encode {}: {}", what, e)).into())
}

fn decode<T: serde::de::DeserializeOwned>(what: &str, bytes: &[u8]) -> LotteryResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| StorageError::CorruptedData(format!("Failed to decode {}: {}", what, e)).into())
}

fn check_version(snapshot: RegistrySnapshot) -> LotteryResult<RegistrySnapshot> {
    if snapshot.version > SNAPSHOT_VERSION {
        return Err(StorageError::CorruptedData(format!(
            "Snapshot version {} is newer than supported {}",
            snapshot.version, SNAPSHOT_VERSION
        ))
        .into());
    }
    Ok(snapshot)
}

/// RocksDB-backed store
#[derive(Clone)]
pub struct RocksStore {
    storage: OptimizedStorage,
}

impl RocksStore {
    pub fn new(storage: OptimizedStorage) -> Self {
        Self { storage }
    }

    pub fn open(path: &str, clear_on_start: bool) -> LotteryResult<Self> {
        if clear_on_start {
            tracing::warn!(path, "Clearing database on startup");
            OptimizedStorage::destroy(path)
                .map_err(|e| StorageError::DatabaseOpenFailed(format!("{}: {}", path, e)))?;
        }
        let storage = OptimizedStorage::new(path)
            .map_err(|e| StorageError::DatabaseOpenFailed(format!("{}: {}", path, e)))?;
        Ok(Self::new(storage))
    }
}

impl SnapshotStore for RocksStore {
    fn load(&self) -> LotteryResult<Option<RegistrySnapshot>> {
        let bytes = self
            .storage
            .get(REGISTRY_SNAPSHOT_KEY)
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        match bytes {
            Some(bytes) => Ok(Some(check_version(decode("registry snapshot", &bytes)?)?)),
            None => Ok(None),
        }
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> LotteryResult<()> {
        let bytes = encode("registry snapshot", snapshot)?;
        self.storage
            .put(REGISTRY_SNAPSHOT_KEY, &bytes)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }
}

impl PaymentStore for RocksStore {
    fn save_payment(&self, payment: &PaymentRequest) -> LotteryResult<()> {
        let bytes = encode("payment", payment)?;
        self.storage
            .put(&payment_key(&payment.id), &bytes)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn load_payment(&self, payment_id: &str) -> LotteryResult<Option<PaymentRequest>> {
        let bytes = self
            .storage
            .get(&payment_key(payment_id))
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        bytes.map(|b| decode("payment", &b)).transpose()
    }

    fn load_payments(&self) -> LotteryResult<Vec<PaymentRequest>> {
        let rows = self
            .storage
            .scan_prefix(PAYMENT_PREFIX.as_bytes())
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;

        let mut payments = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            match decode::<PaymentRequest>("payment", &value) {
                Ok(payment) => payments.push(payment),
                Err(e) => tracing::warn!(key = %String::from_utf8_lossy(&key), "Skipping unreadable payment record: {}", e),
            }
        }
        Ok(payments)
    }

    fn save_winnings(&self, record: &WinningsRecord) -> LotteryResult<()> {
        let bytes = encode("winnings", record)?;
        self.storage
            .put(&winnings_key(&record.game_id), &bytes)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn load_winnings(&self, game_id: &str) -> LotteryResult<Option<WinningsRecord>> {
        let bytes = self
            .storage
            .get(&winnings_key(game_id))
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        bytes.map(|b| decode("winnings", &b)).transpose()
    }
}

/// In-memory store with the same key layout (tests, simulations)
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<Vec<u8>, Vec<u8>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registry snapshots written so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> LotteryResult<Option<RegistrySnapshot>> {
        match self.entries.get(REGISTRY_SNAPSHOT_KEY) {
            Some(bytes) => Ok(Some(check_version(decode("registry snapshot", &bytes)?)?)),
            None => Ok(None),
        }
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> LotteryResult<()> {
        let bytes = encode("registry snapshot", snapshot)?;
        self.entries.insert(REGISTRY_SNAPSHOT_KEY.to_vec(), bytes);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl PaymentStore for MemoryStore {
    fn save_payment(&self, payment: &PaymentRequest) -> LotteryResult<()> {
        let bytes = encode("payment", payment)?;
        self.entries.insert(payment_key(&payment.id), bytes);
        Ok(())
    }

    fn load_payment(&self, payment_id: &str) -> LotteryResult<Option<PaymentRequest>> {
        self.entries
            .get(&payment_key(payment_id))
            .map(|bytes| decode("payment", &bytes))
            .transpose()
    }

    fn load_payments(&self) -> LotteryResult<Vec<PaymentRequest>> {
        let mut payments = Vec::new();
        for entry in self.entries.iter() {
            if entry.key().starts_with(PAYMENT_PREFIX.as_bytes()) {
                payments.push(decode("payment", entry.value())?);
            }
        }
        payments.sort_by(|a: &PaymentRequest, b| a.created_at.cmp(&b.created_at));
        Ok(payments)
    }

    fn save_winnings(&self, record: &WinningsRecord) -> LotteryResult<()> {
        let bytes = encode("winnings", record)?;
        self.entries.insert(winnings_key(&record.game_id), bytes);
        Ok(())
    }

    fn load_winnings(&self, game_id: &str) -> LotteryResult<Option<WinningsRecord>> {
        self.entries
            .get(&winnings_key(game_id))
            .map(|bytes| decode("winnings", &bytes))
            .transpose()
    }
}

/// Load the registry at startup.
///
/// Games that fail validation are skipped and logged; an unreadable snapshot
/// is an error.
pub fn load_snapshot(store: &dyn SnapshotStore) -> LotteryResult<GameRegistry> {
    let Some(snapshot) = store.load()? else {
        tracing::info!("No registry snapshot found, starting empty");
        return Ok(GameRegistry::new());
    };

    let total = snapshot.games.len();
    let mut games = Vec::with_capacity(total);
    for game in snapshot.games {
        let chat_id = game.chat_id;
        match from_snapshot(game) {
            Ok(game) => games.push(game),
            Err(e) => tracing::warn!(chat_id, "Dropping invalid game from snapshot: {}", e),
        }
    }

    tracing::info!(
        restored = games.len(),
        total,
        saved_at = %snapshot.saved_at,
        "Registry snapshot loaded"
    );
    Ok(GameRegistry::from_games(games))
}

/// Serialized snapshot writer for one registry
pub struct Persistence {
    registry: Arc<GameRegistry>,
    store: Arc<dyn SnapshotStore>,
    save_lock: Mutex<()>,
}

impl Persistence {
    pub fn new(registry: Arc<GameRegistry>, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            registry,
            store,
            save_lock: Mutex::new(()),
        }
    }

    /// Save the registry; concurrent callers queue so each save sees post-mutation state
    pub async fn save_snapshot(&self) -> LotteryResult<()> {
        let _guard = self.save_lock.lock().await;
        let games = self.registry.snapshot_all().await;
        let count = games.len();
        self.store.save(&RegistrySnapshot::new(games))?;
        tracing::trace!(games = count, "Registry snapshot saved");
        Ok(())
    }

    /// Periodically save until the returned handle is stopped
    pub fn start_auto_save(self: &Arc<Self>, interval: Duration) -> AutoSaveHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let persistence = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = persistence.save_snapshot().await {
                            tracing::warn!("Periodic snapshot failed: {}", e);
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }

            if let Err(e) = persistence.save_snapshot().await {
                tracing::error!("Final snapshot failed: {}", e);
            } else {
                tracing::info!("Final snapshot saved");
            }
        });

        AutoSaveHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}

/// Handle of the periodic save task
pub struct AutoSaveHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AutoSaveHandle {
    /// Stop the loop and wait for the final save
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Auto-save task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for AutoSaveHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
