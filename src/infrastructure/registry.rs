//! Cross-platform position registry.
//!
//! A durable JSON table mapping instrument -> owning platform, shared by
//! every trading process on the host and guarded by an advisory lock on a
//! sidecar file. The table guarantees at most one active platform per
//! instrument: `register` refuses a symbol owned by another platform, and
//! `unregister` refuses a foreign or unknown symbol. Entries left behind by
//! crashed processes are reaped by `cleanup_stale`.
//!
//! Every mutation is acquire-lock -> read-modify-write -> release, with an
//! atomic temp-file rename for the write. The lock wait is bounded: a
//! timeout means "registry unavailable", which callers must never read as
//! "symbol available". Reads tolerate a missing or corrupt backing file by
//! starting from an empty table.
//!
//! The API is synchronous by design; the critical section is a couple of
//! local file operations. Async callers should wrap calls in
//! `tokio::task::spawn_blocking`.

use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::trading::types::Direction;

const REGISTRY_VERSION: &str = "1.0";
const LOCK_POLL_INTERVAL_MS: u64 = 100;

/// Errors from registry operations. A conflicting registration is NOT an
/// error; it is an `Ok(false)` result.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not acquire registry lock within {timeout_ms}ms")]
    LockTimeout { timeout_ms: u64 },

    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One registered position: instrument -> owning platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub platform: String,
    pub order_id: String,
    pub direction: Direction,
    pub notional_usd: Decimal,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    positions: HashMap<String, RegistryEntry>,
    last_update: DateTime<Utc>,
    version: String,
}

impl RegistryFile {
    fn empty() -> Self {
        Self {
            positions: HashMap::new(),
            last_update: Utc::now(),
            version: REGISTRY_VERSION.to_string(),
        }
    }
}

/// RAII wrapper: the advisory lock is released when the guard drops.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

pub struct PositionRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout_ms: u64,
}

impl PositionRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        Self {
            path,
            lock_path,
            lock_timeout_ms: 5_000,
        }
    }

    pub fn with_lock_timeout(mut self, timeout_ms: u64) -> Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a position for an instrument. Returns `Ok(false)` when the
    /// instrument is already owned by a different platform; the existing
    /// entry is left untouched. Re-registering under the same platform
    /// overwrites (update-in-place).
    pub fn register(
        &self,
        symbol: &str,
        platform: &str,
        order_id: &str,
        direction: Direction,
        notional_usd: Decimal,
    ) -> Result<bool, RegistryError> {
        let _guard = self.acquire_lock()?;
        let mut registry = self.load();

        if let Some(existing) = registry.positions.get(symbol) {
            if existing.platform != platform {
                info!(
                    "PositionRegistry: {} already claimed by {}, refusing {}",
                    symbol, existing.platform, platform
                );
                return Ok(false);
            }
        }

        registry.positions.insert(
            symbol.to_string(),
            RegistryEntry {
                platform: platform.to_string(),
                order_id: order_id.to_string(),
                direction,
                notional_usd,
                registered_at: Utc::now(),
            },
        );
        self.store(&mut registry)?;
        debug!("PositionRegistry: registered {} for {}", symbol, platform);
        Ok(true)
    }

    /// Remove a position. Returns `Ok(false)` when the instrument is
    /// unknown or owned by a different platform.
    pub fn unregister(&self, symbol: &str, platform: &str) -> Result<bool, RegistryError> {
        let _guard = self.acquire_lock()?;
        let mut registry = self.load();

        match registry.positions.get(symbol) {
            None => return Ok(false),
            Some(entry) if entry.platform != platform => {
                warn!(
                    "PositionRegistry: {} owned by {}, refusing unregister from {}",
                    symbol, entry.platform, platform
                );
                return Ok(false);
            }
            Some(_) => {}
        }

        registry.positions.remove(symbol);
        self.store(&mut registry)?;
        debug!("PositionRegistry: unregistered {} for {}", symbol, platform);
        Ok(true)
    }

    /// Whether the instrument currently has no registered position.
    pub fn is_available(&self, symbol: &str) -> Result<bool, RegistryError> {
        let _guard = self.acquire_lock()?;
        Ok(!self.load().positions.contains_key(symbol))
    }

    /// All entries, optionally filtered by platform.
    pub fn list(
        &self,
        platform: Option<&str>,
    ) -> Result<HashMap<String, RegistryEntry>, RegistryError> {
        let _guard = self.acquire_lock()?;
        let registry = self.load();
        Ok(match platform {
            None => registry.positions,
            Some(platform) => registry
                .positions
                .into_iter()
                .filter(|(_, entry)| entry.platform == platform)
                .collect(),
        })
    }

    /// Remove entries older than `max_age`. Entries with unusable
    /// timestamps are reaped as well. Returns the number removed. This is
    /// the crash-recovery path for processes that registered and died.
    pub fn cleanup_stale(&self, max_age: Duration) -> Result<usize, RegistryError> {
        let _guard = self.acquire_lock()?;
        let mut registry = self.load();
        let now = Utc::now();

        let stale: Vec<String> = registry
            .positions
            .iter()
            .filter(|(_, entry)| now - entry.registered_at > max_age)
            .map(|(symbol, _)| symbol.clone())
            .collect();

        for symbol in &stale {
            registry.positions.remove(symbol);
            info!("PositionRegistry: reaped stale entry {}", symbol);
        }

        if !stale.is_empty() {
            self.store(&mut registry)?;
        }
        Ok(stale.len())
    }

    fn acquire_lock(&self) -> Result<LockGuard, RegistryError> {
        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;

        let deadline = Instant::now() + std::time::Duration::from_millis(self.lock_timeout_ms);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(LOCK_POLL_INTERVAL_MS));
                }
                Err(_) => {
                    return Err(RegistryError::LockTimeout {
                        timeout_ms: self.lock_timeout_ms,
                    })
                }
            }
        }
    }

    /// Load the backing table. Missing or corrupt files yield an empty
    /// registry rather than an error.
    fn load(&self) -> RegistryFile {
        if !self.path.exists() {
            return RegistryFile::empty();
        }
        match fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(registry) => registry,
                Err(e) => {
                    warn!(
                        "PositionRegistry: corrupt registry file {}, starting fresh: {}",
                        self.path.display(),
                        e
                    );
                    RegistryFile::empty()
                }
            },
            Err(e) => {
                warn!(
                    "PositionRegistry: unreadable registry file {}, starting fresh: {}",
                    self.path.display(),
                    e
                );
                RegistryFile::empty()
            }
        }
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn store(&self, registry: &mut RegistryFile) -> Result<(), RegistryError> {
        registry.last_update = Utc::now();

        let tmp_path = PathBuf::from(format!("{}.tmp", self.path.display()));
        let contents = serde_json::to_string_pretty(registry)?;
        if let Err(e) = fs::write(&tmp_path, &contents) {
            let _ = fs::remove_file(&tmp_path);
            return Err(RegistryError::Io(e));
        }
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(RegistryError::Io(e));
        }
        Ok(())
    }
}

/// Periodic reaper over a shared registry, for the process that owns the
/// maintenance schedule. Each sweep runs on the blocking pool.
pub async fn run_reaper(
    registry: std::sync::Arc<PositionRegistry>,
    max_age: Duration,
    interval_ms: u64,
    mut stop_rx: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("PositionRegistry: reaper running every {}ms", interval_ms);

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    info!("PositionRegistry: reaper stopped");
                    break;
                }
            }
            _ = ticker.tick() => {
                let registry = registry.clone();
                let swept = tokio::task::spawn_blocking(move || registry.cleanup_stale(max_age))
                    .await;
                match swept {
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => info!("PositionRegistry: reaper removed {} stale entries", n),
                    Ok(Err(e)) => warn!("PositionRegistry: reaper sweep failed: {}", e),
                    Err(e) => warn!("PositionRegistry: reaper task failed: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> PositionRegistry {
        PositionRegistry::new(dir.path().join("registry.json"))
    }

    fn register(reg: &PositionRegistry, symbol: &str, platform: &str) -> bool {
        reg.register(symbol, platform, "ord-1", Direction::Long, dec!(11000))
            .unwrap()
    }

    #[test]
    fn test_register_then_conflict_leaves_entry_unchanged() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);

        assert!(register(&reg, "EUR_USD", "oanda"));
        assert!(!register(&reg, "EUR_USD", "ibkr"));

        let entries = reg.list(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["EUR_USD"].platform, "oanda");
        assert_eq!(entries["EUR_USD"].order_id, "ord-1");
    }

    #[test]
    fn test_same_platform_register_is_update() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);

        assert!(register(&reg, "EUR_USD", "oanda"));
        assert!(reg
            .register("EUR_USD", "oanda", "ord-2", Direction::Short, dec!(5000))
            .unwrap());

        let entries = reg.list(None).unwrap();
        assert_eq!(entries["EUR_USD"].order_id, "ord-2");
        assert_eq!(entries["EUR_USD"].direction, Direction::Short);
    }

    #[test]
    fn test_round_trip_restores_availability() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);

        assert!(reg.is_available("EUR_USD").unwrap());
        assert!(register(&reg, "EUR_USD", "oanda"));
        assert!(!reg.is_available("EUR_USD").unwrap());

        assert!(reg.unregister("EUR_USD", "oanda").unwrap());
        assert!(reg.is_available("EUR_USD").unwrap());
    }

    #[test]
    fn test_foreign_unregister_fails_and_preserves_entry() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);

        assert!(register(&reg, "EUR_USD", "oanda"));
        assert!(!reg.unregister("EUR_USD", "ibkr").unwrap());
        assert!(!reg.unregister("GBP_USD", "oanda").unwrap());
        assert!(!reg.is_available("EUR_USD").unwrap());
    }

    #[test]
    fn test_list_filters_by_platform() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);

        register(&reg, "EUR_USD", "oanda");
        register(&reg, "GBP_USD", "ibkr");

        let oanda = reg.list(Some("oanda")).unwrap();
        assert_eq!(oanda.len(), 1);
        assert!(oanda.contains_key("EUR_USD"));

        assert_eq!(reg.list(None).unwrap().len(), 2);
    }

    /// Write a registry file where `symbol` was registered `age` ago.
    fn write_aged_registry(path: &Path, entries: &[(&str, Duration)]) {
        let mut positions = serde_json::Map::new();
        for (symbol, age) in entries {
            positions.insert(
                symbol.to_string(),
                serde_json::json!({
                    "platform": "oanda",
                    "order_id": "ord-1",
                    "direction": "Long",
                    "notional_usd": "11000",
                    "registered_at": Utc::now() - *age,
                }),
            );
        }
        let file = serde_json::json!({
            "positions": positions,
            "last_update": Utc::now(),
            "version": "1.0",
        });
        fs::write(path, serde_json::to_string_pretty(&file).unwrap()).unwrap();
    }

    #[test]
    fn test_cleanup_stale_removes_old_keeps_fresh() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);

        // 25h-old entry is past the 24h threshold, the 1h-old one is not
        write_aged_registry(
            reg.path(),
            &[
                ("EUR_USD", Duration::hours(25)),
                ("GBP_USD", Duration::hours(1)),
            ],
        );

        let removed = reg.cleanup_stale(Duration::hours(24)).unwrap();
        assert_eq!(removed, 1);

        let entries = reg.list(None).unwrap();
        assert!(!entries.contains_key("EUR_USD"));
        assert!(entries.contains_key("GBP_USD"));
    }

    #[test]
    fn test_corrupt_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);

        fs::write(reg.path(), "{not valid json").unwrap();
        assert!(reg.is_available("EUR_USD").unwrap());
        assert!(reg.list(None).unwrap().is_empty());

        // A registration recovers the file
        assert!(register(&reg, "EUR_USD", "oanda"));
        assert_eq!(reg.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        {
            let reg = PositionRegistry::new(&path);
            register(&reg, "EUR_USD", "oanda");
        }

        let reopened = PositionRegistry::new(&path);
        assert!(!reopened.is_available("EUR_USD").unwrap());
        assert_eq!(reopened.list(None).unwrap()["EUR_USD"].platform, "oanda");
    }

    #[test]
    fn test_lock_timeout_is_unavailable_not_available() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir).with_lock_timeout(250);

        // Hold the lock from "another process"
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.path().join("registry.json.lock"))
            .unwrap();
        lock_file.try_lock_exclusive().unwrap();

        let err = reg.is_available("EUR_USD").unwrap_err();
        assert!(matches!(err, RegistryError::LockTimeout { timeout_ms: 250 }));

        fs2::FileExt::unlock(&lock_file).unwrap();
        assert!(reg.is_available("EUR_USD").unwrap());
    }

    #[tokio::test]
    async fn test_reaper_sweeps_on_schedule() {
        let dir = TempDir::new().unwrap();
        let reg = std::sync::Arc::new(registry(&dir));

        write_aged_registry(reg.path(), &[("EUR_USD", Duration::hours(25))]);

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let reaper = tokio::spawn(run_reaper(reg.clone(), Duration::hours(24), 20, stop_rx));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        reaper.await.unwrap();

        assert!(reg.is_available("EUR_USD").unwrap());
    }
}
