//! Replay protection: atomic, TTL-bound nonce consumption.
//!
//! The shared store is SQLite so that multiple facilitator processes agree
//! on which nonces are spent. When the shared store is unreachable the
//! manager degrades to a process-local set with no TTL — acceptable only for
//! single-instance deployments, and logged loudly because it weakens
//! cross-process replay protection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use alloy::primitives::B256;
use dashmap::DashMap;

use crate::typed_data::{parse_bytes32, Bytes32Mode};

/// Default nonce time-to-live.
pub const DEFAULT_NONCE_TTL_SECS: u64 = 60;

/// Current unix timestamp for nonce bookkeeping.
/// On clock error, returns i64::MAX so recorded nonces never look expired.
fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_else(|_| {
            tracing::error!("system clock before UNIX epoch — using max timestamp for nonce safety");
            i64::MAX
        })
}

/// Cross-process nonce store backed by SQLite.
///
/// `INSERT` on the PRIMARY KEY is the atomic claim; the uniqueness
/// constraint is enforced at the database level, safe across processes.
pub struct SharedNonceStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SharedNonceStore {
    /// Open (or create) the nonce database at the given path.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS consumed_nonces (
                nonce BLOB PRIMARY KEY,
                consumed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nonces_consumed_at ON consumed_nonces(consumed_at);
            PRAGMA journal_mode=WAL;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("nonce store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Atomically claim `nonce` unless it was already consumed within
    /// `ttl_secs`. An expired prior claim is evicted and re-claimed.
    pub fn try_consume(&self, nonce: &B256, ttl_secs: u64) -> Result<bool, rusqlite::Error> {
        let conn = self.lock();
        let now = unix_now();
        let cutoff = now.saturating_sub(ttl_secs as i64);

        conn.execute(
            "DELETE FROM consumed_nonces WHERE nonce = ?1 AND consumed_at < ?2",
            rusqlite::params![nonce.as_slice(), cutoff],
        )?;

        match conn.execute(
            "INSERT INTO consumed_nonces (nonce, consumed_at) VALUES (?1, ?2)",
            rusqlite::params![nonce.as_slice(), now],
        ) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop all claims older than `ttl_secs`. Returns the number purged.
    pub fn purge_expired(&self, ttl_secs: u64) -> Result<usize, rusqlite::Error> {
        let conn = self.lock();
        let cutoff = unix_now().saturating_sub(ttl_secs as i64);
        conn.execute(
            "DELETE FROM consumed_nonces WHERE consumed_at < ?1",
            rusqlite::params![cutoff],
        )
    }
}

/// Atomic replay protection with a degraded local fallback.
pub struct NonceManager {
    shared: Option<SharedNonceStore>,
    /// Fallback set, insert-only, no TTL. Values are claim times for diagnostics.
    local: DashMap<B256, Instant>,
    ttl_secs: u64,
    degraded: AtomicBool,
}

impl NonceManager {
    /// Manager backed by a shared store, with the default 60s TTL.
    pub fn new(store: SharedNonceStore) -> Self {
        Self::with_ttl(Some(store), DEFAULT_NONCE_TTL_SECS)
    }

    /// Local-only manager for single-instance deployments and tests.
    /// Provides no cross-process replay protection and no TTL eviction.
    pub fn local_only() -> Self {
        Self::with_ttl(None, DEFAULT_NONCE_TTL_SECS)
    }

    pub fn with_ttl(shared: Option<SharedNonceStore>, ttl_secs: u64) -> Self {
        Self {
            shared,
            local: DashMap::new(),
            ttl_secs,
            degraded: AtomicBool::new(false),
        }
    }

    /// Atomically check-and-consume a hex-encoded nonce.
    ///
    /// Returns `true` iff the nonce was absent (or expired) and is now
    /// claimed. Empty or malformed input is always rejected.
    pub fn verify_and_consume(&self, nonce: &str) -> bool {
        if nonce.trim().is_empty() {
            tracing::warn!("empty nonce rejected");
            return false;
        }
        let parsed = match parse_bytes32(nonce, Bytes32Mode::Strict) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "malformed nonce rejected");
                return false;
            }
        };
        self.consume(&parsed)
    }

    /// Atomically check-and-consume an already-parsed nonce.
    pub fn consume(&self, nonce: &B256) -> bool {
        if let Some(store) = &self.shared {
            match store.try_consume(nonce, self.ttl_secs) {
                Ok(fresh) => {
                    if self.degraded.swap(false, Ordering::Relaxed) {
                        tracing::info!("shared nonce store recovered, leaving degraded mode");
                    }
                    if !fresh {
                        tracing::warn!(nonce = %format!("{nonce:.8}"), "replayed nonce rejected");
                    }
                    return fresh;
                }
                Err(e) => {
                    if !self.degraded.swap(true, Ordering::Relaxed) {
                        tracing::error!(
                            error = %e,
                            "shared nonce store unreachable — DEGRADED to process-local replay \
                             protection; unsafe for multi-instance deployments"
                        );
                    } else {
                        tracing::warn!(error = %e, "shared nonce store still unreachable");
                    }
                }
            }
        }

        // Local fallback: DashMap's entry API is the atomic claim within this
        // process. No TTL — entries live until restart.
        use dashmap::mapref::entry::Entry;
        match self.local.entry(*nonce) {
            Entry::Occupied(_) => {
                tracing::warn!(nonce = %format!("{nonce:.8}"), "replayed nonce rejected (local set)");
                false
            }
            Entry::Vacant(v) => {
                v.insert(Instant::now());
                true
            }
        }
    }

    /// Whether the manager is currently running on the local fallback.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonce(byte: u8) -> B256 {
        B256::new([byte; 32])
    }

    #[test]
    fn shared_store_consumes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonces.db");
        let store = SharedNonceStore::open(path.to_str().unwrap()).unwrap();

        assert!(store.try_consume(&nonce(0x42), 60).unwrap());
        assert!(!store.try_consume(&nonce(0x42), 60).unwrap());
        assert!(store.try_consume(&nonce(0x43), 60).unwrap());
    }

    #[test]
    fn shared_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonces.db");
        {
            let store = SharedNonceStore::open(path.to_str().unwrap()).unwrap();
            assert!(store.try_consume(&nonce(0xaa), 60).unwrap());
        }
        {
            let store = SharedNonceStore::open(path.to_str().unwrap()).unwrap();
            assert!(!store.try_consume(&nonce(0xaa), 60).unwrap());
        }
    }

    #[test]
    fn expired_nonce_is_reusable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonces.db");
        let store = SharedNonceStore::open(path.to_str().unwrap()).unwrap();

        // Insert with an ancient timestamp, then claim with a 60s TTL:
        // the stale row is evicted and the nonce consumable again.
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO consumed_nonces (nonce, consumed_at) VALUES (?1, ?2)",
                rusqlite::params![nonce(0xbb).as_slice(), 1000i64],
            )
            .unwrap();
        }
        assert!(store.try_consume(&nonce(0xbb), 60).unwrap());
        // ...and consumed again within the window, it is a replay.
        assert!(!store.try_consume(&nonce(0xbb), 60).unwrap());
    }

    #[test]
    fn purge_drops_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonces.db");
        let store = SharedNonceStore::open(path.to_str().unwrap()).unwrap();

        store.try_consume(&nonce(0x01), 60).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO consumed_nonces (nonce, consumed_at) VALUES (?1, ?2)",
                rusqlite::params![nonce(0x02).as_slice(), 1000i64],
            )
            .unwrap();
        }
        assert_eq!(store.purge_expired(60).unwrap(), 1);
        assert!(!store.try_consume(&nonce(0x01), 60).unwrap());
    }

    #[test]
    fn manager_rejects_empty_and_malformed() {
        let manager = NonceManager::local_only();
        assert!(!manager.verify_and_consume(""));
        assert!(!manager.verify_and_consume("   "));
        assert!(!manager.verify_and_consume("0xabcd"));
        assert!(!manager.verify_and_consume("not-hex"));
    }

    #[test]
    fn manager_consumes_exactly_once() {
        let manager = NonceManager::local_only();
        let hex = format!("0x{}", "42".repeat(32));
        assert!(manager.verify_and_consume(&hex));
        assert!(!manager.verify_and_consume(&hex));
    }

    #[test]
    fn manager_with_shared_store_spans_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonces.db");
        let hex = format!("0x{}", "77".repeat(32));

        let first = NonceManager::new(SharedNonceStore::open(path.to_str().unwrap()).unwrap());
        assert!(first.verify_and_consume(&hex));
        assert!(!first.is_degraded());

        let second = NonceManager::new(SharedNonceStore::open(path.to_str().unwrap()).unwrap());
        assert!(!second.verify_and_consume(&hex));
    }
}
