//! Persistent claim store.
//!
//! Two tables mirror each other: `dns` maps a label to its claim entry
//! (a JSON document with the expiry and the address), `dns4ip` maps the
//! raw 16-byte address back to the label. Every mutation touches both
//! inside a single transaction, so readers never observe half a claim.

use std::net::Ipv6Addr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::idprov::{IdProvider, ProviderError};
use crate::supervisor::FatalError;

/// Attempt limit for collision-resolving label generation.
const MAX_ID_ATTEMPTS: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("id space exhausted after {MAX_ID_ATTEMPTS} attempts")]
    IdExhausted,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// One claim: the address it belongs to and when it lapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Absolute expiry instant, RFC3339 on disk.
    pub expires: DateTime<Utc>,
    /// The claimant's address.
    pub value: Ipv6Addr,
}

impl Entry {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires < now
    }
}

struct StoreInner {
    conn: Mutex<Option<Connection>>,
    providers: Vec<Box<dyn IdProvider>>,
    provider_cursor: AtomicUsize,
    serial: AtomicU64,
    ttl: Duration,
    parent_zone: String,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to the claim store. Cheap to clone; all clones share the
/// database connection and the sweeper.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open (or create) the database at `path`, recover from whatever a
    /// previous run left behind, and start the background sweeper.
    pub async fn open(
        path: &Path,
        ttl: StdDuration,
        parent_zone: &str,
        providers: Vec<Box<dyn IdProvider>>,
        sweep_interval: StdDuration,
        errors: mpsc::Sender<FatalError>,
    ) -> Result<Store, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("failed to open {}: {e}", path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| StoreError::Unavailable(format!("chmod {}: {e}", path.display())))?;
        }

        Self::finish_open(conn, ttl, parent_zone, providers, sweep_interval, errors).await
    }

    /// In-memory store for tests; same recovery and sweeper paths.
    pub async fn open_in_memory(
        ttl: StdDuration,
        parent_zone: &str,
        providers: Vec<Box<dyn IdProvider>>,
        sweep_interval: StdDuration,
        errors: mpsc::Sender<FatalError>,
    ) -> Result<Store, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("failed to open in-memory db: {e}")))?;
        Self::finish_open(conn, ttl, parent_zone, providers, sweep_interval, errors).await
    }

    async fn finish_open(
        mut conn: Connection,
        ttl: StdDuration,
        parent_zone: &str,
        providers: Vec<Box<dyn IdProvider>>,
        sweep_interval: StdDuration,
        errors: mpsc::Sender<FatalError>,
    ) -> Result<Store, StoreError> {
        if providers.is_empty() {
            return Err(StoreError::Unavailable("no id providers configured".into()));
        }
        let ttl = Duration::from_std(ttl)
            .map_err(|_| StoreError::Unavailable("ttl out of range".into()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS dns (id TEXT PRIMARY KEY, entry TEXT NOT NULL)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS dns4ip (addr BLOB PRIMARY KEY, id TEXT NOT NULL)",
            [],
        )?;

        // Recovery sweep: drop whatever expired while we were down and
        // seed the serial from the largest surviving expiry.
        let (removed, max_expiry) = sweep_tables(&mut conn, Utc::now())?;
        if removed > 0 {
            info!(removed, "recovery sweep deleted expired claims");
        }

        let (shutdown, _) = watch::channel(false);
        let store = Store {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(Some(conn)),
                providers,
                provider_cursor: AtomicUsize::new(0),
                serial: AtomicU64::new(max_expiry.map(|t| t.timestamp() as u64).unwrap_or(0)),
                ttl,
                parent_zone: parent_zone.trim_end_matches('.').to_string(),
                shutdown,
                sweeper: Mutex::new(None),
            }),
        };

        let handle = store.spawn_sweeper(sweep_interval, errors);
        *store.inner.sweeper.lock().await = Some(handle);
        Ok(store)
    }

    /// Insert a claim for `addr`, or refresh the existing one. Returns the
    /// entry as stored and the FQDN it is served under.
    pub async fn upsert(&self, addr: Ipv6Addr) -> Result<(Entry, String), StoreError> {
        let now = Utc::now();
        let entry = Entry {
            expires: now + self.inner.ttl,
            value: addr,
        };
        let entry_json = serde_json::to_string(&entry)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let addr_key = addr.octets().to_vec();

        let mut guard = self.inner.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("store is closed".into()))?;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM dns4ip WHERE addr = ?1",
                params![addr_key],
                |row| row.get(0),
            )
            .optional()?;

        let label = match existing {
            Some(label) => label,
            None => {
                let label = self.pick_label(&tx)?;
                tx.execute(
                    "INSERT INTO dns4ip (addr, id) VALUES (?1, ?2)",
                    params![addr_key, label],
                )?;
                label
            }
        };

        tx.execute(
            "INSERT INTO dns (id, entry) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET entry = excluded.entry",
            params![label, entry_json],
        )?;
        tx.commit()?;
        drop(guard);

        self.inner
            .serial
            .fetch_max(entry.expires.timestamp() as u64, Ordering::AcqRel);

        debug!(%addr, label, "claim upserted");
        Ok((entry, format!("{label}.{}", self.inner.parent_zone)))
    }

    /// Round-robin over the configured providers until a candidate misses
    /// the `dns` table, within the fixed attempt limit.
    fn pick_label(&self, tx: &Transaction<'_>) -> Result<String, StoreError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let cursor = self.inner.provider_cursor.fetch_add(1, Ordering::Relaxed);
            let provider = &self.inner.providers[cursor % self.inner.providers.len()];
            let candidate = provider.generate()?.to_lowercase();

            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM dns WHERE id = ?1)",
                params![candidate],
                |row| row.get(0),
            )?;
            if !taken {
                return Ok(candidate);
            }
        }
        Err(StoreError::IdExhausted)
    }

    /// Address for a live claim, `None` for unknown or expired labels.
    pub async fn resolve_by_label(&self, label: &str) -> Result<Option<Ipv6Addr>, StoreError> {
        let label = label.to_lowercase();
        let guard = self.inner.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("store is closed".into()))?;

        let raw: Option<String> = conn
            .query_row("SELECT entry FROM dns WHERE id = ?1", params![label], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(raw
            .and_then(|json| serde_json::from_str::<Entry>(&json).ok())
            .filter(|entry| !entry.expired_at(Utc::now()))
            .map(|entry| entry.value))
    }

    /// Live claim for an address, through the reverse table.
    pub async fn resolve_by_address(
        &self,
        addr: Ipv6Addr,
    ) -> Result<Option<(Entry, String)>, StoreError> {
        let guard = self.inner.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("store is closed".into()))?;

        let label: Option<String> = conn
            .query_row(
                "SELECT id FROM dns4ip WHERE addr = ?1",
                params![addr.octets().to_vec()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(label) = label else {
            return Ok(None);
        };

        let raw: Option<String> = conn
            .query_row("SELECT entry FROM dns WHERE id = ?1", params![label], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(raw
            .and_then(|json| serde_json::from_str::<Entry>(&json).ok())
            .filter(|entry| !entry.expired_at(Utc::now()))
            .map(|entry| (entry, label)))
    }

    /// Current zone serial, truncated from the monotonic expiry maximum.
    pub fn serial(&self) -> u32 {
        self.inner.serial.load(Ordering::Acquire) as u32
    }

    pub fn parent_zone(&self) -> &str {
        &self.inner.parent_zone
    }

    pub fn ttl(&self) -> StdDuration {
        // Positive by construction.
        self.inner.ttl.to_std().unwrap_or(StdDuration::ZERO)
    }

    /// Delete expired claims. Returns how many were removed.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let mut guard = self.inner.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("store is closed".into()))?;
        let (removed, _) = sweep_tables(conn, Utc::now())?;
        Ok(removed)
    }

    fn spawn_sweeper(
        &self,
        interval: StdDuration,
        errors: mpsc::Sender<FatalError>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the recovery sweep already
            // covered that ground.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        match store.sweep().await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "sweeper deleted expired claims"),
                            Err(e) => {
                                if !*shutdown.borrow() {
                                    warn!(error = %e, "sweeper failed, shutting down");
                                    let _ = errors.send(FatalError::Store(e)).await;
                                }
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Stop the sweeper and release the database handle. Idempotent.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        if let Some(handle) = self.inner.sweeper.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.conn.lock().await.take();
    }
}

/// Delete every expired pair under one transaction; report the number of
/// removals and the largest surviving expiry.
fn sweep_tables(
    conn: &mut Connection,
    now: DateTime<Utc>,
) -> Result<(usize, Option<DateTime<Utc>>), StoreError> {
    let tx = conn.transaction()?;
    let mut removed = 0usize;
    let mut max_expiry: Option<DateTime<Utc>> = None;

    let rows: Vec<(String, String)> = {
        let mut stmt = tx.prepare("SELECT id, entry FROM dns")?;
        let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        mapped.collect::<Result<_, _>>()?
    };

    for (label, json) in rows {
        match serde_json::from_str::<Entry>(&json) {
            Ok(entry) if !entry.expired_at(now) => {
                max_expiry = Some(max_expiry.map_or(entry.expires, |m| m.max(entry.expires)));
            }
            Ok(_) => {
                tx.execute("DELETE FROM dns WHERE id = ?1", params![label])?;
                tx.execute("DELETE FROM dns4ip WHERE id = ?1", params![label])?;
                removed += 1;
            }
            Err(e) => {
                // An undecodable row can only hold the label hostage; drop it.
                warn!(label, error = %e, "dropping undecodable claim entry");
                tx.execute("DELETE FROM dns WHERE id = ?1", params![label])?;
                tx.execute("DELETE FROM dns4ip WHERE id = ?1", params![label])?;
                removed += 1;
            }
        }
    }

    tx.commit()?;
    Ok((removed, max_expiry))
}
