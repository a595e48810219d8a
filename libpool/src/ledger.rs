//! Per-pool accounting database.
//!
//! Every pool carries its own SQLite file at `<pool-mount>/stat.db`, so any
//! node that mounts the pool sees the same inventory. The ledger records the
//! nominal size of each PV, not what it occupies on disk.
//!
//! Callers must hold the process-wide statfile lock around every mutation and
//! around the free-space read that precedes it; the ledger itself only
//! guarantees that each call is one committed transaction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::debug;

use crate::constants::{LEDGER_FILE, RESERVED_PERCENT};
use crate::error::PoolError;
use crate::types::pv_hash;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS summary (
    volname    TEXT PRIMARY KEY,
    size       INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS pv_stats (
    pvname     TEXT PRIMARY KEY,
    hash       TEXT NOT NULL,
    size       INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

/// Aggregate view of a pool's ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of PV records.
    pub pvs: u64,
    /// Pool capacity as last recorded by `update_summary`.
    pub total: u64,
    /// Sum of nominal PV sizes.
    pub used: u64,
    /// `total - used`, floored at zero.
    pub free: u64,
}

impl PoolStats {
    /// Headroom kept back from `free`.
    pub fn reserved(&self) -> u64 {
        self.free * RESERVED_PERCENT / 100
    }

    /// Bytes a new PV may claim.
    pub fn available(&self) -> u64 {
        self.free - self.reserved()
    }

    pub fn fits(&self, size: u64) -> bool {
        size <= self.available()
    }
}

/// One PV row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvRecord {
    pub pvname: String,
    pub hash: String,
    pub size: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Handle on `<mount>/stat.db`.
#[derive(Debug, Clone)]
pub struct PoolLedger {
    pool: Pool<Sqlite>,
    volname: String,
    path: PathBuf,
}

impl PoolLedger {
    /// Open (creating if needed) the ledger of pool `volname` mounted at
    /// `mount`.
    pub async fn open(mount: &Path, volname: &str) -> Result<Self, PoolError> {
        let path = mount.join(LEDGER_FILE);
        // WAL needs shared memory, which a FUSE mount cannot provide across
        // nodes.
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        debug!(volname, path = %path.display(), "ledger opened");

        Ok(Self {
            pool,
            volname: volname.to_owned(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the pool's total capacity.
    pub async fn update_summary(&self, total: u64) -> Result<(), PoolError> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO summary (volname, size, created_at, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(volname) DO UPDATE SET size = excluded.size, updated_at = excluded.updated_at",
        )
        .bind(&self.volname)
        .bind(total as i64)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Upsert the nominal size of `pvname`, keeping its original
    /// `created_at`.
    pub async fn update_pv_record(&self, pvname: &str, size: u64) -> Result<(), PoolError> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO pv_stats (pvname, hash, size, created_at, updated_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(pvname) DO UPDATE SET size = excluded.size, updated_at = excluded.updated_at",
        )
        .bind(pvname)
        .bind(pv_hash(pvname))
        .bind(size as i64)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop the row of `pvname`; absent rows are not an error.
    pub async fn remove_pv_record(&self, pvname: &str) -> Result<(), PoolError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pv_stats WHERE pvname = ?")
            .bind(pvname)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn pv_record(&self, pvname: &str) -> Result<Option<PvRecord>, PoolError> {
        let row = sqlx::query_as::<_, (String, String, i64, i64, i64)>(
            "SELECT pvname, hash, size, created_at, updated_at FROM pv_stats WHERE pvname = ?",
        )
        .bind(pvname)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(pvname, hash, size, created_at, updated_at)| PvRecord {
            pvname,
            hash,
            size: size.max(0) as u64,
            created_at,
            updated_at,
        }))
    }

    pub async fn get_stats(&self) -> Result<PoolStats, PoolError> {
        let total: Option<i64> =
            sqlx::query_scalar("SELECT size FROM summary WHERE volname = ?")
                .bind(&self.volname)
                .fetch_optional(&self.pool)
                .await?;

        let (pvs, used): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(size), 0) FROM pv_stats")
                .fetch_one(&self.pool)
                .await?;

        let total = total.unwrap_or(0).max(0) as u64;
        let used = used.max(0) as u64;
        Ok(PoolStats {
            pvs: pvs.max(0) as u64,
            total,
            used,
            free: total.saturating_sub(used),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
