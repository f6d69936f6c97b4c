//! History index: the duplicate-detection subsystem.
//!
//! "Have we seen this Message-ID?" is answered by a sharded hash index over
//! an append-only log. The SHA-256 of the Message-ID routes to one of 16
//! shard databases (first hex character) and 256 tables within it (next two
//! characters); the row key is the following `short_hash_len` characters
//! and the row value a comma-separated list of byte offsets into
//! `history.dat`. A bucket hit is only believed after the full Message-ID
//! stored at the offset matches, so short-hash collisions are harmless.
//!
//! Adds are at-most-once: a per-shard lock serializes the probe, the log
//! append, and the row update, and the log record only becomes reachable
//! once the row update lands.

mod log;
pub mod rebuild;

pub use log::{HistoryLog, HistoryRecord};

use std::path::Path;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::config::{HISTORY_SHARD_COUNT, HISTORY_TABLE_COUNT, MSGID_CACHE_CAPACITY};
use crate::error::{Result, SpoolError};

/// Outcome of a membership probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup {
    /// The Message-ID is present; `offset` addresses its log record.
    Hit { offset: u64 },
    Miss,
}

/// Outcome of an insertion attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Added {
    Added { offset: u64 },
    AlreadyExists,
}

/// Lowercase hex SHA-256 of a Message-ID.
pub fn short_hash(message_id: &str) -> String {
    let digest = Sha256::digest(message_id.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Routing coordinates derived from a Message-ID hash.
struct Route {
    shard: usize,
    table: String,
    key: String,
}

/// The history index component.
pub struct History {
    shards: Vec<SqlitePool>,
    locks: Vec<Mutex<()>>,
    log: HistoryLog,
    short_hash_len: u8,
    /// Bounded fast path in front of the shard probe; maps Message-ID to
    /// its log offset.
    msgid_cache: Cache<String, u64>,
}

impl History {
    /// Open the shard databases and the append log under `dir`, creating
    /// them on first use. `short_hash_len` must be the locked value from
    /// the main store.
    pub async fn open(dir: &Path, short_hash_len: u8) -> Result<History> {
        tokio::fs::create_dir_all(dir).await?;

        let mut shards = Vec::with_capacity(HISTORY_SHARD_COUNT);
        let mut locks = Vec::with_capacity(HISTORY_SHARD_COUNT);
        for shard in 0..HISTORY_SHARD_COUNT {
            let path = dir.join(format!("shard_{:x}.db", shard));
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            let pool = SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?;
            create_tables(&pool).await?;
            shards.push(pool);
            locks.push(Mutex::new(()));
        }

        let log = HistoryLog::open(&dir.join("history.dat")).await?;

        Ok(History {
            shards,
            locks,
            log,
            short_hash_len,
            msgid_cache: Cache::new(MSGID_CACHE_CAPACITY),
        })
    }

    pub fn log(&self) -> &HistoryLog {
        &self.log
    }

    pub fn short_hash_len(&self) -> u8 {
        self.short_hash_len
    }

    fn route(&self, message_id: &str) -> Route {
        let hash = short_hash(message_id);
        let shard = usize::from_str_radix(&hash[..1], 16).unwrap_or(0);
        let table = format!("h{}", &hash[1..3]);
        let key = hash[3..3 + self.short_hash_len as usize].to_string();
        Route { shard, table, key }
    }

    /// Exact membership test. I/O errors fail closed (an error result,
    /// never a false Miss).
    pub async fn lookup(&self, message_id: &str) -> Result<Lookup> {
        if let Some(offset) = self.msgid_cache.get(message_id).await {
            return Ok(Lookup::Hit { offset });
        }
        let route = self.route(message_id);
        self.probe(&route, message_id).await
    }

    /// Probe the shard row and verify candidate offsets against the log.
    async fn probe(&self, route: &Route, message_id: &str) -> Result<Lookup> {
        let sql = format!("SELECT o FROM {} WHERE k = ?", route.table);
        let row = sqlx::query(&sql)
            .bind(&route.key)
            .fetch_optional(&self.shards[route.shard])
            .await?;
        let Some(row) = row else {
            return Ok(Lookup::Miss);
        };
        let offsets: String = row.get(0);

        for part in offsets.split(',') {
            let Ok(offset) = part.parse::<u64>() else {
                tracing::warn!(key = %route.key, value = %part, "unparseable offset in shard row");
                continue;
            };
            match self.log.read_record(offset).await {
                Ok(record) => {
                    if record.message_id == message_id {
                        self.msgid_cache
                            .insert(message_id.to_string(), offset)
                            .await;
                        return Ok(Lookup::Hit { offset });
                    }
                }
                Err(SpoolError::CorruptRecord { offset }) => {
                    // Skip and keep scanning the bucket.
                    tracing::warn!(offset, "corrupt history record, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Lookup::Miss)
    }

    /// Insert a Message-ID with at-most-once semantics.
    ///
    /// Holds the shard lock across probe, log append, and row update, so
    /// concurrent adds of the same ID serialize and exactly one wins.
    pub async fn add(
        &self,
        message_id: &str,
        groups: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<Added> {
        let route = self.route(message_id);
        let _guard = self.locks[route.shard].lock().await;

        if let Lookup::Hit { .. } = self.probe(&route, message_id).await? {
            return Ok(Added::AlreadyExists);
        }

        let offset = self
            .log
            .append(HistoryRecord {
                message_id: message_id.to_string(),
                posted_at: posted_at.timestamp(),
                groups: groups.to_string(),
            })
            .await?;

        let sql = format!(
            "INSERT INTO {} (k, o) VALUES (?, ?) \
             ON CONFLICT(k) DO UPDATE SET o = o || ',' || excluded.o",
            route.table
        );
        sqlx::query(&sql)
            .bind(&route.key)
            .bind(offset.to_string())
            .execute(&self.shards[route.shard])
            .await?;

        self.msgid_cache
            .insert(message_id.to_string(), offset)
            .await;
        Ok(Added::Added { offset })
    }

    /// Flush the log and close every shard pool. Called last in the
    /// shutdown order, after the processor has drained.
    pub async fn close(&self) {
        self.log.close().await;
        for pool in &self.shards {
            pool.close().await;
        }
    }
}

/// Create the 256 bucket tables of one shard in a single batch.
async fn create_tables(pool: &SqlitePool) -> Result<()> {
    let mut ddl = String::new();
    for table in 0..HISTORY_TABLE_COUNT {
        ddl.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS h{:02x} (k TEXT PRIMARY KEY, o TEXT NOT NULL);\n",
            table
        ));
    }
    sqlx::raw_sql(&ddl).execute(pool).await?;
    Ok(())
}
