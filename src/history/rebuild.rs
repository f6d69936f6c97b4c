//! Shard index reconstruction from the append log.
//!
//! Reads `history.dat` start to end and rewrites every shard row. The
//! tables are cleared first, so the pass is idempotent and also discards
//! rows damaged by partial writes. Corrupt log lines are skipped and
//! counted, never fatal.

use std::collections::HashMap;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{HISTORY_SHARD_COUNT, HISTORY_TABLE_COUNT};
use crate::error::Result;

use super::log::HistoryRecord;
use super::short_hash;

/// Buffered rows are flushed once this many routes accumulate.
const FLUSH_THRESHOLD: usize = 50_000;

#[derive(Debug, Default, Clone, Copy)]
pub struct RebuildStats {
    pub records: u64,
    pub corrupt: u64,
}

/// Rebuild all shard rows from `history.dat` under `dir`.
pub async fn rebuild(dir: &Path, short_hash_len: u8) -> Result<RebuildStats> {
    let mut shards = Vec::with_capacity(HISTORY_SHARD_COUNT);
    for shard in 0..HISTORY_SHARD_COUNT {
        let options = SqliteConnectOptions::new()
            .filename(dir.join(format!("shard_{:x}.db", shard)))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        reset_tables(&pool).await?;
        shards.push(pool);
    }

    let file = File::open(dir.join("history.dat")).await?;
    let mut reader = BufReader::new(file);
    let mut stats = RebuildStats::default();
    let mut offset: u64 = 0;
    let mut line = String::new();

    // Buffer: (shard, table, key) -> offsets in append order.
    let mut rows: HashMap<(usize, String, String), Vec<u64>> = HashMap::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            break;
        }
        let record_offset = offset;
        offset += read as u64;

        match HistoryRecord::decode(&line) {
            Some(record) => {
                let hash = short_hash(&record.message_id);
                let shard = usize::from_str_radix(&hash[..1], 16).unwrap_or(0);
                let table = format!("h{}", &hash[1..3]);
                let key = hash[3..3 + short_hash_len as usize].to_string();
                rows.entry((shard, table, key)).or_default().push(record_offset);
                stats.records += 1;
            }
            None => {
                tracing::warn!(offset = record_offset, "skipping corrupt history record");
                stats.corrupt += 1;
            }
        }

        if rows.len() >= FLUSH_THRESHOLD {
            flush(&shards, &mut rows).await?;
        }
    }
    flush(&shards, &mut rows).await?;

    for pool in &shards {
        pool.close().await;
    }
    tracing::info!(
        records = stats.records,
        corrupt = stats.corrupt,
        "history index rebuilt"
    );
    Ok(stats)
}

async fn flush(
    shards: &[SqlitePool],
    rows: &mut HashMap<(usize, String, String), Vec<u64>>,
) -> Result<()> {
    for ((shard, table, key), offsets) in rows.drain() {
        let joined = offsets
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "INSERT INTO {} (k, o) VALUES (?, ?) \
             ON CONFLICT(k) DO UPDATE SET o = o || ',' || excluded.o",
            table
        );
        sqlx::query(&sql)
            .bind(&key)
            .bind(&joined)
            .execute(&shards[shard])
            .await?;
    }
    Ok(())
}

/// Drop and recreate every bucket table of a shard.
async fn reset_tables(pool: &SqlitePool) -> Result<()> {
    let mut ddl = String::new();
    for table in 0..HISTORY_TABLE_COUNT {
        ddl.push_str(&format!("DROP TABLE IF EXISTS h{:02x};\n", table));
        ddl.push_str(&format!(
            "CREATE TABLE h{:02x} (k TEXT PRIMARY KEY, o TEXT NOT NULL);\n",
            table
        ));
    }
    sqlx::raw_sql(&ddl).execute(pool).await?;
    Ok(())
}
