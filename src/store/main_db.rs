//! Main store: newsgroup registry, providers, users, post queue, fetch
//! watermarks, and the locked short-hash-length row.
//!
//! A single SQLite database, read-heavy, coarse-grained. Per-group article
//! data lives in the per-group stores.

use std::path::Path;

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::config::ProviderConfig;
use crate::error::Result;

/// A registered newsgroup.
#[derive(Debug, Clone)]
pub struct Newsgroup {
    pub id: i64,
    pub name: String,
    /// Prefix up to the first dot, e.g. "comp" for "comp.lang.rust".
    pub hierarchy: String,
    pub active: bool,
    pub description: String,
    pub high_water: i64,
    pub low_water: i64,
    pub message_count: i64,
    pub last_article: Option<i64>,
    /// Days of retention; 0 means infinite.
    pub expiry_days: i64,
    /// Article-count cap; 0 means unlimited.
    pub max_articles: i64,
    pub max_art_size: i64,
    /// Active-file status flag ("y", "n", "m", ...).
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An authenticated user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub posting: bool,
}

/// A locally accepted article queued for peering.
#[derive(Debug, Clone)]
pub struct PostQueueEntry {
    pub id: i64,
    pub message_id: String,
    pub newsgroup: String,
}

pub struct MainDb {
    pool: SqlitePool,
}

fn password_digest(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hierarchy_of(name: &str) -> String {
    name.split('.').next().unwrap_or(name).to_string()
}

fn group_from_row(row: &sqlx::sqlite::SqliteRow) -> Newsgroup {
    Newsgroup {
        id: row.get("id"),
        name: row.get("name"),
        hierarchy: row.get("hierarchy"),
        active: row.get::<i64, _>("active") != 0,
        description: row.get("description"),
        high_water: row.get("high_water"),
        low_water: row.get("low_water"),
        message_count: row.get("message_count"),
        last_article: row.get("last_article"),
        expiry_days: row.get("expiry_days"),
        max_articles: row.get("max_articles"),
        max_art_size: row.get("max_art_size"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl MainDb {
    pub async fn open(path: &Path) -> Result<MainDb> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let db = MainDb { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key             TEXT PRIMARY KEY,
                value           TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS newsgroups (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                name            TEXT NOT NULL UNIQUE,
                hierarchy       TEXT NOT NULL,
                active          INTEGER NOT NULL DEFAULT 1,
                description     TEXT NOT NULL DEFAULT '',
                high_water      INTEGER NOT NULL DEFAULT 0,
                low_water       INTEGER NOT NULL DEFAULT 1,
                message_count   INTEGER NOT NULL DEFAULT 0,
                last_article    INTEGER,
                expiry_days     INTEGER NOT NULL DEFAULT 0,
                max_articles    INTEGER NOT NULL DEFAULT 0,
                max_art_size    INTEGER NOT NULL DEFAULT 0,
                status          TEXT NOT NULL DEFAULT 'y',
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_newsgroups_hierarchy ON newsgroups(hierarchy);

            CREATE TABLE IF NOT EXISTS hierarchies (
                name            TEXT PRIMARY KEY,
                group_count     INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS providers (
                name            TEXT PRIMARY KEY,
                host            TEXT NOT NULL,
                port            INTEGER NOT NULL,
                ssl             INTEGER NOT NULL DEFAULT 0,
                username        TEXT,
                password        TEXT,
                max_conns       INTEGER NOT NULL DEFAULT 4,
                priority        INTEGER NOT NULL DEFAULT 0,
                max_art_size    INTEGER NOT NULL DEFAULT 0,
                posting         INTEGER NOT NULL DEFAULT 0,
                enabled         INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS users (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                username        TEXT NOT NULL UNIQUE,
                password_digest TEXT NOT NULL,
                posting         INTEGER NOT NULL DEFAULT 1,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id              TEXT PRIMARY KEY,
                user_id         INTEGER NOT NULL,
                remote          TEXT NOT NULL,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS post_queue (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id      TEXT NOT NULL,
                newsgroup       TEXT NOT NULL,
                state           TEXT NOT NULL DEFAULT 'pending'
            );
            CREATE INDEX IF NOT EXISTS idx_post_queue_state ON post_queue(state);

            CREATE TABLE IF NOT EXISTS fetch_progress (
                provider        TEXT NOT NULL,
                newsgroup       TEXT NOT NULL,
                last_num        INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (provider, newsgroup)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Short hash length lock
    // =========================================================================

    /// Return the locked short-hash length, persisting `requested` on first
    /// use. A later mismatch warns and keeps the locked value.
    pub async fn locked_short_hash_len(&self, requested: u8) -> Result<u8> {
        let existing = sqlx::query("SELECT value FROM config WHERE key = 'short_hash_len'")
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = existing {
            let value: String = row.get(0);
            let locked: u8 = value.parse().unwrap_or(requested);
            if locked != requested {
                tracing::warn!(
                    locked,
                    requested,
                    "short_hash_len is locked, ignoring configured value"
                );
            }
            return Ok(locked);
        }
        sqlx::query("INSERT INTO config (key, value) VALUES ('short_hash_len', ?)")
            .bind(requested.to_string())
            .execute(&self.pool)
            .await?;
        tracing::info!(len = requested, "short_hash_len locked");
        Ok(requested)
    }

    // =========================================================================
    // Newsgroup registry
    // =========================================================================

    pub async fn get_group(&self, name: &str) -> Result<Option<Newsgroup>> {
        let row = sqlx::query("SELECT * FROM newsgroups WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(group_from_row))
    }

    pub async fn list_groups(&self) -> Result<Vec<Newsgroup>> {
        let rows = sqlx::query("SELECT * FROM newsgroups ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(group_from_row).collect())
    }

    /// Create a group with defaults if absent; existing groups are never
    /// overwritten. Returns the stored row either way.
    pub async fn create_group_if_missing(&self, name: &str, status: &str) -> Result<Newsgroup> {
        let now = Utc::now().timestamp();
        let hierarchy = hierarchy_of(name);
        sqlx::query(
            "INSERT INTO newsgroups (name, hierarchy, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(&hierarchy)
        .bind(status)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "INSERT INTO hierarchies (name, group_count) VALUES (?, \
             (SELECT COUNT(*) FROM newsgroups WHERE hierarchy = ?)) \
             ON CONFLICT(name) DO UPDATE SET group_count = excluded.group_count",
        )
        .bind(&hierarchy)
        .bind(&hierarchy)
        .execute(&self.pool)
        .await?;
        match self.get_group(name).await? {
            Some(group) => Ok(group),
            None => Err(crate::error::SpoolError::Database(sqlx::Error::RowNotFound)),
        }
    }

    pub async fn set_group_description(&self, name: &str, description: &str) -> Result<()> {
        sqlx::query("UPDATE newsgroups SET description = ?, updated_at = ? WHERE name = ?")
            .bind(description)
            .bind(Utc::now().timestamp())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Set a group's retention knobs (0 disables the respective limit).
    pub async fn set_group_limits(
        &self,
        name: &str,
        expiry_days: i64,
        max_articles: i64,
        max_art_size: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE newsgroups SET expiry_days = ?, max_articles = ?, max_art_size = ?, \
             updated_at = ? WHERE name = ?",
        )
        .bind(expiry_days)
        .bind(max_articles)
        .bind(max_art_size)
        .bind(Utc::now().timestamp())
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write back `(low, high, count, last_article)` after ingestion or
    /// maintenance.
    pub async fn update_group_counters(
        &self,
        name: &str,
        low_water: i64,
        high_water: i64,
        message_count: i64,
        last_article: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE newsgroups SET low_water = ?, high_water = ?, message_count = ?, \
             last_article = ?, updated_at = ? WHERE name = ?",
        )
        .bind(low_water)
        .bind(high_water)
        .bind(message_count)
        .bind(last_article)
        .bind(Utc::now().timestamp())
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Providers
    // =========================================================================

    /// Mirror a configured provider into the registry.
    pub async fn upsert_provider(&self, p: &ProviderConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO providers (name, host, port, ssl, username, password, max_conns, \
             priority, max_art_size, posting, enabled) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET host = excluded.host, port = excluded.port, \
             ssl = excluded.ssl, username = excluded.username, password = excluded.password, \
             max_conns = excluded.max_conns, priority = excluded.priority, \
             max_art_size = excluded.max_art_size, posting = excluded.posting, \
             enabled = excluded.enabled",
        )
        .bind(&p.name)
        .bind(&p.host)
        .bind(p.port as i64)
        .bind(p.ssl as i64)
        .bind(&p.username)
        .bind(&p.password)
        .bind(p.max_conns as i64)
        .bind(p.priority as i64)
        .bind(p.max_art_size as i64)
        .bind(p.posting as i64)
        .bind(p.enabled() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Users and sessions
    // =========================================================================

    pub async fn create_user(&self, username: &str, password: &str, posting: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (username, password_digest, posting, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(username)
        .bind(password_digest(password))
        .bind(posting as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Validate credentials; `None` on unknown user or digest mismatch.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, password_digest, posting FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let stored: String = row.get("password_digest");
        if stored != password_digest(password) {
            return Ok(None);
        }
        Ok(Some(User {
            id: row.get("id"),
            username: row.get("username"),
            posting: row.get::<i64, _>("posting") != 0,
        }))
    }

    /// Audit row for a successful AUTHINFO.
    pub async fn record_session(&self, session_id: &str, user_id: i64, remote: &str) -> Result<()> {
        sqlx::query("INSERT INTO sessions (id, user_id, remote, created_at) VALUES (?, ?, ?, ?)")
            .bind(session_id)
            .bind(user_id)
            .bind(remote)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Post queue
    // =========================================================================

    pub async fn enqueue_post(&self, message_id: &str, newsgroup: &str) -> Result<()> {
        sqlx::query("INSERT INTO post_queue (message_id, newsgroup, state) VALUES (?, ?, 'pending')")
            .bind(message_id)
            .bind(newsgroup)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn pending_posts(&self, limit: i64) -> Result<Vec<PostQueueEntry>> {
        let rows = sqlx::query(
            "SELECT id, message_id, newsgroup FROM post_queue WHERE state = 'pending' \
             ORDER BY id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| PostQueueEntry {
                id: row.get("id"),
                message_id: row.get("message_id"),
                newsgroup: row.get("newsgroup"),
            })
            .collect())
    }

    pub async fn mark_posted(&self, entry_id: i64) -> Result<()> {
        sqlx::query("UPDATE post_queue SET state = 'posted' WHERE id = ?")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Fetch watermarks
    // =========================================================================

    pub async fn watermark(&self, provider: &str, newsgroup: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT last_num FROM fetch_progress WHERE provider = ? AND newsgroup = ?",
        )
        .bind(provider)
        .bind(newsgroup)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get(0)).unwrap_or(0))
    }

    pub async fn set_watermark(&self, provider: &str, newsgroup: &str, last_num: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO fetch_progress (provider, newsgroup, last_num) VALUES (?, ?, ?) \
             ON CONFLICT(provider, newsgroup) DO UPDATE SET last_num = excluded.last_num",
        )
        .bind(provider)
        .bind(newsgroup)
        .bind(last_num)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
