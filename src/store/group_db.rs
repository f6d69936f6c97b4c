//! Per-group store: articles, overview, thread cache, and tree cache in
//! one SQLite file per newsgroup.
//!
//! The write path is serialized by a per-group lock so article numbers are
//! assigned atomically and thread-cache updates never race. Readers go
//! straight to the pool and may observe a slightly stale thread cache.
//!
//! Thread assembly on insert: the rightmost reference that resolves
//! locally becomes the parent and donates its root; otherwise the article
//! roots a new thread. Tree rows are invalidated on write and rebuilt
//! lazily on the next read.

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::article::{Article, OverviewRow};
use crate::config::FUTURE_DATE_SLACK_SECS;
use crate::error::Result;

/// One thread-cache row.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadCacheEntry {
    pub thread_root: i64,
    pub root_date: i64,
    pub message_count: i64,
    /// Reply article numbers in arrival order (the root is not listed).
    pub child_articles: Vec<i64>,
    pub last_child_number: i64,
    pub last_activity: i64,
    pub created_at: i64,
}

/// One precomputed tree row.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub thread_root: i64,
    pub article_num: i64,
    pub parent_article: Option<i64>,
    pub depth: i64,
    pub child_count: i64,
    pub descendant_count: i64,
    /// Materialized ancestor chain of preorder positions, e.g. "0.1.3".
    pub tree_path: String,
    pub sort_order: i64,
}

pub struct GroupDb {
    group: String,
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl GroupDb {
    pub async fn open(group: &str, path: &Path) -> Result<GroupDb> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let db = GroupDb {
            group: group.to_string(),
            pool,
            write_lock: Mutex::new(()),
        };
        db.ensure_schema().await?;
        Ok(db)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
                key             TEXT PRIMARY KEY,
                value           INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS articles (
                article_num     INTEGER PRIMARY KEY,
                message_id      TEXT NOT NULL UNIQUE,
                subject         TEXT NOT NULL,
                from_header     TEXT NOT NULL,
                date_sent       INTEGER NOT NULL,
                date_string     TEXT NOT NULL,
                refs            TEXT NOT NULL DEFAULT '',
                path            TEXT NOT NULL DEFAULT '',
                headers_blob    TEXT NOT NULL,
                body_text       TEXT NOT NULL,
                bytes           INTEGER NOT NULL,
                lines           INTEGER NOT NULL,
                hide            INTEGER NOT NULL DEFAULT 0,
                downloaded      INTEGER NOT NULL DEFAULT 1,
                parent_article  INTEGER,
                thread_root     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_articles_date ON articles(date_sent);
            CREATE INDEX IF NOT EXISTS idx_articles_root ON articles(thread_root);

            CREATE TABLE IF NOT EXISTS overview (
                article_num     INTEGER PRIMARY KEY,
                subject         TEXT NOT NULL,
                from_header     TEXT NOT NULL,
                date_sent       INTEGER NOT NULL,
                date_string     TEXT NOT NULL,
                message_id      TEXT NOT NULL,
                refs            TEXT NOT NULL DEFAULT '',
                bytes           INTEGER NOT NULL,
                lines           INTEGER NOT NULL,
                reply_count     INTEGER NOT NULL DEFAULT 0,
                downloaded      INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS thread_cache (
                thread_root         INTEGER PRIMARY KEY,
                root_date           INTEGER NOT NULL,
                message_count       INTEGER NOT NULL,
                child_articles      TEXT NOT NULL DEFAULT '',
                last_child_number   INTEGER NOT NULL,
                last_activity       INTEGER NOT NULL,
                created_at          INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cached_trees (
                thread_root         INTEGER NOT NULL,
                article_num         INTEGER NOT NULL,
                parent_article      INTEGER,
                depth               INTEGER NOT NULL,
                child_count         INTEGER NOT NULL,
                descendant_count    INTEGER NOT NULL,
                tree_path           TEXT NOT NULL,
                sort_order          INTEGER NOT NULL,
                PRIMARY KEY (thread_root, article_num)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Insert an article, assign its number, and update threading.
    /// Serialized under the group write lock.
    pub async fn insert_article(&self, article: &Article) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        self.insert_locked(article).await
    }

    /// Insert many articles under a single lock acquisition.
    pub async fn batch_insert(&self, articles: &[Article]) -> Result<Vec<i64>> {
        let _guard = self.write_lock.lock().await;
        let mut nums = Vec::with_capacity(articles.len());
        for article in articles {
            nums.push(self.insert_locked(article).await?);
        }
        Ok(nums)
    }

    async fn insert_locked(&self, article: &Article) -> Result<i64> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        // Numbers come from the high-water counter, never from MAX() alone,
        // so numbers freed by deletion are never reused.
        let max_used: i64 = sqlx::query_scalar(
            "SELECT MAX(COALESCE((SELECT MAX(article_num) FROM articles), 0), \
             COALESCE((SELECT value FROM counters WHERE key = 'last_article_num'), 0))",
        )
        .fetch_one(&mut *tx)
        .await?;
        let next = max_used + 1;
        sqlx::query(
            "INSERT INTO counters (key, value) VALUES ('last_article_num', ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(next)
        .execute(&mut *tx)
        .await?;

        // Rightmost resolving reference wins the parent slot.
        let mut parent: Option<(i64, i64)> = None;
        for reference in article.reference_ids().iter().rev() {
            let row = sqlx::query(
                "SELECT article_num, thread_root FROM articles WHERE message_id = ?",
            )
            .bind(reference)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = row {
                parent = Some((row.get(0), row.get(1)));
                break;
            }
        }
        let (parent_num, root) = match parent {
            Some((p, r)) => (Some(p), r),
            None => (None, next),
        };

        sqlx::query(
            "INSERT INTO articles (article_num, message_id, subject, from_header, date_sent, \
             date_string, refs, path, headers_blob, body_text, bytes, lines, hide, downloaded, \
             parent_article, thread_root) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(next)
        .bind(&article.message_id)
        .bind(&article.subject)
        .bind(&article.from_header)
        .bind(article.date_sent.timestamp())
        .bind(&article.date_string)
        .bind(&article.references)
        .bind(&article.path)
        .bind(&article.headers_blob)
        .bind(&article.body_text)
        .bind(article.bytes)
        .bind(article.lines)
        .bind(article.hide as i64)
        .bind(article.downloaded as i64)
        .bind(parent_num)
        .bind(root)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO overview (article_num, subject, from_header, date_sent, date_string, \
             message_id, refs, bytes, lines, reply_count, downloaded) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(next)
        .bind(&article.subject)
        .bind(&article.from_header)
        .bind(article.date_sent.timestamp())
        .bind(&article.date_string)
        .bind(&article.message_id)
        .bind(&article.references)
        .bind(article.bytes)
        .bind(article.lines)
        .bind(article.downloaded as i64)
        .execute(&mut *tx)
        .await?;

        if let Some(parent_num) = parent_num {
            sqlx::query("UPDATE overview SET reply_count = reply_count + 1 WHERE article_num = ?")
                .bind(parent_num)
                .execute(&mut *tx)
                .await?;
        }

        // Future-dated or hidden articles never advance thread activity.
        let ts = article.date_sent.timestamp();
        let eligible = !article.hide && ts <= now + FUTURE_DATE_SLACK_SECS;
        let activity = if eligible { ts } else { 0 };

        let mut rebuild_root = None;
        if root == next {
            sqlx::query(
                "INSERT INTO thread_cache (thread_root, root_date, message_count, \
                 child_articles, last_child_number, last_activity, created_at) \
                 VALUES (?, ?, 1, '', ?, ?, ?) ON CONFLICT(thread_root) DO NOTHING",
            )
            .bind(root)
            .bind(ts)
            .bind(next)
            .bind(activity)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        } else {
            let updated = sqlx::query(
                "UPDATE thread_cache SET \
                 child_articles = CASE WHEN child_articles = '' THEN ?1 \
                                       ELSE child_articles || ',' || ?1 END, \
                 message_count = message_count + 1, \
                 last_child_number = ?2, \
                 last_activity = CASE WHEN ?3 > last_activity THEN ?3 ELSE last_activity END \
                 WHERE thread_root = ?4",
            )
            .bind(next.to_string())
            .bind(next)
            .bind(activity)
            .bind(root)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                // Thread row was pruned; rebuild it from surviving articles.
                rebuild_root = Some(root);
            }
        }

        sqlx::query("DELETE FROM cached_trees WHERE thread_root = ?")
            .bind(root)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if let Some(root) = rebuild_root {
            self.rebuild_thread_cache(root).await?;
        }
        Ok(next)
    }

    /// Replace (or create) a thread-cache row wholesale.
    pub async fn replace_thread_cache(&self, entry: &ThreadCacheEntry) -> Result<()> {
        let children = entry
            .child_articles
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(",");
        sqlx::query(
            "INSERT INTO thread_cache (thread_root, root_date, message_count, child_articles, \
             last_child_number, last_activity, created_at) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(thread_root) DO UPDATE SET root_date = excluded.root_date, \
             message_count = excluded.message_count, child_articles = excluded.child_articles, \
             last_child_number = excluded.last_child_number, \
             last_activity = excluded.last_activity, created_at = excluded.created_at",
        )
        .bind(entry.thread_root)
        .bind(entry.root_date)
        .bind(entry.message_count)
        .bind(children)
        .bind(entry.last_child_number)
        .bind(entry.last_activity)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recompute a thread-cache row from the articles table.
    async fn rebuild_thread_cache(&self, root: i64) -> Result<Option<ThreadCacheEntry>> {
        let rows = sqlx::query(
            "SELECT article_num, date_sent, hide FROM articles WHERE thread_root = ? \
             ORDER BY article_num",
        )
        .bind(root)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let now = Utc::now().timestamp();
        let mut entry = ThreadCacheEntry {
            thread_root: root,
            root_date: 0,
            message_count: rows.len() as i64,
            child_articles: Vec::new(),
            last_child_number: 0,
            last_activity: 0,
            created_at: now,
        };
        for row in &rows {
            let num: i64 = row.get(0);
            let date: i64 = row.get(1);
            let hide: i64 = row.get(2);
            if num == root {
                entry.root_date = date;
            } else {
                entry.child_articles.push(num);
            }
            entry.last_child_number = entry.last_child_number.max(num);
            if hide == 0 && date <= now + FUTURE_DATE_SLACK_SECS {
                entry.last_activity = entry.last_activity.max(date);
            }
        }
        self.replace_thread_cache(&entry).await?;
        Ok(Some(entry))
    }

    /// Delete a batch of articles in one transaction, removing overview and
    /// thread rows referencing them. Callers chunk the batch.
    pub async fn delete_articles(&self, nums: &[i64]) -> Result<u64> {
        if nums.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        let placeholders = vec!["?"; nums.len()].join(",");

        let mut tx = self.pool.begin().await?;

        let roots_sql = format!(
            "SELECT DISTINCT thread_root FROM articles WHERE article_num IN ({})",
            placeholders
        );
        let mut roots_query = sqlx::query(&roots_sql);
        for num in nums {
            roots_query = roots_query.bind(num);
        }
        let roots: Vec<i64> = roots_query
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect();

        let delete_articles_sql = format!(
            "DELETE FROM articles WHERE article_num IN ({})",
            placeholders
        );
        let mut delete_query = sqlx::query(&delete_articles_sql);
        for num in nums {
            delete_query = delete_query.bind(num);
        }
        let deleted = delete_query.execute(&mut *tx).await?.rows_affected();

        let delete_overview_sql = format!(
            "DELETE FROM overview WHERE article_num IN ({})",
            placeholders
        );
        let mut delete_query = sqlx::query(&delete_overview_sql);
        for num in nums {
            delete_query = delete_query.bind(num);
        }
        delete_query.execute(&mut *tx).await?;

        // Thread rows referencing deleted articles rebuild on next read.
        for root in &roots {
            sqlx::query("DELETE FROM thread_cache WHERE thread_root = ?")
                .bind(root)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM cached_trees WHERE thread_root = ?")
                .bind(root)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(deleted)
    }

    // =========================================================================
    // Read path
    // =========================================================================

    pub async fn get_by_number(&self, num: i64) -> Result<Option<Article>> {
        let row = sqlx::query("SELECT * FROM articles WHERE article_num = ?")
            .bind(num)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(article_from_row))
    }

    pub async fn get_by_message_id(&self, message_id: &str) -> Result<Option<Article>> {
        let row = sqlx::query("SELECT * FROM articles WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(article_from_row))
    }

    /// `(low, high, count)`; an empty group reports `(1, 0, 0)`.
    pub async fn listing_range(&self) -> Result<(i64, i64, i64)> {
        let row = sqlx::query(
            "SELECT COALESCE(MIN(article_num), 1), COALESCE(MAX(article_num), 0), COUNT(*) \
             FROM articles",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get(0), row.get(1), row.get(2)))
    }

    /// Article numbers within `[low, high]`, ascending (LISTGROUP).
    pub async fn article_numbers(&self, low: i64, high: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT article_num FROM articles WHERE article_num >= ? AND article_num <= ? \
             ORDER BY article_num",
        )
        .bind(low)
        .bind(high)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Overview rows within `[low, high]`, in article-number order.
    pub async fn list_overview(&self, low: i64, high: i64) -> Result<Vec<OverviewRow>> {
        let rows = sqlx::query(
            "SELECT article_num, subject, from_header, date_sent, date_string, message_id, \
             refs, bytes, lines, reply_count, downloaded FROM overview \
             WHERE article_num >= ? AND article_num <= ? ORDER BY article_num",
        )
        .bind(low)
        .bind(high)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| OverviewRow {
                article_num: row.get("article_num"),
                subject: row.get("subject"),
                from_header: row.get("from_header"),
                date_sent: chrono::DateTime::from_timestamp(row.get("date_sent"), 0)
                    .unwrap_or_default(),
                date_string: row.get("date_string"),
                message_id: row.get("message_id"),
                references: row.get("refs"),
                bytes: row.get("bytes"),
                lines: row.get("lines"),
                reply_count: row.get("reply_count"),
                downloaded: row.get::<i64, _>("downloaded") != 0,
            })
            .collect())
    }

    /// Thread-cache row for a root, rebuilding it when pruned.
    pub async fn thread_cache_for(&self, root: i64) -> Result<Option<ThreadCacheEntry>> {
        let row = sqlx::query("SELECT * FROM thread_cache WHERE thread_root = ?")
            .bind(root)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let children: String = row.get("child_articles");
                Ok(Some(ThreadCacheEntry {
                    thread_root: row.get("thread_root"),
                    root_date: row.get("root_date"),
                    message_count: row.get("message_count"),
                    child_articles: children
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .filter_map(|s| s.parse().ok())
                        .collect(),
                    last_child_number: row.get("last_child_number"),
                    last_activity: row.get("last_activity"),
                    created_at: row.get("created_at"),
                }))
            }
            None => self.rebuild_thread_cache(root).await,
        }
    }

    /// Tree rows for a root, rebuilding the cache lazily after
    /// invalidation.
    pub async fn tree_for(&self, root: i64) -> Result<Vec<TreeNode>> {
        let rows = sqlx::query(
            "SELECT * FROM cached_trees WHERE thread_root = ? ORDER BY sort_order",
        )
        .bind(root)
        .fetch_all(&self.pool)
        .await?;
        if !rows.is_empty() {
            return Ok(rows.iter().map(tree_node_from_row).collect());
        }
        self.rebuild_tree(root).await
    }

    /// Recompute the preorder tree rows for a thread and store them.
    async fn rebuild_tree(&self, root: i64) -> Result<Vec<TreeNode>> {
        let rows = sqlx::query(
            "SELECT article_num, parent_article FROM articles WHERE thread_root = ? \
             ORDER BY article_num",
        )
        .bind(root)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let members: Vec<(i64, Option<i64>)> = rows
            .iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect();
        let present: std::collections::HashSet<i64> =
            members.iter().map(|(n, _)| *n).collect();

        // Children keyed by parent; members whose parent is gone hang off
        // the root position.
        let mut children: std::collections::HashMap<Option<i64>, Vec<i64>> =
            std::collections::HashMap::new();
        let mut top_level = Vec::new();
        for (num, parent) in &members {
            match parent {
                Some(p) if present.contains(p) && *num != root => {
                    children.entry(Some(*p)).or_default().push(*num)
                }
                _ if *num == root || parent.is_none() => top_level.push(*num),
                _ => top_level.push(*num),
            }
        }

        // Preorder walk assigning sort_order and materialized paths.
        let mut nodes = Vec::with_capacity(members.len());
        let mut order: i64 = 0;
        let mut stack: Vec<(i64, Option<i64>, i64, String)> = Vec::new();
        for num in top_level.iter().rev() {
            stack.push((*num, None, 0, String::new()));
        }
        while let Some((num, parent, depth, parent_path)) = stack.pop() {
            let tree_path = if parent_path.is_empty() {
                order.to_string()
            } else {
                format!("{}.{}", parent_path, order)
            };
            let kids = children.get(&Some(num)).cloned().unwrap_or_default();
            nodes.push(TreeNode {
                thread_root: root,
                article_num: num,
                parent_article: parent,
                depth,
                child_count: kids.len() as i64,
                descendant_count: 0,
                tree_path: tree_path.clone(),
                sort_order: order,
            });
            order += 1;
            for kid in kids.iter().rev() {
                stack.push((*kid, Some(num), depth + 1, tree_path.clone()));
            }
        }

        // Descendant counts: every node increments each ancestor on its path.
        let mut counts: std::collections::HashMap<i64, i64> = std::collections::HashMap::new();
        let by_num: std::collections::HashMap<i64, Option<i64>> =
            nodes.iter().map(|n| (n.article_num, n.parent_article)).collect();
        for node in &nodes {
            let mut cursor = node.parent_article;
            while let Some(p) = cursor {
                *counts.entry(p).or_default() += 1;
                cursor = by_num.get(&p).copied().flatten();
            }
        }
        for node in &mut nodes {
            node.descendant_count = counts.get(&node.article_num).copied().unwrap_or(0);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cached_trees WHERE thread_root = ?")
            .bind(root)
            .execute(&mut *tx)
            .await?;
        for node in &nodes {
            sqlx::query(
                "INSERT INTO cached_trees (thread_root, article_num, parent_article, depth, \
                 child_count, descendant_count, tree_path, sort_order) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(node.thread_root)
            .bind(node.article_num)
            .bind(node.parent_article)
            .bind(node.depth)
            .bind(node.child_count)
            .bind(node.descendant_count)
            .bind(&node.tree_path)
            .bind(node.sort_order)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(nodes)
    }

    // =========================================================================
    // Maintenance queries
    // =========================================================================

    pub async fn nums_older_than(&self, cutoff: i64, limit: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT article_num FROM articles WHERE date_sent < ? ORDER BY article_num LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    pub async fn oldest_nums(&self, limit: i64) -> Result<Vec<i64>> {
        let rows =
            sqlx::query("SELECT article_num FROM articles ORDER BY article_num LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn article_from_row(row: &sqlx::sqlite::SqliteRow) -> Article {
    Article {
        article_num: row.get("article_num"),
        message_id: row.get("message_id"),
        subject: row.get("subject"),
        from_header: row.get("from_header"),
        date_sent: chrono::DateTime::from_timestamp(row.get("date_sent"), 0).unwrap_or_default(),
        date_string: row.get("date_string"),
        references: row.get("refs"),
        path: row.get("path"),
        headers_blob: row.get("headers_blob"),
        body_text: row.get("body_text"),
        bytes: row.get("bytes"),
        lines: row.get("lines"),
        hide: row.get::<i64, _>("hide") != 0,
        downloaded: row.get::<i64, _>("downloaded") != 0,
    }
}

fn tree_node_from_row(row: &sqlx::sqlite::SqliteRow) -> TreeNode {
    TreeNode {
        thread_root: row.get("thread_root"),
        article_num: row.get("article_num"),
        parent_article: row.get("parent_article"),
        depth: row.get("depth"),
        child_count: row.get("child_count"),
        descendant_count: row.get("descendant_count"),
        tree_path: row.get("tree_path"),
        sort_order: row.get("sort_order"),
    }
}
