//! Expiry and pruning over the per-group stores.
//!
//! Two composable operations, selectable by group pattern: age expiry
//! (delete articles older than a retention window) and count pruning
//! (delete the oldest articles beyond a per-group cap). Dry-run is the
//! default; mutation requires `force`. Deletes run in bounded chunks, one
//! transaction per chunk, and the registry counters are recomputed after
//! mutations.

use std::sync::Arc;

use chrono::Utc;

use crate::config::EXPIRE_DELETE_CHUNK;
use crate::error::Result;
use crate::store::{GroupStores, MainDb, Newsgroup};
use crate::wildmat::Wildmat;

#[derive(Debug, Clone)]
pub struct ExpireOptions {
    /// `$all`, an exact name, or a wildmat (prefix patterns included).
    pub pattern: String,
    /// Retention window in days (0 = no age expiry) when `respect_expiry`
    /// is off.
    pub days: i64,
    /// Use each group's own ExpiryDays instead of `days`; 0 means
    /// infinite retention.
    pub respect_expiry: bool,
    /// Also prune groups above their MaxArticles cap.
    pub prune: bool,
    /// Actually delete; without it the pass only reports.
    pub force: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExpireReport {
    pub groups_scanned: u64,
    pub aged_out: u64,
    pub pruned: u64,
}

/// Run one expiry/prune pass over every group matching the pattern.
pub async fn run(
    main: &Arc<MainDb>,
    stores: &Arc<GroupStores>,
    opts: &ExpireOptions,
) -> Result<ExpireReport> {
    let selector = if opts.pattern == "$all" {
        None
    } else {
        Some(Wildmat::parse(&opts.pattern))
    };

    let mut report = ExpireReport::default();
    for group in main.list_groups().await? {
        if let Some(w) = &selector {
            if !w.matches(&group.name) {
                continue;
            }
        }
        report.groups_scanned += 1;
        let (aged, pruned) = expire_group(main, stores, &group, opts).await?;
        report.aged_out += aged;
        report.pruned += pruned;
    }

    tracing::info!(
        groups = report.groups_scanned,
        aged_out = report.aged_out,
        pruned = report.pruned,
        dry_run = !opts.force,
        "expiry pass complete"
    );
    Ok(report)
}

async fn expire_group(
    main: &Arc<MainDb>,
    stores: &Arc<GroupStores>,
    group: &Newsgroup,
    opts: &ExpireOptions,
) -> Result<(u64, u64)> {
    let db = stores.get(&group.name).await?;
    let mut aged: u64 = 0;
    let mut pruned: u64 = 0;

    let days = if opts.respect_expiry {
        group.expiry_days
    } else {
        opts.days
    };
    if days > 0 {
        let cutoff = Utc::now().timestamp() - days * 86_400;
        if opts.force {
            loop {
                let nums = db
                    .nums_older_than(cutoff, EXPIRE_DELETE_CHUNK as i64)
                    .await?;
                if nums.is_empty() {
                    break;
                }
                aged += db.delete_articles(&nums).await?;
            }
        } else {
            // LIMIT -1 disables the cap for the dry-run count.
            aged = db.nums_older_than(cutoff, -1).await?.len() as u64;
        }
    }

    if opts.prune && group.max_articles > 0 {
        let (_, _, count) = db.listing_range().await?;
        let excess = count - group.max_articles;
        if excess > 0 {
            if opts.force {
                let mut remaining = excess;
                while remaining > 0 {
                    let take = remaining.min(EXPIRE_DELETE_CHUNK as i64);
                    let nums = db.oldest_nums(take).await?;
                    if nums.is_empty() {
                        break;
                    }
                    let deleted = db.delete_articles(&nums).await?;
                    pruned += deleted;
                    remaining -= deleted as i64;
                    if deleted == 0 {
                        break;
                    }
                }
            } else {
                pruned = excess as u64;
            }
        }
    }

    if opts.force && (aged > 0 || pruned > 0) {
        let (low, high, count) = db.listing_range().await?;
        let last = if count > 0 { Some(high) } else { None };
        main.update_group_counters(&group.name, low, high, count, last)
            .await?;
        tracing::info!(
            group = %group.name,
            aged_out = aged,
            pruned,
            remaining = count,
            "group expired"
        );
    }
    Ok((aged, pruned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::Article;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (Arc<MainDb>, Arc<GroupStores>) {
        let main = Arc::new(MainDb::open(&dir.path().join("main.db")).await.unwrap());
        let stores = GroupStores::new(dir.path().join("groups"));
        (main, stores)
    }

    fn article(id: usize, age_days: i64) -> Article {
        let date = Utc::now() - Duration::days(age_days);
        Article {
            message_id: format!("<e{}@test>", id),
            subject: "S".to_string(),
            from_header: "u@example.com".to_string(),
            date_sent: date,
            date_string: date.to_rfc2822(),
            headers_blob: format!("Message-ID: <e{}@test>", id),
            body_text: "body\n".to_string(),
            bytes: 50,
            lines: 1,
            downloaded: true,
            ..Default::default()
        }
    }

    fn opts(pattern: &str) -> ExpireOptions {
        ExpireOptions {
            pattern: pattern.to_string(),
            days: 0,
            respect_expiry: false,
            prune: false,
            force: false,
        }
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let dir = TempDir::new().unwrap();
        let (main, stores) = setup(&dir).await;
        main.create_group_if_missing("misc.test", "y").await.unwrap();
        let db = stores.get("misc.test").await.unwrap();
        for i in 0..10 {
            db.insert_article(&article(i, 60)).await.unwrap();
        }

        let mut o = opts("$all");
        o.days = 30;
        let report = run(&main, &stores, &o).await.unwrap();
        assert_eq!(report.aged_out, 10);
        assert_eq!(db.listing_range().await.unwrap().2, 10);
    }

    #[tokio::test]
    async fn test_age_expiry_deletes_old_articles() {
        let dir = TempDir::new().unwrap();
        let (main, stores) = setup(&dir).await;
        main.create_group_if_missing("misc.test", "y").await.unwrap();
        let db = stores.get("misc.test").await.unwrap();
        for i in 0..5 {
            db.insert_article(&article(i, 60)).await.unwrap();
        }
        for i in 5..8 {
            db.insert_article(&article(i, 1)).await.unwrap();
        }

        let mut o = opts("$all");
        o.days = 30;
        o.force = true;
        let report = run(&main, &stores, &o).await.unwrap();
        assert_eq!(report.aged_out, 5);

        let (low, high, count) = db.listing_range().await.unwrap();
        assert_eq!((low, high, count), (6, 8, 3));

        // Registry counters were written back.
        let group = main.get_group("misc.test").await.unwrap().unwrap();
        assert_eq!(group.message_count, 3);
        assert_eq!(group.low_water, 6);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_articles() {
        let dir = TempDir::new().unwrap();
        let (main, stores) = setup(&dir).await;
        main.create_group_if_missing("misc.test", "y").await.unwrap();
        // MaxArticles = 10 against 20 stored articles.
        sqlx_update_max_articles(&main, "misc.test", 10).await;
        let db = stores.get("misc.test").await.unwrap();
        for i in 0..20 {
            db.insert_article(&article(i, 1)).await.unwrap();
        }

        let mut o = opts("misc.test");
        o.prune = true;
        o.force = true;
        let report = run(&main, &stores, &o).await.unwrap();
        assert_eq!(report.pruned, 10);

        let (low, high, count) = db.listing_range().await.unwrap();
        assert_eq!((low, high, count), (11, 20, 10));
    }

    #[tokio::test]
    async fn test_expire_then_prune_compose() {
        let dir = TempDir::new().unwrap();
        let (main, stores) = setup(&dir).await;
        main.create_group_if_missing("misc.test", "y").await.unwrap();
        sqlx_update_max_articles(&main, "misc.test", 3).await;
        let db = stores.get("misc.test").await.unwrap();
        // 5 aged-out, 5 fresh; prune cap of 3 trims two more.
        for i in 0..5 {
            db.insert_article(&article(i, 60)).await.unwrap();
        }
        for i in 5..10 {
            db.insert_article(&article(i, 1)).await.unwrap();
        }

        let mut o = opts("$all");
        o.days = 30;
        o.prune = true;
        o.force = true;
        let report = run(&main, &stores, &o).await.unwrap();
        assert_eq!(report.aged_out, 5);
        assert_eq!(report.pruned, 2);

        let (low, high, count) = db.listing_range().await.unwrap();
        assert_eq!((low, high, count), (8, 10, 3));
    }

    #[tokio::test]
    async fn test_respect_expiry_zero_means_infinite() {
        let dir = TempDir::new().unwrap();
        let (main, stores) = setup(&dir).await;
        main.create_group_if_missing("misc.test", "y").await.unwrap();
        let db = stores.get("misc.test").await.unwrap();
        for i in 0..4 {
            db.insert_article(&article(i, 400)).await.unwrap();
        }

        // Group ExpiryDays is 0: nothing ages out even with --days set.
        let mut o = opts("$all");
        o.days = 30;
        o.respect_expiry = true;
        o.force = true;
        let report = run(&main, &stores, &o).await.unwrap();
        assert_eq!(report.aged_out, 0);
        assert_eq!(db.listing_range().await.unwrap().2, 4);
    }

    #[tokio::test]
    async fn test_pattern_selects_groups() {
        let dir = TempDir::new().unwrap();
        let (main, stores) = setup(&dir).await;
        main.create_group_if_missing("misc.test", "y").await.unwrap();
        main.create_group_if_missing("comp.lang.rust", "y").await.unwrap();

        for name in ["misc.test", "comp.lang.rust"] {
            let db = stores.get(name).await.unwrap();
            db.insert_article(&article(0, 60)).await.unwrap();
        }

        let mut o = opts("comp.*");
        o.days = 30;
        o.force = true;
        run(&main, &stores, &o).await.unwrap();

        let misc = stores.get("misc.test").await.unwrap();
        let comp = stores.get("comp.lang.rust").await.unwrap();
        assert_eq!(misc.listing_range().await.unwrap().2, 1);
        assert_eq!(comp.listing_range().await.unwrap().2, 0);
    }

    async fn sqlx_update_max_articles(main: &Arc<MainDb>, group: &str, cap: i64) {
        main.set_group_limits(group, 0, cap, 0).await.unwrap();
    }
}
