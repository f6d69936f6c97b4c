//! Fetcher: walks provider group ranges and feeds the processor.
//!
//! For each (provider, group) pair a watermark in the main store marks how
//! far the range walk has advanced. Workers walk the range in fixed-size
//! chunks: STAT discovers the Message-ID for each number, the history index
//! screens duplicates without a body fetch, and unknown articles are pulled
//! with ARTICLE and queued for ingestion. The watermark checkpoints only
//! after every insertion in the chunk has completed, so a crash resumes at
//! the previous chunk boundary and re-fetched articles dedup harmlessly.
//!
//! Groups are sharded across a provider's workers by index, so no two
//! workers ever touch the same group at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::Sender;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::instrument;

use crate::config::{
    FETCH_CHUNK_SIZE, FETCH_RETRY_ATTEMPTS, FETCH_RETRY_BASE_SECS, FETCH_RETRY_CAP_SECS,
    POOL_GET_DEADLINE_SECS, PROVIDER_FAILED_RESET_SECS, PROVIDER_THROTTLE_AFTER,
};
use crate::error::{Result, SpoolError};
use crate::history::{History, Lookup};
use crate::nntp::{ArticleSpec, BackendPool, PooledConn};
use crate::processor::IngestJob;
use crate::store::MainDb;

/// Provider availability, advanced by connection outcomes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProviderHealth {
    Unknown,
    Healthy,
    Throttled,
    Failed,
}

struct HealthState {
    health: ProviderHealth,
    consecutive_failures: u32,
    failed_at: Option<Instant>,
}

impl HealthState {
    fn new() -> HealthState {
        HealthState {
            health: ProviderHealth::Unknown,
            consecutive_failures: 0,
            failed_at: None,
        }
    }

    fn on_success(&mut self) {
        self.health = ProviderHealth::Healthy;
        self.consecutive_failures = 0;
        self.failed_at = None;
    }

    fn on_transient_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= PROVIDER_THROTTLE_AFTER {
            self.health = ProviderHealth::Throttled;
        }
    }

    fn on_fatal(&mut self) {
        self.health = ProviderHealth::Failed;
        self.failed_at = Some(Instant::now());
    }

    /// Failed providers drain back to Unknown after the reset TTL.
    fn usable(&mut self) -> bool {
        if self.health == ProviderHealth::Failed {
            match self.failed_at {
                Some(at) if at.elapsed() >= Duration::from_secs(PROVIDER_FAILED_RESET_SECS) => {
                    self.health = ProviderHealth::Unknown;
                    self.consecutive_failures = 0;
                    self.failed_at = None;
                }
                _ => return false,
            }
        }
        true
    }
}

pub struct Fetcher {
    main: Arc<MainDb>,
    history: Arc<History>,
    ingest_tx: Sender<IngestJob>,
    pools: Vec<Arc<BackendPool>>,
    health: Mutex<HashMap<String, HealthState>>,
}

impl Fetcher {
    pub fn new(
        main: Arc<MainDb>,
        history: Arc<History>,
        ingest_tx: Sender<IngestJob>,
        mut pools: Vec<Arc<BackendPool>>,
    ) -> Arc<Fetcher> {
        // Lower priority value is tried first.
        pools.sort_by_key(|pool| pool.provider().priority);
        Arc::new(Fetcher {
            main,
            history,
            ingest_tx,
            pools,
            health: Mutex::new(HashMap::new()),
        })
    }

    pub async fn provider_health(&self, provider: &str) -> ProviderHealth {
        self.health
            .lock()
            .await
            .get(provider)
            .map(|s| s.health)
            .unwrap_or(ProviderHealth::Unknown)
    }

    /// One full pass over every provider and active group.
    pub async fn run_once(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let groups: Vec<String> = self
            .main
            .list_groups()
            .await?
            .into_iter()
            .filter(|g| g.active)
            .map(|g| g.name)
            .collect();
        if groups.is_empty() {
            tracing::debug!("no active groups to fetch");
            return Ok(());
        }

        for pool in &self.pools {
            if *shutdown.borrow() {
                return Err(SpoolError::ShuttingDown);
            }
            let provider_name = pool.provider().name.clone();
            if !pool.provider().enabled() {
                continue;
            }
            {
                let mut health = self.health.lock().await;
                let state = health
                    .entry(provider_name.clone())
                    .or_insert_with(HealthState::new);
                if !state.usable() {
                    tracing::debug!(provider = %provider_name, "provider is failed, skipping");
                    continue;
                }
            }
            Self::run_provider(&self, pool, &groups, shutdown.clone()).await;
        }
        Ok(())
    }

    /// Spawn per-provider workers and wait for the pass to finish. Groups
    /// are sharded by index so a group has at most one worker.
    async fn run_provider(
        fetcher: &Arc<Fetcher>,
        pool: &Arc<BackendPool>,
        groups: &[String],
        shutdown: watch::Receiver<bool>,
    ) {
        // Probe capabilities once per pass; absence of extensions only
        // degrades logging, STAT/ARTICLE are mandatory everywhere.
        if let Ok(mut pooled) = pool
            .get(std::time::Duration::from_secs(POOL_GET_DEADLINE_SECS))
            .await
        {
            match pooled.conn.capabilities().await {
                Ok(caps) => tracing::debug!(
                    provider = %pool.provider().name,
                    capabilities = ?caps,
                    "upstream capabilities"
                ),
                Err(e) => tracing::debug!(
                    provider = %pool.provider().name,
                    error = %e,
                    "capabilities probe failed, continuing"
                ),
            }
            pool.put(pooled).await;
        }

        let workers = pool.provider().max_conns;
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let fetcher = Arc::clone(fetcher);
            let pool = Arc::clone(pool);
            let shard: Vec<String> = groups
                .iter()
                .enumerate()
                .filter(|(idx, _)| idx % workers == worker_id)
                .map(|(_, name)| name.clone())
                .collect();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                fetcher.worker(worker_id, pool, shard, shutdown).await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "fetch worker panicked");
            }
        }
    }

    #[instrument(name = "fetch.worker", skip(self, pool, shard, shutdown), fields(provider = %pool.provider().name))]
    async fn worker(
        &self,
        worker_id: usize,
        pool: Arc<BackendPool>,
        shard: Vec<String>,
        shutdown: watch::Receiver<bool>,
    ) {
        for group in shard {
            if *shutdown.borrow() {
                return;
            }
            match self.fetch_group(&pool, &group, &shutdown).await {
                Ok(fetched) => {
                    if fetched > 0 {
                        tracing::info!(group = %group, fetched, "group fetch complete");
                    }
                    self.health
                        .lock()
                        .await
                        .entry(pool.provider().name.clone())
                        .or_insert_with(HealthState::new)
                        .on_success();
                }
                Err(SpoolError::ShuttingDown) => return,
                Err(e) => {
                    let fatal = matches!(&e, SpoolError::Nntp(msg) if msg.contains("authentication"));
                    let mut health = self.health.lock().await;
                    let state = health
                        .entry(pool.provider().name.clone())
                        .or_insert_with(HealthState::new);
                    if fatal {
                        tracing::error!(group = %group, error = %e, "fatal provider error");
                        state.on_fatal();
                        return;
                    }
                    tracing::warn!(group = %group, error = %e, "group fetch failed");
                    state.on_transient_failure();
                }
            }
        }
    }

    /// Advance one group's watermark toward the provider's high mark.
    async fn fetch_group(
        &self,
        pool: &Arc<BackendPool>,
        group: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<u64> {
        let provider = pool.provider().name.clone();
        let deadline = Duration::from_secs(POOL_GET_DEADLINE_SECS);

        let mut pooled = pool.get(deadline).await?;
        let status = match pooled.conn.select_group(group).await {
            Ok(status) => status,
            Err(e) => {
                // The provider may simply not carry this group.
                pool.put(pooled).await;
                tracing::debug!(group = %group, error = %e, "group unavailable upstream");
                return Ok(0);
            }
        };

        let watermark = self.main.watermark(&provider, group).await?;
        let mut next = (watermark + 1).max(status.low);
        let mut fetched: u64 = 0;

        while next <= status.high {
            if *shutdown.borrow() {
                pool.put(pooled).await;
                return Err(SpoolError::ShuttingDown);
            }
            let chunk_end = (next + FETCH_CHUNK_SIZE as i64 - 1).min(status.high);
            let mut replies = Vec::new();

            for num in next..=chunk_end {
                match self
                    .fetch_article(pool, &mut pooled, group, num, &mut replies)
                    .await
                {
                    Ok(true) => fetched += 1,
                    Ok(false) => {}
                    Err(e) => {
                        pool.put(pooled).await;
                        return Err(e);
                    }
                }
            }

            // Wait for the chunk's insertions before checkpointing; a crash
            // re-fetches at most one chunk and dedup handles the overlap.
            for reply in replies {
                match reply.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        pool.put(pooled).await;
                        return Err(e);
                    }
                    Err(_) => {
                        pool.put(pooled).await;
                        return Err(SpoolError::ShuttingDown);
                    }
                }
            }
            self.main.set_watermark(&provider, group, chunk_end).await?;
            next = chunk_end + 1;
        }

        pool.put(pooled).await;
        Ok(fetched)
    }

    /// Discover, screen, and queue a single article number. Transient
    /// errors retry with exponential backoff on a fresh connection.
    async fn fetch_article(
        &self,
        pool: &Arc<BackendPool>,
        pooled: &mut PooledConn,
        group: &str,
        num: i64,
        replies: &mut Vec<oneshot::Receiver<Result<crate::processor::IngestOutcome>>>,
    ) -> Result<bool> {
        let max_art_size = pool.provider().max_art_size;
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .try_fetch_article(pooled, group, num, max_art_size)
                .await;
            match result {
                Ok(Some(raw)) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    self.ingest_tx
                        .send(IngestJob {
                            raw,
                            group: group.to_string(),
                            reply: Some(reply_tx),
                        })
                        .await
                        .map_err(|_| SpoolError::ShuttingDown)?;
                    replies.push(reply_rx);
                    return Ok(true);
                }
                Ok(None) => return Ok(false),
                Err(e) if e.is_transient() && attempt + 1 < FETCH_RETRY_ATTEMPTS => {
                    attempt += 1;
                    let backoff = (FETCH_RETRY_BASE_SECS << attempt).min(FETCH_RETRY_CAP_SECS);
                    tracing::debug!(
                        group = %group,
                        num,
                        attempt,
                        backoff,
                        error = %e,
                        "transient fetch error, retrying on a fresh connection"
                    );
                    tokio::time::sleep(Duration::from_secs(backoff)).await;

                    // Replace the (likely broken) connection and reselect.
                    let mut fresh = pool
                        .get(Duration::from_secs(POOL_GET_DEADLINE_SECS))
                        .await?;
                    fresh.conn.select_group(group).await?;
                    let old = std::mem::replace(pooled, fresh);
                    drop(old);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One fetch attempt: STAT for the Message-ID, history screen, then
    /// ARTICLE. `Ok(None)` means the number can be skipped.
    async fn try_fetch_article(
        &self,
        pooled: &mut PooledConn,
        group: &str,
        num: i64,
        max_art_size: u64,
    ) -> Result<Option<String>> {
        let Some((_, message_id)) = pooled.conn.stat(ArticleSpec::Number(num)).await? else {
            return Ok(None);
        };
        if message_id.is_empty() {
            return Ok(None);
        }

        if let Lookup::Hit { .. } = self.history.lookup(&message_id).await? {
            return Ok(None);
        }

        let raw = pooled
            .conn
            .article(ArticleSpec::MessageId(message_id.clone()), 0)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        // Oversize articles are skipped outright, never retried.
        if max_art_size > 0 && raw.len() as u64 > max_art_size {
            tracing::debug!(
                group = %group,
                num,
                message_id = %message_id,
                bytes = raw.len(),
                "skipping oversize article"
            );
            return Ok(None);
        }
        Ok(Some(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_transitions() {
        let mut state = HealthState::new();
        assert_eq!(state.health, ProviderHealth::Unknown);

        state.on_success();
        assert_eq!(state.health, ProviderHealth::Healthy);

        for _ in 0..PROVIDER_THROTTLE_AFTER {
            state.on_transient_failure();
        }
        assert_eq!(state.health, ProviderHealth::Throttled);

        state.on_success();
        assert_eq!(state.health, ProviderHealth::Healthy);

        state.on_fatal();
        assert_eq!(state.health, ProviderHealth::Failed);
        assert!(!state.usable());
    }

    #[test]
    fn test_failed_provider_drains_after_ttl() {
        let mut state = HealthState::new();
        state.on_fatal();
        state.failed_at =
            Some(Instant::now() - Duration::from_secs(PROVIDER_FAILED_RESET_SECS + 1));
        assert!(state.usable());
        assert_eq!(state.health, ProviderHealth::Unknown);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut last = 0;
        for attempt in 1..10u32 {
            let backoff = (FETCH_RETRY_BASE_SECS << attempt).min(FETCH_RETRY_CAP_SECS);
            assert!(backoff <= FETCH_RETRY_CAP_SECS);
            assert!(backoff >= last.min(FETCH_RETRY_CAP_SECS));
            last = backoff;
        }
    }
}
