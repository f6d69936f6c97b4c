//! Transfer queue: offers locally accepted articles to peers.
//!
//! One session per peer. The session starts in TAKETHIS-direct mode,
//! pipelining TAKETHIS commands and reading responses in send order. The
//! running success rate drives adaptive switching: a poor rate falls back
//! to CHECK-first (offer ids, transfer only what the peer wants), and a
//! recovered rate switches back to direct mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::{
    PeerConfig, ProviderConfig, XFER_CHECK_BATCH_MAX, XFER_CHECK_BATCH_SIZE,
    XFER_DEFER_MAX_ATTEMPTS, XFER_DIRECT_ABOVE, XFER_DIRECT_MIN_TOTAL, XFER_DIRECT_WINDOW,
    XFER_CHECK_FIRST_BELOW, XFER_QUEUE_POLL_SECS, XFER_RATE_MIN_TOTAL, POOL_GET_DEADLINE_SECS,
};
use crate::error::{Result, SpoolError};
use crate::nntp::{BackendPool, CheckStatus, Conn};
use crate::store::{GroupStores, MainDb, PostQueueEntry};
use crate::wildmat::Wildmat;

/// How articles are being offered to a peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferMode {
    TakeThisDirect,
    CheckFirst,
}

/// Per-article offer state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OfferState {
    Pending,
    Accepted,
    Rejected,
    Deferred,
}

/// Running TAKETHIS counters for one peer session.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {
    pub total: u64,
    pub success: u64,
}

impl TransferStats {
    pub fn record(&mut self, accepted: bool) {
        self.total += 1;
        if accepted {
            self.success += 1;
        }
    }

    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.success as f64 / self.total as f64
    }

    /// Adaptive mode transition rules.
    pub fn next_mode(&self, mode: TransferMode) -> TransferMode {
        match mode {
            TransferMode::TakeThisDirect
                if self.total >= XFER_RATE_MIN_TOTAL && self.rate() < XFER_CHECK_FIRST_BELOW =>
            {
                TransferMode::CheckFirst
            }
            TransferMode::CheckFirst
                if self.total >= XFER_DIRECT_MIN_TOTAL && self.rate() >= XFER_DIRECT_ABOVE =>
            {
                TransferMode::TakeThisDirect
            }
            _ => mode,
        }
    }
}

/// An article staged for one peer.
struct OfferItem {
    entry: PostQueueEntry,
    wire: String,
    state: OfferState,
    attempts: u32,
}

pub struct Transfer {
    main: Arc<MainDb>,
    stores: Arc<GroupStores>,
    peers: Vec<PeerTarget>,
    sessions: tokio::sync::Mutex<HashMap<String, PeerSession>>,
}

struct PeerTarget {
    peer: PeerConfig,
    pool: Arc<BackendPool>,
    filter: Wildmat,
}

/// A peer is dialed through the same pool machinery as a provider.
fn peer_as_provider(peer: &PeerConfig) -> ProviderConfig {
    ProviderConfig {
        name: peer.name.clone(),
        host: peer.host.clone(),
        port: peer.port,
        ssl: peer.ssl,
        username: peer.username.clone(),
        password: peer.password.clone(),
        max_conns: 1,
        priority: 0,
        max_art_size: 0,
        posting: true,
        enabled: Some(true),
        proxy: None,
    }
}

impl Transfer {
    pub fn new(
        main: Arc<MainDb>,
        stores: Arc<GroupStores>,
        peers: Vec<PeerConfig>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Arc<Transfer> {
        let peers = peers
            .into_iter()
            .map(|peer| {
                let pool =
                    BackendPool::new(peer_as_provider(&peer), connect_timeout, read_timeout);
                let filter = Wildmat::parse(&peer.groups);
                PeerTarget { peer, pool, filter }
            })
            .collect();
        Arc::new(Transfer {
            main,
            stores,
            peers,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    /// Running TAKETHIS counters and mode for one peer session.
    pub async fn peer_stats(&self, peer: &str) -> Option<(TransferStats, TransferMode)> {
        self.sessions
            .lock()
            .await
            .get(peer)
            .map(|s| (s.stats, s.mode))
    }

    /// Run the queue until shutdown: drain pending entries, offer them to
    /// every matching peer, then mark them posted.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = match self.main.pending_posts(XFER_CHECK_BATCH_MAX as i64).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "cannot read post queue");
                    Vec::new()
                }
            };
            if batch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(XFER_QUEUE_POLL_SECS)) => continue,
                    _ = shutdown.changed() => continue,
                }
            }

            let mut all_ok = true;
            for target in &self.peers {
                let mut sessions = self.sessions.lock().await;
                let session = sessions
                    .entry(target.peer.name.clone())
                    .or_insert_with(PeerSession::new);
                if let Err(e) = self.offer_to_peer(target, session, &batch).await {
                    all_ok = false;
                    tracing::warn!(
                        peer = %target.peer.name,
                        error = %e,
                        "transfer pass failed, will retry"
                    );
                }
            }

            // A failed pass leaves the batch pending; the re-offer is
            // harmless because peers dedup by Message-ID.
            if all_ok {
                for entry in &batch {
                    if let Err(e) = self.main.mark_posted(entry.id).await {
                        tracing::error!(error = %e, "cannot mark post queue entry");
                    }
                }
            } else {
                tokio::time::sleep(Duration::from_secs(XFER_QUEUE_POLL_SECS)).await;
            }
        }

        for target in &self.peers {
            target.pool.close_all().await;
        }
    }

    /// Offer one batch to one peer through its session.
    async fn offer_to_peer(
        &self,
        target: &PeerTarget,
        session: &mut PeerSession,
        batch: &[PostQueueEntry],
    ) -> Result<()> {
        let mut items = Vec::new();
        for entry in batch {
            if !target.filter.matches(&entry.newsgroup) {
                continue;
            }
            let db = self.stores.get(&entry.newsgroup).await?;
            let Some(article) = db.get_by_message_id(&entry.message_id).await? else {
                // Expired before peering; nothing to offer.
                continue;
            };
            items.push(OfferItem {
                entry: entry.clone(),
                wire: article.wire_format(),
                state: OfferState::Pending,
                attempts: 0,
            });
        }
        if items.is_empty() {
            return Ok(());
        }

        let mut pooled = target
            .pool
            .get(Duration::from_secs(POOL_GET_DEADLINE_SECS))
            .await?;
        // The checkout may be a fresh connection; streaming mode is
        // negotiated per connection and repeating it is harmless.
        pooled.conn.mode_stream().await?;

        let result = session.offer(&mut pooled.conn, &mut items).await;
        target.pool.put(pooled).await;

        let accepted = items
            .iter()
            .filter(|i| i.state == OfferState::Accepted)
            .count();
        tracing::info!(
            peer = %target.peer.name,
            offered = items.len(),
            accepted,
            rate = session.stats.rate(),
            mode = ?session.mode,
            "transfer batch complete"
        );
        result
    }
}

/// Per-peer adaptive state that survives across batches.
pub struct PeerSession {
    pub stats: TransferStats,
    pub mode: TransferMode,
}

impl Default for PeerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSession {
    pub fn new() -> PeerSession {
        PeerSession {
            stats: TransferStats::default(),
            mode: TransferMode::TakeThisDirect,
        }
    }

    /// Offer items until each is Accepted or Rejected; Deferred items
    /// retry up to the attempt cap.
    async fn offer(&mut self, conn: &mut Conn, items: &mut [OfferItem]) -> Result<()> {
        loop {
            let open: Vec<usize> = items
                .iter()
                .enumerate()
                .filter(|(_, item)| {
                    item.state == OfferState::Pending || item.state == OfferState::Deferred
                })
                .map(|(idx, _)| idx)
                .collect();
            if open.is_empty() {
                return Ok(());
            }
            match self.mode {
                TransferMode::TakeThisDirect => self.offer_direct(conn, items, &open).await?,
                TransferMode::CheckFirst => self.offer_check_first(conn, items, &open).await?,
            }
        }
    }

    /// Pipeline TAKETHIS in windows, reading responses in send order and
    /// re-evaluating the mode at window boundaries.
    async fn offer_direct(
        &mut self,
        conn: &mut Conn,
        items: &mut [OfferItem],
        open: &[usize],
    ) -> Result<()> {
        for window in open.chunks(XFER_DIRECT_WINDOW) {
            let mut sent = Vec::with_capacity(window.len());
            for &idx in window {
                let cmd_id = conn
                    .send_takethis_streaming(&items[idx].entry.message_id, &items[idx].wire)
                    .await?;
                sent.push((idx, cmd_id));
            }
            for (idx, cmd_id) in sent {
                let outcome = conn.read_takethis_response_streaming(cmd_id).await?;
                self.stats.record(outcome.accepted);
                items[idx].state = if outcome.accepted {
                    OfferState::Accepted
                } else {
                    OfferState::Rejected
                };
            }
            let next = self.stats.next_mode(self.mode);
            if next != self.mode {
                tracing::info!(
                    rate = self.stats.rate(),
                    total = self.stats.total,
                    "switching to CHECK-first mode"
                );
                self.mode = next;
                return Ok(());
            }
        }
        Ok(())
    }

    /// CHECK batches first; TAKETHIS only what the peer wants.
    async fn offer_check_first(
        &mut self,
        conn: &mut Conn,
        items: &mut [OfferItem],
        open: &[usize],
    ) -> Result<()> {
        for batch in open.chunks(XFER_CHECK_BATCH_SIZE.clamp(1, XFER_CHECK_BATCH_MAX)) {
            let ids: Vec<String> = batch
                .iter()
                .map(|&idx| items[idx].entry.message_id.clone())
                .collect();
            let verdicts = conn.check(&ids).await?;
            if verdicts.len() != batch.len() {
                return Err(SpoolError::Nntp(
                    "CHECK response count mismatch".into(),
                ));
            }

            for (&idx, (_, status)) in batch.iter().zip(&verdicts) {
                match status {
                    CheckStatus::Wanted => {
                        let outcome = conn
                            .take_this(&items[idx].entry.message_id, &items[idx].wire)
                            .await?;
                        self.stats.record(outcome.accepted);
                        items[idx].state = if outcome.accepted {
                            OfferState::Accepted
                        } else {
                            OfferState::Rejected
                        };
                    }
                    CheckStatus::Unwanted => {
                        items[idx].state = OfferState::Rejected;
                    }
                    CheckStatus::Deferred => {
                        items[idx].attempts += 1;
                        items[idx].state = if items[idx].attempts >= XFER_DEFER_MAX_ATTEMPTS {
                            OfferState::Rejected
                        } else {
                            OfferState::Deferred
                        };
                    }
                }
            }
            let next = self.stats.next_mode(self.mode);
            if next != self.mode {
                tracing::info!(
                    rate = self.stats.rate(),
                    total = self.stats.total,
                    "switching back to TAKETHIS-direct mode"
                );
                self.mode = next;
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total: u64, success: u64) -> TransferStats {
        TransferStats { total, success }
    }

    // =============================================================================
    // Adaptive mode tests
    // =============================================================================

    #[test]
    fn test_direct_mode_holds_below_threshold_total() {
        // Too few offers to judge: stay direct even with failures.
        let s = stats(9, 0);
        assert_eq!(
            s.next_mode(TransferMode::TakeThisDirect),
            TransferMode::TakeThisDirect
        );
    }

    #[test]
    fn test_direct_switches_to_check_first_on_poor_rate() {
        let s = stats(20, 10);
        assert_eq!(
            s.next_mode(TransferMode::TakeThisDirect),
            TransferMode::CheckFirst
        );
    }

    #[test]
    fn test_direct_stays_on_good_rate() {
        let s = stats(100, 96);
        assert_eq!(
            s.next_mode(TransferMode::TakeThisDirect),
            TransferMode::TakeThisDirect
        );
    }

    #[test]
    fn test_check_first_switches_back_on_recovery() {
        let s = stats(100, 98);
        assert_eq!(
            s.next_mode(TransferMode::CheckFirst),
            TransferMode::TakeThisDirect
        );
        // But not before 20 offers.
        let s = stats(19, 19);
        assert_eq!(s.next_mode(TransferMode::CheckFirst), TransferMode::CheckFirst);
    }

    #[test]
    fn test_rate_of_empty_stats_is_full() {
        assert_eq!(stats(0, 0).rate(), 1.0);
    }

    // =============================================================================
    // Session bookkeeping tests
    // =============================================================================

    #[tokio::test]
    async fn test_peer_stats_reports_session_counters() {
        let dir = tempfile::TempDir::new().unwrap();
        let main = Arc::new(
            crate::store::MainDb::open(&dir.path().join("main.db"))
                .await
                .unwrap(),
        );
        let stores = crate::store::GroupStores::new(dir.path().join("groups"));
        let transfer = Transfer::new(
            main,
            stores,
            Vec::new(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        // No session yet for an unknown peer.
        assert!(transfer.peer_stats("peer1").await.is_none());

        // Counters and mode surface once a session exists.
        {
            let mut sessions = transfer.sessions.lock().await;
            let session = sessions
                .entry("peer1".to_string())
                .or_insert_with(PeerSession::new);
            session.stats = stats(20, 10);
            session.mode = session.stats.next_mode(session.mode);
        }
        let (reported, mode) = transfer.peer_stats("peer1").await.unwrap();
        assert_eq!(mode, TransferMode::CheckFirst);
        assert_eq!(reported.total, 20);
        assert_eq!(reported.success, 10);
    }
}
