//! Article processor: the single write path into the system.
//!
//! Every article, whether fetched, posted, or taken from a peer, enters
//! through [`Processor::ingest`]. The history index is the dedup arbiter:
//! its atomic add decides the winner under contention before the per-group
//! insert happens, so two racing ingests of one Message-ID store exactly
//! one article and the loser reports a duplicate.

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::article::Article;
use crate::bridge::{BridgeEvent, BridgeHub};
use crate::config::INGEST_QUEUE_CAPACITY;
use crate::error::{Result, SpoolError};
use crate::history::{Added, History, Lookup};
use crate::spam::SpamFilter;
use crate::store::{GroupStores, MainDb};

/// Outcome of one ingestion attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Stored { article_num: i64 },
    DuplicateMessageId,
    InvalidGroup,
    Malformed(String),
    /// Spam rejection: success-shaped at the protocol boundary.
    Rejected,
}

/// A queued ingestion job from the fetcher.
pub struct IngestJob {
    pub raw: String,
    pub group: String,
    /// Present when the producer wants the outcome back.
    pub reply: Option<oneshot::Sender<Result<IngestOutcome>>>,
}

pub struct Processor {
    hostname: String,
    main: Arc<MainDb>,
    stores: Arc<GroupStores>,
    history: Arc<History>,
    spam: Arc<dyn SpamFilter>,
    bridges: Arc<BridgeHub>,
    /// Enqueue accepted articles for peering.
    queue_for_peers: bool,
}

impl Processor {
    pub fn new(
        hostname: String,
        main: Arc<MainDb>,
        stores: Arc<GroupStores>,
        history: Arc<History>,
        spam: Arc<dyn SpamFilter>,
        bridges: Arc<BridgeHub>,
        queue_for_peers: bool,
    ) -> Arc<Processor> {
        Arc::new(Processor {
            hostname,
            main,
            stores,
            history,
            spam,
            bridges,
            queue_for_peers,
        })
    }

    pub fn history(&self) -> &Arc<History> {
        &self.history
    }

    /// Ingest a raw article into a group.
    pub async fn ingest(&self, raw: &str, group_name: &str) -> Result<IngestOutcome> {
        let mut article = match Article::parse(raw) {
            Ok(article) => article,
            Err(SpoolError::Malformed(reason)) => {
                tracing::debug!(group = %group_name, %reason, "rejecting malformed article");
                return Ok(IngestOutcome::Malformed(reason));
            }
            Err(e) => return Err(e),
        };

        let Some(group) = self.main.get_group(group_name).await? else {
            return Ok(IngestOutcome::InvalidGroup);
        };
        if !group.active {
            return Ok(IngestOutcome::InvalidGroup);
        }
        if group.max_art_size > 0 && article.bytes > group.max_art_size {
            return Ok(IngestOutcome::Malformed(format!(
                "article of {} bytes exceeds group limit {}",
                article.bytes, group.max_art_size
            )));
        }

        // Fast duplicate probe before running the filter.
        if let Lookup::Hit { .. } = self.history.lookup(&article.message_id).await? {
            return Ok(IngestOutcome::DuplicateMessageId);
        }

        if self
            .spam
            .should_reject(&article.headers_blob, &article.body_text, group_name)
            .await
        {
            tracing::info!(
                message_id = %article.message_id,
                group = %group_name,
                "article rejected by spam filter"
            );
            return Ok(IngestOutcome::Rejected);
        }

        // The atomic add is the dedup arbiter under contention.
        match self
            .history
            .add(&article.message_id, group_name, article.date_sent)
            .await?
        {
            Added::AlreadyExists => return Ok(IngestOutcome::DuplicateMessageId),
            Added::Added { .. } => {}
        }

        // Record our hop in the Path unless we are already the head.
        if article.path.split('!').next() != Some(self.hostname.as_str()) {
            article.path = format!("{}!{}", self.hostname, article.path);
        }

        let db = self.stores.get(group_name).await?;
        let article_num = db.insert_article(&article).await?;
        article.article_num = article_num;

        let (low, high, count) = db.listing_range().await?;
        self.main
            .update_group_counters(group_name, low, high, count, Some(article_num))
            .await?;

        if self.queue_for_peers {
            self.main
                .enqueue_post(&article.message_id, group_name)
                .await?;
        }

        if !self.bridges.is_empty() {
            self.bridges.notify(BridgeEvent {
                article: Arc::new(article.clone()),
                group: group_name.to_string(),
            });
        }

        tracing::debug!(
            message_id = %article.message_id,
            group = %group_name,
            article_num,
            "article stored"
        );
        Ok(IngestOutcome::Stored { article_num })
    }

    /// Spawn the bounded ingest queue and its workers. Producers block on
    /// send when the queue is full; that is the fetcher's backpressure.
    pub fn spawn_ingest_workers(
        self: Arc<Self>,
        workers: usize,
    ) -> (Sender<IngestJob>, Vec<JoinHandle<()>>) {
        let (tx, rx) = async_channel::bounded::<IngestJob>(INGEST_QUEUE_CAPACITY);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let processor = Arc::clone(&self);
            let rx: Receiver<IngestJob> = rx.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(job) = rx.recv().await {
                    let result = processor.ingest(&job.raw, &job.group).await;
                    if let Err(e) = &result {
                        tracing::error!(
                            worker = id,
                            group = %job.group,
                            error = %e,
                            "ingestion failed"
                        );
                    }
                    if let Some(reply) = job.reply {
                        let _ = reply.send(result);
                    }
                }
                tracing::debug!(worker = id, "ingest worker draining complete");
            }));
        }
        (tx, handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spam::AcceptAll;
    use tempfile::TempDir;

    struct RejectSubject(&'static str);

    #[async_trait::async_trait]
    impl SpamFilter for RejectSubject {
        async fn should_reject(&self, headers: &str, _body: &str, _group: &str) -> bool {
            headers.contains(self.0)
        }
    }

    async fn build(dir: &TempDir, spam: Arc<dyn SpamFilter>) -> Arc<Processor> {
        let main = Arc::new(MainDb::open(&dir.path().join("main.db")).await.unwrap());
        main.create_group_if_missing("misc.test", "y").await.unwrap();
        let stores = GroupStores::new(dir.path().join("groups"));
        let history = Arc::new(
            History::open(&dir.path().join("history"), 7).await.unwrap(),
        );
        Processor::new(
            "news.example.org".to_string(),
            main,
            stores,
            history,
            spam,
            Arc::new(BridgeHub::new()),
            false,
        )
    }

    fn raw_article(id: &str) -> String {
        format!(
            "Message-ID: {}\r\nSubject: S\r\nFrom: u@example.com\r\n\
             Date: Mon, 20 Jan 2025 12:00:00 +0000\r\nPath: origin!not-for-mail\r\n\r\nbody\r\n",
            id
        )
    }

    #[tokio::test]
    async fn test_ingest_then_retrieve_round_trip() {
        let dir = TempDir::new().unwrap();
        let processor = build(&dir, Arc::new(AcceptAll)).await;

        let outcome = processor
            .ingest(&raw_article("<rt@test>"), "misc.test")
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Stored { article_num: 1 });

        let db = processor.stores.get("misc.test").await.unwrap();
        let stored = db.get_by_message_id("<rt@test>").await.unwrap().unwrap();
        assert_eq!(stored.body_text, "body\n");
        // Our hop was recorded in Path.
        assert_eq!(stored.path, "news.example.org!origin!not-for-mail");
    }

    #[tokio::test]
    async fn test_second_ingest_is_duplicate() {
        let dir = TempDir::new().unwrap();
        let processor = build(&dir, Arc::new(AcceptAll)).await;

        processor
            .ingest(&raw_article("<dup@test>"), "misc.test")
            .await
            .unwrap();
        let outcome = processor
            .ingest(&raw_article("<dup@test>"), "misc.test")
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::DuplicateMessageId);

        let db = processor.stores.get("misc.test").await.unwrap();
        assert_eq!(db.listing_range().await.unwrap(), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_concurrent_ingest_single_store() {
        let dir = TempDir::new().unwrap();
        let processor = build(&dir, Arc::new(AcceptAll)).await;
        let main = processor.main.clone();
        main.create_group_if_missing("misc.other", "y").await.unwrap();

        let raw = raw_article("<race@test>");
        let p1 = processor.clone();
        let p2 = processor.clone();
        let raw2 = raw.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { p1.ingest(&raw, "misc.test").await.unwrap() }),
            tokio::spawn(async move { p2.ingest(&raw2, "misc.other").await.unwrap() }),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let stored = outcomes
            .iter()
            .filter(|o| matches!(o, IngestOutcome::Stored { .. }))
            .count();
        let duplicate = outcomes
            .iter()
            .filter(|o| **o == IngestOutcome::DuplicateMessageId)
            .count();
        assert_eq!((stored, duplicate), (1, 1));
    }

    #[tokio::test]
    async fn test_unknown_group_rejected() {
        let dir = TempDir::new().unwrap();
        let processor = build(&dir, Arc::new(AcceptAll)).await;
        let outcome = processor
            .ingest(&raw_article("<g@test>"), "no.such.group")
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::InvalidGroup);
    }

    #[tokio::test]
    async fn test_malformed_article_reported() {
        let dir = TempDir::new().unwrap();
        let processor = build(&dir, Arc::new(AcceptAll)).await;
        let outcome = processor
            .ingest("Subject: no message id\r\n\r\nbody\r\n", "misc.test")
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Malformed(_)));
    }

    #[tokio::test]
    async fn test_spam_rejection_stores_nothing() {
        let dir = TempDir::new().unwrap();
        let processor = build(&dir, Arc::new(RejectSubject("<spam@test>"))).await;

        let outcome = processor
            .ingest(&raw_article("<spam@test>"), "misc.test")
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Rejected);

        // Rejected articles are absent from both history and the store.
        assert_eq!(
            processor.history.lookup("<spam@test>").await.unwrap(),
            Lookup::Miss
        );
        let db = processor.stores.get("misc.test").await.unwrap();
        assert_eq!(db.listing_range().await.unwrap(), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_counters_written_back_to_registry() {
        let dir = TempDir::new().unwrap();
        let processor = build(&dir, Arc::new(AcceptAll)).await;

        processor
            .ingest(&raw_article("<c1@test>"), "misc.test")
            .await
            .unwrap();
        processor
            .ingest(&raw_article("<c2@test>"), "misc.test")
            .await
            .unwrap();

        let group = processor.main.get_group("misc.test").await.unwrap().unwrap();
        assert_eq!(group.low_water, 1);
        assert_eq!(group.high_water, 2);
        assert_eq!(group.message_count, 2);
    }
}
