//! End-to-end fetcher and transfer tests: two server instances on
//! localhost, one acting as the upstream/peer of the other.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

use spool::bridge::BridgeHub;
use spool::config::{AppConfig, LoggingConfig, PeerConfig, ProviderConfig, ServerConfig};
use spool::fetch::Fetcher;
use spool::history::History;
use spool::nntp::BackendPool;
use spool::processor::{IngestOutcome, Processor};
use spool::server::{Session, SessionContext};
use spool::spam::AcceptAll;
use spool::store::{GroupStores, MainDb};
use spool::transfer::{Transfer, TransferMode};

/// One running node: stores, processor, and a listening NNTP session
/// acceptor.
struct Node {
    ctx: Arc<SessionContext>,
    addr: SocketAddr,
    _dir: TempDir,
}

async fn start_node(queue_for_peers: bool) -> Node {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(AppConfig {
        hostname: "node.test.example".to_string(),
        data_dir: "unused".into(),
        short_hash_len: 7,
        server: ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            tls_listen: None,
            tls_cert: None,
            tls_key: None,
            auth_required: false,
            anonymous_posting: true,
        },
        provider: Vec::new(),
        peer: Vec::new(),
        active_file: None,
        descriptions_file: None,
        logging: LoggingConfig::default(),
    });

    let main = Arc::new(MainDb::open(&dir.path().join("main.db")).await.unwrap());
    main.create_group_if_missing("misc.test", "y").await.unwrap();
    let stores = GroupStores::new(dir.path().join("groups"));
    let history = Arc::new(History::open(&dir.path().join("history"), 7).await.unwrap());
    let processor = Processor::new(
        config.hostname.clone(),
        main.clone(),
        stores.clone(),
        history.clone(),
        Arc::new(AcceptAll),
        Arc::new(BridgeHub::new()),
        queue_for_peers,
    );

    let ctx = Arc::new(SessionContext {
        config,
        main,
        stores,
        history,
        processor,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            let ctx = accept_ctx.clone();
            tokio::spawn(async move {
                Session::new(stream, ctx, peer.to_string()).run().await;
            });
        }
    });

    Node {
        ctx,
        addr,
        _dir: dir,
    }
}

fn raw_article(id: &str) -> String {
    format!(
        "Message-ID: {}\r\nNewsgroups: misc.test\r\nSubject: S {}\r\n\
         From: u@example.com\r\nDate: Mon, 20 Jan 2025 12:00:00 +0000\r\n\
         Path: origin!not-for-mail\r\n\r\nbody of {}\r\n",
        id, id, id
    )
}

async fn ingest(node: &Node, id: &str) {
    let outcome = node
        .ctx
        .processor
        .ingest(&raw_article(id), "misc.test")
        .await
        .unwrap();
    assert!(
        matches!(outcome, IngestOutcome::Stored { .. }),
        "{}: {:?}",
        id,
        outcome
    );
}

fn provider_for(addr: SocketAddr, max_conns: usize) -> ProviderConfig {
    ProviderConfig {
        name: "upstream".to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        ssl: false,
        username: None,
        password: None,
        max_conns,
        priority: 0,
        max_art_size: 0,
        posting: false,
        enabled: Some(true),
        proxy: None,
    }
}

// =============================================================================
// Fetcher
// =============================================================================

#[tokio::test]
async fn test_fetcher_pulls_missing_articles_and_resumes() {
    let upstream = start_node(false).await;
    for i in 1..=7 {
        ingest(&upstream, &format!("<up{}@test>", i)).await;
    }

    let local = start_node(false).await;
    let (ingest_tx, ingest_handles) = local.ctx.processor.clone().spawn_ingest_workers(2);

    let pool = BackendPool::new(
        provider_for(upstream.addr, 2),
        Duration::from_secs(5),
        Duration::from_secs(10),
    );
    let fetcher = Fetcher::new(
        local.ctx.main.clone(),
        local.ctx.history.clone(),
        ingest_tx.clone(),
        vec![pool.clone()],
    );

    let (_tx, shutdown) = watch::channel(false);
    fetcher.clone().run_once(shutdown.clone()).await.unwrap();

    let db = local.ctx.stores.get("misc.test").await.unwrap();
    let (low, high, count) = db.listing_range().await.unwrap();
    assert_eq!((low, high, count), (1, 7, 7));
    assert_eq!(
        local.ctx.main.watermark("upstream", "misc.test").await.unwrap(),
        7
    );

    // Everything made it across with the right content.
    let one = db.get_by_message_id("<up3@test>").await.unwrap().unwrap();
    assert!(one.body_text.contains("body of <up3@test>"));

    // A second pass finds nothing new and duplicates nothing.
    fetcher.clone().run_once(shutdown.clone()).await.unwrap();
    assert_eq!(db.listing_range().await.unwrap().2, 7);

    // New upstream articles are picked up from the watermark.
    ingest(&upstream, "<up8@test>").await;
    fetcher.clone().run_once(shutdown).await.unwrap();
    assert_eq!(db.listing_range().await.unwrap().2, 8);

    drop(ingest_tx);
    drop(fetcher);
    for handle in ingest_handles {
        let _ = handle.await;
    }
    pool.close_all().await;
}

// =============================================================================
// Adaptive transfer
// =============================================================================

#[tokio::test]
async fn test_adaptive_transfer_switches_to_check_first() {
    let peer = start_node(false).await;
    let local = start_node(true).await;

    // Ten ids the peer already holds, offered as positions 10-19, and five
    // more spread through the tail.
    let early_dups: Vec<usize> = (10..20).collect();
    let late_dups = [25usize, 30, 35, 40, 45];
    for idx in early_dups.iter().chain(late_dups.iter()) {
        ingest(&peer, &format!("<x{}@test>", idx)).await;
    }

    // Local node stores all fifty; each ingest queues the article for
    // peering in order.
    for idx in 0..50 {
        ingest(&local, &format!("<x{}@test>", idx)).await;
    }
    assert_eq!(
        local.ctx.main.pending_posts(200).await.unwrap().len(),
        50
    );

    let transfer = Transfer::new(
        local.ctx.main.clone(),
        local.ctx.stores.clone(),
        vec![PeerConfig {
            name: "peer1".to_string(),
            host: peer.addr.ip().to_string(),
            port: peer.addr.port(),
            ssl: false,
            username: None,
            password: None,
            groups: "*".to_string(),
        }],
        Duration::from_secs(5),
        Duration::from_secs(10),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(transfer.clone().run(shutdown_rx));

    // Wait for the queue to drain.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if local.ctx.main.pending_posts(1).await.unwrap().is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    // The peer ended up with every article exactly once.
    let db = peer.ctx.stores.get("misc.test").await.unwrap();
    assert_eq!(db.listing_range().await.unwrap().2, 50);

    // Ten rejects in the first twenty TAKETHIS forced CHECK-first mode;
    // the five CHECK-refused ids in the tail never got a TAKETHIS, so the
    // session saw 45 TAKETHIS with 35 accepted.
    let (stats, mode) = transfer.peer_stats("peer1").await.unwrap();
    assert_eq!(mode, TransferMode::CheckFirst);
    assert_eq!(stats.total, 45);
    assert_eq!(stats.success, 35);
}
