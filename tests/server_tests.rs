//! End-to-end NNTP session tests over real TCP connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};

use spool::bridge::BridgeHub;
use spool::config::{AppConfig, LoggingConfig, ServerConfig};
use spool::history::History;
use spool::nntp::NntpCodec;
use spool::processor::Processor;
use spool::server::{Session, SessionContext};
use spool::spam::AcceptAll;
use spool::store::{GroupStores, MainDb};

struct TestServer {
    ctx: Arc<SessionContext>,
    addr: SocketAddr,
    _dir: TempDir,
}

fn test_config(auth_required: bool) -> AppConfig {
    AppConfig {
        hostname: "news.test.example".to_string(),
        data_dir: "unused".into(),
        short_hash_len: 7,
        server: ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            tls_listen: None,
            tls_cert: None,
            tls_key: None,
            auth_required,
            anonymous_posting: true,
        },
        provider: Vec::new(),
        peer: Vec::new(),
        active_file: None,
        descriptions_file: None,
        logging: LoggingConfig::default(),
    }
}

async fn start_server(auth_required: bool) -> TestServer {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(test_config(auth_required));

    let main = Arc::new(MainDb::open(&dir.path().join("main.db")).await.unwrap());
    main.create_group_if_missing("misc.test", "y").await.unwrap();
    main.create_group_if_missing("comp.lang.rust", "y").await.unwrap();
    main.set_group_description("comp.lang.rust", "The Rust language")
        .await
        .unwrap();

    let stores = GroupStores::new(dir.path().join("groups"));
    let history = Arc::new(History::open(&dir.path().join("history"), 7).await.unwrap());
    let processor = Processor::new(
        config.hostname.clone(),
        main.clone(),
        stores.clone(),
        history.clone(),
        Arc::new(AcceptAll),
        Arc::new(BridgeHub::new()),
        false,
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

    TestServer {
        ctx,
        addr,
        _dir: dir,
    }
}

/// Connect and consume the greeting; returns the client codec.
async fn connect(server: &TestServer) -> NntpCodec<TcpStream> {
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let mut codec = NntpCodec::new(stream, 0);
    let greeting = codec.read_line().await.unwrap();
    assert!(greeting.starts_with("200 ") || greeting.starts_with("201 "));
    codec
}

fn post_article(id: &str, group: &str, subject: &str) -> Vec<String> {
    vec![
        format!("Message-ID: {}", id),
        format!("Newsgroups: {}", group),
        format!("Subject: {}", subject),
        "From: Test User <test@example.com>".to_string(),
        "Date: Mon, 20 Jan 2025 12:00:00 +0000".to_string(),
        "Path: origin!not-for-mail".to_string(),
        "".to_string(),
        "Test body line.".to_string(),
        ".dot-stuffed line survives".to_string(),
    ]
}

async fn post(codec: &mut NntpCodec<TcpStream>, lines: &[String]) -> String {
    codec.write_line("POST").await.unwrap();
    let go = codec.read_line().await.unwrap();
    assert!(go.starts_with("340 "), "{}", go);
    codec.write_multiline(lines).await.unwrap();
    codec.read_line().await.unwrap()
}

// =============================================================================
// Group selection and listing
// =============================================================================

#[tokio::test]
async fn test_group_on_empty_group_reports_low_one_high_zero() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    codec.write_line("GROUP misc.test").await.unwrap();
    assert_eq!(
        codec.read_line().await.unwrap(),
        "211 0 1 0 misc.test"
    );
}

#[tokio::test]
async fn test_group_unknown_gives_411() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    codec.write_line("GROUP no.such.group").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("411 "));
}

#[tokio::test]
async fn test_listgroup_range() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    for i in 1..=5 {
        let reply = post(
            &mut codec,
            &post_article(&format!("<lg{}@test>", i), "misc.test", "s"),
        )
        .await;
        assert!(reply.starts_with("240 "), "{}", reply);
    }

    codec.write_line("LISTGROUP misc.test 2-4").await.unwrap();
    assert_eq!(codec.read_line().await.unwrap(), "211 5 1 5 misc.test");
    let numbers = codec.read_multiline(0).await.unwrap();
    assert_eq!(numbers, vec!["2", "3", "4"]);
}

#[tokio::test]
async fn test_list_active_with_wildmat() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    codec.write_line("LIST ACTIVE comp.*").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("215 "));
    let lines = codec.read_multiline(0).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("comp.lang.rust "));

    codec.write_line("LIST NEWSGROUPS comp.*").await.unwrap();
    codec.read_line().await.unwrap();
    let lines = codec.read_multiline(0).await.unwrap();
    assert_eq!(lines, vec!["comp.lang.rust\tThe Rust language"]);
}

// =============================================================================
// Posting and retrieval
// =============================================================================

#[tokio::test]
async fn test_post_then_article_round_trip() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    let reply = post(
        &mut codec,
        &post_article("<post1@test>", "misc.test", "Round trip"),
    )
    .await;
    assert!(reply.starts_with("240 "), "{}", reply);

    // By Message-ID without a selected group.
    codec.write_line("ARTICLE <post1@test>").await.unwrap();
    let status = codec.read_line().await.unwrap();
    assert!(status.starts_with("220 1 <post1@test>"), "{}", status);
    let lines = codec.read_multiline(0).await.unwrap();
    let text = lines.join("\n");
    assert!(text.contains("Subject: Round trip"));
    assert!(text.contains("Test body line."));
    assert!(text.contains(".dot-stuffed line survives"));
    // Our hop is in the Path.
    assert!(text.contains("Path: news.test.example!origin!not-for-mail"));

    // By number with a selected group.
    codec.write_line("GROUP misc.test").await.unwrap();
    codec.read_line().await.unwrap();
    codec.write_line("STAT 1").await.unwrap();
    assert_eq!(codec.read_line().await.unwrap(), "223 1 <post1@test>");

    codec.write_line("HEAD 1").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("221 "));
    let head = codec.read_multiline(0).await.unwrap();
    assert!(head.iter().any(|l| l == "Subject: Round trip"));

    codec.write_line("BODY 1").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("222 "));
    let body = codec.read_multiline(0).await.unwrap();
    assert_eq!(
        body,
        vec!["Test body line.", ".dot-stuffed line survives"]
    );
}

#[tokio::test]
async fn test_duplicate_post_rejected() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    let article = post_article("<dup@test>", "misc.test", "s");
    assert!(post(&mut codec, &article).await.starts_with("240 "));
    assert!(post(&mut codec, &article).await.starts_with("441 "));
}

#[tokio::test]
async fn test_post_generates_missing_headers() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    let lines = vec![
        "Newsgroups: misc.test".to_string(),
        "Subject: No id".to_string(),
        "From: Test <t@example.com>".to_string(),
        "".to_string(),
        "body".to_string(),
    ];
    assert!(post(&mut codec, &lines).await.starts_with("240 "));

    codec.write_line("GROUP misc.test").await.unwrap();
    codec.read_line().await.unwrap();
    codec.write_line("HEAD 1").await.unwrap();
    codec.read_line().await.unwrap();
    let head = codec.read_multiline(0).await.unwrap().join("\n");
    assert!(head.contains("Message-ID: <"));
    assert!(head.contains("@news.test.example>"));
    assert!(head.contains("Date: "));
}

#[tokio::test]
async fn test_article_without_group_selected() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    codec.write_line("ARTICLE 1").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("412 "));

    codec.write_line("GROUP misc.test").await.unwrap();
    codec.read_line().await.unwrap();
    codec.write_line("ARTICLE 99").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("423 "));

    codec.write_line("ARTICLE <missing@test>").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("430 "));
}

// =============================================================================
// Overview
// =============================================================================

#[tokio::test]
async fn test_over_empty_range_sends_bare_terminator() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    codec.write_line("GROUP misc.test").await.unwrap();
    codec.read_line().await.unwrap();
    codec.write_line("OVER 1-100").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("224 "));
    assert!(codec.read_multiline(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_xover_rows_in_article_order() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    for i in 1..=3 {
        post(
            &mut codec,
            &post_article(&format!("<ov{}@test>", i), "misc.test", &format!("s{}", i)),
        )
        .await;
    }

    codec.write_line("GROUP misc.test").await.unwrap();
    codec.read_line().await.unwrap();
    codec.write_line("XOVER 1-3").await.unwrap();
    codec.read_line().await.unwrap();
    let rows = codec.read_multiline(0).await.unwrap();
    assert_eq!(rows.len(), 3);
    for (i, row) in rows.iter().enumerate() {
        let fields: Vec<&str> = row.split('\t').collect();
        assert_eq!(fields[0], (i + 1).to_string());
        assert_eq!(fields[1], format!("s{}", i + 1));
        assert_eq!(fields[4], format!("<ov{}@test>", i + 1));
    }
}

// =============================================================================
// Peering commands
// =============================================================================

#[tokio::test]
async fn test_check_and_takethis() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    codec.write_line("MODE STREAM").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("203 "));

    codec.write_line("CHECK <peer1@test>").await.unwrap();
    assert_eq!(codec.read_line().await.unwrap(), "238 <peer1@test>");

    codec.write_line("TAKETHIS <peer1@test>").await.unwrap();
    codec
        .write_multiline(&post_article("<peer1@test>", "misc.test", "s"))
        .await
        .unwrap();
    assert_eq!(codec.read_line().await.unwrap(), "239 <peer1@test>");

    // Now present: CHECK refuses, TAKETHIS rejects.
    codec.write_line("CHECK <peer1@test>").await.unwrap();
    assert_eq!(codec.read_line().await.unwrap(), "438 <peer1@test>");

    codec.write_line("TAKETHIS <peer1@test>").await.unwrap();
    codec
        .write_multiline(&post_article("<peer1@test>", "misc.test", "s"))
        .await
        .unwrap();
    assert_eq!(codec.read_line().await.unwrap(), "439 <peer1@test>");
}

#[tokio::test]
async fn test_streaming_takethis_pipelined_responses_in_order() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    // Pipeline 100 TAKETHIS without reading a single response.
    for i in 0..100 {
        let id = format!("<stream{}@test>", i);
        codec
            .write_line_unflushed(&format!("TAKETHIS {}", id))
            .await
            .unwrap();
        codec
            .write_multiline_unflushed(&post_article(&id, "misc.test", "s"))
            .await
            .unwrap();
    }
    codec.flush().await.unwrap();

    // All 100 responses arrive, in send order.
    for i in 0..100 {
        let reply = codec.read_line().await.unwrap();
        assert_eq!(reply, format!("239 <stream{}@test>", i));
    }

    let db = server.ctx.stores.get("misc.test").await.unwrap();
    let (low, high, count) = db.listing_range().await.unwrap();
    assert_eq!((low, high, count), (1, 100, 100));
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_auth_required_gates_reader_commands() {
    let server = start_server(true).await;
    server
        .ctx
        .main
        .create_user("reader", "secret", true)
        .await
        .unwrap();
    let mut codec = connect(&server).await;

    codec.write_line("GROUP misc.test").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("480 "));

    codec.write_line("AUTHINFO USER reader").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("381 "));
    codec.write_line("AUTHINFO PASS wrong").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("481 "));

    codec.write_line("AUTHINFO USER reader").await.unwrap();
    codec.read_line().await.unwrap();
    codec.write_line("AUTHINFO PASS secret").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("281 "));

    codec.write_line("GROUP misc.test").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("211 "));
}

// =============================================================================
// Session basics
// =============================================================================

#[tokio::test]
async fn test_unknown_command_and_quit() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    codec.write_line("FROBNICATE").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("500 "));

    codec.write_line("DATE").await.unwrap();
    let date = codec.read_line().await.unwrap();
    assert!(date.starts_with("111 "));
    assert_eq!(date.len(), "111 ".len() + 14);

    codec.write_line("QUIT").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("205 "));
}

#[tokio::test]
async fn test_capabilities_listed() {
    let server = start_server(false).await;
    let mut codec = connect(&server).await;

    codec.write_line("CAPABILITIES").await.unwrap();
    assert!(codec.read_line().await.unwrap().starts_with("101 "));
    let caps = codec.read_multiline(0).await.unwrap();
    assert!(caps.iter().any(|c| c == "VERSION 2"));
    assert!(caps.iter().any(|c| c == "READER"));
    assert!(caps.iter().any(|c| c == "STREAMING"));
}
