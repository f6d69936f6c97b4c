//! One reader or peer session.
//!
//! Sessions move `Greeting -> {Authenticated | Anonymous} -> GroupSelected?
//! -> {reading | posting}`. Illegal transitions answer with 480/412/420
//! class codes and never change state. Within a session, responses are
//! written strictly in command order.

use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::article::{header_value, valid_message_id, Article};
use crate::config::{AppConfig, SERVER_MAX_ARTICLE_BYTES, SERVER_MAX_LINE_BYTES, SERVER_READ_TIMEOUT_SECS};
use crate::error::{Result, SpoolError};
use crate::history::{History, Lookup};
use crate::nntp::NntpCodec;
use crate::processor::{IngestOutcome, Processor};
use crate::store::{GroupStores, MainDb, User};
use crate::wildmat::Wildmat;

/// Dependencies shared by every session.
pub struct SessionContext {
    pub config: Arc<AppConfig>,
    pub main: Arc<MainDb>,
    pub stores: Arc<GroupStores>,
    pub history: Arc<History>,
    pub processor: Arc<Processor>,
}

pub struct Session<S> {
    codec: NntpCodec<S>,
    ctx: Arc<SessionContext>,
    session_id: Uuid,
    remote: String,
    user: Option<User>,
    pending_user: Option<String>,
    current_group: Option<String>,
    current_article: Option<i64>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(stream: S, ctx: Arc<SessionContext>, remote: String) -> Session<S> {
        Session {
            codec: NntpCodec::new(stream, SERVER_MAX_LINE_BYTES),
            ctx,
            session_id: Uuid::new_v4(),
            remote,
            user: None,
            pending_user: None,
            current_group: None,
            current_article: None,
        }
    }

    fn can_post(&self) -> bool {
        match &self.user {
            Some(user) => user.posting,
            None => self.ctx.config.server.anonymous_posting,
        }
    }

    fn auth_ok(&self) -> bool {
        self.user.is_some() || !self.ctx.config.server.auth_required
    }

    /// Run the session to completion. Errors terminate the connection; the
    /// peer is gone or misbehaving.
    pub async fn run(mut self) {
        tracing::info!(
            session = %self.session_id,
            remote = %self.remote,
            "session opened"
        );

        let greeting = if self.can_post() { 200 } else { 201 };
        let hostname = self.ctx.config.hostname.clone();
        if self
            .codec
            .write_line(&format!("{} {} ready", greeting, hostname))
            .await
            .is_err()
        {
            return;
        }

        loop {
            let line = match timeout(
                Duration::from_secs(SERVER_READ_TIMEOUT_SECS),
                self.codec.read_line(),
            )
            .await
            {
                Ok(Ok(line)) => line,
                Ok(Err(_)) | Err(_) => break,
            };

            match self.dispatch(&line).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::debug!(session = %self.session_id, error = %e, "session error");
                    break;
                }
            }
        }
        tracing::info!(session = %self.session_id, "session closed");
    }

    /// Handle one command line; `Ok(false)` ends the session.
    async fn dispatch(&mut self, line: &str) -> Result<bool> {
        let mut parts = line.splitn(2, ' ');
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        let args = parts.next().unwrap_or("").trim();

        // AUTHINFO USER must be followed by AUTHINFO PASS.
        if self.pending_user.is_some() && verb != "AUTHINFO" {
            self.pending_user = None;
        }

        match verb.as_str() {
            "" => self.codec.write_line("500 command not recognized").await?,
            "QUIT" => {
                self.codec.write_line("205 closing connection").await?;
                return Ok(false);
            }
            "CAPABILITIES" => self.cmd_capabilities().await?,
            "MODE" => self.cmd_mode(args).await?,
            "AUTHINFO" => self.cmd_authinfo(args).await?,
            "DATE" => {
                let stamp = Utc::now().format("%Y%m%d%H%M%S");
                self.codec.write_line(&format!("111 {}", stamp)).await?;
            }
            "HELP" => {
                self.codec.write_line("100 help text follows").await?;
                let lines: Vec<String> = [
                    "ARTICLE BODY CAPABILITIES CHECK DATE GROUP HEAD HELP",
                    "LIST LISTGROUP MODE OVER POST QUIT STAT TAKETHIS XOVER",
                ]
                .iter()
                .map(|l| l.to_string())
                .collect();
                self.codec.write_multiline(&lines).await?;
            }
            _ if !self.auth_ok() => {
                self.codec.write_line("480 authentication required").await?
            }
            "GROUP" => self.cmd_group(args).await?,
            "LISTGROUP" => self.cmd_listgroup(args).await?,
            "LIST" => self.cmd_list(args).await?,
            "ARTICLE" => self.cmd_article(args, Retrieval::Full).await?,
            "HEAD" => self.cmd_article(args, Retrieval::Head).await?,
            "BODY" => self.cmd_article(args, Retrieval::Body).await?,
            "STAT" => self.cmd_article(args, Retrieval::Stat).await?,
            "OVER" | "XOVER" => self.cmd_over(args).await?,
            "POST" => self.cmd_post().await?,
            "CHECK" => self.cmd_check(args).await?,
            "TAKETHIS" => self.cmd_takethis(args).await?,
            _ => self.codec.write_line("500 command not recognized").await?,
        }
        Ok(true)
    }

    async fn cmd_capabilities(&mut self) -> Result<()> {
        self.codec.write_line("101 capability list follows").await?;
        let mut caps = vec![
            "VERSION 2".to_string(),
            "READER".to_string(),
            "STREAMING".to_string(),
            "OVER".to_string(),
            "LIST ACTIVE NEWSGROUPS OVERVIEW.FMT".to_string(),
        ];
        if self.can_post() {
            caps.push("POST".to_string());
        }
        if self.user.is_none() {
            caps.push("AUTHINFO USER".to_string());
        }
        self.codec.write_multiline(&caps).await?;
        Ok(())
    }

    async fn cmd_mode(&mut self, args: &str) -> Result<()> {
        match args.to_ascii_uppercase().as_str() {
            "READER" => {
                let code = if self.can_post() { 200 } else { 201 };
                self.codec
                    .write_line(&format!("{} reader mode", code))
                    .await?
            }
            "STREAM" => self.codec.write_line("203 streaming permitted").await?,
            _ => self.codec.write_line("501 unknown mode").await?,
        }
        Ok(())
    }

    async fn cmd_authinfo(&mut self, args: &str) -> Result<()> {
        let mut parts = args.splitn(2, ' ');
        let sub = parts.next().unwrap_or("").to_ascii_uppercase();
        let value = parts.next().unwrap_or("").trim();

        match sub.as_str() {
            "USER" if !value.is_empty() => {
                self.pending_user = Some(value.to_string());
                self.codec.write_line("381 password required").await?;
            }
            "PASS" => {
                let Some(username) = self.pending_user.take() else {
                    self.codec.write_line("482 AUTHINFO USER first").await?;
                    return Ok(());
                };
                match self.ctx.main.authenticate(&username, value).await? {
                    Some(user) => {
                        self.ctx
                            .main
                            .record_session(&self.session_id.to_string(), user.id, &self.remote)
                            .await?;
                        tracing::info!(
                            session = %self.session_id,
                            username = %user.username,
                            "authenticated"
                        );
                        self.user = Some(user);
                        self.codec.write_line("281 authentication accepted").await?;
                    }
                    None => {
                        tracing::info!(
                            session = %self.session_id,
                            username = %username,
                            "authentication rejected"
                        );
                        self.codec
                            .write_line("481 authentication failed")
                            .await?;
                    }
                }
            }
            _ => self.codec.write_line("501 syntax error").await?,
        }
        Ok(())
    }

    async fn cmd_group(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            self.codec.write_line("501 group name required").await?;
            return Ok(());
        }
        let Some(group) = self.ctx.main.get_group(args).await? else {
            self.codec.write_line("411 no such newsgroup").await?;
            return Ok(());
        };
        if !group.active {
            self.codec.write_line("411 no such newsgroup").await?;
            return Ok(());
        }
        let db = self.ctx.stores.get(&group.name).await?;
        let (low, high, count) = db.listing_range().await?;
        self.current_group = Some(group.name.clone());
        self.current_article = if count > 0 { Some(low) } else { None };
        self.codec
            .write_line(&format!("211 {} {} {} {}", count, low, high, group.name))
            .await?;
        Ok(())
    }

    async fn cmd_listgroup(&mut self, args: &str) -> Result<()> {
        let mut parts = args.split_whitespace();
        let name = match parts.next() {
            Some(name) => name.to_string(),
            None => match &self.current_group {
                Some(name) => name.clone(),
                None => {
                    self.codec.write_line("412 no newsgroup selected").await?;
                    return Ok(());
                }
            },
        };
        let range = parts.next().map(parse_range);

        let Some(group) = self.ctx.main.get_group(&name).await? else {
            self.codec.write_line("411 no such newsgroup").await?;
            return Ok(());
        };
        let db = self.ctx.stores.get(&group.name).await?;
        let (low, high, count) = db.listing_range().await?;
        let (range_low, range_high) = match range {
            Some((l, h)) => (l.max(low), h.min(high)),
            None => (low, high),
        };

        self.current_group = Some(group.name.clone());
        self.current_article = if count > 0 { Some(low) } else { None };
        self.codec
            .write_line(&format!("211 {} {} {} {}", count, low, high, group.name))
            .await?;
        let numbers = if count > 0 && range_low <= range_high {
            db.article_numbers(range_low, range_high).await?
        } else {
            Vec::new()
        };
        let lines: Vec<String> = numbers.iter().map(|n| n.to_string()).collect();
        self.codec.write_multiline(&lines).await?;
        Ok(())
    }

    async fn cmd_list(&mut self, args: &str) -> Result<()> {
        let mut parts = args.split_whitespace();
        let keyword = parts
            .next()
            .unwrap_or("ACTIVE")
            .to_ascii_uppercase();
        let pattern = parts.next().map(Wildmat::parse);

        match keyword.as_str() {
            "ACTIVE" => {
                self.codec.write_line("215 list of newsgroups follows").await?;
                let mut lines = Vec::new();
                for group in self.ctx.main.list_groups().await? {
                    if !group.active {
                        continue;
                    }
                    if let Some(w) = &pattern {
                        if !w.matches(&group.name) {
                            continue;
                        }
                    }
                    lines.push(format!(
                        "{} {} {} {}",
                        group.name, group.high_water, group.low_water, group.status
                    ));
                }
                self.codec.write_multiline(&lines).await?;
            }
            "NEWSGROUPS" => {
                self.codec.write_line("215 descriptions follow").await?;
                let mut lines = Vec::new();
                for group in self.ctx.main.list_groups().await? {
                    if let Some(w) = &pattern {
                        if !w.matches(&group.name) {
                            continue;
                        }
                    }
                    lines.push(format!("{}\t{}", group.name, group.description));
                }
                self.codec.write_multiline(&lines).await?;
            }
            "OVERVIEW.FMT" => {
                self.codec.write_line("215 overview format follows").await?;
                let fields: Vec<String> = [
                    "Subject:",
                    "From:",
                    "Date:",
                    "Message-ID:",
                    "References:",
                    ":bytes",
                    ":lines",
                ]
                .iter()
                .map(|f| f.to_string())
                .collect();
                self.codec.write_multiline(&fields).await?;
            }
            _ => self.codec.write_line("501 unknown list keyword").await?,
        }
        Ok(())
    }

    /// Resolve the target of ARTICLE/HEAD/BODY/STAT: explicit Message-ID,
    /// explicit number in the current group, or the current article.
    async fn resolve_article(&mut self, args: &str) -> Result<ResolveOutcome> {
        if args.starts_with('<') {
            if !valid_message_id(args) {
                return Ok(ResolveOutcome::Reply("430 no such article"));
            }
            // Locate the article's group through the history log record.
            let offset = match self.ctx.history.lookup(args).await? {
                Lookup::Hit { offset } => offset,
                Lookup::Miss => return Ok(ResolveOutcome::Reply("430 no such article")),
            };
            let record = match self.ctx.history.log().read_record(offset).await {
                Ok(record) => record,
                Err(SpoolError::CorruptRecord { .. }) => {
                    return Ok(ResolveOutcome::Reply("430 no such article"))
                }
                Err(e) => return Err(e),
            };
            let group = record.groups.split(',').next().unwrap_or_default().to_string();
            let db = self.ctx.stores.get(&group).await?;
            return Ok(match db.get_by_message_id(args).await? {
                Some(article) => ResolveOutcome::Found(article),
                None => ResolveOutcome::Reply("430 no such article"),
            });
        }

        let Some(group) = self.current_group.clone() else {
            return Ok(ResolveOutcome::Reply("412 no newsgroup selected"));
        };
        let num = if args.is_empty() {
            match self.current_article {
                Some(num) => num,
                None => return Ok(ResolveOutcome::Reply("420 no current article")),
            }
        } else {
            match args.parse::<i64>() {
                Ok(num) => num,
                Err(_) => return Ok(ResolveOutcome::Reply("501 invalid article number")),
            }
        };
        let db = self.ctx.stores.get(&group).await?;
        Ok(match db.get_by_number(num).await? {
            Some(article) => {
                self.current_article = Some(num);
                ResolveOutcome::Found(article)
            }
            None => ResolveOutcome::Reply("423 no article with that number"),
        })
    }

    async fn cmd_article(&mut self, args: &str, retrieval: Retrieval) -> Result<()> {
        let article = match self.resolve_article(args).await? {
            ResolveOutcome::Found(article) => article,
            ResolveOutcome::Reply(reply) => {
                self.codec.write_line(reply).await?;
                return Ok(());
            }
        };
        let num = article.article_num;
        let id = &article.message_id;
        match retrieval {
            Retrieval::Stat => {
                self.codec
                    .write_line(&format!("223 {} {}", num, id))
                    .await?;
            }
            Retrieval::Head => {
                self.codec
                    .write_line(&format!("221 {} {}", num, id))
                    .await?;
                let headers = article.reconstruct_headers();
                self.codec
                    .write_multiline(&crate::nntp::text_to_lines(&headers))
                    .await?;
            }
            Retrieval::Body => {
                self.codec
                    .write_line(&format!("222 {} {}", num, id))
                    .await?;
                self.codec
                    .write_multiline(&crate::nntp::text_to_lines(&article.body_text))
                    .await?;
            }
            Retrieval::Full => {
                self.codec
                    .write_line(&format!("220 {} {}", num, id))
                    .await?;
                self.codec
                    .write_multiline(&crate::nntp::text_to_lines(&article.wire_format()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn cmd_over(&mut self, args: &str) -> Result<()> {
        let Some(group) = self.current_group.clone() else {
            self.codec.write_line("412 no newsgroup selected").await?;
            return Ok(());
        };
        let db = self.ctx.stores.get(&group).await?;
        let (range_low, range_high) = if args.is_empty() {
            match self.current_article {
                Some(num) => (num, num),
                None => {
                    self.codec.write_line("420 no current article").await?;
                    return Ok(());
                }
            }
        } else {
            parse_range(args)
        };

        self.codec.write_line("224 overview follows").await?;
        let rows = if range_low <= range_high {
            db.list_overview(range_low, range_high).await?
        } else {
            Vec::new()
        };
        let lines: Vec<String> = rows
            .iter()
            .map(|row| {
                format!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    row.article_num,
                    sanitize_field(&row.subject),
                    sanitize_field(&row.from_header),
                    sanitize_field(&row.date_string),
                    row.message_id,
                    sanitize_field(&row.references),
                    row.bytes,
                    row.lines
                )
            })
            .collect();
        self.codec.write_multiline(&lines).await?;
        Ok(())
    }

    async fn cmd_post(&mut self) -> Result<()> {
        if !self.can_post() {
            self.codec.write_line("440 posting not allowed").await?;
            return Ok(());
        }
        self.codec
            .write_line("340 send article, end with <CR-LF>.<CR-LF>")
            .await?;
        let lines = self.codec.read_multiline(SERVER_MAX_ARTICLE_BYTES).await?;
        let raw = self.complete_post_headers(lines);

        match self.ingest_to_listed_groups(&raw).await? {
            IngestOutcome::Stored { .. } | IngestOutcome::Rejected => {
                // Spam rejection is success-shaped at the protocol boundary.
                self.codec.write_line("240 article received").await?;
            }
            IngestOutcome::DuplicateMessageId => {
                self.codec
                    .write_line("441 duplicate message-id")
                    .await?;
            }
            IngestOutcome::InvalidGroup => {
                self.codec.write_line("441 no valid newsgroups").await?;
            }
            IngestOutcome::Malformed(reason) => {
                self.codec
                    .write_line(&format!("441 posting failed: {}", reason))
                    .await?;
            }
        }
        Ok(())
    }

    /// Fill in the headers a user agent may omit on POST.
    fn complete_post_headers(&self, lines: Vec<String>) -> String {
        let mut text = lines.join("\r\n");
        text.push_str("\r\n");
        let (header_block, _) = match text.split_once("\r\n\r\n") {
            Some((h, b)) => (h.to_string(), b),
            None => (text.trim_end().to_string(), ""),
        };

        let hostname = &self.ctx.config.hostname;
        let mut prefix = String::new();
        if header_value(&header_block.replace("\r\n", "\n"), "Message-ID").is_none() {
            prefix.push_str(&format!(
                "Message-ID: <{}@{}>\r\n",
                Uuid::new_v4().simple(),
                hostname
            ));
        }
        if header_value(&header_block.replace("\r\n", "\n"), "Date").is_none() {
            prefix.push_str(&format!("Date: {}\r\n", Utc::now().to_rfc2822()));
        }
        if header_value(&header_block.replace("\r\n", "\n"), "Path").is_none() {
            prefix.push_str(&format!("Path: {}!not-for-mail\r\n", hostname));
        }
        format!("{}{}", prefix, text)
    }

    /// Ingest into every listed newsgroup; the best single outcome wins.
    async fn ingest_to_listed_groups(&self, raw: &str) -> Result<IngestOutcome> {
        let normalized = raw.replace("\r\n", "\n");
        let header_block = normalized.split("\n\n").next().unwrap_or("");
        let newsgroups = header_value(header_block, "Newsgroups").unwrap_or_default();
        let groups: Vec<&str> = newsgroups
            .split(',')
            .map(|g| g.trim())
            .filter(|g| !g.is_empty())
            .collect();
        if groups.is_empty() {
            return Ok(IngestOutcome::Malformed("missing Newsgroups header".into()));
        }

        fn rank(outcome: &IngestOutcome) -> u8 {
            match outcome {
                IngestOutcome::Stored { .. } => 4,
                IngestOutcome::DuplicateMessageId => 3,
                IngestOutcome::Rejected => 2,
                IngestOutcome::Malformed(_) => 1,
                IngestOutcome::InvalidGroup => 0,
            }
        }

        let mut best = IngestOutcome::InvalidGroup;
        for group in groups {
            let outcome = self.ctx.processor.ingest(raw, group).await?;
            if rank(&outcome) > rank(&best) {
                best = outcome;
            }
        }
        Ok(best)
    }

    async fn cmd_check(&mut self, args: &str) -> Result<()> {
        if !valid_message_id(args) {
            self.codec
                .write_line(&format!("438 {} invalid message-id", args))
                .await?;
            return Ok(());
        }
        match self.ctx.history.lookup(args).await? {
            Lookup::Miss => {
                self.codec
                    .write_line(&format!("238 {}", args))
                    .await?
            }
            Lookup::Hit { .. } => {
                self.codec
                    .write_line(&format!("438 {}", args))
                    .await?
            }
        }
        Ok(())
    }

    async fn cmd_takethis(&mut self, args: &str) -> Result<()> {
        // The article always follows TAKETHIS; read it before judging.
        let lines = self.codec.read_multiline(SERVER_MAX_ARTICLE_BYTES).await?;
        if !valid_message_id(args) {
            self.codec
                .write_line(&format!("439 {}", args))
                .await?;
            return Ok(());
        }
        let mut raw = lines.join("\r\n");
        raw.push_str("\r\n");

        match self.ingest_to_listed_groups(&raw).await? {
            IngestOutcome::Stored { .. } | IngestOutcome::Rejected => {
                self.codec.write_line(&format!("239 {}", args)).await?;
            }
            _ => {
                self.codec.write_line(&format!("439 {}", args)).await?;
            }
        }
        Ok(())
    }
}

enum Retrieval {
    Full,
    Head,
    Body,
    Stat,
}

enum ResolveOutcome {
    Found(Article),
    Reply(&'static str),
}

/// Parse an RFC 3977 range: "n", "n-", or "n-m".
fn parse_range(arg: &str) -> (i64, i64) {
    match arg.split_once('-') {
        None => {
            let n = arg.parse().unwrap_or(0);
            (n, n)
        }
        Some((low, "")) => (low.parse().unwrap_or(0), i64::MAX),
        Some((low, high)) => (low.parse().unwrap_or(0), high.parse().unwrap_or(0)),
    }
}

/// Overview fields must not carry tabs or line breaks.
fn sanitize_field(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\t' || c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}
