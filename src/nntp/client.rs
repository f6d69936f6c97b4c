//! Upstream NNTP connection.
//!
//! One authenticated connection to a provider or peer, exposing the reader
//! commands the fetcher needs and the RFC 4644 streaming commands the
//! transfer queue needs. Responses on a connection arrive strictly in send
//! order; the streaming API keeps a FIFO of pending TAKETHIS command ids
//! and enforces in-order reads. Any read error invalidates the connection:
//! every subsequent read reports the original failure.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::timeout;

use crate::config::ProviderConfig;
use crate::error::{Result, SpoolError};

use super::codec::{text_to_lines, NntpCodec, Response};
use super::stream::{dial, ConnStream};

/// Target of an article-addressed command.
#[derive(Debug, Clone)]
pub enum ArticleSpec {
    Number(i64),
    MessageId(String),
}

impl ArticleSpec {
    fn token(&self) -> String {
        match self {
            ArticleSpec::Number(n) => n.to_string(),
            ArticleSpec::MessageId(id) => id.clone(),
        }
    }
}

/// Result of a GROUP command.
#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub count: i64,
    pub low: i64,
    pub high: i64,
    pub name: String,
}

/// Per-id CHECK verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CheckStatus {
    Wanted,
    Unwanted,
    Deferred,
}

/// Per-article TAKETHIS verdict.
#[derive(Debug, Clone, Copy)]
pub struct TakeThisOutcome {
    pub code: u16,
    pub accepted: bool,
}

/// One active newsgroup line from LIST ACTIVE.
#[derive(Debug, Clone)]
pub struct ActiveGroup {
    pub name: String,
    pub high: i64,
    pub low: i64,
    pub status: String,
}

pub struct Conn {
    codec: NntpCodec<ConnStream>,
    posting_allowed: bool,
    read_timeout: Duration,
    /// FIFO of (cmd id, message id) for in-flight streaming TAKETHIS.
    pending: VecDeque<(u64, String)>,
    next_cmd_id: u64,
    /// First read failure; poisons all later reads.
    broken: Option<String>,
}

impl Conn {
    /// Dial, read the greeting, and authenticate when the provider has
    /// credentials.
    pub async fn connect(
        provider: &ProviderConfig,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Conn> {
        let stream = dial(provider, connect_timeout).await?;
        let mut conn = Conn {
            codec: NntpCodec::new(stream, 0),
            posting_allowed: false,
            read_timeout,
            pending: VecDeque::new(),
            next_cmd_id: 0,
            broken: None,
        };

        let greeting = conn.read_response().await?;
        match greeting.code {
            200 => conn.posting_allowed = true,
            201 => conn.posting_allowed = false,
            code => {
                return Err(SpoolError::Nntp(format!(
                    "unexpected greeting {} from {}",
                    code,
                    provider.addr()
                )))
            }
        }

        if let (Some(username), Some(password)) = (&provider.username, &provider.password) {
            let (username, password) = (username.clone(), password.clone());
            conn.authenticate(&username, &password).await?;
        }
        Ok(conn)
    }

    pub fn is_posting_allowed(&self) -> bool {
        self.posting_allowed
    }

    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    async fn read_line(&mut self) -> Result<String> {
        if let Some(reason) = &self.broken {
            return Err(SpoolError::Nntp(reason.clone()));
        }
        let result = match timeout(self.read_timeout, self.codec.read_line()).await {
            Ok(inner) => inner,
            Err(_) => Err(SpoolError::Nntp("read timeout".into())),
        };
        if let Err(e) = &result {
            self.broken = Some(e.to_string());
        }
        result
    }

    async fn read_response(&mut self) -> Result<Response> {
        let line = self.read_line().await?;
        Response::parse(&line)
    }

    async fn read_multiline(&mut self, max_bytes: u64) -> Result<Vec<String>> {
        if let Some(reason) = &self.broken {
            return Err(SpoolError::Nntp(reason.clone()));
        }
        let result = match timeout(self.read_timeout, self.codec.read_multiline(max_bytes)).await {
            Ok(inner) => inner,
            Err(_) => Err(SpoolError::Nntp("read timeout".into())),
        };
        if let Err(e) = &result {
            self.broken = Some(e.to_string());
        }
        result
    }

    /// Send one command and read its status line. Refused while streaming
    /// responses are outstanding (they must be drained first).
    async fn command(&mut self, line: &str) -> Result<Response> {
        if !self.pending.is_empty() {
            return Err(SpoolError::Nntp(
                "streaming responses outstanding, drain them first".into(),
            ));
        }
        self.codec.write_line(line).await?;
        self.read_response().await
    }

    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let user_reply = self.command(&format!("AUTHINFO USER {}", username)).await?;
        match user_reply.code {
            281 => return Ok(()),
            381 => {}
            code => {
                return Err(SpoolError::Nntp(format!(
                    "AUTHINFO USER rejected with {}",
                    code
                )))
            }
        }
        let pass_reply = self.command(&format!("AUTHINFO PASS {}", password)).await?;
        if pass_reply.code != 281 {
            return Err(SpoolError::Nntp(format!(
                "authentication failed with {}",
                pass_reply.code
            )));
        }
        Ok(())
    }

    pub async fn capabilities(&mut self) -> Result<Vec<String>> {
        let reply = self.command("CAPABILITIES").await?;
        if reply.code != 101 {
            return Err(SpoolError::Nntp(format!(
                "CAPABILITIES rejected with {}",
                reply.code
            )));
        }
        self.read_multiline(0).await
    }

    /// Enter RFC 4644 streaming mode.
    pub async fn mode_stream(&mut self) -> Result<()> {
        let reply = self.command("MODE STREAM").await?;
        if reply.code != 203 {
            return Err(SpoolError::Nntp(format!(
                "MODE STREAM rejected with {}",
                reply.code
            )));
        }
        Ok(())
    }

    pub async fn select_group(&mut self, name: &str) -> Result<GroupStatus> {
        let reply = self.command(&format!("GROUP {}", name)).await?;
        if reply.code != 211 {
            return Err(SpoolError::Nntp(format!(
                "GROUP {} rejected with {}",
                name, reply.code
            )));
        }
        let mut parts = reply.text.split_whitespace();
        let count = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
        let low = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
        let high = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
        let name = parts.next().unwrap_or(name).to_string();
        Ok(GroupStatus {
            count,
            low,
            high,
            name,
        })
    }

    /// LIST ACTIVE, optionally truncated to `limit` groups (0 = all).
    pub async fn list_groups(&mut self, limit: usize) -> Result<Vec<ActiveGroup>> {
        let reply = self.command("LIST ACTIVE").await?;
        if reply.code != 215 {
            return Err(SpoolError::Nntp(format!(
                "LIST ACTIVE rejected with {}",
                reply.code
            )));
        }
        let lines = self.read_multiline(0).await?;
        let mut groups = Vec::new();
        for line in lines {
            let mut parts = line.split_whitespace();
            let Some(name) = parts.next() else { continue };
            let high = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
            let low = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
            let status = parts.next().unwrap_or("y").to_string();
            groups.push(ActiveGroup {
                name: name.to_string(),
                high,
                low,
                status,
            });
            if limit > 0 && groups.len() >= limit {
                break;
            }
        }
        Ok(groups)
    }

    /// STAT; `Ok(Some((number, message_id)))` on 223, `Ok(None)` when the
    /// article does not exist (420/423/430), error otherwise.
    pub async fn stat(&mut self, spec: ArticleSpec) -> Result<Option<(i64, String)>> {
        let reply = self.command(&format!("STAT {}", spec.token())).await?;
        match reply.code {
            223 => {
                let mut parts = reply.text.split_whitespace();
                let num = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
                let id = parts.next().unwrap_or_default().to_string();
                Ok(Some((num, id)))
            }
            420 | 423 | 430 => Ok(None),
            code => Err(SpoolError::Nntp(format!("STAT rejected with {}", code))),
        }
    }

    /// ARTICLE; raw wire text (CRLF line endings) or `None` when missing.
    /// `max_bytes` guards against oversize articles (0 = unlimited).
    pub async fn article(&mut self, spec: ArticleSpec, max_bytes: u64) -> Result<Option<String>> {
        let reply = self.command(&format!("ARTICLE {}", spec.token())).await?;
        match reply.code {
            220 => {
                let lines = self.read_multiline(max_bytes).await?;
                let mut raw = lines.join("\r\n");
                raw.push_str("\r\n");
                Ok(Some(raw))
            }
            420 | 423 | 430 => Ok(None),
            code => Err(SpoolError::Nntp(format!("ARTICLE rejected with {}", code))),
        }
    }

    /// POST an article given its full wire text.
    pub async fn post(&mut self, article_text: &str) -> Result<()> {
        let reply = self.command("POST").await?;
        if reply.code != 340 {
            return Err(SpoolError::Nntp(format!(
                "POST rejected with {}",
                reply.code
            )));
        }
        self.codec
            .write_multiline(&text_to_lines(article_text))
            .await?;
        let reply = self.read_response().await?;
        if reply.code != 240 {
            return Err(SpoolError::Nntp(format!(
                "article not accepted, code {}",
                reply.code
            )));
        }
        Ok(())
    }

    /// Pipelined CHECK for a batch of message ids; responses are read in
    /// send order and matched back positionally.
    pub async fn check(&mut self, ids: &[String]) -> Result<Vec<(String, CheckStatus)>> {
        if !self.pending.is_empty() {
            return Err(SpoolError::Nntp(
                "streaming responses outstanding, drain them first".into(),
            ));
        }
        for id in ids {
            self.codec
                .write_line_unflushed(&format!("CHECK {}", id))
                .await?;
        }
        self.codec.flush().await?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let reply = self.read_response().await?;
            let status = match reply.code {
                238 => CheckStatus::Wanted,
                438 => CheckStatus::Unwanted,
                431 => CheckStatus::Deferred,
                code => {
                    return Err(SpoolError::Nntp(format!(
                        "CHECK {} rejected with {}",
                        id, code
                    )))
                }
            };
            out.push((id.clone(), status));
        }
        Ok(out)
    }

    /// Blocking TAKETHIS: send the article and wait for its verdict.
    pub async fn take_this(&mut self, id: &str, article_text: &str) -> Result<TakeThisOutcome> {
        let cmd_id = self.send_takethis_streaming(id, article_text).await?;
        self.read_takethis_response_streaming(cmd_id).await
    }

    /// Enqueue a TAKETHIS without reading its response; returns the command
    /// id to read it back with. Responses arrive in send order.
    pub async fn send_takethis_streaming(&mut self, id: &str, article_text: &str) -> Result<u64> {
        if let Some(reason) = &self.broken {
            return Err(SpoolError::Nntp(reason.clone()));
        }
        self.codec
            .write_line_unflushed(&format!("TAKETHIS {}", id))
            .await?;
        self.codec
            .write_multiline_unflushed(&text_to_lines(article_text))
            .await?;
        self.codec.flush().await?;

        let cmd_id = self.next_cmd_id;
        self.next_cmd_id += 1;
        self.pending.push_back((cmd_id, id.to_string()));
        Ok(cmd_id)
    }

    /// Read the response for a previously sent streaming TAKETHIS. Must be
    /// called in send order; a read for anything but the oldest pending
    /// command is an error.
    pub async fn read_takethis_response_streaming(
        &mut self,
        cmd_id: u64,
    ) -> Result<TakeThisOutcome> {
        match self.pending.front() {
            Some((front, _)) if *front == cmd_id => {}
            Some((front, _)) => {
                return Err(SpoolError::Nntp(format!(
                    "streaming responses must be read in order (next is {}, asked for {})",
                    front, cmd_id
                )))
            }
            None => {
                return Err(SpoolError::Nntp(format!(
                    "no pending streaming command {}",
                    cmd_id
                )))
            }
        }
        let reply = self.read_response().await?;
        self.pending.pop_front();
        match reply.code {
            239 => Ok(TakeThisOutcome {
                code: 239,
                accepted: true,
            }),
            439 => Ok(TakeThisOutcome {
                code: 439,
                accepted: false,
            }),
            code => Err(SpoolError::Nntp(format!(
                "unexpected TAKETHIS response {}",
                code
            ))),
        }
    }

    pub fn pending_streaming(&self) -> usize {
        self.pending.len()
    }

    /// Best-effort QUIT; errors ignored, the connection is going away.
    pub async fn quit(mut self) {
        let _ = self.codec.write_line("QUIT").await;
        let _ = timeout(Duration::from_secs(2), self.codec.read_line()).await;
    }
}
