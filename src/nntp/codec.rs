//! NNTP wire framing.
//!
//! Command and response lines are CRLF-terminated; multi-line payloads end
//! with a lone `.` line and byte-stuff leading dots. The codec wraps any
//! async stream and is shared by the upstream client and the server
//! sessions.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Result, SpoolError};

/// A single status line, split into code and trailing text.
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub text: String,
}

impl Response {
    pub fn parse(line: &str) -> Result<Response> {
        let code_str = line.split(' ').next().unwrap_or("");
        let code: u16 = code_str
            .parse()
            .map_err(|_| SpoolError::Nntp(format!("unparseable response line: {}", line)))?;
        let text = line[code_str.len()..].trim_start().to_string();
        Ok(Response { code, text })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

pub struct NntpCodec<S> {
    stream: BufReader<S>,
    /// Refuses lines longer than this; 0 disables the check.
    max_line: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> NntpCodec<S> {
    pub fn new(stream: S, max_line: usize) -> NntpCodec<S> {
        NntpCodec {
            stream: BufReader::new(stream),
            max_line,
        }
    }

    /// Read one line, stripping the CRLF terminator. EOF is an error (the
    /// peer hung up mid-conversation).
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(SpoolError::Nntp("connection closed".into()));
        }
        if self.max_line > 0 && line.len() > self.max_line {
            return Err(SpoolError::Nntp("line too long".into()));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    pub async fn read_response(&mut self) -> Result<Response> {
        let line = self.read_line().await?;
        Response::parse(&line)
    }

    /// Read a dot-terminated block, un-stuffing leading dots. `max_bytes`
    /// bounds the cumulative payload (0 = unlimited).
    pub async fn read_multiline(&mut self, max_bytes: u64) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut total: u64 = 0;
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(SpoolError::Nntp(
                    "connection closed inside multi-line response".into(),
                ));
            }
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            if line == "." {
                return Ok(lines);
            }
            let line = match line.strip_prefix('.') {
                Some(rest) => rest.to_string(),
                None => line,
            };
            total += line.len() as u64 + 2;
            if max_bytes > 0 && total > max_bytes {
                return Err(SpoolError::Nntp("multi-line payload too large".into()));
            }
            lines.push(line);
        }
    }

    /// Write one CRLF-terminated line and flush.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let inner = self.stream.get_mut();
        inner.write_all(line.as_bytes()).await?;
        inner.write_all(b"\r\n").await?;
        inner.flush().await?;
        Ok(())
    }

    /// Queue a line without flushing (for pipelined commands).
    pub async fn write_line_unflushed(&mut self, line: &str) -> Result<()> {
        let inner = self.stream.get_mut();
        inner.write_all(line.as_bytes()).await?;
        inner.write_all(b"\r\n").await?;
        Ok(())
    }

    /// Write a dot-stuffed block followed by the `.` terminator, without
    /// flushing.
    pub async fn write_multiline_unflushed(&mut self, lines: &[String]) -> Result<()> {
        let inner = self.stream.get_mut();
        for line in lines {
            if line.starts_with('.') {
                inner.write_all(b".").await?;
            }
            inner.write_all(line.as_bytes()).await?;
            inner.write_all(b"\r\n").await?;
        }
        inner.write_all(b".\r\n").await?;
        Ok(())
    }

    /// Write a dot-stuffed block and flush.
    pub async fn write_multiline(&mut self, lines: &[String]) -> Result<()> {
        self.write_multiline_unflushed(lines).await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.stream.get_mut().flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

/// Split CRLF-or-LF wire text into lines for dot-stuffed writing.
pub fn text_to_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.replace("\r\n", "\n")
        .trim_end_matches('\n')
        .split('\n')
        .map(|l| l.to_string())
        .collect()
}
