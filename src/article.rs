//! Article representation and header handling.
//!
//! An article is stored as structured fields (the canonical six headers
//! plus counters) together with the verbatim header block and body. Parsing
//! extracts structured fields with continuation unfolding; reconstruction
//! re-emits the canonical six from the structured fields and appends the
//! remaining headers from the stored block.

use chrono::{DateTime, Utc};

use crate::dates;
use crate::error::{Result, SpoolError};

/// Headers re-emitted from structured fields during reconstruction.
const CANONICAL_HEADERS: &[&str] = &[
    "message-id",
    "subject",
    "from",
    "date",
    "references",
    "path",
];

/// A stored Usenet article.
#[derive(Debug, Clone, Default)]
pub struct Article {
    /// Per-group article number, assigned on insert. Zero before insert.
    pub article_num: i64,
    /// Angle-bracketed Message-ID, stored verbatim, compared case-sensitively.
    pub message_id: String,
    pub subject: String,
    pub from_header: String,
    /// Parsed Date header in UTC (zero time when unparseable).
    pub date_sent: DateTime<Utc>,
    /// Raw Date header as received.
    pub date_string: String,
    /// Raw References header (possibly empty).
    pub references: String,
    pub path: String,
    /// Verbatim header block, LF-separated, no trailing blank line.
    pub headers_blob: String,
    pub body_text: String,
    pub bytes: i64,
    pub lines: i64,
    pub hide: bool,
    pub downloaded: bool,
}

/// Overview projection of an article, sufficient for XOVER.
#[derive(Debug, Clone)]
pub struct OverviewRow {
    pub article_num: i64,
    pub subject: String,
    pub from_header: String,
    pub date_sent: DateTime<Utc>,
    pub date_string: String,
    pub message_id: String,
    pub references: String,
    pub bytes: i64,
    pub lines: i64,
    pub reply_count: i64,
    pub downloaded: bool,
}

impl Article {
    /// Parse a raw article (headers, blank line, body) into structured form.
    ///
    /// Validates the headers PROC requires: Message-ID (syntactically
    /// `<local@host>`), Subject, From, Date, and Path. References is
    /// optional. Line endings may be CRLF or LF.
    pub fn parse(raw: &str) -> Result<Article> {
        let normalized = raw.replace("\r\n", "\n");
        let (header_block, body) = match normalized.split_once("\n\n") {
            Some((h, b)) => (h, b),
            None => (normalized.trim_end_matches('\n'), ""),
        };

        let message_id = header_value(header_block, "Message-ID")
            .ok_or_else(|| SpoolError::Malformed("missing Message-ID".into()))?;
        if !valid_message_id(&message_id) {
            return Err(SpoolError::Malformed(format!(
                "invalid Message-ID: {}",
                message_id
            )));
        }
        let subject = header_value(header_block, "Subject")
            .ok_or_else(|| SpoolError::Malformed("missing Subject".into()))?;
        let from_header = header_value(header_block, "From")
            .ok_or_else(|| SpoolError::Malformed("missing From".into()))?;
        let date_string = header_value(header_block, "Date")
            .ok_or_else(|| SpoolError::Malformed("missing Date".into()))?;
        let path = header_value(header_block, "Path")
            .ok_or_else(|| SpoolError::Malformed("missing Path".into()))?;
        let references = header_value(header_block, "References").unwrap_or_default();

        let date_sent = dates::parse_date_or_epoch(&date_string);
        let body = body.to_string();
        let lines = if body.is_empty() {
            0
        } else {
            body.trim_end_matches('\n').split('\n').count() as i64
        };

        Ok(Article {
            article_num: 0,
            message_id,
            subject,
            from_header,
            date_sent,
            date_string,
            references,
            path,
            headers_blob: header_block.to_string(),
            bytes: raw.len() as i64,
            lines,
            body_text: body,
            hide: false,
            downloaded: true,
        })
    }

    /// Ordered list of referenced Message-IDs, oldest first.
    pub fn reference_ids(&self) -> Vec<String> {
        parse_references(&self.references)
    }

    /// Reconstruct the full header block: the canonical six from structured
    /// fields, then every additional header from the stored block.
    ///
    /// Skips headers already emitted, drops lines starting with a lowercase
    /// letter, and keeps indented continuation lines attached to their
    /// parent header (dropped together with a dropped parent).
    pub fn reconstruct_headers(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Message-ID: {}\r\n", self.message_id));
        out.push_str(&format!("Subject: {}\r\n", self.subject));
        out.push_str(&format!("From: {}\r\n", self.from_header));
        out.push_str(&format!("Date: {}\r\n", self.date_string));
        if !self.references.is_empty() {
            out.push_str(&format!("References: {}\r\n", self.references));
        }
        out.push_str(&format!("Path: {}\r\n", self.path));

        let mut emitted: Vec<String> = CANONICAL_HEADERS.iter().map(|h| h.to_string()).collect();
        let mut keeping = false;
        for line in self.headers_blob.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // Continuation: tied to the last kept header.
                if keeping {
                    out.push_str(line);
                    out.push_str("\r\n");
                }
                continue;
            }
            keeping = false;
            let Some(colon) = line.find(':') else {
                continue;
            };
            let name = &line[..colon];
            if name.is_empty() || name.contains(' ') {
                continue;
            }
            // Header names starting with a lowercase letter are dropped.
            if name.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
                continue;
            }
            let lower = name.to_ascii_lowercase();
            if emitted.iter().any(|e| *e == lower) {
                continue;
            }
            emitted.push(lower);
            keeping = true;
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }

    /// The full wire form: reconstructed headers, blank line, body.
    pub fn wire_format(&self) -> String {
        let mut out = self.reconstruct_headers();
        out.push_str("\r\n");
        if !self.body_text.is_empty() {
            for line in self.body_text.trim_end_matches('\n').split('\n') {
                let line = line.trim_end_matches('\r');
                out.push_str(line);
                out.push_str("\r\n");
            }
        }
        out
    }

}

/// Extract a header value by name, case-insensitively, unfolding
/// continuation lines. Returns the trimmed value.
pub fn header_value(header_block: &str, name: &str) -> Option<String> {
    let prefix = format!("{}:", name.to_ascii_lowercase());
    let mut value: Option<String> = None;
    for line in header_block.split('\n') {
        let line = line.trim_end_matches('\r');
        if let Some(v) = &mut value {
            if line.starts_with(' ') || line.starts_with('\t') {
                v.push(' ');
                v.push_str(line.trim());
                continue;
            }
            break;
        }
        if line.to_ascii_lowercase().starts_with(&prefix) {
            value = Some(line[prefix.len()..].trim().to_string());
        }
    }
    value
}

/// Syntactic Message-ID check: `<local@host>`, no whitespace, single
/// bracket pair.
pub fn valid_message_id(id: &str) -> bool {
    if !id.starts_with('<') || !id.ends_with('>') || id.len() < 5 {
        return false;
    }
    let inner = &id[1..id.len() - 1];
    if inner.contains('<') || inner.contains('>') || inner.contains(char::is_whitespace) {
        return false;
    }
    let Some(at) = inner.find('@') else {
        return false;
    };
    at > 0 && at < inner.len() - 1
}

/// Split a References header into ordered angle-bracketed IDs.
pub fn parse_references(references: &str) -> Vec<String> {
    references
        .split_whitespace()
        .filter(|tok| tok.starts_with('<') && tok.ends_with('>') && tok.contains('@'))
        .map(|tok| tok.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "Path: news.example.org!not-for-mail\r\n\
Message-ID: <abc123@example.com>\r\n\
From: Jo User <jo@example.com>\r\n\
Subject: Test article\r\n\
Date: Mon, 20 Jan 2025 12:00:00 +0000\r\n\
References: <root@example.com> <mid@example.com>\r\n\
X-Custom: kept\r\n\
\tcontinued value\r\n\
broken lowercase: dropped\r\n\
\r\n\
Body line one.\r\n\
Body line two.\r\n";

    // =============================================================================
    // Parsing tests
    // =============================================================================

    #[test]
    fn test_parse_extracts_structured_fields() {
        let article = Article::parse(RAW).unwrap();
        assert_eq!(article.message_id, "<abc123@example.com>");
        assert_eq!(article.subject, "Test article");
        assert_eq!(article.from_header, "Jo User <jo@example.com>");
        assert_eq!(article.path, "news.example.org!not-for-mail");
        assert_eq!(article.lines, 2);
        assert_eq!(
            article.reference_ids(),
            vec!["<root@example.com>", "<mid@example.com>"]
        );
    }

    #[test]
    fn test_parse_rejects_missing_message_id() {
        let raw = "From: a@b\r\nSubject: s\r\nDate: x\r\nPath: p\r\n\r\nbody\r\n";
        assert!(matches!(
            Article::parse(raw),
            Err(SpoolError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_message_id_syntax() {
        let raw = "Message-ID: no-brackets@x\r\nFrom: a@b\r\nSubject: s\r\nDate: x\r\nPath: p\r\n\r\n";
        assert!(Article::parse(raw).is_err());
    }

    #[test]
    fn test_header_value_unfolds_continuations() {
        let block = "Subject: part one\n\tpart two\nFrom: someone";
        assert_eq!(
            header_value(block, "Subject").unwrap(),
            "part one part two"
        );
    }

    // =============================================================================
    // Message-ID validation tests
    // =============================================================================

    #[test]
    fn test_valid_message_id_shapes() {
        assert!(valid_message_id("<a@b.example>"));
        assert!(!valid_message_id("a@b.example"));
        assert!(!valid_message_id("<a@>"));
        assert!(!valid_message_id("<@b>"));
        assert!(!valid_message_id("<a b@c>"));
        assert!(!valid_message_id("<ab>"));
        assert!(!valid_message_id("<<a@b>>"));
    }

    // =============================================================================
    // Reconstruction tests
    // =============================================================================

    #[test]
    fn test_reconstruct_emits_canonical_six_first() {
        let article = Article::parse(RAW).unwrap();
        let rebuilt = article.reconstruct_headers();
        let lines: Vec<&str> = rebuilt.lines().collect();
        assert!(lines[0].starts_with("Message-ID:"));
        assert!(lines[1].starts_with("Subject:"));
        assert!(lines[2].starts_with("From:"));
        assert!(lines[3].starts_with("Date:"));
        assert!(lines[4].starts_with("References:"));
        assert!(lines[5].starts_with("Path:"));
    }

    #[test]
    fn test_reconstruct_skips_duplicates_and_lowercase() {
        let article = Article::parse(RAW).unwrap();
        let rebuilt = article.reconstruct_headers();
        // Canonical headers appear exactly once.
        assert_eq!(rebuilt.matches("Message-ID:").count(), 1);
        assert_eq!(rebuilt.matches("Subject:").count(), 1);
        // The lowercase-starting header is dropped.
        assert!(!rebuilt.contains("broken lowercase"));
        // The extra header and its continuation survive.
        assert!(rebuilt.contains("X-Custom: kept\r\n\tcontinued value\r\n"));
    }

    #[test]
    fn test_reconstruct_reparse_round_trip() {
        let article = Article::parse(RAW).unwrap();
        let reparsed = Article::parse(&article.wire_format()).unwrap();
        assert_eq!(reparsed.message_id, article.message_id);
        assert_eq!(reparsed.subject, article.subject);
        assert_eq!(reparsed.from_header, article.from_header);
        assert_eq!(reparsed.date_string, article.date_string);
        assert_eq!(reparsed.references, article.references);
        assert_eq!(reparsed.path, article.path);
        assert_eq!(reparsed.body_text, article.body_text);
    }

    #[test]
    fn test_dropped_parent_drops_continuation() {
        let raw = "Message-ID: <x@y>\r\nFrom: a@b\r\nSubject: s\r\nDate: Mon, 20 Jan 2025 12:00:00 +0000\r\nPath: p\r\nlowercase: parent\r\n\tcontinuation\r\n\r\nbody\r\n";
        let article = Article::parse(raw).unwrap();
        let rebuilt = article.reconstruct_headers();
        assert!(!rebuilt.contains("continuation"));
    }
}
