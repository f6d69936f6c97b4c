//! Spam filter seam.
//!
//! The rule engine itself is an external collaborator; ingestion only
//! depends on this narrow interface. Rejection is success-shaped at the
//! protocol boundary but logged distinctly.

use async_trait::async_trait;

/// Per-article filter consulted during ingestion.
#[async_trait]
pub trait SpamFilter: Send + Sync {
    async fn should_reject(&self, headers: &str, body: &str, group: &str) -> bool;
}

/// Accept-everything filter used when no rule engine is configured.
pub struct AcceptAll;

#[async_trait]
impl SpamFilter for AcceptAll {
    async fn should_reject(&self, _headers: &str, _body: &str, _group: &str) -> bool {
        false
    }
}
