//! spool - a Usenet news server and peering gateway.
//!
//! Speaks NNTP to readers and peers, fetches articles from upstream
//! providers, dedups them against a sharded history index, stores them in
//! per-group embedded databases, and offers accepted articles onward via
//! streaming CHECK/TAKETHIS.

pub mod active;
pub mod article;
pub mod bridge;
pub mod config;
pub mod dates;
pub mod error;
pub mod expire;
pub mod fetch;
pub mod history;
pub mod nntp;
pub mod processor;
pub mod server;
pub mod spam;
pub mod store;
pub mod transfer;
pub mod wildmat;

pub use error::{Result, SpoolError};
