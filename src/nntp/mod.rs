//! NNTP wire protocol: framing, the upstream client connection, and the
//! per-provider connection pool.

pub mod client;
pub mod codec;
pub mod pool;
pub mod stream;

pub use client::{ActiveGroup, ArticleSpec, CheckStatus, Conn, GroupStatus, TakeThisOutcome};
pub use codec::{text_to_lines, NntpCodec, Response};
pub use pool::{BackendPool, PooledConn};
pub use stream::ConnStream;
