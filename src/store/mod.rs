//! Storage layer: the main registry database and the per-group stores.

pub mod group_db;
pub mod handles;
pub mod main_db;

pub use group_db::{GroupDb, ThreadCacheEntry, TreeNode};
pub use handles::GroupStores;
pub use main_db::{MainDb, Newsgroup, PostQueueEntry, User};
