//! Reference-counted cache of open per-group stores.
//!
//! A group's store opens on first reference and stays cached; the reaper
//! closes handles that have been idle past the timeout and have no
//! outstanding references (the `Arc` strong count is the reference count,
//! so closing never races an active user).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{GROUP_HANDLE_IDLE_SECS, GROUP_HANDLE_REAP_INTERVAL_SECS};
use crate::error::Result;

use super::group_db::GroupDb;

struct CachedHandle {
    db: Arc<GroupDb>,
    last_used: Instant,
}

pub struct GroupStores {
    dir: PathBuf,
    handles: Mutex<HashMap<String, CachedHandle>>,
    idle_timeout: Duration,
}

/// Replace characters that cannot appear in a file name. Group names are
/// already restricted, this only guards against path separators.
fn file_name_for(group: &str) -> String {
    let safe: String = group
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.db", safe)
}

impl GroupStores {
    pub fn new(dir: PathBuf) -> Arc<GroupStores> {
        Arc::new(GroupStores {
            dir,
            handles: Mutex::new(HashMap::new()),
            idle_timeout: Duration::from_secs(GROUP_HANDLE_IDLE_SECS),
        })
    }

    /// Get (opening on demand) the store for a group. The returned `Arc`
    /// is the reference; dropping it returns the handle.
    pub async fn get(&self, group: &str) -> Result<Arc<GroupDb>> {
        let mut handles = self.handles.lock().await;
        if let Some(cached) = handles.get_mut(group) {
            cached.last_used = Instant::now();
            return Ok(cached.db.clone());
        }
        drop(handles);

        // Open outside the cache lock; a concurrent opener may win.
        let db = Arc::new(GroupDb::open(group, &self.dir.join(file_name_for(group))).await?);

        let mut handles = self.handles.lock().await;
        let cached = handles.entry(group.to_string()).or_insert_with(|| CachedHandle {
            db: db.clone(),
            last_used: Instant::now(),
        });
        cached.last_used = Instant::now();
        Ok(cached.db.clone())
    }

    /// Spawn the periodic reaper closing idle, unreferenced handles.
    pub fn start_reaper(self: Arc<Self>) -> JoinHandle<()> {
        let stores = self;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(GROUP_HANDLE_REAP_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                stores.reap().await;
            }
        })
    }

    async fn reap(&self) {
        let mut closable = Vec::new();
        {
            let mut handles = self.handles.lock().await;
            let idle_timeout = self.idle_timeout;
            handles.retain(|group, cached| {
                let idle = cached.last_used.elapsed() >= idle_timeout;
                let unreferenced = Arc::strong_count(&cached.db) == 1;
                if idle && unreferenced {
                    tracing::debug!(group = %group, "closing idle group store");
                    closable.push(cached.db.clone());
                    false
                } else {
                    true
                }
            });
        }
        for db in closable {
            db.close().await;
        }
    }

    /// Close every cached handle; waits for outstanding connections to be
    /// returned to their pools.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<GroupDb>> = {
            let mut handles = self.handles.lock().await;
            handles.drain().map(|(_, cached)| cached.db).collect()
        };
        for db in drained {
            db.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_get_caches_handle() {
        let dir = TempDir::new().unwrap();
        let stores = GroupStores::new(dir.path().to_path_buf());

        let a = stores.get("misc.test").await.unwrap();
        let b = stores.get("misc.test").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        stores.close_all().await;
    }

    #[tokio::test]
    async fn test_reap_skips_referenced_handles() {
        let dir = TempDir::new().unwrap();
        let stores = GroupStores::new(dir.path().to_path_buf());
        let held = stores.get("misc.test").await.unwrap();

        // Force everything to look idle.
        {
            let mut handles = stores.handles.lock().await;
            for cached in handles.values_mut() {
                cached.last_used = Instant::now() - Duration::from_secs(GROUP_HANDLE_IDLE_SECS * 2);
            }
        }
        stores.reap().await;

        // Still cached because a reference is outstanding.
        assert_eq!(stores.handles.lock().await.len(), 1);

        drop(held);
        stores.reap().await;
        assert!(stores.handles.lock().await.is_empty());
    }

    #[test]
    fn test_file_name_sanitizes_separators() {
        assert_eq!(file_name_for("comp.lang.rust"), "comp.lang.rust.db");
        assert_eq!(file_name_for("bad/../name"), "bad_.._name.db");
    }
}
