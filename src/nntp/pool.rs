//! Per-provider connection pool.
//!
//! Holds up to `max_conns` authenticated connections to one upstream.
//! Idle connections sit in a bounded channel; a semaphore caps the total so
//! `get` blocks while every connection is checked out. A periodic reaper
//! closes connections idle past the threshold or marked broken.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{ProviderConfig, POOL_IDLE_TIMEOUT_SECS, POOL_REAP_INTERVAL_SECS};
use crate::error::{Result, SpoolError};

use super::client::Conn;

struct IdleConn {
    conn: Conn,
    since: Instant,
}

/// A checked-out connection; return it with [`BackendPool::put`] or drop it
/// to discard (the capacity permit releases either way).
pub struct PooledConn {
    pub conn: Conn,
    _permit: OwnedSemaphorePermit,
}

pub struct BackendPool {
    provider: Arc<ProviderConfig>,
    idle_tx: Sender<IdleConn>,
    idle_rx: Receiver<IdleConn>,
    capacity: Arc<Semaphore>,
    connect_timeout: Duration,
    read_timeout: Duration,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl BackendPool {
    pub fn new(
        provider: ProviderConfig,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Arc<BackendPool> {
        let max_conns = provider.max_conns;
        let (idle_tx, idle_rx) = async_channel::bounded(max_conns);
        Arc::new(BackendPool {
            provider: Arc::new(provider),
            idle_tx,
            idle_rx,
            capacity: Arc::new(Semaphore::new(max_conns)),
            connect_timeout,
            read_timeout,
            reaper: Mutex::new(None),
        })
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    /// Get a connection, reusing an idle one or dialing a new one. Blocks
    /// while all connections are checked out; `deadline` bounds the wait.
    pub async fn get(&self, deadline: Duration) -> Result<PooledConn> {
        let permit = match timeout(deadline, self.capacity.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SpoolError::ShuttingDown),
            Err(_) => {
                return Err(SpoolError::Nntp(format!(
                    "timed out waiting for a connection to {}",
                    self.provider.name
                )))
            }
        };

        while let Ok(idle) = self.idle_rx.try_recv() {
            if idle.conn.is_broken() {
                continue;
            }
            return Ok(PooledConn {
                conn: idle.conn,
                _permit: permit,
            });
        }

        let conn = Conn::connect(&self.provider, self.connect_timeout, self.read_timeout).await?;
        tracing::debug!(provider = %self.provider.name, "opened upstream connection");
        Ok(PooledConn {
            conn,
            _permit: permit,
        })
    }

    /// Return a connection to the idle set. Broken connections are
    /// discarded.
    pub async fn put(&self, pooled: PooledConn) {
        if pooled.conn.is_broken() {
            return;
        }
        let idle = IdleConn {
            conn: pooled.conn,
            since: Instant::now(),
        };
        // Dropping the permit after the enqueue keeps capacity accounting
        // correct: the slot frees only once the conn is parked or gone.
        let _ = self.idle_tx.try_send(idle);
    }

    /// Spawn the periodic reaper for idle and broken connections.
    pub async fn start_reaper(self: Arc<Self>) {
        let pool = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(POOL_REAP_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.reap().await;
            }
        });
        *self.reaper.lock().await = Some(handle);
    }

    async fn reap(&self) {
        let idle_timeout = Duration::from_secs(POOL_IDLE_TIMEOUT_SECS);
        let mut keep = Vec::new();
        let mut retire = Vec::new();
        while let Ok(idle) = self.idle_rx.try_recv() {
            if idle.conn.is_broken() || idle.since.elapsed() >= idle_timeout {
                retire.push(idle.conn);
            } else {
                keep.push(idle);
            }
        }
        for idle in keep {
            let _ = self.idle_tx.try_send(idle);
        }
        if !retire.is_empty() {
            tracing::debug!(
                provider = %self.provider.name,
                count = retire.len(),
                "reaping idle upstream connections"
            );
        }
        for conn in retire {
            conn.quit().await;
        }
    }

    /// Stop the reaper and close every idle connection. Checked-out
    /// connections die when their holders drop them.
    pub async fn close_all(&self) {
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.abort();
        }
        self.capacity.close();
        self.idle_rx.close();
        while let Ok(idle) = self.idle_rx.try_recv() {
            idle.conn.quit().await;
        }
    }
}
