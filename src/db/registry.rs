//! Process-wide cache of connection pools keyed by connection signature.
//!
//! Each signature owns a `OnceCell`: concurrent first callers for the same
//! signature serialize on it and only one pool is ever created, while
//! different signatures never wait on each other. A failed creation leaves
//! the cell empty, so nothing is registered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;
use tokio::sync::OnceCell;

use super::config::ConnectionConfig;
use super::driver::{Pool, PoolFactory};
use crate::error::{Error, Result};

type PoolCell = Arc<OnceCell<Arc<dyn Pool>>>;

static GLOBAL: Lazy<Arc<PoolRegistry>> = Lazy::new(|| Arc::new(PoolRegistry::new()));

#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, PoolCell>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every session in the process.
    pub fn global() -> Arc<PoolRegistry> {
        GLOBAL.clone()
    }

    fn cells(&self) -> MutexGuard<'_, HashMap<String, PoolCell>> {
        // A panic while holding this lock cannot leave the map half-updated.
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the pool for `config`, creating it on first use.
    pub async fn get_or_create(
        &self,
        config: &ConnectionConfig,
        factory: &dyn PoolFactory,
    ) -> Result<Arc<dyn Pool>> {
        let signature = config.signature();

        loop {
            let cell = self.cells().entry(signature.clone()).or_default().clone();

            let created = cell
                .get_or_try_init(|| async {
                    tracing::info!("Creating connection pool for {}", config.display_string());
                    factory
                        .create(&config.pool_options())
                        .await
                        .map_err(|source| Error::Connection {
                            signature: signature.clone(),
                            source,
                        })
                })
                .await
                .map(Arc::clone);

            let pool = match created {
                Ok(pool) => pool,
                Err(err) => {
                    let mut cells = self.cells();
                    let stale = cells
                        .get(&signature)
                        .is_some_and(|current| Arc::ptr_eq(current, &cell) && !cell.initialized());
                    if stale {
                        cells.remove(&signature);
                    }
                    return Err(err);
                }
            };

            // close_all may have drained the cell while it was initializing
            let registered = {
                let mut cells = self.cells();
                match cells.get(&signature) {
                    Some(current) => Arc::ptr_eq(current, &cell),
                    None => {
                        cells.insert(signature.clone(), cell.clone());
                        true
                    }
                }
            };
            if registered {
                return Ok(pool);
            }

            tracing::info!("Discarding superseded connection pool {}", signature);
            pool.close().await;
        }
    }

    /// The registered pool for `signature`, if one has been created.
    pub fn get(&self, signature: &str) -> Option<Arc<dyn Pool>> {
        self.cells()
            .get(signature)
            .and_then(|cell| cell.get().cloned())
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.get(signature).is_some()
    }

    /// Number of pools that have been created and not yet closed.
    pub fn len(&self) -> usize {
        self.cells()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered pool and empty the registry.
    pub async fn close_all(&self) {
        let drained: Vec<(String, PoolCell)> = self.cells().drain().collect();
        for (signature, cell) in drained {
            if let Some(pool) = cell.get() {
                tracing::info!("Closing connection pool {}", signature);
                pool.close().await;
            }
        }
    }
}
