// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! One pool per destination

use conduit_error::{BError, Error, ErrorType::*, Result};
use conduit_pool::{PoolMonitor, PoolStats, ResourcePool};
use futures::future::join_all;
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};

/// Builds the pool of a destination the first time it is asked for
pub trait PoolFactory<R>: Send + Sync {
    fn create_pool(&self, addr: SocketAddr) -> ResourcePool<R>;
}

impl<R, F> PoolFactory<R> for F
where
    F: Fn(SocketAddr) -> ResourcePool<R> + Send + Sync,
{
    fn create_pool(&self, addr: SocketAddr) -> ResourcePool<R> {
        self(addr)
    }
}

struct Pools<R> {
    map: HashMap<SocketAddr, ResourcePool<R>>,
    shut_down: bool,
}

/// Lazily creates and owns the [ResourcePool] of every destination
pub struct PoolRegistry<R> {
    pools: RwLock<Pools<R>>,
    factory: Box<dyn PoolFactory<R>>,
    monitor: Option<Arc<dyn PoolMonitor>>,
}

impl<R: Send + 'static> PoolRegistry<R> {
    pub fn new(factory: impl PoolFactory<R> + 'static) -> Self {
        PoolRegistry {
            pools: RwLock::new(Pools {
                map: HashMap::new(),
                shut_down: false,
            }),
            factory: Box::new(factory),
            monitor: None,
        }
    }

    /// Report pool creation and shutdown to `monitor`
    pub fn set_monitor(&mut self, monitor: Arc<dyn PoolMonitor>) {
        self.monitor = Some(monitor);
    }

    /// Return the pool of `addr`, creating it if needed.
    ///
    /// Fails with `ShutdownInProgress` once [Self::shutdown_all] has been called.
    pub fn get(&self, addr: SocketAddr) -> Result<ResourcePool<R>> {
        {
            let pools = self.pools.read();
            if pools.shut_down {
                return Err(registry_shut_down(addr));
            }
            if let Some(pool) = pools.map.get(&addr) {
                return Ok(pool.clone());
            }
        } // read lock released here

        let pool = {
            let mut pools = self.pools.write();
            // check again since another task might have already added it
            if pools.shut_down {
                return Err(registry_shut_down(addr));
            }
            if let Some(pool) = pools.map.get(&addr) {
                return Ok(pool.clone());
            }
            let pool = self.factory.create_pool(addr);
            pools.map.insert(addr, pool.clone());
            pool
        };
        debug!("created pool {} for {addr}", pool.name());
        if let Some(monitor) = self.monitor.as_ref() {
            monitor.on_pool_created(Arc::new(pool.clone()));
        }
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.pools.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the stats of every pool
    pub fn stats(&self) -> Vec<(SocketAddr, PoolStats)> {
        self.pools
            .read()
            .map
            .iter()
            .map(|(addr, pool)| (*addr, pool.stats()))
            .collect()
    }

    /// Shut every pool down concurrently, returning once all of them are done or at `deadline`.
    pub async fn shutdown_all(&self, deadline: Instant) {
        let (pools, first) = {
            let mut pools = self.pools.write();
            let first = !pools.shut_down;
            pools.shut_down = true;
            let all: Vec<_> = pools.map.values().cloned().collect();
            (all, first)
        };
        debug!("shutting down {} pools", pools.len());

        let all = join_all(pools.iter().map(|pool| pool.shutdown(deadline)));
        if timeout_at(deadline, all).await.is_err() {
            warn!("pools did not finish shutting down before the deadline");
        }

        if first {
            if let Some(monitor) = self.monitor.as_ref() {
                for pool in pools.iter() {
                    monitor.on_pool_shutdown(pool.name(), pool.stats());
                }
            }
        }
    }
}

fn registry_shut_down(addr: SocketAddr) -> BError {
    Error::explain(
        ShutdownInProgress,
        format!("no new pool for {addr}, registry is shut down"),
    )
    .into_local()
}
