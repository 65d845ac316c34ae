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

use std::sync::Arc;
use std::time::Duration;

use crate::lifecycle::LifecycleStats;

/// A point in time snapshot of a pool
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    pub min_size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub creating: usize,
    pub waiters: usize,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub total_create_errors: u64,
    pub total_timeouts: u64,
    /// the current spacing between creation attempts
    pub backoff: Duration,
    pub lifecycle: LifecycleStats,
}

impl PoolStats {
    /// Resources the pool accounts for against `max_size`
    pub fn size(&self) -> usize {
        self.idle + self.in_use + self.creating
    }
}

/// Live view of one pool, handed to a [PoolMonitor].
pub trait PoolStatsProvider: Send + Sync {
    fn name(&self) -> &str;
    fn stats(&self) -> PoolStats;
}

/// Receives pool life events, for example to register pools with a metrics system.
pub trait PoolMonitor: Send + Sync {
    fn on_pool_created(&self, pool: Arc<dyn PoolStatsProvider>);
    fn on_pool_shutdown(&self, name: &str, last: PoolStats);
}
