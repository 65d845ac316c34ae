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

//! Generic asynchronous resource pooling
//!
//! A [ResourcePool] holds a bounded number of reusable resources for a single destination. The
//! resources themselves are produced and torn down by a caller supplied [Lifecycle]. Callers that
//! find no idle resource wait in a FIFO queue until one is returned, created, or their deadline
//! passes. Creation failures back off exponentially so an unhealthy destination only sees a trickle
//! of attempts.

#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::type_complexity)]

mod lifecycle;
mod pool;
mod stats;

pub use lifecycle::{Lifecycle, LifecycleStats};
pub use pool::{PoolConf, ResourcePool, Strategy};
pub use stats::{PoolMonitor, PoolStats, PoolStatsProvider};
