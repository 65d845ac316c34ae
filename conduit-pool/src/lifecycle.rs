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

use async_trait::async_trait;
use conduit_error::Result;

/// Counters a [Lifecycle] may report about its own activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LifecycleStats {
    pub created: u64,
    pub destroyed: u64,
    pub create_errors: u64,
    pub destroy_errors: u64,
}

/// How a [crate::ResourcePool] creates, checks and tears down its resources.
///
/// The pool only calls `create` from a task of its own, so a slow or never finishing `create` never
/// blocks a caller beyond that caller's deadline.
#[async_trait]
pub trait Lifecycle<R>: Send + Sync {
    /// Produce a new resource.
    async fn create(&self) -> Result<R>;

    /// Check an idle resource before it is handed out. Failing resources are destroyed.
    fn validate_get(&self, _resource: &R) -> bool {
        true
    }

    /// Check a resource coming back from a caller. Failing resources are destroyed.
    fn validate_put(&self, _resource: &R) -> bool {
        true
    }

    /// Tear the resource down. `error` tells whether it is being dropped because it misbehaved.
    async fn destroy(&self, resource: R, error: bool);

    fn stats(&self) -> LifecycleStats {
        LifecycleStats::default()
    }
}
