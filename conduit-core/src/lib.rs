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

#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::type_complexity)]

//! # conduit
//!
//! The transport core of an RPC client: one bounded [pool](conduit_pool::ResourcePool) of
//! connections per destination, a [RequestDispatcher](dispatcher::RequestDispatcher) that runs
//! requests over pooled connections under a request deadline and response size limits, and a
//! bounded graceful shutdown of both.
//!
//! ```no_run
//! use conduit_core::conf::ClientConf;
//! use conduit_core::dispatcher::RequestDispatcher;
//! use conduit_core::protocols::Request;
//!
//! # async fn run() -> conduit_error::Result<()> {
//! let dispatcher = RequestDispatcher::http(ClientConf::default())?;
//! let req = Request::get("http://127.0.0.1:8080/status".parse().unwrap());
//! let resp = dispatcher.request(req).await?;
//! println!("{} {} bytes", resp.status, resp.body.len());
//! dispatcher.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod conf;
pub mod connectors;
pub mod dispatcher;
pub mod protocols;
pub mod registry;
pub mod resolver;
pub mod shutdown;
pub mod tls;

pub use conduit_error::{ErrorType::*, *};
pub use conduit_pool::{
    Lifecycle, LifecycleStats, PoolConf, PoolMonitor, PoolStats, PoolStatsProvider, ResourcePool,
    Strategy,
};

pub mod prelude {
    pub use crate::conf::ClientConf;
    pub use crate::dispatcher::RequestDispatcher;
    pub use crate::protocols::{Request, Response};
}
