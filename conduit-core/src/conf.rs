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

//! Client configuration
//!
//! The configuration is loaded from YAML. All durations are in milliseconds.

use conduit_error::{Error, ErrorType::*, OrErr, Result};
use conduit_pool::{PoolConf, Strategy};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::tls::TlsConf;

/// The configuration of a [crate::dispatcher::RequestDispatcher] and of the pools it creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConf {
    /// The deadline of a whole request, acquiring a connection included
    pub request_timeout_ms: u64,
    /// TCP connect timeout when the pool creates a connection
    pub connect_timeout_ms: u64,
    /// How long a pooled connection may stay idle, 0 keeps it forever
    pub idle_timeout_ms: u64,
    /// How long [crate::dispatcher::RequestDispatcher::shutdown()] waits for in-flight requests
    pub shutdown_timeout_ms: u64,
    /// Max bytes of a response body
    pub max_response_size: usize,
    /// Max bytes of a response head, status line included
    pub max_header_size: usize,
    pub pool: PoolSettings,
    /// Requested TLS parameters, checked against the security context at construction
    pub tls: Option<TlsConf>,
}

/// The per destination pool section of [ClientConf]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_size: usize,
    pub min_size: usize,
    /// How long a request may wait in the pool's queue for a connection
    pub waiter_timeout_ms: u64,
    pub strategy: Strategy,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// First backoff step when `min_backoff_ms` is 0, defaults to max(10, max_backoff_ms / 32)
    pub initial_backoff_ms: Option<u64>,
}

impl Default for ClientConf {
    fn default() -> Self {
        ClientConf {
            request_timeout_ms: 10_000,
            connect_timeout_ms: 3_000,
            idle_timeout_ms: 25_000,
            shutdown_timeout_ms: 15_000,
            max_response_size: 2 * 1024 * 1024,
            max_header_size: 8 * 1024,
            pool: PoolSettings::default(),
            tls: None,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_size: 200,
            min_size: 0,
            waiter_timeout_ms: 10_000,
            strategy: Strategy::MostRecentlyUsed,
            min_backoff_ms: 0,
            max_backoff_ms: 5_000,
            initial_backoff_ms: None,
        }
    }
}

impl ClientConf {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(FileReadError, || {
            format!("Unable to read conf file from {path}")
        })
        .map_err(|e| e.into_local())?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: ClientConf = serde_yaml::from_str(conf_str).or_err_with(ConfigurationError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })
        .map_err(|e| e.into_local())?;
        trace!("Loaded conf: {conf:?}");
        conf.validate()
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).or_err(InternalError, "Unable to serialize conf")
    }

    pub fn validate(self) -> Result<Self> {
        fn check(ok: bool, what: &'static str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::explain(ConfigurationError, what).into_local())
            }
        }
        check(self.request_timeout_ms > 0, "request_timeout_ms must be positive")?;
        check(self.max_response_size > 0, "max_response_size must be positive")?;
        check(self.max_header_size > 0, "max_header_size must be positive")?;
        check(self.pool.max_size > 0, "pool.max_size must be positive")?;
        check(
            self.pool.min_size <= self.pool.max_size,
            "pool.min_size must not exceed pool.max_size",
        )?;
        check(
            self.pool.min_backoff_ms <= self.pool.max_backoff_ms,
            "pool.min_backoff_ms must not exceed pool.max_backoff_ms",
        )?;
        if let Some(tls) = self.tls.as_ref() {
            check(
                !tls.cipher_suites.is_empty() || !tls.protocols.is_empty(),
                "tls section requests neither cipher suites nor protocols",
            )?;
        }
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// The settings of every destination pool
    pub fn pool_conf(&self) -> PoolConf {
        let pool = &self.pool;
        PoolConf {
            max_size: pool.max_size,
            min_size: pool.min_size,
            idle_timeout: (self.idle_timeout_ms > 0)
                .then(|| Duration::from_millis(self.idle_timeout_ms)),
            waiter_timeout: Duration::from_millis(pool.waiter_timeout_ms),
            strategy: pool.strategy,
            min_backoff: Duration::from_millis(pool.min_backoff_ms),
            max_backoff: Duration::from_millis(pool.max_backoff_ms),
            initial_backoff: pool.initial_backoff_ms.map(Duration::from_millis),
        }
    }
}
