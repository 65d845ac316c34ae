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

//! TLS parameter validation
//!
//! Handshakes are not driven here. A client only checks at construction that the cipher suites
//! and protocol versions it was asked for overlap with what its [SecurityContext] supports, so a
//! misconfiguration fails fast instead of on the first request.

use conduit_error::{Error, ErrorType::*, Result};
use log::debug;
use serde::{Deserialize, Serialize};

/// Requested TLS parameters. An empty list leaves the choice to the security context.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConf {
    pub cipher_suites: Vec<String>,
    pub protocols: Vec<String>,
}

/// The cipher suites and protocol versions a TLS stack supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    cipher_suites: Vec<String>,
    protocols: Vec<String>,
}

impl SecurityContext {
    pub fn new(cipher_suites: Vec<String>, protocols: Vec<String>) -> Self {
        SecurityContext {
            cipher_suites,
            protocols,
        }
    }

    /// What the `rustls` ring provider supports, e.g. `TLS13_AES_128_GCM_SHA256` and `TLSv1.3`
    pub fn rustls() -> Self {
        let provider = rustls::crypto::ring::default_provider();
        let cipher_suites = provider
            .cipher_suites
            .iter()
            .map(|s| format!("{:?}", s.suite()))
            .collect();
        let protocols = rustls::ALL_VERSIONS
            .iter()
            .map(|v| format!("{:?}", v.version).replace('_', "."))
            .collect();
        SecurityContext::new(cipher_suites, protocols)
    }

    pub fn cipher_suites(&self) -> &[String] {
        &self.cipher_suites
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Narrow `requested` down to what this context supports.
    ///
    /// Fails with `ConfigurationError` when a non empty request has nothing in common with it.
    pub fn negotiate(&self, requested: &TlsConf) -> Result<TlsConf> {
        Ok(TlsConf {
            cipher_suites: overlap(&requested.cipher_suites, &self.cipher_suites, "cipher suites")?,
            protocols: overlap(&requested.protocols, &self.protocols, "protocols")?,
        })
    }
}

// case and `_`/`.` insensitive, so `tlsv1_2` matches `TLSv1.2`
fn same_name(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes().zip(b.bytes()).all(|(x, y)| {
            let norm = |c: u8| if c == b'_' { b'.' } else { c.to_ascii_lowercase() };
            norm(x) == norm(y)
        })
}

fn overlap(requested: &[String], supported: &[String], what: &str) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(supported.to_vec());
    }
    let found: Vec<String> = requested
        .iter()
        .filter_map(|r| supported.iter().find(|s| same_name(r, s)).cloned())
        .collect();
    if found.is_empty() {
        return Err(Error::explain(
            ConfigurationError,
            format!(
                "None of the requested {what}: [{}] are found in the security context",
                requested.join(", ")
            ),
        )
        .into_local());
    }
    if found.len() < requested.len() {
        debug!("unsupported {what} dropped from {requested:?}");
    }
    Ok(found)
}

/// Check the requested parameters against the security context at client construction.
///
/// Returns the parameters to use, `None` when no TLS parameters were requested.
pub fn validate(
    context: Option<&SecurityContext>,
    requested: Option<&TlsConf>,
) -> Result<Option<TlsConf>> {
    match (requested, context) {
        (None, _) => Ok(None),
        (Some(_), None) => Err(Error::explain(
            ConfigurationError,
            "TLS parameters passed with no security context",
        )
        .into_local()),
        (Some(requested), Some(context)) => context.negotiate(requested).map(Some),
    }
}
