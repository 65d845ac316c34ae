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

//! Destination name resolution

use async_trait::async_trait;
use conduit_error::{Error, ErrorType::*, Result};
use log::debug;
use std::net::SocketAddr;

/// Turns a host and port into the address that keys a connection pool
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr>;
}

/// Resolve through the system resolver, picking the first address returned
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        // IPv6 literals come bracketed from the URI authority
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse() {
            return Ok(SocketAddr::new(ip, port));
        }
        let mut addrs = match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                let e = Error::because(UnresolvedDestination, format!("{host}:{port}"), e);
                return Err(e.into_remote());
            }
        };
        match addrs.next() {
            Some(addr) => {
                debug!("resolved {host}:{port} to {addr}");
                Ok(addr)
            }
            None => Err(Error::explain(
                UnresolvedDestination,
                format!("{host}:{port} has no address"),
            )
            .into_remote()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_ip_literal() {
        let addr = DnsResolver.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
        let addr = DnsResolver.resolve("[::1]", 443).await.unwrap();
        assert_eq!(addr, "[::1]:443".parse().unwrap());
    }

    #[tokio::test]
    async fn unresolvable() {
        let e = DnsResolver
            .resolve("does-not-exist.invalid", 80)
            .await
            .unwrap_err();
        assert_eq!(e.etype(), &UnresolvedDestination);
        assert_eq!(e.esource(), &conduit_error::ErrorSource::Remote);
    }
}
