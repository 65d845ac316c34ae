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

//! Running requests over pooled connections

use bytes::{Bytes, BytesMut};
use conduit_error::{BError, Error, ErrorType::*, OkOrErr, Result};
use conduit_pool::{Lifecycle, PoolMonitor, PoolStats, ResourcePool};
use http::uri::Scheme;
use http::Uri;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::conf::ClientConf;
use crate::connectors::HttpLifecycle;
use crate::protocols::{Http1Session, Request, Response, ResponseHeader, Session};
use crate::registry::PoolRegistry;
use crate::resolver::{DnsResolver, Resolver};
use crate::shutdown::{aborted, ShutdownCoordinator};
use crate::tls::{self, SecurityContext, TlsConf};

/// Sends requests to any destination through one pool of sessions per destination.
///
/// Each request runs under the request timeout, from acquiring a session to reading the last
/// byte of the body. A session goes back to its pool only after a clean exchange; on any error,
/// timeout included, it is destroyed.
pub struct RequestDispatcher<S: Session> {
    conf: ClientConf,
    registry: PoolRegistry<S>,
    resolver: Box<dyn Resolver>,
    tls: Option<TlsConf>,
    coordinator: ShutdownCoordinator,
}

impl RequestDispatcher<Http1Session> {
    /// A dispatcher of plain HTTP/1.1 connections, with TLS parameters checked against the
    /// rustls provider.
    pub fn http(conf: ClientConf) -> Result<Self> {
        let connect_timeout = conf.connect_timeout();
        Self::new(
            conf,
            Some(&SecurityContext::rustls()),
            move |addr| -> Arc<dyn Lifecycle<Http1Session>> {
                Arc::new(HttpLifecycle::new(addr, connect_timeout))
            },
        )
    }
}

impl<S: Session> RequestDispatcher<S> {
    /// Create a dispatcher whose pools use the [Lifecycle] `lifecycle` returns for each address.
    ///
    /// Fails with `ConfigurationError` when `conf` is invalid or when its TLS parameters do not
    /// fit `security`.
    pub fn new<F>(conf: ClientConf, security: Option<&SecurityContext>, lifecycle: F) -> Result<Self>
    where
        F: Fn(SocketAddr) -> Arc<dyn Lifecycle<S>> + Send + Sync + 'static,
    {
        let conf = conf.validate()?;
        let tls = tls::validate(security, conf.tls.as_ref())?;
        let pool_conf = conf.pool_conf();
        let registry = PoolRegistry::new(move |addr: SocketAddr| {
            ResourcePool::new(addr.to_string(), pool_conf.clone(), lifecycle(addr))
        });
        Ok(RequestDispatcher {
            conf,
            registry,
            resolver: Box::new(DnsResolver),
            tls,
            coordinator: ShutdownCoordinator::new(),
        })
    }

    pub fn with_resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn PoolMonitor>) -> Self {
        self.registry.set_monitor(monitor);
        self
    }

    pub fn conf(&self) -> &ClientConf {
        &self.conf
    }

    /// The TLS parameters agreed with the security context, if any were requested
    pub fn tls_params(&self) -> Option<&TlsConf> {
        self.tls.as_ref()
    }

    /// The stats of the pool of every destination contacted so far
    pub fn stats(&self) -> Vec<(SocketAddr, PoolStats)> {
        self.registry.stats()
    }

    /// Send `req` and read the whole response.
    ///
    /// Every failure is a `RemoteInvocationError` caused by what actually went wrong.
    pub async fn request(&self, req: Request) -> Result<Response> {
        let context = format!("{} {}", req.method, req.uri);
        self.do_request(req)
            .await
            .map_err(|e| Error::because(RemoteInvocationError, context, e))
    }

    async fn do_request(&self, req: Request) -> Result<Response> {
        let _inflight = self.coordinator.enter()?;
        let mut abort = self.coordinator.abort_watch();
        let timeout = self.conf.request_timeout();
        let deadline = Instant::now() + timeout;

        let addr = self.resolve(&req.uri, deadline).await?;
        let pool = self.registry.get(addr)?;

        // ACQUIRING
        let acquire_deadline = deadline.min(Instant::now() + pool.conf().waiter_timeout);
        let mut session = tokio::select! {
            biased;
            _ = aborted(&mut abort) => return Err(shutdown_abort()),
            acquired = pool.get_until(acquire_deadline) => match acquired {
                Ok(session) => session,
                Err(e) if e.etype() == &PoolExhausted && acquire_deadline == deadline => {
                    return Error::e_because(
                        RequestTimedout,
                        format!("no connection to {addr} within {timeout:?}"),
                        e,
                    );
                }
                Err(e) => return Err(e),
            },
        };

        // IN_FLIGHT
        let outcome = tokio::select! {
            biased;
            _ = aborted(&mut abort) => Err(shutdown_abort()),
            _ = sleep_until(deadline) => Err(Error::explain(
                RequestTimedout,
                format!("request timeout {timeout:?} exceeded"),
            )
            .into_remote()),
            res = exchange(
                &mut session,
                &req,
                self.conf.max_header_size,
                self.conf.max_response_size,
            ) => res,
        };

        match outcome {
            Ok((header, body)) => {
                let remote_addr = session.peer_addr().unwrap_or(addr);
                pool.put(session);
                debug!("{} {} -> {} from {remote_addr}", req.method, req.uri, header.status);
                let mut response = Response::new(header, body);
                response.remote_addr = Some(remote_addr);
                Ok(response)
            }
            Err(e) => {
                debug!("{} {} failed, disposing of the connection: {e}", req.method, req.uri);
                pool.dispose(session);
                Err(e)
            }
        }
    }

    async fn resolve(&self, uri: &Uri, deadline: Instant) -> Result<SocketAddr> {
        let host = uri
            .host()
            .or_err(UnresolvedDestination, "request URI has no host")
            .map_err(|e| e.into_local())?;
        let default_port = if uri.scheme() == Some(&Scheme::HTTPS) {
            443
        } else {
            80
        };
        let port = uri.port_u16().unwrap_or(default_port);
        match timeout_at(deadline, self.resolver.resolve(host, port)).await {
            Ok(resolved) => resolved,
            Err(_) => {
                let e = Error::explain(RequestTimedout, format!("timeout resolving {host}"));
                Err(e.into_remote())
            }
        }
    }

    /// Stop accepting requests and release every connection, within the shutdown timeout.
    ///
    /// In-flight requests get until the shutdown timeout to finish, the remaining ones then fail
    /// with `RequestTimedout`. Calling this again waits for the first call to finish.
    pub async fn shutdown(&self) {
        let deadline = Instant::now() + self.conf.shutdown_timeout();
        if !self.coordinator.begin() {
            if self.coordinator.wait_finished(deadline).await {
                return;
            }
            // the first caller went away before finishing, take over with no grace period
            warn!("earlier shutdown did not finish in time, forcing it");
            self.coordinator.force_abort();
            self.registry.shutdown_all(Instant::now()).await;
            self.coordinator.finish();
            return;
        }
        info!(
            "shutting down, {} requests in flight",
            self.coordinator.inflight()
        );
        if !self.coordinator.drain(deadline).await {
            warn!(
                "{} requests still in flight at the shutdown deadline, aborting them",
                self.coordinator.inflight()
            );
            self.coordinator.force_abort();
        }
        self.registry.shutdown_all(deadline).await;
        self.coordinator.finish();
        info!("shut down");
    }
}

async fn exchange<S: Session>(
    session: &mut S,
    req: &Request,
    max_header_size: usize,
    max_response_size: usize,
) -> Result<(ResponseHeader, Bytes)> {
    session.write_request(req).await?;
    let header = session.read_response_header(max_header_size).await?;
    let mut body = BytesMut::new();
    while let Some(chunk) = session.read_body().await? {
        if body.len() + chunk.len() > max_response_size {
            return Err(Error::explain(
                ResponseTooLarge,
                format!("response body exceeds {max_response_size} bytes"),
            )
            .into_remote());
        }
        body.extend_from_slice(&chunk);
    }
    Ok((header, body.freeze()))
}

fn shutdown_abort() -> BError {
    Error::explain(RequestTimedout, "shutdown timeout exceeded").into_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_error::ErrorSource;
    use async_trait::async_trait;
    use http::{HeaderMap, HeaderValue, StatusCode, Version};
    use std::time::Duration;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    // replies according to the request path: /size/<n>, /hang or /fail
    #[derive(Default)]
    struct MockSession {
        path: String,
        remaining: usize,
        done: bool,
    }

    #[async_trait]
    impl Session for MockSession {
        async fn write_request(&mut self, req: &Request) -> Result<()> {
            self.path = req.path_and_query().to_string();
            self.done = false;
            Ok(())
        }

        async fn read_response_header(&mut self, _max: usize) -> Result<ResponseHeader> {
            if self.path == "/hang" {
                futures::future::pending::<()>().await;
            }
            if self.path == "/fail" {
                return Error::e_explain(ConnectionClosed, "mock");
            }
            let size: usize = self
                .path
                .trim_start_matches("/size/")
                .parse()
                .unwrap_or(0);
            self.remaining = size;
            let mut headers = HeaderMap::new();
            headers.insert("content-length", HeaderValue::from(size));
            Ok(ResponseHeader {
                status: StatusCode::OK,
                version: Version::HTTP_11,
                reason: None,
                headers,
            })
        }

        async fn read_body(&mut self) -> Result<Option<Bytes>> {
            if self.remaining == 0 {
                self.done = true;
                return Ok(None);
            }
            let n = self.remaining.min(1000);
            self.remaining -= n;
            Ok(Some(Bytes::from(vec![b'x'; n])))
        }

        fn reusable(&self) -> bool {
            self.done
        }
    }

    struct MockConnector {
        hang: bool,
    }

    #[async_trait]
    impl Lifecycle<MockSession> for MockConnector {
        async fn create(&self) -> Result<MockSession> {
            if self.hang {
                futures::future::pending::<()>().await;
            }
            Ok(MockSession::default())
        }
        fn validate_put(&self, session: &MockSession) -> bool {
            session.reusable()
        }
        async fn destroy(&self, _session: MockSession, _error: bool) {}
    }

    fn dispatcher_with(conf: ClientConf, hang: bool) -> RequestDispatcher<MockSession> {
        RequestDispatcher::new(conf, None, move |_addr| -> Arc<dyn Lifecycle<MockSession>> {
            Arc::new(MockConnector { hang })
        })
        .unwrap()
    }

    fn dispatcher(conf: ClientConf) -> RequestDispatcher<MockSession> {
        dispatcher_with(conf, false)
    }

    fn req(path: &str) -> Request {
        Request::get(format!("http://10.0.0.1{path}").parse().unwrap())
    }

    fn small_conf() -> ClientConf {
        let mut conf = ClientConf {
            request_timeout_ms: 500,
            shutdown_timeout_ms: 300,
            max_response_size: 4096,
            ..Default::default()
        };
        conf.pool.max_size = 1;
        conf
    }

    #[tokio::test]
    async fn test_reuse() {
        init_log();
        let dispatcher = dispatcher(small_conf());
        let resp = dispatcher.request(req("/size/10")).await.unwrap();
        assert_eq!(resp.body.len(), 10);
        assert_eq!(resp.remote_addr, Some("10.0.0.1:80".parse().unwrap()));
        dispatcher.request(req("/size/20")).await.unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.len(), 1);
        let (addr, stats) = &stats[0];
        assert_eq!(addr, &"10.0.0.1:80".parse::<SocketAddr>().unwrap());
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_body_limit() {
        init_log();
        let dispatcher = dispatcher(small_conf());
        let resp = dispatcher.request(req("/size/4096")).await.unwrap();
        assert_eq!(resp.body.len(), 4096);

        let e = dispatcher.request(req("/size/4097")).await.unwrap_err();
        assert_eq!(e.etype(), &RemoteInvocationError);
        assert_eq!(e.root_etype(), &ResponseTooLarge);
        assert_eq!(e.esource(), &ErrorSource::Remote);
        let stats = dispatcher.stats().remove(0).1;
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.total_destroyed, 1);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        init_log();
        let dispatcher = dispatcher(small_conf());
        let start = Instant::now();
        let e = dispatcher.request(req("/hang")).await.unwrap_err();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
        assert_eq!(e.root_etype(), &RequestTimedout);
        assert!(e.is_timeout());
        assert_eq!(dispatcher.stats()[0].1.total_destroyed, 1);
    }

    #[tokio::test]
    async fn test_transport_error_disposes() {
        init_log();
        let dispatcher = dispatcher(small_conf());
        let e = dispatcher.request(req("/fail")).await.unwrap_err();
        assert_eq!(e.etype_chain(), vec![&RemoteInvocationError, &ConnectionClosed]);
        assert_eq!(dispatcher.stats()[0].1.total_destroyed, 1);
    }

    #[tokio::test]
    async fn test_acquire_bounded_by_request_timeout() {
        init_log();
        let dispatcher = dispatcher_with(small_conf(), true);
        let start = Instant::now();
        let e = dispatcher.request(req("/size/1")).await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(
            e.etype_chain(),
            vec![&RemoteInvocationError, &RequestTimedout, &PoolExhausted]
        );
        // the destination was never reached
        assert_eq!(e.esource(), &ErrorSource::Local);
    }

    #[tokio::test]
    async fn test_waiter_timeout() {
        init_log();
        let mut conf = small_conf();
        conf.pool.waiter_timeout_ms = 100;
        let dispatcher = Arc::new(dispatcher(conf));
        let d = dispatcher.clone();
        // holds the only connection
        let hanging = tokio::spawn(async move { d.request(req("/hang")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let e = dispatcher.request(req("/size/1")).await.unwrap_err();
        assert_eq!(e.etype_chain(), vec![&RemoteInvocationError, &PoolExhausted]);
        assert!(hanging.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_requests() {
        init_log();
        let dispatcher = dispatcher(small_conf());
        dispatcher.request(req("/size/1")).await.unwrap();
        dispatcher.shutdown().await;
        let e = dispatcher.request(req("/size/1")).await.unwrap_err();
        assert_eq!(e.root_etype(), &ShutdownInProgress);
        // idempotent
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stragglers() {
        init_log();
        let mut conf = small_conf();
        conf.request_timeout_ms = 10_000;
        let dispatcher = Arc::new(dispatcher(conf));
        let d = dispatcher.clone();
        let hanging = tokio::spawn(async move { d.request(req("/hang")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        dispatcher.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(2));

        let e = hanging.await.unwrap().unwrap_err();
        assert_eq!(e.root_etype(), &RequestTimedout);
        assert_eq!(
            e.chain().last().and_then(|e| e.context_str()),
            Some("shutdown timeout exceeded")
        );
    }

    #[tokio::test]
    async fn test_shutdown_after_abandoned_shutdown() {
        init_log();
        let mut conf = small_conf();
        conf.request_timeout_ms = 10_000;
        let dispatcher = Arc::new(dispatcher(conf));
        let d = dispatcher.clone();
        let hanging = tokio::spawn(async move { d.request(req("/hang")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the first shutdown is dropped while it waits for the hanging request to drain
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), dispatcher.shutdown()).await;
        assert!(abandoned.is_err());

        let start = Instant::now();
        let second = tokio::time::timeout(Duration::from_secs(2), dispatcher.shutdown()).await;
        assert!(second.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(300));

        let e = hanging.await.unwrap().unwrap_err();
        assert_eq!(
            e.chain().last().and_then(|e| e.context_str()),
            Some("shutdown timeout exceeded")
        );
        let e = dispatcher.request(req("/size/1")).await.unwrap_err();
        assert_eq!(e.root_etype(), &ShutdownInProgress);

        // finished now, later calls return right away
        let third = tokio::time::timeout(Duration::from_millis(50), dispatcher.shutdown()).await;
        assert!(third.is_ok());
    }

    #[test]
    fn test_tls_without_security_context() {
        let conf = ClientConf {
            tls: Some(TlsConf {
                cipher_suites: vec!["TLS13_AES_128_GCM_SHA256".to_string()],
                protocols: vec![],
            }),
            ..Default::default()
        };
        let e = RequestDispatcher::new(conf, None, |_addr| -> Arc<dyn Lifecycle<MockSession>> {
            Arc::new(MockConnector { hang: false })
        })
        .err()
        .unwrap();
        assert_eq!(e.etype(), &ConfigurationError);
        assert_eq!(
            e.context_str(),
            Some("TLS parameters passed with no security context")
        );
    }

    #[test]
    fn test_tls_params_negotiated() {
        let conf = ClientConf {
            tls: Some(TlsConf {
                cipher_suites: vec![],
                protocols: vec!["TLSv1.3".to_string(), "SSLv3".to_string()],
            }),
            ..Default::default()
        };
        let dispatcher = RequestDispatcher::http(conf).unwrap();
        let tls = dispatcher.tls_params().unwrap();
        assert_eq!(tls.protocols, vec!["TLSv1.3".to_string()]);
    }
}
