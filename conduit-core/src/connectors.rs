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

//! Establishing connections for the pools

use async_trait::async_trait;
use conduit_error::{Error, ErrorType::*, OrErr, Result};
use conduit_pool::{Lifecycle, LifecycleStats};
use log::debug;
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;

use crate::protocols::{Http1Session, Session};

fn wrap_connect_error(e: std::io::Error, context: String) -> Box<Error> {
    let etype = match e.kind() {
        ErrorKind::ConnectionRefused => ConnectRefused,
        ErrorKind::TimedOut => ConnectTimedout,
        _ => ConnectError,
    };
    Error::because(etype, context, e).into_remote()
}

/// Connect to `addr`, giving up after `connect_timeout`
pub async fn connect_tcp(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = connect_within(addr, connect_timeout, TcpStream::connect(addr)).await?;
    stream
        .set_nodelay(true)
        .or_err(ConnectError, "failed to set TCP_NODELAY")
        .map_err(|e| e.into_local())?;
    Ok(stream)
}

async fn connect_within<S, F>(addr: SocketAddr, connect_timeout: Duration, connect: F) -> Result<S>
where
    F: Future<Output = std::io::Result<S>>,
{
    match tokio::time::timeout(connect_timeout, connect).await {
        Ok(res) => res.map_err(|e| wrap_connect_error(e, format!("connecting to {addr}"))),
        Err(_) => Err(Error::explain(
            ConnectTimedout,
            format!("timeout {connect_timeout:?} connecting to {addr}"),
        )
        .into_remote()),
    }
}

/// The [Lifecycle] of plain HTTP/1.1 connections to one destination
pub struct HttpLifecycle {
    addr: SocketAddr,
    connect_timeout: Duration,
    created: AtomicU64,
    destroyed: AtomicU64,
    create_errors: AtomicU64,
}

impl HttpLifecycle {
    pub fn new(addr: SocketAddr, connect_timeout: Duration) -> Self {
        HttpLifecycle {
            addr,
            connect_timeout,
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            create_errors: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Lifecycle<Http1Session> for HttpLifecycle {
    async fn create(&self) -> Result<Http1Session> {
        match connect_tcp(self.addr, self.connect_timeout).await {
            Ok(stream) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!("connected to {}", self.addr);
                Ok(Http1Session::new(Box::new(stream)).with_peer(self.addr))
            }
            Err(e) => {
                self.create_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn validate_put(&self, session: &Http1Session) -> bool {
        session.reusable()
    }

    async fn destroy(&self, mut session: Http1Session, error: bool) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        // a failed exchange leaves the stream in an unknown state, just drop it
        if !error {
            session.shutdown().await;
        }
    }

    fn stats(&self) -> LifecycleStats {
        LifecycleStats {
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            create_errors: self.create_errors.load(Ordering::Relaxed),
            destroy_errors: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_error::ErrorSource;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_refused() {
        // grab a free port then release it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let lifecycle = HttpLifecycle::new(addr, Duration::from_secs(1));
        let e = lifecycle.create().await.err().unwrap();
        assert_eq!(e.etype(), &ConnectRefused);
        assert_eq!(e.esource(), &ErrorSource::Remote);
        assert_eq!(lifecycle.stats().create_errors, 1);
    }

    #[tokio::test]
    async fn connect_timeout() {
        let addr = "10.0.0.1:80".parse().unwrap();
        // a peer that never answers the handshake
        let never = std::future::pending::<std::io::Result<TcpStream>>();
        let start = std::time::Instant::now();
        let e = connect_within(addr, Duration::from_millis(50), never)
            .await
            .err()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(e.etype(), &ConnectTimedout);
        assert_eq!(e.esource(), &ErrorSource::Remote);
        assert_eq!(
            e.context_str(),
            Some("timeout 50ms connecting to 10.0.0.1:80")
        );
    }

    #[tokio::test]
    async fn connect_io_error_kinds() {
        let addr = "10.0.0.1:80".parse().unwrap();
        let timed_out = async { Err::<TcpStream, _>(std::io::Error::from(ErrorKind::TimedOut)) };
        let e = connect_within(addr, Duration::from_secs(1), timed_out)
            .await
            .err()
            .unwrap();
        assert_eq!(e.etype(), &ConnectTimedout);

        let reset = async { Err::<TcpStream, _>(std::io::Error::from(ErrorKind::ConnectionReset)) };
        let e = connect_within(addr, Duration::from_secs(1), reset)
            .await
            .err()
            .unwrap();
        assert_eq!(e.etype(), &ConnectError);
        assert_eq!(e.esource(), &ErrorSource::Remote);
    }

    #[tokio::test]
    async fn connect_and_destroy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let lifecycle = HttpLifecycle::new(addr, Duration::from_secs(1));
        let session = lifecycle.create().await.unwrap();
        let _accepted = listener.accept().await.unwrap();
        assert_eq!(session.peer_addr(), Some(addr));
        assert!(lifecycle.validate_put(&session));

        lifecycle.destroy(session, false).await;
        let stats = lifecycle.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.destroyed, 1);
    }
}
