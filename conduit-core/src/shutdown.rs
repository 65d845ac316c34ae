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

//! Bounded graceful shutdown of a dispatcher
//!
//! The [ShutdownCoordinator] tracks in-flight requests through [InflightGuard]s. Once shutdown
//! begins, new requests are refused, the coordinator waits for in-flight requests to drain, and
//! past the deadline it tells the stragglers to abort through a watch channel.

use conduit_error::{Error, ErrorType::*, Result};
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{watch, Notify};
use tokio::time::{timeout_at, Instant};

/// The signal in-flight requests listen to, flipped to `true` when they must abort
pub type AbortWatch = watch::Receiver<bool>;

pub struct ShutdownCoordinator {
    accepting: AtomicBool,
    inflight: AtomicUsize,
    drained: Notify,
    abort: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        ShutdownCoordinator {
            accepting: AtomicBool::new(true),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
            abort: watch::channel(false).0,
            done: watch::channel(false).0,
        }
    }

    /// Register a new request, refused with `ShutdownInProgress` once shutdown has begun.
    ///
    /// The request counts as in flight until the returned guard is dropped.
    pub fn enter(&self) -> Result<InflightGuard<'_>> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard { coordinator: self };
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::explain(ShutdownInProgress, "client is shutting down").into_local());
        }
        Ok(guard)
    }

    fn leave(&self) {
        if self.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting requests. Return false if shutdown had already begun.
    pub fn begin(&self) -> bool {
        self.accepting.swap(false, Ordering::SeqCst)
    }

    /// Wait until no request is in flight or until `deadline`. Return whether it drained.
    pub async fn drain(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // register before checking so a wake up in between is not lost
            notified.as_mut().enable();
            let inflight = self.inflight();
            if inflight == 0 {
                return true;
            }
            debug!("waiting for {inflight} in-flight requests");
            if timeout_at(deadline, notified).await.is_err() {
                return self.inflight() == 0;
            }
        }
    }

    /// Tell every in-flight request to abort
    pub fn force_abort(&self) {
        self.abort.send_replace(true);
    }

    pub fn abort_watch(&self) -> AbortWatch {
        self.abort.subscribe()
    }

    /// Record that shutdown finished, waking up any other caller waiting on it
    pub fn finish(&self) {
        self.done.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait until `deadline` for the shutdown started elsewhere to finish.
    ///
    /// Returns false when it did not finish in time, which includes the case of a shutdown whose
    /// caller stopped polling it.
    pub async fn wait_finished(&self, deadline: Instant) -> bool {
        let mut done = self.done.subscribe();
        // the sender lives in self, the channel cannot close under us
        let finished = matches!(
            timeout_at(deadline, done.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        finished
    }
}

/// Resolve once `abort` is flipped
pub async fn aborted(abort: &mut AbortWatch) {
    if abort.wait_for(|abort| *abort).await.is_err() {
        // the coordinator is gone, nothing will ever abort this request
        futures::future::pending::<()>().await;
    }
}

/// Marks one request in flight, released when dropped
pub struct InflightGuard<'a> {
    coordinator: &'a ShutdownCoordinator,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_enter_and_refuse() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.enter().unwrap();
        assert_eq!(coordinator.inflight(), 1);
        assert!(coordinator.begin());
        assert!(!coordinator.begin());
        assert!(!coordinator.is_accepting());

        let e = coordinator.enter().err().unwrap();
        assert_eq!(e.etype(), &ShutdownInProgress);
        assert_eq!(e.esource(), &conduit_error::ErrorSource::Local);
        assert_eq!(coordinator.inflight(), 1);
        drop(guard);
        assert_eq!(coordinator.inflight(), 0);
    }

    #[tokio::test]
    async fn test_drain() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let c = coordinator.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _guard = c.enter().unwrap();
            tx.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        rx.await.unwrap();

        coordinator.begin();
        let start = Instant::now();
        assert!(coordinator.drain(start + Duration::from_secs(5)).await);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_drain_deadline_and_abort() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let c = coordinator.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let straggler = tokio::spawn(async move {
            let _guard = c.enter().unwrap();
            let mut abort = c.abort_watch();
            tx.send(()).unwrap();
            aborted(&mut abort).await;
        });
        rx.await.unwrap();

        coordinator.begin();
        let start = Instant::now();
        assert!(!coordinator.drain(start + Duration::from_millis(200)).await);
        assert!(start.elapsed() >= Duration::from_millis(200));

        coordinator.force_abort();
        straggler.await.unwrap();
        assert_eq!(coordinator.inflight(), 0);
    }

    #[tokio::test]
    async fn test_wait_finished() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let c = coordinator.clone();
        let waiter = tokio::spawn(async move {
            c.wait_finished(Instant::now() + Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!coordinator.is_finished());
        coordinator.finish();
        assert!(waiter.await.unwrap());
        assert!(coordinator.is_finished());
    }

    #[tokio::test]
    async fn test_wait_finished_gives_up_at_deadline() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.begin());
        // nobody ever finishes this shutdown
        let start = Instant::now();
        assert!(!coordinator.wait_finished(start + Duration::from_millis(100)).await);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(!coordinator.is_finished());
    }
}
