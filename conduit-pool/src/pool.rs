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

//! The bounded resource pool

use conduit_error::{BError, Error, ErrorType::*, Result};
use conduit_limits::RateLimiter;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::{sleep, sleep_until, timeout_at, Instant};

use crate::lifecycle::Lifecycle;
use crate::stats::{PoolStats, PoolStatsProvider};

/// Which idle resource to hand out first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// The most recently returned one, keeping a warm working set
    #[default]
    #[serde(alias = "mru")]
    MostRecentlyUsed,
    /// The one idle for the longest time, spreading usage evenly
    #[serde(alias = "lru")]
    LeastRecentlyUsed,
}

/// Settings of one [ResourcePool]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConf {
    pub max_size: usize,
    pub min_size: usize,
    /// idle resources older than this are destroyed, `None` keeps them forever
    pub idle_timeout: Option<Duration>,
    /// how long [ResourcePool::get()] waits for a resource
    pub waiter_timeout: Duration,
    pub strategy: Strategy,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// first backoff step when `min_backoff` is zero, see [RateLimiter]
    pub initial_backoff: Option<Duration>,
}

impl Default for PoolConf {
    fn default() -> Self {
        PoolConf {
            max_size: 200,
            min_size: 0,
            idle_timeout: Some(Duration::from_secs(25)),
            waiter_timeout: Duration::from_secs(10),
            strategy: Strategy::MostRecentlyUsed,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(5),
            initial_backoff: None,
        }
    }
}

impl PoolConf {
    fn rate_limiter(&self) -> RateLimiter {
        let limiter = RateLimiter::new(self.min_backoff, self.max_backoff);
        match self.initial_backoff {
            Some(step) => limiter.with_initial_step(step),
            None => limiter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    // no new callers, waiting for checked out resources to come back
    Draining,
    Terminated,
}

struct IdleEntry<R> {
    resource: R,
    since: StdInstant,
}

struct Waiter<R> {
    id: u64,
    enqueued_at: StdInstant,
    tx: oneshot::Sender<Result<R>>,
}

struct PoolState<R> {
    phase: Phase,
    // oldest return at the front
    idle: VecDeque<IdleEntry<R>>,
    waiters: VecDeque<Waiter<R>>,
    in_use: usize,
    creating: usize,
    limiter: RateLimiter,
    retry_pending: bool,
    next_waiter_id: u64,
    total_created: u64,
    total_destroyed: u64,
    total_create_errors: u64,
    total_timeouts: u64,
}

impl<R> PoolState<R> {
    fn new(limiter: RateLimiter) -> Self {
        PoolState {
            phase: Phase::Running,
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            in_use: 0,
            creating: 0,
            limiter,
            retry_pending: false,
            next_waiter_id: 0,
            total_created: 0,
            total_destroyed: 0,
            total_create_errors: 0,
            total_timeouts: 0,
        }
    }

    fn size(&self) -> usize {
        self.idle.len() + self.in_use + self.creating
    }

    // waiters not covered by a pending creation, or a pool below its floor
    fn wants_resource(&self, min_size: usize) -> bool {
        self.waiters.len() > self.creating || self.size() < min_size
    }

    fn pop_idle(&mut self, strategy: Strategy) -> Option<R> {
        let entry = match strategy {
            Strategy::MostRecentlyUsed => self.idle.pop_back(),
            Strategy::LeastRecentlyUsed => self.idle.pop_front(),
        };
        entry.map(|e| e.resource)
    }

    fn enqueue_waiter(&mut self) -> (u64, oneshot::Receiver<Result<R>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        self.waiters.push_back(Waiter {
            id,
            enqueued_at: StdInstant::now(),
            tx,
        });
        (id, rx)
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    // The oldest waiter gets the resource, otherwise it goes idle. Only called while running.
    fn hand_off(&mut self, mut resource: R) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(Ok(resource)) {
                Ok(()) => {
                    self.in_use += 1;
                    trace!(
                        "waiter {} served after {:?}",
                        waiter.id,
                        waiter.enqueued_at.elapsed()
                    );
                    return;
                }
                // the receiver is gone, try the next one
                Err(returned) => match returned {
                    Ok(r) => resource = r,
                    Err(_) => return,
                },
            }
        }
        self.idle.push_back(IdleEntry {
            resource,
            since: StdInstant::now(),
        });
    }

    fn fail_oldest_waiter(&mut self, mut error: BError) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(Err(error)) {
                Ok(()) => return,
                Err(returned) => match returned {
                    Err(e) => error = e,
                    Ok(_) => return,
                },
            }
        }
    }

    // Take back a checked out resource. Return it if it has to be destroyed instead.
    fn release(&mut self, resource: R) -> Option<R> {
        self.in_use = self.in_use.saturating_sub(1);
        if self.phase != Phase::Running {
            self.total_destroyed += 1;
            return Some(resource);
        }
        self.hand_off(resource);
        None
    }
}

struct PoolInner<R> {
    name: String,
    conf: PoolConf,
    lifecycle: Arc<dyn Lifecycle<R>>,
    state: Mutex<PoolState<R>>,
    // pinged whenever a checked out resource comes back
    returned: Notify,
    terminated: watch::Sender<bool>,
}

/// A bounded pool of resources for one destination.
///
/// `idle + in_use + creating` never exceeds `max_size`. Cloning the pool gives another handle to
/// the same resources.
pub struct ResourcePool<R> {
    inner: Arc<PoolInner<R>>,
}

impl<R> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        ResourcePool {
            inner: self.inner.clone(),
        }
    }
}

enum Acquire<R> {
    Idle(R),
    Wait(u64, oneshot::Receiver<Result<R>>),
}

impl<R: Send + 'static> ResourcePool<R> {
    /// Create a new [ResourcePool].
    ///
    /// The pool starts filling up to `min_size` and reaping idle resources right away, so this
    /// needs to be called within a tokio runtime when either is configured.
    pub fn new(name: impl Into<String>, conf: PoolConf, lifecycle: Arc<dyn Lifecycle<R>>) -> Self {
        let (terminated, _) = watch::channel(false);
        let pool = ResourcePool {
            inner: Arc::new(PoolInner {
                name: name.into(),
                state: Mutex::new(PoolState::new(conf.rate_limiter())),
                conf,
                lifecycle,
                returned: Notify::new(),
                terminated,
            }),
        };
        if let Some(idle_timeout) = pool.inner.conf.idle_timeout {
            if !idle_timeout.is_zero() {
                tokio::spawn(reap_idle(Arc::downgrade(&pool.inner), idle_timeout));
            }
        }
        pool.fill();
        pool
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn conf(&self) -> &PoolConf {
        &self.inner.conf
    }

    /// Get a resource, waiting at most the configured waiter timeout.
    pub async fn get(&self) -> Result<R> {
        self.get_until(Instant::now() + self.inner.conf.waiter_timeout)
            .await
    }

    /// Get a resource, waiting until `deadline` at most.
    ///
    /// Fails with `PoolExhausted` when the deadline passes first, with `ShutdownInProgress` once
    /// the pool is shutting down, and with `ConnectionCreationError` when the creation serving
    /// this caller failed.
    pub async fn get_until(&self, deadline: Instant) -> Result<R> {
        loop {
            let acquire = {
                let mut state = self.inner.state.lock();
                if state.phase != Phase::Running {
                    return Err(shutdown_error(&self.inner.name));
                }
                match state.pop_idle(self.inner.conf.strategy) {
                    Some(resource) => {
                        state.in_use += 1;
                        Acquire::Idle(resource)
                    }
                    None => {
                        let (id, rx) = state.enqueue_waiter();
                        Acquire::Wait(id, rx)
                    }
                }
            };
            match acquire {
                Acquire::Idle(resource) => {
                    if self.inner.lifecycle.validate_get(&resource) {
                        return Ok(resource);
                    }
                    debug!("pool {}: idle resource failed validation", self.inner.name);
                    self.discard(resource, true);
                }
                Acquire::Wait(id, rx) => {
                    let ticket = Ticket {
                        pool: self,
                        id,
                        rx,
                        settled: false,
                    };
                    self.fill();
                    return ticket.wait(deadline).await;
                }
            }
        }
    }

    /// Return a resource obtained from [Self::get()].
    ///
    /// The resource goes to the oldest waiter if there is one, otherwise it becomes idle.
    pub fn put(&self, resource: R) {
        if !self.inner.lifecycle.validate_put(&resource) {
            debug!("pool {}: returned resource failed validation", self.inner.name);
            self.discard(resource, true);
            return;
        }
        let doomed = self.inner.state.lock().release(resource);
        if let Some(resource) = doomed {
            self.destroy_later(resource, false);
        }
        self.inner.returned.notify_one();
    }

    /// Destroy a resource obtained from [Self::get()] that is not fit for reuse.
    pub fn dispose(&self, resource: R) {
        self.discard(resource, true);
    }

    fn discard(&self, resource: R, error: bool) {
        {
            let mut state = self.inner.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
            state.total_destroyed += 1;
        }
        self.destroy_later(resource, error);
        self.inner.returned.notify_one();
        self.fill();
    }

    fn destroy_later(&self, resource: R, error: bool) {
        let lifecycle = self.inner.lifecycle.clone();
        tokio::spawn(async move { lifecycle.destroy(resource, error).await });
    }

    // Start as many creations as demand, capacity and backoff allow.
    fn fill(&self) {
        let mut starts = 0;
        let mut retry_at = None;
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Running {
                return;
            }
            let conf = &self.inner.conf;
            while state.wants_resource(conf.min_size) && state.size() < conf.max_size {
                if !state.limiter.try_attempt() {
                    if !state.retry_pending {
                        retry_at = state.limiter.next_permit_at();
                        state.retry_pending = retry_at.is_some();
                    }
                    break;
                }
                state.creating += 1;
                starts += 1;
            }
        }
        for _ in 0..starts {
            self.spawn_create();
        }
        if let Some(at) = retry_at {
            trace!("pool {}: creation deferred by backoff", self.inner.name);
            let pool = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                sleep_until(Instant::from_std(at)).await;
                if let Some(inner) = pool.upgrade() {
                    inner.state.lock().retry_pending = false;
                    ResourcePool { inner }.fill();
                }
            });
        }
    }

    fn spawn_create(&self) {
        let lifecycle = self.inner.lifecycle.clone();
        let mut slot = CreationSlot {
            pool: Arc::downgrade(&self.inner),
            armed: true,
        };
        tokio::spawn(async move {
            let created = lifecycle.create().await;
            slot.armed = false;
            match slot.pool.upgrade() {
                Some(inner) => ResourcePool { inner }.on_created(created),
                None => {
                    if let Ok(resource) = created {
                        lifecycle.destroy(resource, false).await;
                    }
                }
            }
        });
    }

    fn on_created(&self, created: Result<R>) {
        let mut doomed = None;
        {
            let mut state = self.inner.state.lock();
            state.creating -= 1;
            match created {
                Ok(resource) => {
                    state.total_created += 1;
                    state.limiter.record_success();
                    if state.phase == Phase::Running {
                        state.hand_off(resource);
                    } else {
                        state.total_destroyed += 1;
                        state.fail_oldest_waiter(shutdown_error(&self.inner.name));
                        doomed = Some(resource);
                    }
                }
                Err(e) => {
                    state.total_create_errors += 1;
                    state.limiter.record_failure();
                    warn!(
                        "pool {}: failed to create resource, next attempt in {:?}: {e}",
                        self.inner.name,
                        state.limiter.current_interval()
                    );
                    let context = format!("pool {}", self.inner.name);
                    state.fail_oldest_waiter(Error::because(ConnectionCreationError, context, e));
                }
            }
        }
        if let Some(resource) = doomed {
            self.destroy_later(resource, false);
        }
        self.fill();
    }

    // destroy idle resources past the idle timeout, return false once the pool stops running
    fn reap(&self, idle_timeout: Duration) -> bool {
        let expired = {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Running {
                return false;
            }
            let now = StdInstant::now();
            let mut expired = Vec::new();
            while state.size() > self.inner.conf.min_size {
                match state.idle.front() {
                    Some(entry) if now.duration_since(entry.since) >= idle_timeout => {
                        if let Some(entry) = state.idle.pop_front() {
                            expired.push(entry.resource);
                        }
                    }
                    _ => break,
                }
            }
            state.total_destroyed += expired.len() as u64;
            expired
        };
        if !expired.is_empty() {
            debug!(
                "pool {}: reaped {} idle resources",
                self.inner.name,
                expired.len()
            );
        }
        for resource in expired {
            self.destroy_later(resource, false);
        }
        self.fill();
        true
    }

    /// Shut the pool down, returning by `deadline` at the latest.
    ///
    /// New [Self::get()] calls fail right away. Waiters are cancelled, except those a pending
    /// creation may still serve: they keep their own deadline. Idle resources are destroyed. The
    /// pool then waits for checked out resources to come back until `deadline`, after which any
    /// straggler is destroyed whenever it is returned. Calling this more than once waits for the
    /// first call to finish.
    pub async fn shutdown(&self, deadline: Instant) {
        let started = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Running {
                state.phase = Phase::Draining;
                let idle: Vec<R> = state.idle.drain(..).map(|e| e.resource).collect();
                state.total_destroyed += idle.len() as u64;
                // cancel under the lock so a waiter timing out right now still finds its answer
                let keep = state.creating.min(state.waiters.len());
                let cancelled = state.waiters.split_off(keep);
                for waiter in cancelled {
                    let _ = waiter.tx.send(Err(shutdown_error(&self.inner.name)));
                }
                Some(idle)
            } else {
                None
            }
        };

        let idle = match started {
            Some(idle) => idle,
            None => {
                let mut terminated = self.inner.terminated.subscribe();
                let _ = timeout_at(deadline, async {
                    while !*terminated.borrow_and_update() {
                        if terminated.changed().await.is_err() {
                            return;
                        }
                    }
                })
                .await;
                return;
            }
        };

        info!("pool {}: shutting down", self.inner.name);
        for resource in idle {
            self.destroy_later(resource, false);
        }

        loop {
            let in_use = self.inner.state.lock().in_use;
            if in_use == 0 {
                break;
            }
            tokio::select! {
                _ = self.inner.returned.notified() => {}
                _ = sleep_until(deadline) => {
                    warn!(
                        "pool {}: {in_use} resources still checked out at shutdown deadline",
                        self.inner.name
                    );
                    break;
                }
            }
        }

        self.inner.state.lock().phase = Phase::Terminated;
        self.inner.terminated.send_replace(true);
        info!("pool {}: shut down", self.inner.name);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.terminated.borrow()
    }

    /// Snapshot the pool counters
    pub fn stats(&self) -> PoolStats {
        let lifecycle = self.inner.lifecycle.stats();
        let state = self.inner.state.lock();
        PoolStats {
            max_size: self.inner.conf.max_size,
            min_size: self.inner.conf.min_size,
            idle: state.idle.len(),
            in_use: state.in_use,
            creating: state.creating,
            waiters: state.waiters.len(),
            total_created: state.total_created,
            total_destroyed: state.total_destroyed,
            total_create_errors: state.total_create_errors,
            total_timeouts: state.total_timeouts,
            backoff: state.limiter.current_interval(),
            lifecycle,
        }
    }
}

impl<R: Send + 'static> PoolStatsProvider for ResourcePool<R> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn stats(&self) -> PoolStats {
        ResourcePool::stats(self)
    }
}

fn shutdown_error(name: &str) -> BError {
    Error::explain(ShutdownInProgress, format!("pool {name} is shutting down")).into_local()
}

fn lost_answer(what: &'static str) -> BError {
    Error::explain(InternalError, what).into_local()
}

async fn reap_idle<R: Send + 'static>(pool: Weak<PoolInner<R>>, idle_timeout: Duration) {
    let period = (idle_timeout / 2).max(Duration::from_millis(10));
    loop {
        sleep(period).await;
        let Some(inner) = pool.upgrade() else {
            return;
        };
        let live = ResourcePool { inner };
        if !live.reap(idle_timeout) {
            return;
        }
    }
}

// A caller waiting in the queue. Dropping it unanswered takes it out of the queue.
struct Ticket<'a, R: Send + 'static> {
    pool: &'a ResourcePool<R>,
    id: u64,
    rx: oneshot::Receiver<Result<R>>,
    settled: bool,
}

impl<R: Send + 'static> Ticket<'_, R> {
    async fn wait(mut self, deadline: Instant) -> Result<R> {
        tokio::select! {
            biased;
            served = &mut self.rx => {
                self.settled = true;
                served.unwrap_or_else(|_| {
                    Err(lost_answer("pool dropped a waiter without an answer"))
                })
            }
            _ = sleep_until(deadline) => self.expire(),
        }
    }

    fn expire(&mut self) -> Result<R> {
        self.settled = true;
        let inner = &self.pool.inner;
        {
            let mut state = inner.state.lock();
            if state.remove_waiter(self.id) {
                state.total_timeouts += 1;
                let waiters = state.waiters.len();
                drop(state);
                debug!("pool {}: waiter {} timed out", inner.name, self.id);
                return Err(Error::explain(
                    PoolExhausted,
                    format!(
                        "no resource from pool {} before the deadline, max size {}, {waiters} other waiters",
                        inner.name, inner.conf.max_size
                    ),
                )
                .into_local());
            }
        }
        // answered right before the deadline, the answer is already in the channel
        self.rx
            .try_recv()
            .unwrap_or_else(|_| Err(lost_answer("waiter left the queue without an answer")))
    }
}

impl<R: Send + 'static> Drop for Ticket<'_, R> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let removed = self.pool.inner.state.lock().remove_waiter(self.id);
        if removed {
            return;
        }
        // served while being cancelled, give the resource back
        if let Ok(Ok(resource)) = self.rx.try_recv() {
            let doomed = self.pool.inner.state.lock().release(resource);
            if let Some(resource) = doomed {
                self.pool.destroy_later(resource, false);
            }
            self.pool.inner.returned.notify_one();
        }
    }
}

// Gives the creation slot back if the creating task dies before reporting.
struct CreationSlot<R> {
    pool: Weak<PoolInner<R>>,
    armed: bool,
}

impl<R> Drop for CreationSlot<R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(inner) = self.pool.upgrade() {
            warn!("pool {}: resource creation aborted", inner.name);
            let mut state = inner.state.lock();
            state.creating = state.creating.saturating_sub(1);
        }
    }
}
