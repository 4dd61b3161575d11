//! Worker Process Pool.
//!
//! A bounded set of long-lived compiler daemons. A semaphore caps how many leases
//! are out at once; the process table behind the pool's mutex is the only place
//! daemon handles live while idle, and every borrow, return, eviction and spawn
//! goes through it.

pub mod launcher;
pub mod process;

#[cfg(test)]
pub(crate) mod fake;

use ahash::AHashSet;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};

use crate::error::ErrorKind;
use crate::protocol::{Request, ResultEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    /// Ceiling on the number of daemons the pool starts over its lifetime,
    /// replacements for crashed or evicted daemons included.
    pub max_instances: usize,
    pub borrow_timeout: Duration,
    pub result_timeout: Duration,
    pub handshake_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon exited{}", status.map(|code| format!(" with status {code}")).unwrap_or_default())]
    Exited { status: Option<i32> },
    #[error("could not start daemon: {0}")]
    Spawn(#[source] io::Error),
    #[error("i/o error talking to daemon: {0}")]
    Io(#[from] io::Error),
    #[error("could not encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("daemon sent a malformed message `{line}`: {source}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("daemon sent `{got}` where {expected} was expected")]
    Unexpected { expected: &'static str, got: String },
}

impl DaemonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::Exited { .. } | DaemonError::Spawn(_) | DaemonError::Io(_) => ErrorKind::Process,
            DaemonError::Encode(_) | DaemonError::Malformed { .. } | DaemonError::Unexpected { .. } => {
                ErrorKind::Protocol
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(
        "Cannot get a worker tool from a pool of the size: {capacity}. Time out of {:.3} seconds passed.",
        waited.as_secs_f64()
    )]
    BorrowTimeout { capacity: usize, waited: Duration },
    #[error("{worker} produced no result within the deadline of {} seconds", timeout.as_secs_f64())]
    ResultTimeout { worker: WorkerId, timeout: Duration },
    #[error("{worker} did not finish its handshake within {} seconds", timeout.as_secs_f64())]
    HandshakeTimeout { worker: WorkerId, timeout: Duration },
    #[error("{worker} is not borrowed")]
    NotBorrowed { worker: WorkerId },
    #[error("cancelled")]
    Cancelled,
    #[error("the worker pool is shut down")]
    Closed,
    #[error("{worker}: {source}")]
    Daemon {
        worker: WorkerId,
        #[source]
        source: DaemonError,
    },
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::BorrowTimeout { .. } | PoolError::ResultTimeout { .. } | PoolError::Cancelled => {
                ErrorKind::Process
            }
            PoolError::HandshakeTimeout { .. } => ErrorKind::Protocol,
            PoolError::NotBorrowed { .. } | PoolError::Closed => ErrorKind::Configuration,
            PoolError::Daemon { source, .. } => source.kind(),
        }
    }
}

/// A compiler process reachable through the command protocol. At most one
/// request is in flight per daemon; the lease's `&mut` access enforces that.
pub trait CompilerDaemon: Send + 'static {
    fn handshake(&mut self) -> impl Future<Output = Result<(), DaemonError>> + Send;

    fn round_trip(&mut self, request: &Request) -> impl Future<Output = Result<ResultEvent, DaemonError>> + Send;

    fn has_exited(&mut self) -> bool;

    /// Starts killing the process without waiting for it. Must be idempotent.
    fn kill(&mut self);
}

pub trait DaemonLauncher: Send + Sync + 'static {
    type Daemon: CompilerDaemon;

    fn launch(&self, id: WorkerId) -> impl Future<Output = Result<Self::Daemon, DaemonError>> + Send;
}

/// Cancellation signal of one build, observed by borrows, round-trips and
/// pipeline execution.
#[derive(Debug, Clone)]
pub struct BuildCancellation {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for BuildCancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildCancellation {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        BuildCancellation {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum Checkout<D> {
    Idle(WorkerId, D),
    Spawn(WorkerId),
    /// Nothing idle and no spawns left; a borrowed daemon has to come back first.
    AtCeiling,
}

struct ProcessTable<D> {
    idle: Vec<(WorkerId, D)>,
    borrowed: AHashSet<WorkerId>,
    spawned: usize,
    evicted: usize,
    next_id: u64,
    closed: bool,
}

impl<D: CompilerDaemon> ProcessTable<D> {
    fn new() -> Self {
        ProcessTable {
            idle: Vec::new(),
            borrowed: AHashSet::new(),
            spawned: 0,
            evicted: 0,
            next_id: 0,
            closed: false,
        }
    }

    fn checkout(&mut self, max_instances: usize) -> Result<Checkout<D>, PoolError> {
        if self.closed {
            return Err(PoolError::Closed);
        }
        while let Some((id, mut daemon)) = self.idle.pop() {
            if daemon.has_exited() {
                log::warn!("Evicting {id}: the daemon exited while idle");
                daemon.kill();
                self.evicted += 1;
                continue;
            }
            self.borrowed.insert(id);
            return Ok(Checkout::Idle(id, daemon));
        }
        if self.spawned >= max_instances {
            return Ok(Checkout::AtCeiling);
        }
        self.spawned += 1;
        self.next_id += 1;
        let id = WorkerId(self.next_id);
        self.borrowed.insert(id);
        Ok(Checkout::Spawn(id))
    }

    /// Undoes a checkout whose process never started.
    fn abandon_spawn(&mut self, id: WorkerId) {
        if self.borrowed.remove(&id) {
            self.spawned -= 1;
        }
    }

    /// Forgets a started daemon that never became ready.
    fn discard(&mut self, id: WorkerId) {
        if self.borrowed.remove(&id) {
            self.evicted += 1;
        }
    }

    /// Returns a daemon to the table. Poisoned or dead daemons are killed
    /// instead of being kept. Returns whether the daemon went back to idle.
    fn check_in(&mut self, id: WorkerId, mut daemon: D, poisoned: bool) -> Result<bool, PoolError> {
        if !self.borrowed.remove(&id) {
            daemon.kill();
            return Err(PoolError::NotBorrowed { worker: id });
        }
        if poisoned || self.closed || daemon.has_exited() {
            daemon.kill();
            self.evicted += 1;
            return Ok(false);
        }
        self.idle.push((id, daemon));
        Ok(true)
    }

    fn kill_idle(&mut self) -> usize {
        let killed = self.idle.len();
        for (_, mut daemon) in self.idle.drain(..) {
            daemon.kill();
        }
        killed
    }
}

struct PoolInner<L: DaemonLauncher> {
    launcher: L,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    table: Mutex<ProcessTable<L::Daemon>>,
    /// Signalled whenever a daemon goes back to idle or the pool closes.
    returned: Notify,
}

impl<L: DaemonLauncher> PoolInner<L> {
    fn lock_table(&self) -> MutexGuard<'_, ProcessTable<L::Daemon>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<L: DaemonLauncher> Drop for PoolInner<L> {
    fn drop(&mut self) {
        let killed = self.lock_table().kill_idle();
        if killed > 0 {
            log::debug!("Worker pool dropped, killed {killed} idle daemons");
        }
    }
}

pub struct WorkerPool<L: DaemonLauncher> {
    inner: Arc<PoolInner<L>>,
}

impl<L: DaemonLauncher> Clone for WorkerPool<L> {
    fn clone(&self) -> Self {
        WorkerPool {
            inner: self.inner.clone(),
        }
    }
}

impl<L: DaemonLauncher> WorkerPool<L> {
    pub fn new(launcher: L, config: PoolConfig) -> Self {
        WorkerPool {
            inner: Arc::new(PoolInner {
                launcher,
                permits: Arc::new(Semaphore::new(config.max_pool_size)),
                config,
                table: Mutex::new(ProcessTable::new()),
                returned: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.max_pool_size
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn borrowed(&self) -> usize {
        self.inner.lock_table().borrowed.len()
    }

    pub fn idle(&self) -> usize {
        self.inner.lock_table().idle.len()
    }

    pub fn spawned(&self) -> usize {
        self.inner.lock_table().spawned
    }

    pub fn evicted(&self) -> usize {
        self.inner.lock_table().evicted
    }

    /// Waits up to the configured borrow timeout for a free slot, then hands out
    /// an idle daemon or starts a new one. Once `max_instances` daemons were
    /// started it keeps waiting, within the same timeout, for one to be returned.
    pub async fn borrow(&self, cancel: &BuildCancellation) -> Result<WorkerLease<L>, PoolError> {
        self.borrow_with_timeout(self.inner.config.borrow_timeout, cancel).await
    }

    #[tracing::instrument(name = "pool.borrow", skip_all, fields(capacity = self.capacity()))]
    pub async fn borrow_with_timeout(
        &self,
        timeout: Duration,
        cancel: &BuildCancellation,
    ) -> Result<WorkerLease<L>, PoolError> {
        let inner = &self.inner;
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            acquired = tokio::time::timeout_at(deadline, inner.permits.clone().acquire_owned()) => match acquired {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => return Err(self.borrow_timeout(started)),
            },
        };

        let (id, daemon) = loop {
            let returned = inner.returned.notified();
            tokio::pin!(returned);
            // Registered before looking at the table so a check-in in between is not missed.
            returned.as_mut().enable();

            let checkout = inner.lock_table().checkout(inner.config.max_instances)?;
            match checkout {
                Checkout::Idle(id, daemon) => break (id, daemon),
                Checkout::Spawn(id) => break (id, self.start_daemon(id, cancel).await?),
                Checkout::AtCeiling => {
                    tracing::debug!(
                        max_instances = inner.config.max_instances,
                        "instance ceiling reached, waiting for a returned daemon"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => return Err(self.borrow_timeout(started)),
                        _ = &mut returned => {}
                    }
                }
            }
        };
        tracing::debug!(
            worker = %id,
            waited_ms = started.elapsed().as_millis() as u64,
            "borrowed worker"
        );

        Ok(WorkerLease {
            id,
            daemon: Some(daemon),
            pool: inner.clone(),
            permit: Some(permit),
            poisoned: false,
        })
    }

    fn borrow_timeout(&self, started: Instant) -> PoolError {
        let waited = started.elapsed();
        tracing::warn!(
            capacity = self.capacity(),
            waited_ms = waited.as_millis() as u64,
            "borrow timed out"
        );
        PoolError::BorrowTimeout {
            capacity: self.capacity(),
            waited,
        }
    }

    async fn start_daemon(&self, id: WorkerId, cancel: &BuildCancellation) -> Result<L::Daemon, PoolError> {
        let inner = &self.inner;
        let launched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            launched = inner.launcher.launch(id) => {
                launched.map_err(|source| PoolError::Daemon { worker: id, source })
            }
        };
        let mut daemon = match launched {
            Ok(daemon) => daemon,
            Err(err) => {
                inner.lock_table().abandon_spawn(id);
                return Err(err);
            }
        };

        let timeout = inner.config.handshake_timeout;
        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            handshake = tokio::time::timeout(timeout, daemon.handshake()) => match handshake {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(PoolError::Daemon { worker: id, source }),
                Err(_) => Err(PoolError::HandshakeTimeout { worker: id, timeout }),
            },
        };
        if let Err(err) = ready {
            log::warn!("Could not start {id}: {err}");
            daemon.kill();
            inner.lock_table().discard(id);
            return Err(err);
        }

        log::debug!("Started compiler daemon {id}");
        Ok(daemon)
    }

    /// Closes the pool: pending and future borrows fail, idle daemons are killed
    /// now and borrowed ones as soon as they are returned.
    pub fn shutdown(&self) -> usize {
        self.inner.permits.close();
        let mut table = self.inner.lock_table();
        table.closed = true;
        let killed = table.kill_idle();
        drop(table);
        self.inner.returned.notify_waiters();
        log::debug!("Worker pool shut down, killed {killed} idle daemons");
        killed
    }
}

/// Exclusive use of one pooled daemon. Dropping the lease returns it to the
/// pool; a lease whose daemon misbehaved is killed and evicted instead.
pub struct WorkerLease<L: DaemonLauncher> {
    id: WorkerId,
    daemon: Option<L::Daemon>,
    pool: Arc<PoolInner<L>>,
    permit: Option<OwnedSemaphorePermit>,
    poisoned: bool,
}

impl<L: DaemonLauncher> WorkerLease<L> {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Marks the daemon as unusable so it is killed on return.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Sends one request and waits for its result under the result timeout. Any
    /// failure poisons the lease.
    pub async fn execute(&mut self, request: &Request, cancel: &BuildCancellation) -> Result<ResultEvent, PoolError> {
        let worker = self.id;
        let timeout = self.pool.config.result_timeout;
        let Some(daemon) = self.daemon.as_mut() else {
            return Err(PoolError::NotBorrowed { worker });
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            response = tokio::time::timeout(timeout, daemon.round_trip(request)) => match response {
                Ok(Ok(event)) => Ok(event),
                Ok(Err(source)) => Err(PoolError::Daemon { worker, source }),
                Err(_) => Err(PoolError::ResultTimeout { worker, timeout }),
            },
        };
        if let Err(err) = &result {
            tracing::warn!(worker = %worker, error = %err, "daemon call failed");
            self.poisoned = true;
        }
        result
    }

    /// Returns the daemon to the pool now instead of on drop.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.check_in()
    }

    fn check_in(&mut self) -> Result<(), PoolError> {
        let Some(daemon) = self.daemon.take() else {
            return Err(PoolError::NotBorrowed { worker: self.id });
        };
        let result = self.pool.lock_table().check_in(self.id, daemon, self.poisoned);
        if matches!(result, Ok(true)) {
            self.pool.returned.notify_waiters();
        }
        // The slot frees up only once the daemon is back in the table.
        self.permit.take();
        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::debug!("Evicted {} on return", self.id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl<L: DaemonLauncher> Drop for WorkerLease<L> {
    fn drop(&mut self) {
        if self.daemon.is_some() {
            if let Err(err) = self.check_in() {
                log::warn!("Could not return {}: {}", self.id, err);
            }
        }
    }
}
