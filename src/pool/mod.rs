//! Bounded pool of reusable pipeline workers.
//!
//! A [`WorkerPool`] owns a fixed-capacity arena of `max_size` slots. Idle
//! workers sit in their slot with the slot index queued on a free list;
//! vacant slots are tracked separately so a fresh worker can be built
//! without scanning. A [`Semaphore`] initialised to `max_size` gates how
//! many workers are checked out at once, which also bounds how many can
//! ever exist.
//!
//! Borrowing returns a [`PooledWorker`] guard. Dropping it (or passing it to
//! [`WorkerPool::release`]) puts the worker back and returns the permit, so
//! every exit path of a caller releases what it took.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, PoolSettings};
use crate::pipeline::{PipelineError, PipelineFactory, Worker};

/// Errors raised by a worker pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool '{pool}': min_size {min_size} exceeds max_size {max_size}")]
    Capacity {
        pool: String,
        min_size: usize,
        max_size: usize,
    },

    #[error("Pool '{pool}': max_size must be at least 1")]
    ZeroCapacity { pool: String },

    #[error("Pool '{pool}': failed to build worker: {source}")]
    Build {
        pool: String,
        #[source]
        source: PipelineError,
    },

    #[error("Pool '{pool}': no worker available after {waited:?}")]
    Exhausted { pool: String, waited: Duration },

    #[error("Pool '{pool}': no vacant slot for a permitted acquire")]
    Inconsistent { pool: String },
}

/// Snapshot of a pool for status reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub min_size: usize,
    pub max_size: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub available_permits: usize,
    pub created: usize,
    pub closed: bool,
}

struct Arena {
    slots: Vec<Option<Box<dyn Worker>>>,
    /// Slots holding an idle worker, reused front first
    idle: VecDeque<usize>,
    /// Slots with no worker at all
    vacant: Vec<usize>,
}

impl Arena {
    fn empty(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            idle: VecDeque::with_capacity(capacity),
            // Popped from the back, so lower indices come out first
            vacant: (0..capacity).rev().collect(),
        }
    }

    fn idle_workers(&self) -> usize {
        self.idle.len()
    }
}

/// Bounded, pre-warmed pool of workers for one endpoint or dependency
pub struct WorkerPool {
    name: String,
    config: PipelineConfig,
    factory: Arc<dyn PipelineFactory>,
    min_size: usize,
    max_size: usize,
    acquire_timeout: Option<Duration>,
    permits: Arc<Semaphore>,
    arena: Mutex<Arena>,
    sequence: AtomicUsize,
    /// Bumped by `close()`; guards from an older epoch are not returned
    epoch: AtomicU64,
    closed: AtomicBool,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Build a pool and synchronously pre-warm `min_size` workers.
    pub fn new(
        name: impl Into<String>,
        config: PipelineConfig,
        settings: PoolSettings,
        factory: Arc<dyn PipelineFactory>,
    ) -> Result<Self, PoolError> {
        let name = name.into();
        let PoolSettings {
            min_size, max_size, ..
        } = settings;

        if max_size == 0 {
            return Err(PoolError::ZeroCapacity { pool: name });
        }
        if min_size > max_size {
            return Err(PoolError::Capacity {
                pool: name,
                min_size,
                max_size,
            });
        }

        let pool = Self {
            name,
            config,
            factory,
            min_size,
            max_size,
            acquire_timeout: settings.acquire_timeout(),
            permits: Arc::new(Semaphore::new(max_size)),
            arena: Mutex::new(Arena::empty(max_size)),
            sequence: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };

        {
            let mut arena = pool.arena.lock();
            for _ in 0..min_size {
                let worker = pool.spawn_worker()?;
                let slot = arena
                    .vacant
                    .pop()
                    .ok_or_else(|| PoolError::Inconsistent {
                        pool: pool.name.clone(),
                    })?;
                arena.slots[slot] = Some(worker);
                arena.idle.push_back(slot);
            }
        }

        info!(
            "Pool {} ready ({} pre-warmed, max {})",
            pool.name, min_size, max_size
        );
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn idle_len(&self) -> usize {
        self.arena.lock().idle_workers()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Workers built over the pool's lifetime
    pub fn created(&self) -> usize {
        self.sequence.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next unique worker name, `"<pool>[<index>]"`.
    fn next_name(&self) -> String {
        let index = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}[{}]", self.name, index)
    }

    fn spawn_worker(&self) -> Result<Box<dyn Worker>, PoolError> {
        let worker_name = self.next_name();
        let worker = self
            .factory
            .build(&self.config, &worker_name)
            .map_err(|source| PoolError::Build {
                pool: self.name.clone(),
                source,
            })?;
        debug!("Pool {} built worker {}", self.name, worker_name);
        Ok(worker)
    }

    /// Borrow a worker, waiting for a permit first.
    ///
    /// Reuses an idle worker when one exists; otherwise builds a fresh one
    /// in a vacant slot. Building never takes a second permit.
    pub async fn acquire(&self) -> Result<PooledWorker<'_>, PoolError> {
        let waiting = Arc::clone(&self.permits).acquire_owned();
        let permit = match self.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, waiting)
                .await
                .map_err(|_| PoolError::Exhausted {
                    pool: self.name.clone(),
                    waited: limit,
                })?,
            None => waiting.await,
        }
        // The semaphore is never closed; permits are restored instead
        .map_err(|_| PoolError::Inconsistent {
            pool: self.name.clone(),
        })?;

        let epoch = self.epoch.load(Ordering::Acquire);
        let mut arena = self.arena.lock();

        if let Some(slot) = arena.idle.pop_front() {
            if let Some(worker) = arena.slots[slot].take() {
                return Ok(PooledWorker::new(self, slot, epoch, worker, permit));
            }
            warn!("Pool {} idle slot {} was empty", self.name, slot);
            arena.vacant.push(slot);
        }

        let slot = arena.vacant.pop().ok_or_else(|| PoolError::Inconsistent {
            pool: self.name.clone(),
        })?;
        match self.spawn_worker() {
            Ok(worker) => Ok(PooledWorker::new(self, slot, epoch, worker, permit)),
            Err(e) => {
                arena.vacant.push(slot);
                Err(e)
            }
        }
    }

    /// Return a borrowed worker. Equivalent to dropping the guard.
    pub fn release(&self, worker: PooledWorker<'_>) {
        drop(worker);
    }

    fn put_back(&self, slot: usize, epoch: u64, worker: Box<dyn Worker>) -> bool {
        if epoch != self.epoch.load(Ordering::Acquire) {
            debug!(
                "Pool {} discarding {} borrowed before close",
                self.name,
                worker.name()
            );
            return false;
        }

        let mut arena = self.arena.lock();
        if arena.idle.len() >= self.max_size || arena.slots[slot].is_some() {
            warn!(
                "Pool {} idle queue full, discarding {}",
                self.name,
                worker.name()
            );
            return true;
        }
        arena.slots[slot] = Some(worker);
        arena.idle.push_back(slot);
        true
    }

    /// Discard every idle worker and restore all outstanding permits.
    ///
    /// Workers still borrowed are not waited for; when they come back they
    /// are dropped and their permit is forgotten, so the permit count stays
    /// at `max_size`.
    pub fn close(&self) {
        let discarded = {
            let mut arena = self.arena.lock();
            let discarded = arena.idle_workers();
            *arena = Arena::empty(self.max_size);
            discarded
        };

        self.epoch.fetch_add(1, Ordering::AcqRel);
        let outstanding = self
            .max_size
            .saturating_sub(self.permits.available_permits());
        if outstanding > 0 {
            self.permits.add_permits(outstanding);
        }
        self.closed.store(true, Ordering::Release);

        info!(
            "Pool {} closed ({} idle discarded, {} permits restored)",
            self.name, discarded, outstanding
        );
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.idle_len();
        let available_permits = self.available_permits();
        PoolStatus {
            name: self.name.clone(),
            min_size: self.min_size,
            max_size: self.max_size,
            idle,
            checked_out: self.max_size.saturating_sub(available_permits),
            available_permits,
            created: self.created(),
            closed: self.is_closed(),
        }
    }
}

/// Exclusive loan of one worker; returned to the pool on drop
pub struct PooledWorker<'a> {
    pool: &'a WorkerPool,
    slot: usize,
    epoch: u64,
    worker: Option<Box<dyn Worker>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<'a> PooledWorker<'a> {
    fn new(
        pool: &'a WorkerPool,
        slot: usize,
        epoch: u64,
        worker: Box<dyn Worker>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            pool,
            slot,
            epoch,
            worker: Some(worker),
            permit: Some(permit),
        }
    }
}

impl fmt::Debug for PooledWorker<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledWorker")
            .field("pool", &self.pool.name)
            .field("worker", &self.worker.as_ref().map(|w| w.name()))
            .finish_non_exhaustive()
    }
}

impl Deref for PooledWorker<'_> {
    type Target = dyn Worker;

    fn deref(&self) -> &Self::Target {
        self.worker
            .as_deref()
            .expect("worker present until drop")
    }
}

impl DerefMut for PooledWorker<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.worker
            .as_deref_mut()
            .expect("worker present until drop")
    }
}

impl Drop for PooledWorker<'_> {
    fn drop(&mut self) {
        let returned = match self.worker.take() {
            Some(worker) => self.pool.put_back(self.slot, self.epoch, worker),
            None => true,
        };
        if let Some(permit) = self.permit.take() {
            if returned {
                drop(permit);
            } else {
                // close() already restored this permit
                permit.forget();
            }
        }
    }
}
