//! Memory budget management for streaming
//!
//! Tracks bytes held by chunk buffers and octree node groups against a
//! preferred and a hard limit. Going over the preferred limit queues a
//! background unload; going over the hard limit escalates to the panic
//! handler before the request is refused.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, warn};
use parking_lot::RwLock;
use tokio::runtime::Handle;

use crate::core::error::Error;
use crate::core::types::Result;

/// Snapshot of the memory counters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryUsage {
    pub allocated: u64,
    pub preferred: u64,
    pub max: u64,
}

impl MemoryUsage {
    /// Allocation relative to the hard limit (0.0 to 1.0)
    pub fn pressure(&self) -> f32 {
        if self.max == 0 {
            return 0.0;
        }
        self.allocated as f32 / self.max as f32
    }

    /// Whether background eviction should be running
    pub fn over_preferred(&self) -> bool {
        self.allocated > self.preferred
    }

    pub fn available(&self) -> u64 {
        self.max.saturating_sub(self.allocated)
    }
}

/// Something that can give memory back: the world loader.
pub trait Reclaim: Send + Sync {
    /// Evict resident data until at most `goal` bytes are allocated.
    /// `urgent` permits evicting data that markers still want. Returns the
    /// number of bytes freed.
    fn reclaim(&self, goal: u64, urgent: bool) -> u64;
}

/// Escalation hooks for memory exhaustion.
pub trait MemoryPanicHandler: Send + Sync {
    /// A reservation would exceed the hard limit. Runs synchronously on the
    /// requesting thread with no storage lock held; the request is retried
    /// once afterwards.
    fn out_of_memory(&self, request: u64, usage: MemoryUsage, manager: &MemoryManager);

    /// A queued unload finished without getting below the preferred limit.
    fn goal_not_met(&self, usage: MemoryUsage) {
        warn!(
            "Unload finished above preferred budget: {} of {} bytes allocated",
            usage.allocated, usage.preferred
        );
    }
}

/// Default panic handler: evict urgently, wanted regions included.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReclaimOnPanic;

impl MemoryPanicHandler for ReclaimOnPanic {
    fn out_of_memory(&self, request: u64, usage: MemoryUsage, manager: &MemoryManager) {
        warn!(
            "Out of memory: {} bytes requested with {} of {} allocated, reclaiming",
            request, usage.allocated, usage.max
        );
        let freed = manager.reclaim_now(true);
        debug!("Urgent reclaim freed {} bytes", freed);
    }
}

/// Lock-free memory accounting shared by every storage of one world.
pub struct MemoryManager {
    me: Weak<MemoryManager>,
    allocated: AtomicU64,
    preferred: AtomicU64,
    max: AtomicU64,
    panic_handler: Arc<dyn MemoryPanicHandler>,
    reclaim: RwLock<Option<Weak<dyn Reclaim>>>,
    runtime: RwLock<Option<Handle>>,
    unload_running: AtomicBool,
}

impl MemoryManager {
    /// Create a manager with the given budgets in bytes.
    pub fn new(preferred: u64, max: u64, panic_handler: Arc<dyn MemoryPanicHandler>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            allocated: AtomicU64::new(0),
            preferred: AtomicU64::new(preferred),
            max: AtomicU64::new(max),
            panic_handler,
            reclaim: RwLock::new(None),
            runtime: RwLock::new(None),
            unload_running: AtomicBool::new(false),
        })
    }

    /// Runtime used for queued unloads. Without one, unloads run on the
    /// thread that queued them.
    pub fn set_runtime(&self, handle: Handle) {
        *self.runtime.write() = Some(handle);
    }

    /// Register the reclaim target. Held weakly so the target may own the
    /// manager.
    pub fn set_reclaim_target(&self, target: Weak<dyn Reclaim>) {
        *self.reclaim.write() = Some(target);
    }

    pub fn set_limits(&self, preferred: u64, max: u64) {
        self.preferred.store(preferred.min(max), Ordering::Release);
        self.max.store(max, Ordering::Release);
    }

    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            allocated: self.allocated.load(Ordering::Acquire),
            preferred: self.preferred.load(Ordering::Acquire),
            max: self.max.load(Ordering::Acquire),
        }
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Add `bytes` to the counter unless the result would pass `limit`.
    /// On refusal returns the allocation seen at the time.
    fn try_add(&self, bytes: u64, limit: u64) -> std::result::Result<u64, u64> {
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > limit {
                return Err(current);
            }
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserve `bytes`, escalating to the panic handler if the hard limit
    /// would be exceeded. Must not be called while holding a storage lock.
    pub fn reserve(&self, bytes: u64) -> Result<()> {
        let next = match self.try_add(bytes, self.max.load(Ordering::Acquire)) {
            Ok(next) => next,
            Err(_) => {
                self.panic_handler.out_of_memory(bytes, self.usage(), self);
                self.try_add(bytes, self.max.load(Ordering::Acquire))
                    .map_err(|allocated| {
                        error!("Memory exhausted: {} bytes requested, {} allocated", bytes, allocated);
                        Error::MemoryExhausted {
                            requested: bytes,
                            allocated,
                            max: self.max.load(Ordering::Acquire),
                        }
                    })?
            }
        };
        if next > self.preferred.load(Ordering::Acquire) {
            self.queue_unload();
        }
        Ok(())
    }

    /// Low-priority reservation: refused once the preferred limit would be
    /// exceeded.
    pub fn reserve_soft(&self, bytes: u64) -> Result<()> {
        let preferred = self.preferred.load(Ordering::Acquire);
        self.try_add(bytes, preferred).map(|_| ()).map_err(|allocated| {
            self.queue_unload();
            Error::AllocationDenied {
                requested: bytes,
                allocated,
                preferred,
            }
        })
    }

    /// Return `bytes` to the budget.
    pub fn release(&self, bytes: u64) {
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Synchronously ask the reclaim target to get back under the preferred
    /// limit. Returns bytes freed.
    pub fn reclaim_now(&self, urgent: bool) -> u64 {
        let target = self.reclaim.read().as_ref().and_then(Weak::upgrade);
        match target {
            Some(target) => target.reclaim(self.preferred.load(Ordering::Acquire), urgent),
            None => {
                debug!("No reclaim target registered");
                0
            }
        }
    }

    /// Start a background unload unless one is already running.
    pub fn queue_unload(&self) {
        if self.unload_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            self.unload_running.store(false, Ordering::Release);
            return;
        };
        let handle = self.runtime.read().clone().or_else(|| Handle::try_current().ok());
        match handle {
            Some(handle) => {
                handle.spawn_blocking(move || me.run_unload());
            }
            None => me.run_unload(),
        }
    }

    fn run_unload(&self) {
        let freed = self.reclaim_now(false);
        let usage = self.usage();
        debug!("Queued unload freed {} bytes, {} allocated", freed, usage.allocated);
        self.unload_running.store(false, Ordering::Release);
        if usage.over_preferred() {
            self.panic_handler.goal_not_met(usage);
        }
    }

    /// Whether a queued unload is in progress
    pub fn unload_running(&self) -> bool {
        self.unload_running.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager").field("usage", &self.usage()).finish()
    }
}
