//! Workflow-wide concurrency limiter.
//!
//! A fixed pool of slots with three priority buckets of waiters. A
//! released slot is handed directly to a waiter instead of returning to
//! the pool; the bucket scan starts from a rotating cursor so Low is
//! never starved by a steady stream of High acquisitions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::trace;

use crate::definition::NodePriority;
use crate::{Result, WeirError};

struct LimiterState {
    free: usize,
    waiters: [VecDeque<oneshot::Sender<()>>; 3],
    cursor: usize,
    closed: bool,
}

/// Priority-aware slot allocator. `max_concurrency == 0` means unlimited:
/// every acquire succeeds immediately.
pub struct ConcurrencyLimiter {
    state: Option<Arc<Mutex<LimiterState>>>,
    max_concurrency: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrency: usize) -> Self {
        let state = (max_concurrency > 0).then(|| {
            Arc::new(Mutex::new(LimiterState {
                free: max_concurrency,
                waiters: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                cursor: 0,
                closed: false,
            }))
        });
        Self {
            state,
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Free slots right now. Unlimited limiters report `usize::MAX`.
    pub fn available(&self) -> usize {
        match &self.state {
            Some(state) => state.lock().unwrap().free,
            None => usize::MAX,
        }
    }

    /// Queued waiters across all priorities.
    pub fn waiting(&self) -> usize {
        match &self.state {
            Some(state) => {
                let state = state.lock().unwrap();
                state.waiters.iter().map(VecDeque::len).sum()
            }
            None => 0,
        }
    }

    /// Acquire a slot at `priority`, suspending until one is available.
    ///
    /// Dropping the returned future removes the waiter. Errors if the
    /// limiter is disposed while waiting.
    pub async fn acquire(&self, priority: NodePriority) -> Result<ConcurrencySlot> {
        let Some(state) = &self.state else {
            return Ok(ConcurrencySlot { state: None });
        };

        let rx = {
            let mut guard = state.lock().unwrap();
            if guard.closed {
                return Err(WeirError::Resource("concurrency limiter disposed".into()));
            }
            if guard.free > 0 {
                guard.free -= 1;
                trace!(?priority, free = guard.free, "slot acquired from pool");
                return Ok(ConcurrencySlot {
                    state: Some(Arc::clone(state)),
                });
            }
            let (tx, rx) = oneshot::channel();
            guard.waiters[priority.index()].push_back(tx);
            rx
        };

        match rx.await {
            Ok(()) => {
                trace!(?priority, "slot handed off");
                Ok(ConcurrencySlot {
                    state: Some(Arc::clone(state)),
                })
            }
            Err(_) => Err(WeirError::Resource("concurrency limiter disposed".into())),
        }
    }

    /// Cancel all queued waiters. Held slots stay valid; releasing them
    /// after disposal is a no-op.
    pub fn dispose(&self) {
        if let Some(state) = &self.state {
            let mut guard = state.lock().unwrap();
            guard.closed = true;
            for bucket in &mut guard.waiters {
                bucket.clear();
            }
        }
    }
}

fn release_slot(state: &Arc<Mutex<LimiterState>>) {
    let mut guard = state.lock().unwrap();
    if guard.closed {
        return;
    }

    // Hand the slot straight to a waiter: scan the priority buckets
    // starting at the cursor, skipping waiters whose acquire was dropped.
    for offset in 0..3 {
        let idx = (guard.cursor + offset) % 3;
        while let Some(tx) = guard.waiters[idx].pop_front() {
            if tx.send(()).is_ok() {
                guard.cursor = (idx + 1) % 3;
                return;
            }
        }
    }

    guard.free += 1;
}

/// Release handle for one slot. Releasing twice releases exactly once;
/// dropping an unreleased handle releases it.
pub struct ConcurrencySlot {
    state: Option<Arc<Mutex<LimiterState>>>,
}

impl ConcurrencySlot {
    pub fn release(&mut self) {
        if let Some(state) = self.state.take() {
            release_slot(&state);
        }
    }
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.release();
    }
}
