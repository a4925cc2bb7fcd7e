//! Per-node-kind execution throttling.
//!
//! Each registered node id gets its own semaphore; acquisitions on
//! different ids never block each other. Unregistered ids (or a limit of
//! 0) mean no throttling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::trace;

use crate::{Result, WeirError};

/// Caps concurrent executions per node id.
#[derive(Debug, Default)]
pub struct NodeThrottler {
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Release handle for one throttle slot. Dropping releases; explicit
/// release is idempotent.
pub struct ThrottleSlot {
    semaphore: Option<Arc<Semaphore>>,
}

impl ThrottleSlot {
    pub fn release(&mut self) {
        if let Some(sem) = self.semaphore.take() {
            sem.add_permits(1);
        }
    }
}

impl Drop for ThrottleSlot {
    fn drop(&mut self) {
        self.release();
    }
}

impl NodeThrottler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cap for `node_id`. A limit of 0 removes throttling.
    pub fn register(&self, node_id: impl Into<String>, limit: u32) {
        let node_id = node_id.into();
        let mut limits = self.limits.lock().unwrap();
        if limit == 0 {
            limits.remove(&node_id);
        } else {
            limits.insert(node_id, Arc::new(Semaphore::new(limit as usize)));
        }
    }

    /// Remove the cap for `node_id`, cancelling any queued waiters.
    pub fn unregister(&self, node_id: &str) {
        let mut limits = self.limits.lock().unwrap();
        if let Some(sem) = limits.remove(node_id) {
            sem.close();
        }
    }

    pub fn is_throttled(&self, node_id: &str) -> bool {
        self.limits.lock().unwrap().contains_key(node_id)
    }

    /// Acquire a slot for `node_id`.
    ///
    /// Returns `None` immediately for unthrottled nodes; otherwise waits
    /// for a slot. Errors if the node is unregistered while waiting.
    pub async fn acquire(&self, node_id: &str) -> Result<Option<ThrottleSlot>> {
        let semaphore = {
            let limits = self.limits.lock().unwrap();
            match limits.get(node_id) {
                Some(sem) => Arc::clone(sem),
                None => return Ok(None),
            }
        };

        let permit = semaphore.acquire().await.map_err(|_| {
            WeirError::Resource(format!("throttle for node '{node_id}' was unregistered"))
        })?;
        permit.forget();
        trace!(node_id, "throttle slot acquired");

        Ok(Some(ThrottleSlot {
            semaphore: Some(semaphore),
        }))
    }
}
