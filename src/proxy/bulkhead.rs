use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::BulkheadConfig;
use crate::error::{GatewayError, Result};

#[derive(Debug, Default)]
struct Counts {
    active: usize,
    queued: usize,
}

/// Per-backend concurrency limiter with a bounded wait queue.
///
/// At most `max_concurrent` permits are out at once; up to `queue_capacity`
/// callers may wait `queue_timeout` for one. Anything beyond that is rejected
/// immediately. Cancellation is the tokio model: dropping a waiting `acquire`
/// future gives up the queue slot, and a permit released concurrently with a
/// waiter timing out stays in the semaphore for the next caller.
#[derive(Debug)]
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    counts: Mutex<Counts>,
}

/// An admission slot. Dropping it releases the slot and hands it to the
/// longest-waiting queued caller, if any.
#[derive(Debug)]
pub struct BulkheadPermit {
    bulkhead: Arc<Bulkhead>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.bulkhead.lock().active -= 1;
    }
}

/// Releases the queue slot on every exit path, including future drop.
struct QueueSlot {
    bulkhead: Arc<Bulkhead>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.bulkhead.lock().queued -= 1;
    }
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            counts: Mutex::new(Counts::default()),
        }
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<BulkheadPermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(self.admitted(permit));
        }

        {
            let mut counts = self.lock();
            if counts.queued >= self.config.queue_capacity {
                return Err(GatewayError::BulkheadFull);
            }
            counts.queued += 1;
        }
        let _slot = QueueSlot {
            bulkhead: self.clone(),
        };

        tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                let permit = permit
                    .map_err(|_| GatewayError::Internal("bulkhead semaphore closed".to_string()))?;
                Ok(self.admitted(permit))
            }
            _ = tokio::time::sleep(self.config.queue_timeout) => {
                Err(GatewayError::BulkheadQueueTimeout)
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    pub fn queued_count(&self) -> usize {
        self.lock().queued
    }

    pub fn stats(&self) -> serde_json::Value {
        let counts = self.lock();
        serde_json::json!({
            "max_concurrent": self.config.max_concurrent,
            "active_count": counts.active,
            "queued_count": counts.queued,
            "queue_capacity": self.config.queue_capacity,
        })
    }

    fn admitted(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.lock().active += 1;
        BulkheadPermit {
            bulkhead: self.clone(),
            _permit: permit,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
