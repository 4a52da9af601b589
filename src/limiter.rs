//! Per-key bounded concurrency.
//!
//! [`ActionLimiter`] keeps one semaphore per key. Holders of different keys
//! never contend with each other; a limit of 0 turns every call into a no-op.
//!
//! ```ignore
//! let limiter = ActionLimiter::new(2);
//! let _slot = limiter.guard("mysql").await;
//! // at most two holders of "mysql" reach this point
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

#[derive(Default)]
struct LimiterState {
    limit: usize,
    slots: HashMap<String, Arc<Semaphore>>,
    in_flight: HashMap<String, usize>,
}

#[derive(Default)]
pub struct ActionLimiter {
    state: Mutex<LimiterState>,
}

impl ActionLimiter {
    pub fn new(limit: usize) -> Self {
        let limiter = Self::default();
        limiter.set_limit(limit);
        limiter
    }

    /// Resets all per-key state. Callers must not hold any slot.
    pub fn set_limit(&self, limit: usize) {
        let mut state = self.lock();
        state.limit = limit;
        state.slots.clear();
        state.in_flight.clear();
    }

    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    /// Waits until fewer than `limit` holders exist for `key`.
    pub async fn acquire(&self, key: &str) {
        let slot = {
            let mut state = self.lock();
            if state.limit == 0 {
                return;
            }
            let limit = state.limit;
            state
                .slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(limit)))
                .clone()
        };
        // The semaphore is never closed.
        if let Ok(permit) = slot.acquire().await {
            permit.forget();
        }
        *self.lock().in_flight.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Frees one slot of `key`. A release without a matching acquire is ignored.
    pub fn release(&self, key: &str) {
        let mut state = self.lock();
        if state.limit == 0 {
            return;
        }
        let Some(count) = state.in_flight.get_mut(key) else {
            return;
        };
        if *count == 0 {
            return;
        }
        *count -= 1;
        if let Some(slot) = state.slots.get(key) {
            slot.add_permits(1);
        }
    }

    pub fn in_flight(&self, key: &str) -> usize {
        let state = self.lock();
        if state.limit == 0 {
            return 0;
        }
        state.in_flight.get(key).copied().unwrap_or(0)
    }

    /// Acquires a slot that is released when the guard drops.
    pub async fn guard<'a>(&'a self, key: &str) -> LimitGuard<'a> {
        self.acquire(key).await;
        LimitGuard {
            limiter: self,
            key: key.to_string(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct LimitGuard<'a> {
    limiter: &'a ActionLimiter,
    key: String,
}

impl Drop for LimitGuard<'_> {
    fn drop(&mut self) {
        self.limiter.release(&self.key);
    }
}
