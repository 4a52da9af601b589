//! Orderly process termination.
//!
//! Long-running components register themselves once at startup. On
//! termination [`ShutdownRegistry::shutdown_all`] drains them in registration
//! order under a single deadline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{MultiError, Result, TsuruError};

#[async_trait]
pub trait Shutdownable: Send + Sync {
    /// Used in logs and timeout errors.
    fn name(&self) -> String;

    /// Stop accepting work and drain. Must return by `deadline`.
    async fn shutdown(&self, deadline: Instant) -> Result<()>;
}

#[derive(Default)]
struct RegistryState {
    items: Vec<Arc<dyn Shutdownable>>,
    shutting_down: bool,
}

#[derive(Default)]
pub struct ShutdownRegistry {
    state: Mutex<RegistryState>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, item: Arc<dyn Shutdownable>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shutting_down {
            return Err(TsuruError::ShutdownInProgress(item.name()));
        }
        tracing::debug!(component = %item.name(), "registered for shutdown");
        state.items.push(item);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shuts every component down in registration order.
    ///
    /// Once `timeout` has elapsed the remaining components are skipped and
    /// reported as [`TsuruError::ShutdownTimeout`]. Individual failures do not
    /// stop the sequence.
    pub async fn shutdown_all(&self, timeout: Duration) -> Result<()> {
        let items = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shutting_down = true;
            state.items.clone()
        };
        let deadline = Instant::now() + timeout;
        let mut errors = MultiError::new();
        let mut iter = items.iter();
        for item in iter.by_ref() {
            let name = item.name();
            tracing::info!(component = %name, "[shutdown] draining");
            match tokio::time::timeout_at(deadline, item.shutdown(deadline)).await {
                Ok(Ok(())) => tracing::info!(component = %name, "[shutdown] done"),
                Ok(Err(e)) => {
                    tracing::error!(component = %name, error = %e, "[shutdown] failed");
                    errors.push(e);
                }
                Err(_) => {
                    tracing::error!(component = %name, "[shutdown] deadline exceeded");
                    errors.push(TsuruError::ShutdownTimeout(name));
                    break;
                }
            }
        }
        for skipped in iter {
            let name = skipped.name();
            tracing::warn!(component = %name, "[shutdown] skipped after deadline");
            errors.push(TsuruError::ShutdownTimeout(name));
        }
        errors.into_result()
    }
}
