//! Forward/backward action composition with compensating rollback.
//!
//! A [`Pipeline`] runs its actions' forwards in order, handing each one the
//! previous result. The first failing forward (error or panic) stops the run;
//! the already-completed actions are then undone in reverse order, each
//! backward receiving its own forward result. Backward failures are logged and
//! never replace the forward error returned to the caller.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TsuruError};

/// Input of a forward step.
pub struct FwContext<'a, P, R> {
    /// Cancelled when the caller gives up; forwards should stop starting work.
    pub cancel: &'a CancellationToken,
    /// Result of the previous action, `None` for the first one.
    pub previous: Option<&'a R>,
    pub params: &'a [P],
}

/// Input of a backward step. Backwards are never cancelled.
pub struct BwContext<'a, P, R> {
    /// What this action's own forward returned.
    pub fw_result: &'a R,
    pub params: &'a [P],
}

#[async_trait]
pub trait Action<P, R>: Send + Sync
where
    P: Send + Sync,
    R: Send + Sync,
{
    /// Used in log lines.
    fn name(&self) -> &str;

    /// Number of leading params this action reads.
    fn min_params(&self) -> usize {
        0
    }

    async fn forward(&self, ctx: FwContext<'_, P, R>) -> Result<R>;

    /// Undo `forward`. Actions that cannot be undone keep the default.
    async fn backward(&self, _ctx: BwContext<'_, P, R>) -> Result<()> {
        Ok(())
    }

    /// Called with the failing forward's context before the rollback starts.
    fn on_error(&self, _ctx: &FwContext<'_, P, R>, _err: &TsuruError) {}
}

pub struct Pipeline<P, R> {
    actions: Vec<Arc<dyn Action<P, R>>>,
}

impl<P, R> Pipeline<P, R>
where
    P: Send + Sync,
    R: Send + Sync,
{
    pub fn new(actions: Vec<Arc<dyn Action<P, R>>>) -> Self {
        Self { actions }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every forward and returns the last action's result.
    pub async fn execute(&self, cancel: &CancellationToken, params: &[P]) -> Result<R> {
        if self.actions.is_empty() {
            return Err(TsuruError::PipelineNoActions);
        }
        if self.actions.iter().any(|a| params.len() < a.min_params()) {
            return Err(TsuruError::PipelineFewParameters);
        }

        let mut results: Vec<R> = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            tracing::debug!(action = action.name(), "[pipeline] running forward");
            let ctx = FwContext {
                cancel,
                previous: results.last(),
                params,
            };
            let outcome = AssertUnwindSafe(action.forward(ctx)).catch_unwind().await;
            let err = match outcome {
                Ok(Ok(result)) => {
                    results.push(result);
                    continue;
                }
                Ok(Err(err)) => {
                    tracing::error!(
                        action = action.name(),
                        error = %err,
                        "[pipeline] error running the forward"
                    );
                    err
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(
                        action = action.name(),
                        panic = %message,
                        "[pipeline] panic running the forward"
                    );
                    TsuruError::PipelinePanic {
                        action: action.name().to_string(),
                        message,
                    }
                }
            };
            let ctx = FwContext {
                cancel,
                previous: results.last(),
                params,
            };
            action.on_error(&ctx, &err);
            self.rollback(&results, params).await;
            return Err(err);
        }

        results.pop().ok_or(TsuruError::PipelineNoActions)
    }

    async fn rollback(&self, results: &[R], params: &[P]) {
        for (action, fw_result) in self.actions.iter().zip(results).rev() {
            let name = action.name();
            tracing::debug!(action = name, "[pipeline] running backward");
            let ctx = BwContext { fw_result, params };
            match AssertUnwindSafe(action.backward(ctx)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("[{} backward] {}", name, e),
                Err(panic) => {
                    tracing::error!("[{} backward] panic: {}", name, panic_message(panic.as_ref()))
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
