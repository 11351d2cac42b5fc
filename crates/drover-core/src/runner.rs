//! Background task supervision.
//!
//! A [`Runner`] spawns [`Runnable`]s under a single cancellation scope and
//! waits for all of them, aggregating the failures. Cancellation flows
//! down through the [`RunContext`]: tasks observe it and return
//! [`RunError::Cancelled`], which the runner treats as a clean exit.
//!
//! An optional interrupt hook maps the two-signal convention onto the
//! scope: the first Ctrl-C cancels it, a second one makes
//! [`Runner::wait`] give up with [`RunError::ForcedExit`] even if tasks
//! are stuck.

use std::future::Future;

use async_trait::async_trait;
use tokio::{signal, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::{ErrorList, RunError},
    scheduler::LoopHandle,
};

/// The ambient context of a running task: the cancellation scope plus,
/// when the task runs under a loop, a handle to post into it.
#[derive(Clone, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    loop_handle: Option<LoopHandle>,
}

impl RunContext {
    /// Creates a root context with a fresh cancellation scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context over an existing cancellation token.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel, loop_handle: None }
    }

    /// Attaches a loop handle; used by the loop when spawning runnables.
    pub(crate) fn with_loop(mut self, handle: LoopHandle) -> Self {
        self.loop_handle = Some(handle);
        self
    }

    /// The loop this task runs under, if any.
    pub fn loop_handle(&self) -> Option<&LoopHandle> {
        self.loop_handle.as_ref()
    }

    /// Cancels the scope.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once the scope is cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the scope is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A long-lived background task.
#[async_trait]
pub trait Runnable: Send + 'static {
    /// Runs until done or cancelled. Return [`RunError::Cancelled`] on a
    /// clean cancel exit; any other error is a task failure.
    async fn run(self: Box<Self>, ctx: RunContext) -> Result<(), RunError>;

    /// Optional task name for logs; unnamed tasks are numbered.
    fn name(&self) -> &str {
        ""
    }
}

/// Runs several runnables and collects their exits.
pub struct Runner {
    ctx: RunContext,
    tasks: JoinSet<Result<(), RunError>>,
    forced: Option<CancellationToken>,
}

impl Runner {
    /// Creates a runner with a fresh root context.
    pub fn new() -> Self {
        Self::with_context(RunContext::new())
    }

    /// Creates a runner over an existing context.
    pub fn with_context(ctx: RunContext) -> Self {
        Self { ctx, tasks: JoinSet::new(), forced: None }
    }

    /// The runner's context.
    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Installs the interrupt hook: first signal cancels the scope, a
    /// second signal forces [`Runner::wait`] to return.
    pub fn handle_signals(mut self) -> Self {
        let forced = CancellationToken::new();
        self.forced = Some(forced.clone());
        let cancel = self.ctx.token().clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_err() {
                return;
            }
            info!("stop requested");
            cancel.cancel();
            if signal::ctrl_c().await.is_err() {
                return;
            }
            error!("stop requested again, forcing exit");
            forced.cancel();
        });
        self
    }

    /// Spawns a runnable under the runner's context.
    pub fn spawn<R: Runnable>(&mut self, runnable: R) -> &mut Self {
        self.spawn_boxed(Box::new(runnable))
    }

    /// Spawns an already-boxed runnable.
    pub fn spawn_boxed(&mut self, runnable: Box<dyn Runnable>) -> &mut Self {
        let name = if runnable.name().is_empty() {
            self.tasks.len().to_string()
        } else {
            runnable.name().to_string()
        };
        let ctx = self.ctx.clone();
        self.tasks.spawn(async move {
            debug!(task = %name, "task started");
            let res = runnable.run(ctx).await;
            match &res {
                Ok(()) => debug!(task = %name, "task stopped"),
                Err(err) if err.is_cancel() => debug!(task = %name, "task cancelled"),
                Err(err) => error!(task = %name, error = %err, "task failed"),
            }
            res
        });
        self
    }

    /// Spawns a plain future as a task.
    pub fn spawn_future<F>(&mut self, fut: F) -> &mut Self
    where
        F: Future<Output = Result<(), RunError>> + Send + 'static,
    {
        self.tasks.spawn(fut);
        self
    }

    /// Waits for every task and aggregates the non-cancel failures.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::ForcedExit`] if the interrupt hook fired twice,
    /// the single task failure if there was one, or an aggregate of all
    /// failures. Cancel exits count as clean.
    pub async fn wait(mut self) -> Result<(), RunError> {
        let forced = self.forced.take();
        let mut errs = ErrorList::default();
        loop {
            let joined = if let Some(forced) = &forced {
                tokio::select! {
                    _ = forced.cancelled() => return Err(RunError::ForcedExit),
                    joined = self.tasks.join_next() => joined,
                }
            } else {
                self.tasks.join_next().await
            };
            match joined {
                None => break,
                Some(Ok(res)) => {
                    if !matches!(res, Err(ref err) if err.is_cancel()) {
                        errs.add(res);
                    }
                },
                Some(Err(join_err)) => {
                    errs.add(Err(RunError::Other(format!("task aborted: {join_err}"))));
                },
            }
        }
        errs.aggregate()
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives `fut`, and on cancellation invokes `on_cancel` and keeps
/// awaiting it until it unblocks.
///
/// This is the bridge for work that only stops when an external resource
/// is torn down: `on_cancel` closes the resource, the pending read fails,
/// the future returns, and the overall result is `Cancelled`.
pub async fn run_with_cancel<F, C>(ctx: &RunContext, on_cancel: C, fut: F) -> Result<(), RunError>
where
    F: Future<Output = Result<(), RunError>>,
    C: FnOnce(),
{
    tokio::pin!(fut);
    tokio::select! {
        _ = ctx.cancelled() => {
            on_cancel();
            let _ = fut.await;
            Err(RunError::Cancelled)
        },
        res = &mut fut => res,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct Exits(Result<(), RunError>);

    #[async_trait]
    impl Runnable for Exits {
        async fn run(self: Box<Self>, _ctx: RunContext) -> Result<(), RunError> {
            self.0
        }
    }

    struct WaitsForCancel;

    #[async_trait]
    impl Runnable for WaitsForCancel {
        async fn run(self: Box<Self>, ctx: RunContext) -> Result<(), RunError> {
            ctx.cancelled().await;
            Err(RunError::Cancelled)
        }

        fn name(&self) -> &str {
            "waits-for-cancel"
        }
    }

    #[tokio::test]
    async fn clean_exits_aggregate_to_ok() {
        let mut runner = Runner::new();
        runner.spawn(Exits(Ok(()))).spawn(Exits(Err(RunError::Cancelled)));
        assert!(runner.wait().await.is_ok());
    }

    #[tokio::test]
    async fn failures_are_aggregated() {
        let mut runner = Runner::new();
        runner
            .spawn(Exits(Err(RunError::Other("boom".into()))))
            .spawn(Exits(Err(RunError::Other("bang".into()))));
        let err = runner.wait().await.expect_err("must fail");
        assert!(matches!(err, RunError::Aggregate(_)));
    }

    #[tokio::test]
    async fn cancel_unblocks_waiting_tasks() {
        let mut runner = Runner::new();
        runner.spawn(WaitsForCancel);
        runner.context().cancel();
        assert!(runner.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn run_with_cancel_invokes_the_hook() {
        let ctx = RunContext::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let res = run_with_cancel(
            &ctx,
            move || {
                let _ = tx.send(());
            },
            async move {
                // Blocks until the cancel hook fires the channel.
                let _ = rx.await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(res, Err(RunError::Cancelled)));
    }
}
