//! The control loop: a cooperative, priority-scheduled iteration driver.
//!
//! # Architecture
//!
//! ```text
//!                 ┌───────────────────────────────────────┐
//!  post_message ─►│ pending messages (mutex)              │
//!                 │                                       │
//!  trigger_next ─►│ wakeup (1-slot, edge-coalescing)      │
//!                 │                                       │
//!                 │  run():                               │
//!                 │    select { cancel, tick, wakeup }    │
//!                 │    iteration:                         │
//!                 │      store ◄── pending (atomic move)  │
//!                 │      for level in 0..16:              │
//!                 │        pre hooks (one-shot)           │
//!                 │        controllers[level]             │
//!                 │        post hooks (one-shot)          │
//!                 └───────────────────────────────────────┘
//! ```
//!
//! The loop is deliberately not an event loop: controllers are short,
//! synchronous callbacks executed one after another on the loop's own
//! task, all observing the same [`ControlContext`]. Anything that blocks
//! belongs in a [`Runnable`] spawned alongside, talking back exclusively
//! through [`LoopHandle::post_message`] + [`LoopHandle::trigger_next`].
//!
//! # Ordering
//!
//! Within an iteration, controllers run in strictly ascending priority
//! level, pre hooks before and post hooks after each level's controllers.
//! Messages keep FIFO order across iterations; a message no controller
//! takes survives into the next iteration ahead of anything posted in the
//! meantime.
//!
//! # Priority levels
//!
//! Sixteen levels, 0 highest. The named levels give sensing, deciding,
//! actuating, and post-processing each a disciplined place; [`IDLE`] is
//! for sweeps that should only see what everyone else left behind.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::Notify,
    time::{Instant, MissedTickBehavior},
};
use tracing::{error, warn};

use crate::{
    error::RunError,
    message::{Message, MessageStore},
    runner::{RunContext, Runnable, Runner},
};

/// Total number of priority levels.
pub const PRIORITY_LEVELS: usize = 16;

/// Highest priority.
pub const TOP: usize = 0;
/// Conventional level for sensors.
pub const SENSE: usize = 4;
/// Conventional level for decision-making controllers.
pub const CONTROL: usize = 8;
/// Conventional level for actuators.
pub const ACTUATE: usize = 12;
/// Conventional level for post-processing.
pub const POST_PROC: usize = PRIORITY_LEVELS - 2;
/// Lowest priority; cleanup sweeps live here.
pub const IDLE: usize = PRIORITY_LEVELS - 1;

/// Default iteration interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// A per-iteration callback registered at a priority level.
pub trait Controller: Send + 'static {
    /// Runs one control step. Must not block; errors are logged and do
    /// not abort the iteration.
    fn control(&mut self, cc: &mut ControlContext<'_>) -> Result<(), RunError>;
}

impl<F> Controller for F
where
    F: FnMut(&mut ControlContext<'_>) -> Result<(), RunError> + Send + 'static,
{
    fn control(&mut self, cc: &mut ControlContext<'_>) -> Result<(), RunError> {
        self(cc)
    }
}

/// A one-shot hook, consumed at the next iteration of its level.
pub type Hook = Box<dyn FnOnce(&mut ControlContext<'_>) -> Result<(), RunError> + Send>;

/// Lets components wire their controllers and runnables into a loop.
pub trait LoopAdder {
    /// Registers this component's pieces with the loop.
    fn add_to_loop(&mut self, lp: &mut Loop);
}

#[derive(Default)]
struct HookSlot {
    pre: Mutex<Vec<Hook>>,
    post: Mutex<Vec<Hook>>,
}

struct LoopShared {
    messages: Mutex<Vec<Message>>,
    hooks: [HookSlot; PRIORITY_LEVELS],
    wakeup: Notify,
}

/// Cloneable access to a loop from controllers and background tasks.
///
/// Posting a message enqueues it globally and triggers nothing by itself;
/// pair it with [`LoopHandle::trigger_next`] to run an iteration without
/// waiting for the tick.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Enqueues a message for the next iteration's store.
    pub fn post_message(&self, msg: Message) {
        self.shared.messages.lock().expect("lock poisoned").push(msg);
    }

    /// Requests an immediate iteration. The wakeup holds one slot, so
    /// edges coalesce: triggers beyond the stored one are dropped.
    pub fn trigger_next(&self) {
        self.shared.wakeup.notify_one();
    }

    /// Installs a one-shot hook before the controllers of `level`.
    ///
    /// # Panics
    ///
    /// Panics if `level >= PRIORITY_LEVELS`.
    pub fn pre_run_at(&self, level: usize, hook: Hook) {
        self.shared.hooks[level].pre.lock().expect("lock poisoned").push(hook);
    }

    /// Installs a one-shot hook after the controllers of `level`.
    ///
    /// # Panics
    ///
    /// Panics if `level >= PRIORITY_LEVELS`.
    pub fn post_run_at(&self, level: usize, hook: Hook) {
        self.shared.hooks[level].post.lock().expect("lock poisoned").push(hook);
    }
}

/// The context a controller observes during one step.
pub struct ControlContext<'a> {
    time: Instant,
    level: usize,
    store: &'a mut MessageStore,
    handle: &'a LoopHandle,
    ctx: &'a RunContext,
}

impl<'a> ControlContext<'a> {
    /// Monotonic time sampled once at iteration start; every controller
    /// in the iteration sees the same value.
    pub fn time(&self) -> Instant {
        self.time
    }

    /// The priority level currently executing.
    pub fn priority_level(&self) -> usize {
        self.level
    }

    /// The iteration's message store.
    pub fn messages(&mut self) -> &mut MessageStore {
        self.store
    }

    /// Installs a one-shot post hook at the current level. From within a
    /// post hook, the new hook lands in the next iteration.
    pub fn post_run(&mut self, hook: Hook) {
        self.handle.post_run_at(self.level, hook);
    }

    /// The loop handle, for posting and hook injection at other levels.
    pub fn loop_handle(&self) -> &LoopHandle {
        self.handle
    }

    /// The ambient run context (cancellation scope).
    pub fn run_context(&self) -> &RunContext {
        self.ctx
    }
}

struct Level {
    controllers: Vec<Box<dyn Controller>>,
}

/// The loop itself. Construct, register components, then [`Loop::run`].
pub struct Loop {
    interval: Duration,
    levels: Vec<Level>,
    runnables: Vec<Box<dyn Runnable>>,
    handle: LoopHandle,
}

impl Loop {
    /// Creates a loop with the default interval.
    pub fn new() -> Self {
        let shared = Arc::new(LoopShared {
            messages: Mutex::new(Vec::new()),
            hooks: Default::default(),
            wakeup: Notify::new(),
        });
        Self {
            interval: DEFAULT_INTERVAL,
            levels: (0..PRIORITY_LEVELS).map(|_| Level { controllers: Vec::new() }).collect(),
            runnables: Vec::new(),
            handle: LoopHandle { shared },
        }
    }

    /// Overrides the iteration interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// A handle usable before and during [`Loop::run`].
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Lets `adder` register its pieces.
    pub fn add(&mut self, adder: &mut dyn LoopAdder) -> &mut Self {
        adder.add_to_loop(self);
        self
    }

    /// Registers a controller at a priority level.
    ///
    /// # Panics
    ///
    /// Panics if `level >= PRIORITY_LEVELS`.
    pub fn add_controller(&mut self, level: usize, ctl: impl Controller) -> &mut Self {
        self.levels[level].controllers.push(Box::new(ctl));
        self
    }

    /// Registers a background task to run alongside the loop.
    pub fn add_runnable(&mut self, runnable: impl Runnable) -> &mut Self {
        self.runnables.push(Box::new(runnable));
        self
    }

    /// Registers an already-boxed background task.
    pub fn add_runnable_boxed(&mut self, runnable: Box<dyn Runnable>) -> &mut Self {
        self.runnables.push(runnable);
        self
    }

    /// Runs the loop until the context is cancelled.
    ///
    /// Spawns every registered runnable under the loop's scope (each sees
    /// the loop handle in its [`RunContext`]), then drives iterations at
    /// the tick interval or earlier on [`LoopHandle::trigger_next`].
    ///
    /// # Errors
    ///
    /// Returns the aggregated failures of the runnables; cancellation
    /// alone is a clean `Ok`.
    pub async fn run(mut self, ctx: RunContext) -> Result<(), RunError> {
        let ctx = ctx.with_loop(self.handle());
        let mut runner = Runner::with_context(ctx.clone());
        for runnable in self.runnables.drain(..) {
            runner.spawn_boxed(runnable);
        }

        let mut tick = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let cancelled = tokio::select! {
                _ = ctx.cancelled() => true,
                _ = tick.tick() => false,
                _ = self.handle.shared.wakeup.notified() => false,
            };
            if cancelled {
                break;
            }
            self.run_iteration(&ctx);
        }

        runner.wait().await
    }

    fn run_iteration(&mut self, ctx: &RunContext) {
        let shared = self.handle.shared.clone();
        let mut store = MessageStore::new();
        store.add_messages(std::mem::take(
            &mut *shared.messages.lock().expect("lock poisoned"),
        ));

        let time = Instant::now();
        for level in 0..PRIORITY_LEVELS {
            let mut cc = ControlContext {
                time,
                level,
                store: &mut store,
                handle: &self.handle,
                ctx,
            };
            let pre =
                std::mem::take(&mut *shared.hooks[level].pre.lock().expect("lock poisoned"));
            for hook in pre {
                if let Err(err) = hook(&mut cc) {
                    warn!(level, error = %err, "pre-run hook error");
                }
            }
            for ctl in &mut self.levels[level].controllers {
                if let Err(err) = ctl.control(&mut cc) {
                    error!(level, error = %err, "controller error");
                }
            }
            let post =
                std::mem::take(&mut *shared.hooks[level].post.lock().expect("lock poisoned"));
            for hook in post {
                if let Err(err) = hook(&mut cc) {
                    warn!(level, error = %err, "post-run hook error");
                }
            }
        }

        // Untaken messages survive into the next iteration, ahead of
        // anything posted while this one ran.
        if !store.is_empty() {
            let mut pending = shared.messages.lock().expect("lock poisoned");
            let posted = std::mem::take(&mut *pending);
            pending.extend(store.into_inner());
            pending.extend(posted);
        }
    }
}

impl Default for Loop {
    fn default() -> Self {
        Self::new()
    }
}
