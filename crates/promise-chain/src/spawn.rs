//! Task scheduling for promise work and reactions.
//!
//! Promises never poll anything themselves; they hand futures to [`spawn`],
//! which routes the resulting [`Runnable`] to whatever scheduler the
//! embedding application installed on the current thread. All promise
//! state is `!Send`, so scheduling is per-thread: each thread that creates
//! promises needs its own executor.

use anyhow::{anyhow, Result};
use async_executor::LocalExecutor;
use flume::{unbounded, Receiver, TryRecvError};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

pub use async_task::{Runnable, Task};
pub type SpawnFunc = Box<dyn FnOnce() + Send>;
pub type ScheduleFunc = Rc<dyn Fn(Runnable)>;

thread_local! {
    static SCHEDULER: RefCell<Option<ScheduleFunc>> = const { RefCell::new(None) };
    static SCOPED_EXECUTOR: RefCell<Option<Rc<LocalExecutor<'static>>>> = const { RefCell::new(None) };
}

fn schedule_runnable(runnable: Runnable) {
    // Clone the function out so that a scheduler which runs tasks inline
    // can spawn more work without re-entering the borrow.
    let func = SCHEDULER.with(|s| s.borrow().clone());
    match func {
        Some(func) => func(runnable),
        None => panic!("no scheduler has been configured"),
    }
}

pub fn is_scheduler_configured() -> bool {
    SCHEDULER.with(|s| s.borrow().is_some())
}

/// Set the function used to schedule runnables spawned on this thread.
/// This crate has no knowledge of how the embedding application runs its
/// event loop; the function only has to arrange for `Runnable::run` to be
/// called, either right away or from a later turn of that loop.
pub fn set_scheduler(func: ScheduleFunc) {
    SCHEDULER.with(|s| s.borrow_mut().replace(func));
}

/// Remove the scheduler installed on this thread.
pub fn clear_scheduler() {
    SCHEDULER.with(|s| s.borrow_mut().take());
}

fn get_scoped() -> Option<Rc<LocalExecutor<'static>>> {
    SCOPED_EXECUTOR.with(|s| s.borrow().as_ref().map(Rc::clone))
}

/// Spawn a future on the current thread.
/// Dropping the returned task cancels it; call `detach` to let it run
/// to completion unobserved.
pub fn spawn<F, R>(future: F) -> Task<R>
where
    F: Future<Output = R> + 'static,
    R: 'static,
{
    if let Some(executor) = get_scoped() {
        return executor.spawn(future);
    }
    let (runnable, task) = async_task::spawn_local(future, schedule_runnable);
    runnable.schedule();
    task
}

/// Block the current thread until the passed future completes.
/// Tasks spawned on a [`SimpleExecutor`] are not driven by this; use
/// [`SimpleExecutor::run_until`] or a [`ScopedExecutor`] instead.
pub use async_io::block_on;

/// Deferred scheduler: runnables are queued and run one per
/// [`SimpleExecutor::tick`], so spawned work never runs before the
/// spawning call returns.
pub struct SimpleExecutor {
    rx: Receiver<SpawnFunc>,
}

impl Default for SimpleExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleExecutor {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();

        let queue_func = move |f: SpawnFunc| {
            tx.send(f).ok();
        };
        set_scheduler(Rc::new(move |task: Runnable| {
            queue_func(Box::new(move || {
                task.run();
            }))
        }));
        Self { rx }
    }

    /// Wait for the next runnable and run it.
    pub fn tick(&self) -> Result<()> {
        match self.rx.recv() {
            Ok(func) => func(),
            Err(err) => anyhow::bail!("while waiting for events: {:?}", err),
        };
        Ok(())
    }

    /// Run the next queued runnable, if any. Returns false when the
    /// queue is empty.
    pub fn try_tick(&self) -> bool {
        match self.rx.try_recv() {
            Ok(func) => {
                func();
                true
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => false,
        }
    }

    /// Run queued runnables until none remain. Returns how many ran.
    pub fn run_until_stalled(&self) -> usize {
        let mut ran = 0;
        while self.try_tick() {
            ran += 1;
        }
        ran
    }

    /// Spawn `future` and run queued work until it completes.
    /// Fails if the queue drains first, which means nothing left can make
    /// progress towards it.
    pub fn run_until<F, R>(&self, future: F) -> Result<R>
    where
        F: Future<Output = R> + 'static,
        R: 'static,
    {
        let slot = Rc::new(Cell::new(None));
        let out = Rc::clone(&slot);
        spawn(async move {
            out.set(Some(future.await));
        })
        .detach();

        loop {
            if let Some(result) = slot.take() {
                return Ok(result);
            }
            if !self.try_tick() {
                log::debug!("executor stalled with the awaited future still pending");
                return Err(anyhow!("executor stalled before the future completed"));
            }
        }
    }
}

/// Run-immediately scheduler: each runnable is run inside the call that
/// scheduled it. Work spawned by a promise therefore executes before the
/// spawning call returns.
pub struct ImmediateExecutor {}

impl Default for ImmediateExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ImmediateExecutor {
    pub fn new() -> Self {
        set_scheduler(Rc::new(|task: Runnable| {
            task.run();
        }));
        Self {}
    }
}

impl Drop for ImmediateExecutor {
    fn drop(&mut self) {
        clear_scheduler();
    }
}

/// Routes every [`spawn`] on this thread into an
/// [`async_executor::LocalExecutor`] for as long as it is alive.
pub struct ScopedExecutor {}

impl Default for ScopedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopedExecutor {
    pub fn new() -> Self {
        SCOPED_EXECUTOR.with(|s| s.borrow_mut().replace(Rc::new(LocalExecutor::new())));
        Self {}
    }

    pub async fn run<T>(&self, future: impl Future<Output = T>) -> T {
        get_scoped()
            .expect("SCOPED_EXECUTOR to be alive as long as ScopedExecutor")
            .run(future)
            .await
    }
}

impl Drop for ScopedExecutor {
    fn drop(&mut self) {
        SCOPED_EXECUTOR.with(|s| s.borrow_mut().take());
    }
}
