//! Cancellable Task Unit
//!
//! A [`Task`] runs one pipeline stage on its own worker thread under a
//! common control protocol: cooperative cancellation, pause/resume at
//! 100 ms granularity, a typed failure slot read by the owning queue, and
//! real/CPU timing of the run.
//!
//! Cancellation is cooperative: stage code calls
//! [`TaskContext::cooperate`] at safe points (per pixel, per ray batch)
//! and propagates the returned stop marker with `?`. The worker wrapper
//! converts the marker into a clean `stopped()` shutdown; every other
//! error is captured as the task's failure code and handed to the
//! fatal-error sink exactly once.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::errors::{Failure, RenderError, Result, codes};
use crate::support::timer::TaskTimer;

/// Worker thread stack size. Recursive sampling and kernel callbacks need
/// headroom well beyond the platform default.
pub const TASK_STACK_SIZE: usize = 4 * 1024 * 1024;

/// Pause poll interval for the cooperate busy-wait.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Receives the error that failed a task; shared by all tasks of one
/// scene or view so a single failure reaches the front-end once.
pub type FatalErrorSink = Arc<dyn Fn(&RenderError) + Send + Sync>;

/// Completion notifier invoked after `finish()` on the worker thread.
pub type DoneNotifier = Arc<dyn Fn() + Send + Sync>;

/// The work a task performs, split into the protocol hooks.
pub trait TaskPayload: Send + 'static {
    /// The stage body. Must call `ctx.cooperate()?` at safe points at
    /// least once a second.
    fn run(&mut self, ctx: &TaskContext) -> Result<()>;

    /// Invoked when the run loop unwound due to a stop request.
    fn stopped(&mut self, _ctx: &TaskContext) {}

    /// Always invoked after the run, success or not. Timing is available
    /// through the context by the time this runs.
    fn finish(&mut self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }
}

/// Shared control block between a task, its worker thread, and the queue.
pub struct TaskContext {
    stop_requested: AtomicBool,
    paused: AtomicBool,
    done: AtomicBool,
    started: AtomicBool,
    failed: Mutex<Option<Failure>>,
    real_time_ms: AtomicI64,
    cpu_time_ms: AtomicI64,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self {
            stop_requested: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            done: AtomicBool::new(false),
            started: AtomicBool::new(false),
            failed: Mutex::new(None),
            real_time_ms: AtomicI64::new(-1),
            cpu_time_ms: AtomicI64::new(-1),
        }
    }
}

impl TaskContext {
    /// The cooperative suspension point.
    ///
    /// Returns the stop marker if a stop was requested; while paused,
    /// sleeps in 100 ms slices, still honouring stop.
    pub fn cooperate(&self) -> Result<()> {
        if self.stop_requested.load(Ordering::Relaxed) {
            return Err(RenderError::Stopped);
        }
        while self.paused.load(Ordering::Relaxed) {
            std::thread::yield_now();
            std::thread::sleep(PAUSE_POLL);
            if self.stop_requested.load(Ordering::Relaxed) {
                return Err(RenderError::Stopped);
            }
        }
        Ok(())
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stop_pending(&self) -> bool {
        self.stop_requested.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failure(&self) -> Option<Failure> {
        self.failed.lock().clone()
    }

    #[must_use]
    pub fn failure_code(&self, default: i32) -> i32 {
        self.failed.lock().as_ref().map_or(default, |f| f.code)
    }

    /// Elapsed real time of the finished run in milliseconds (-1 before).
    #[must_use]
    pub fn consumed_real_time_ms(&self) -> i64 {
        self.real_time_ms.load(Ordering::Acquire)
    }

    /// Elapsed thread CPU time in milliseconds, -1 where unsupported.
    #[must_use]
    pub fn consumed_cpu_time_ms(&self) -> i64 {
        self.cpu_time_ms.load(Ordering::Acquire)
    }

    fn record_failure(&self, failure: Failure) {
        let mut slot = self.failed.lock();
        if slot.is_none() {
            *slot = Some(failure);
        }
    }
}

/// A pipeline stage bound to one worker thread.
pub struct Task {
    name: &'static str,
    ctx: Arc<TaskContext>,
    payload: Mutex<Option<Box<dyn TaskPayload>>>,
    fatal: FatalErrorSink,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    #[must_use]
    pub fn new(name: &'static str, payload: Box<dyn TaskPayload>, fatal: FatalErrorSink) -> Self {
        Self {
            name,
            ctx: Arc::new(TaskContext::default()),
            payload: Mutex::new(Some(payload)),
            fatal,
            thread: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<TaskContext> {
        &self.ctx
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Starts the worker thread exactly once; a no-op after completion or
    /// if already started.
    pub fn start(&self, on_done: DoneNotifier) {
        let mut thread = self.thread.lock();
        if self.ctx.is_done() || thread.is_some() {
            return;
        }
        let Some(payload) = self.payload.lock().take() else {
            return;
        };
        self.ctx.started.store(true, Ordering::Release);

        let ctx = Arc::clone(&self.ctx);
        let fatal = Arc::clone(&self.fatal);
        let name = self.name;
        let builder = std::thread::Builder::new()
            .name(format!("prism-{name}"))
            .stack_size(TASK_STACK_SIZE);
        match builder.spawn(move || worker(&ctx, payload, &fatal, &on_done)) {
            Ok(handle) => *thread = Some(handle),
            Err(e) => {
                log::warn!("failed to spawn {name} task thread: {e}");
                self.ctx
                    .record_failure(Failure::from_code(codes::OUT_OF_MEMORY));
                self.ctx.done.store(true, Ordering::Release);
                self.ctx.started.store(false, Ordering::Release);
            }
        }
    }

    pub fn request_stop(&self) {
        self.ctx.request_stop();
    }

    /// Requests a stop and joins the worker thread.
    pub fn stop(&self) {
        self.ctx.request_stop();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::warn!("{} task thread terminated abnormally", self.name);
            }
        }
    }

    pub fn pause(&self) {
        self.ctx.pause();
    }

    pub fn resume(&self) {
        self.ctx.resume();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.ctx.is_paused()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.ctx.started.load(Ordering::Acquire) && !self.ctx.is_done()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.ctx.is_done()
    }

    #[must_use]
    pub fn failure(&self) -> Option<Failure> {
        self.ctx.failure()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The worker-thread protocol around the payload hooks.
fn worker(
    ctx: &Arc<TaskContext>,
    mut payload: Box<dyn TaskPayload>,
    fatal: &FatalErrorSink,
    on_done: &DoneNotifier,
) {
    platform_thread_init();

    let timer = TaskTimer::new();

    let outcome = catch_unwind(AssertUnwindSafe(|| payload.run(ctx)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_stop() => {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| payload.stopped(ctx))) {
                let err = RenderError::Uncategorized(panic_text(&*panic, "stopping a task"));
                fatal(&err);
                ctx.record_failure(err.failure());
            }
        }
        Ok(Err(e)) => {
            fatal(&e);
            ctx.record_failure(e.failure());
        }
        Err(panic) => {
            let err = RenderError::Uncategorized(panic_text(&*panic, "running a task"));
            fatal(&err);
            ctx.record_failure(err.failure());
        }
    }

    ctx.real_time_ms
        .store(timer.elapsed_real_ms(), Ordering::Release);
    ctx.cpu_time_ms
        .store(timer.elapsed_cpu_ms().unwrap_or(-1), Ordering::Release);

    // finish() always runs; its errors are reported but cannot fail the
    // task a second time.
    match catch_unwind(AssertUnwindSafe(|| payload.finish(ctx))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => fatal(&e),
        Err(panic) => fatal(&RenderError::Uncategorized(panic_text(
            &*panic,
            "finishing a task",
        ))),
    }

    ctx.done.store(true, Ordering::Release);
    on_done();
}

fn panic_text(panic: &(dyn std::any::Any + Send), during: &str) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    format!("An unexpected error occurred {during}: {detail}")
}

/// Per-platform worker initialisation hook. Nothing to do on Unix.
fn platform_thread_init() {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingPayload {
        ran: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    impl TaskPayload for CountingPayload {
        fn run(&mut self, ctx: &TaskContext) -> Result<()> {
            ctx.cooperate()?;
            self.ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finish(&mut self, _ctx: &TaskContext) -> Result<()> {
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn noop_sink() -> FatalErrorSink {
        Arc::new(|_| {})
    }

    fn wait_done(task: &Task) {
        while !task.is_done() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn run_and_finish_each_execute_once() {
        let ran = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let task = Task::new(
            "test",
            Box::new(CountingPayload {
                ran: Arc::clone(&ran),
                finished: Arc::clone(&finished),
            }),
            noop_sink(),
        );
        task.start(Arc::new(|| {}));
        task.start(Arc::new(|| {})); // second start is a no-op
        wait_done(&task);
        task.stop();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(task.failure().is_none());
        assert!(task.context().consumed_real_time_ms() >= 0);
    }

    struct BlockingPayload;

    impl TaskPayload for BlockingPayload {
        fn run(&mut self, ctx: &TaskContext) -> Result<()> {
            loop {
                ctx.cooperate()?;
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn stop_terminates_a_spinning_task() {
        let task = Task::new("spin", Box::new(BlockingPayload), noop_sink());
        task.start(Arc::new(|| {}));
        std::thread::sleep(Duration::from_millis(10));
        task.stop();
        assert!(task.is_done());
        // A cooperative stop is not a failure.
        assert!(task.failure().is_none());
    }

    #[test]
    fn pause_then_resume_lets_the_task_complete() {
        let ran = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let task = Task::new(
            "pause",
            Box::new(CountingPayload {
                ran: Arc::clone(&ran),
                finished: Arc::clone(&finished),
            }),
            noop_sink(),
        );
        task.pause();
        task.pause(); // pause is idempotent
        task.start(Arc::new(|| {}));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!task.is_done());
        task.resume();
        task.resume(); // resume when not paused is a no-op
        wait_done(&task);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    struct FailingPayload;

    impl TaskPayload for FailingPayload {
        fn run(&mut self, _ctx: &TaskContext) -> Result<()> {
            Err(RenderError::Param("broken stage".into()))
        }
    }

    #[test]
    fn failures_reach_the_sink_and_the_failure_slot() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let sink: FatalErrorSink = Arc::new(move |err| {
            assert_eq!(err.code(), codes::PARAM);
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        let task = Task::new("fail", Box::new(FailingPayload), sink);
        task.start(Arc::new(|| {}));
        wait_done(&task);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(task.failure().unwrap().code, codes::PARAM);
    }

    struct PanickingPayload;

    impl TaskPayload for PanickingPayload {
        fn run(&mut self, _ctx: &TaskContext) -> Result<()> {
            panic!("kaboom");
        }
    }

    #[test]
    fn panics_map_to_uncategorized_failures() {
        let task = Task::new("panic", Box::new(PanickingPayload), noop_sink());
        task.start(Arc::new(|| {}));
        wait_done(&task);
        let failure = task.failure().unwrap();
        assert_eq!(failure.code, codes::UNCATEGORIZED);
        assert!(failure.text.contains("kaboom"));
    }
}
