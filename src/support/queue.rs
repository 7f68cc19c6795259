//! Task Queue
//!
//! An ordered pipeline of entries drained by a single driver thread. Four
//! entry kinds exist: a task (started on its own worker thread), a sync
//! barrier (holds everything behind it until every active task is done), a
//! fire-and-forget message, and a callback executed on the driver thread.
//!
//! A sync between two batches of tasks therefore implements a fork/join:
//! no entry behind the barrier starts before every task in front of it has
//! reported done.
//!
//! Failure handling is first-wins: the first failure code absorbed from a
//! reaped task stops the queue (two-phase: request-stop every active task,
//! then join each) and is reported by the owning control thread.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::errors::Failure;
use crate::messages::Message;
use crate::messages::bus::MessageSink;
use crate::support::task::{DoneNotifier, Task};

/// A callback run on the queue-processing thread.
pub type QueueFunction = Box<dyn FnOnce(&TaskQueue) + Send>;

/// One scheduled pipeline entry.
pub enum TaskEntry {
    Task(Arc<Task>),
    Sync,
    Message(Message),
    Function(QueueFunction),
}

struct QueueState {
    queued: std::collections::VecDeque<TaskEntry>,
    active: SmallVec<[Arc<Task>; 8]>,
    failed: Option<Failure>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

pub struct TaskQueue {
    shared: Arc<QueueShared>,
    bus: Arc<dyn MessageSink>,
}

impl TaskQueue {
    #[must_use]
    pub fn new(bus: Arc<dyn MessageSink>) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    queued: std::collections::VecDeque::new(),
                    active: SmallVec::new(),
                    failed: None,
                }),
                cond: Condvar::new(),
            }),
            bus,
        }
    }

    /// Schedules a task; ownership moves to the queue. Appending new work
    /// clears a previous failure so a queue can be reused after an abort.
    pub fn append_task(&self, task: Task) -> Arc<Task> {
        let task = Arc::new(task);
        let mut state = self.shared.state.lock();
        state.failed = None;
        state.queued.push_back(TaskEntry::Task(Arc::clone(&task)));
        drop(state);
        self.notify();
        task
    }

    /// Schedules a barrier.
    pub fn append_sync(&self) {
        self.shared.state.lock().queued.push_back(TaskEntry::Sync);
        self.notify();
    }

    /// Schedules a fire-and-forget message send.
    pub fn append_message(&self, msg: Message) {
        self.shared
            .state
            .lock()
            .queued
            .push_back(TaskEntry::Message(msg));
        self.notify();
    }

    /// Schedules a callback to run on the driver thread.
    pub fn append_function(&self, f: impl FnOnce(&TaskQueue) + Send + 'static) {
        self.shared
            .state
            .lock()
            .queued
            .push_back(TaskEntry::Function(Box::new(f)));
        self.notify();
    }

    /// Runs one scheduling step. Returns `true` iff more work may be
    /// immediately available.
    pub fn process(&self) -> bool {
        let mut state = self.shared.state.lock();

        // Reap finished tasks, absorbing the first failure seen.
        let mut absorbed = state.failed.clone();
        state.active.retain(|task| {
            if absorbed.is_none() {
                absorbed = task.failure();
            }
            !task.is_done()
        });
        state.failed = absorbed;

        if state.failed.is_some() {
            Self::stop_locked(&mut state);
            self.notify();
            return false;
        }

        match state.queued.pop_front() {
            Some(TaskEntry::Task(task)) => {
                state.active.push(Arc::clone(&task));
                let shared = Arc::clone(&self.shared);
                let notifier: DoneNotifier = Arc::new(move || { shared.cond.notify_one(); });
                task.start(notifier);
            }
            Some(TaskEntry::Sync) => {
                if !state.active.is_empty() {
                    // Cannot pass the barrier yet; put it back and wait.
                    state.queued.push_front(TaskEntry::Sync);
                    self.shared
                        .cond
                        .wait_for(&mut state, Duration::from_millis(50));
                    return false;
                }
            }
            Some(TaskEntry::Message(msg)) => {
                // Send outside the lock; delivery failures are ignored.
                drop(state);
                if self.bus.send(msg).is_err() {
                    log::debug!("queued message dropped: transport closed");
                }
                state = self.shared.state.lock();
            }
            Some(TaskEntry::Function(f)) => {
                drop(state);
                f(self);
                state = self.shared.state.lock();
            }
            None => {}
        }

        if state.queued.is_empty() {
            // The timeout bounds the window of a completion signal racing
            // this wait; appends and task completions notify the condvar.
            self.shared
                .cond
                .wait_for(&mut state, Duration::from_millis(50));
        }

        !state.queued.is_empty()
    }

    /// Stops all active tasks and clears the pipeline.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        Self::stop_locked(&mut state);
        drop(state);
        self.notify();
    }

    // Two passes: set every cancel flag first, then join. Joining as we go
    // would leave later tasks running obliviously while earlier ones wind
    // down, which makes shutdown take much longer than it needs to when
    // there are more threads than cores.
    fn stop_locked(state: &mut QueueState) {
        for task in &state.active {
            task.request_stop();
        }
        for task in &state.active {
            task.stop();
        }
        state.active.clear();
        state.queued.clear();
    }

    pub fn pause(&self) {
        let state = self.shared.state.lock();
        for task in &state.active {
            task.pause();
        }
    }

    pub fn resume(&self) {
        let state = self.shared.state.lock();
        for task in &state.active {
            task.resume();
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        let state = self.shared.state.lock();
        state.active.iter().any(|t| t.is_paused())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        let state = self.shared.state.lock();
        !state.queued.is_empty() || state.active.iter().any(|t| t.is_running())
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        let state = self.shared.state.lock();
        state.queued.is_empty() && state.active.iter().all(|t| t.is_done())
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.shared.state.lock().failed.is_some()
    }

    #[must_use]
    pub fn failure_code(&self, default: i32) -> i32 {
        self.shared
            .state
            .lock()
            .failed
            .as_ref()
            .map_or(default, |f| f.code)
    }

    #[must_use]
    pub fn failure(&self) -> Option<Failure> {
        self.shared.state.lock().failed.clone()
    }

    pub fn notify(&self) {
        self.shared.cond.notify_one();
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{RenderError, Result};
    use crate::messages::bus::NullBus;
    use crate::support::task::{TaskContext, TaskPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        log: Arc<Mutex<Vec<usize>>>,
        id: usize,
        delay_ms: u64,
    }

    impl TaskPayload for Recorder {
        fn run(&mut self, ctx: &TaskContext) -> Result<()> {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
            ctx.cooperate()?;
            self.log.lock().push(self.id);
            Ok(())
        }
    }

    fn drain(queue: &TaskQueue) {
        while !queue.is_done() {
            queue.process();
        }
    }

    fn noop_sink() -> crate::support::task::FatalErrorSink {
        Arc::new(|_| {})
    }

    #[test]
    fn sync_barrier_orders_batches() {
        let queue = TaskQueue::new(Arc::new(NullBus));
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            queue.append_task(Task::new(
                "a",
                Box::new(Recorder {
                    log: Arc::clone(&log),
                    id,
                    delay_ms: 20 - (id as u64) * 5,
                }),
                noop_sink(),
            ));
        }
        queue.append_sync();
        queue.append_task(Task::new(
            "b",
            Box::new(Recorder {
                log: Arc::clone(&log),
                id: 99,
                delay_ms: 0,
            }),
            noop_sink(),
        ));
        drain(&queue);
        let order = log.lock().clone();
        assert_eq!(order.len(), 4);
        assert_eq!(*order.last().unwrap(), 99);
    }

    struct Exploder;

    impl TaskPayload for Exploder {
        fn run(&mut self, _ctx: &TaskContext) -> Result<()> {
            Err(RenderError::OutOfMemory)
        }
    }

    struct NeverRuns(Arc<AtomicUsize>);

    impl TaskPayload for NeverRuns {
        fn run(&mut self, _ctx: &TaskContext) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn failure_stops_the_pipeline_and_wins_first() {
        let queue = TaskQueue::new(Arc::new(NullBus));
        let ran = Arc::new(AtomicUsize::new(0));
        queue.append_task(Task::new("boom", Box::new(Exploder), noop_sink()));
        queue.append_sync();
        queue.append_task(Task::new(
            "after",
            Box::new(NeverRuns(Arc::clone(&ran))),
            noop_sink(),
        ));
        // Drive until the failure is absorbed.
        for _ in 0..200 {
            if queue.failed() {
                break;
            }
            queue.process();
        }
        assert!(queue.failed());
        assert_eq!(queue.failure_code(0), crate::errors::codes::OUT_OF_MEMORY);
        assert!(queue.is_done());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn queued_functions_run_on_the_driver_thread() {
        let queue = TaskQueue::new(Arc::new(NullBus));
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = Arc::clone(&hit);
        let driver = std::thread::current().id();
        queue.append_function(move |_q| {
            assert_eq!(std::thread::current().id(), driver);
            hit2.fetch_add(1, Ordering::SeqCst);
        });
        drain(&queue);
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn appending_a_task_clears_a_stale_failure() {
        let queue = TaskQueue::new(Arc::new(NullBus));
        queue.append_task(Task::new("boom", Box::new(Exploder), noop_sink()));
        for _ in 0..200 {
            if queue.failed() {
                break;
            }
            queue.process();
        }
        assert!(queue.failed());
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.append_task(Task::new(
            "retry",
            Box::new(Recorder {
                log: Arc::clone(&log),
                id: 1,
                delay_ms: 0,
            }),
            noop_sink(),
        ));
        assert!(!queue.failed());
        drain(&queue);
        assert_eq!(log.lock().as_slice(), &[1]);
    }
}
