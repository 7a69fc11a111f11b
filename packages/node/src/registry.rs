//! The job registry: invocation lifecycle, cancellation, and event logs.
//!
//! Every run is tracked here from submission to terminal state. Completed
//! invocations stay registered so results remain retrievable; entries are
//! removed only by an explicit clear sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use outpost_codec::{CallOutcome, ExceptionInfo, Locator};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Lifecycle state of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Submitted, not yet picked up by a worker.
    Pending,
    /// Executing on a worker.
    Running,
    /// Returned normally; result stored under the run key.
    Completed,
    /// Raised; exception and traceback captured as data.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl RunStatus {
    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One tagged unit of output produced during execution.
///
/// Stdout and Stderr events preserve production order; the Result event is
/// the terminal event of every log, exactly once.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    Stdout(Vec<String>),
    Stderr(Vec<String>),
    Result(CallOutcome),
}

/// Ordered, replayable event log for one invocation.
///
/// Subscribers read by index and await new events, so a subscriber that
/// joins after completion still replays the full sequence.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<OutputEvent>>,
    notify: Notify,
}

impl EventLog {
    fn push(&self, event: OutputEvent) {
        self.events.lock().unwrap().push(event);
        self.notify.notify_waiters();
    }

    fn get(&self, index: usize) -> Option<OutputEvent> {
        self.events.lock().unwrap().get(index).cloned()
    }

    /// Wait for the event at `index`, returning immediately if it already
    /// exists.
    pub async fn wait_from(&self, index: usize) -> OutputEvent {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.get(index) {
                return event;
            }
            notified.await;
        }
    }

    /// Number of events currently in the log.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Whether the log holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cancelled_exception(key: &str) -> ExceptionInfo {
    ExceptionInfo::new("Cancelled", format!("run '{}' was cancelled", key), "")
}

/// One tracked remote execution.
pub struct Invocation {
    key: String,
    locator: Locator,
    status: Mutex<RunStatus>,
    cancel: AtomicBool,
    force: AtomicBool,
    log: EventLog,
}

impl Invocation {
    fn new(key: String, locator: Locator) -> Self {
        Self {
            key,
            locator,
            status: Mutex::new(RunStatus::Pending),
            cancel: AtomicBool::new(false),
            force: AtomicBool::new(false),
            log: EventLog::default(),
        }
    }

    /// The run key identifying this invocation.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The locator this invocation executes.
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Current lifecycle state.
    pub fn status(&self) -> RunStatus {
        *self.status.lock().unwrap()
    }

    /// The invocation's ordered event log.
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Whether cancellation has been requested. Polled cooperatively by
    /// handler code at safe points.
    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Whether best-effort interruption was requested.
    pub fn force_requested(&self) -> bool {
        self.force.load(Ordering::SeqCst)
    }

    /// Transition Pending -> Running. Returns false if the invocation is
    /// already terminal (e.g. cancelled before pickup).
    pub fn begin(&self) -> bool {
        let mut status = self.status.lock().unwrap();
        match *status {
            RunStatus::Pending => {
                *status = RunStatus::Running;
                true
            }
            _ => false,
        }
    }

    /// Append a stdout event tagged to this invocation.
    pub fn emit_stdout(&self, lines: Vec<String>) {
        self.log.push(OutputEvent::Stdout(lines));
    }

    /// Append a stderr event tagged to this invocation.
    pub fn emit_stderr(&self, lines: Vec<String>) {
        self.log.push(OutputEvent::Stderr(lines));
    }

    /// Settle into a terminal state, first writer wins.
    ///
    /// A cancel racing a natural completion resolves here: whichever
    /// transition arrives first is kept, the loser's effect is discarded.
    /// Pushes the terminal Result event exactly once.
    pub fn settle(&self, status: RunStatus, outcome: CallOutcome) -> bool {
        debug_assert!(status.is_terminal());
        {
            let mut current = self.status.lock().unwrap();
            if current.is_terminal() {
                return false;
            }
            *current = status;
        }
        debug!(key = %self.key, ?status, "invocation settled");
        self.log.push(OutputEvent::Result(outcome));
        true
    }

    /// Request cancellation. Pending invocations settle immediately;
    /// Running ones observe the token at their next safe point.
    pub fn request_cancel(&self, force: bool) {
        self.cancel.store(true, Ordering::SeqCst);
        if force {
            self.force.store(true, Ordering::SeqCst);
        }

        let settled_pending = {
            let mut status = self.status.lock().unwrap();
            if *status == RunStatus::Pending {
                *status = RunStatus::Cancelled;
                true
            } else {
                false
            }
        };
        if settled_pending {
            self.log
                .push(OutputEvent::Result(CallOutcome::error(cancelled_exception(
                    &self.key,
                ))));
        }
    }

    /// Wait for the terminal Result event, replaying the log as needed.
    pub async fn wait_outcome(&self) -> CallOutcome {
        let mut index = 0;
        loop {
            match self.log.wait_from(index).await {
                OutputEvent::Result(outcome) => return outcome,
                _ => index += 1,
            }
        }
    }

    /// The terminal outcome, if the invocation has settled.
    pub fn outcome(&self) -> Option<CallOutcome> {
        let events = self.log.events.lock().unwrap();
        events.iter().rev().find_map(|event| match event {
            OutputEvent::Result(outcome) => Some(outcome.clone()),
            _ => None,
        })
    }
}

/// Registry of in-flight and completed invocations, by key.
///
/// Registering a new invocation is a mutation and takes the same lock as
/// `cancel_all`, which makes cancel-all atomic with respect to new
/// submissions.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Arc<Invocation>>>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new Pending invocation under `key`, replacing any
    /// previous invocation at that key.
    pub fn register(&self, key: impl Into<String>, locator: Locator) -> Arc<Invocation> {
        let key = key.into();
        let invocation = Arc::new(Invocation::new(key.clone(), locator));
        self.jobs
            .lock()
            .unwrap()
            .insert(key, Arc::clone(&invocation));
        invocation
    }

    /// Look up an invocation by key.
    pub fn get(&self, key: &str) -> Option<Arc<Invocation>> {
        self.jobs.lock().unwrap().get(key).cloned()
    }

    /// All registered keys, in-flight or completed.
    pub fn list_keys(&self) -> Vec<String> {
        self.jobs.lock().unwrap().keys().cloned().collect()
    }

    /// Cancel the named invocations. Terminal or unknown keys are a no-op.
    pub fn cancel(&self, keys: &[String], force: bool) {
        for key in keys {
            if let Some(invocation) = self.get(key) {
                info!(key = %key, force, "cancel requested");
                invocation.request_cancel(force);
            }
        }
    }

    /// Cancel every Pending/Running invocation, atomically with respect to
    /// new submissions.
    pub fn cancel_all(&self, force: bool) {
        let jobs = self.jobs.lock().unwrap();
        info!(count = jobs.len(), force, "cancel-all requested");
        for invocation in jobs.values() {
            invocation.request_cancel(force);
        }
    }

    /// Remove the named invocations if they are terminal. Running entries
    /// are left in place.
    pub fn remove_terminal(&self, keys: &[String]) {
        let mut jobs = self.jobs.lock().unwrap();
        for key in keys {
            let terminal = jobs
                .get(key)
                .map(|inv| inv.status().is_terminal())
                .unwrap_or(false);
            if terminal {
                jobs.remove(key);
            }
        }
    }

    /// Remove every terminal invocation whose key is not in `keep`.
    pub fn sweep_terminal(&self, keep: &[String]) {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.retain(|key, inv| !inv.status().is_terminal() || keep.contains(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_codec::Value;

    fn locator() -> Locator {
        Locator::call("ops", "test")
    }

    #[test]
    fn lifecycle_pending_running_completed() {
        let registry = JobRegistry::new();
        let inv = registry.register("k", locator());
        assert_eq!(inv.status(), RunStatus::Pending);

        assert!(inv.begin());
        assert_eq!(inv.status(), RunStatus::Running);

        assert!(inv.settle(RunStatus::Completed, CallOutcome::ok(Value::from(6i64))));
        assert_eq!(inv.status(), RunStatus::Completed);
        assert_eq!(
            inv.outcome().unwrap().value,
            Some(Value::Integer(6))
        );
    }

    #[test]
    fn settle_is_first_writer_wins() {
        let registry = JobRegistry::new();
        let inv = registry.register("k", locator());
        inv.begin();

        assert!(inv.settle(RunStatus::Completed, CallOutcome::ok(Value::Null)));
        assert!(!inv.settle(
            RunStatus::Cancelled,
            CallOutcome::error(ExceptionInfo::new("Cancelled", "late", ""))
        ));

        assert_eq!(inv.status(), RunStatus::Completed);
        // Exactly one terminal Result event.
        assert_eq!(inv.log().len(), 1);
    }

    #[test]
    fn cancel_pending_settles_immediately() {
        let registry = JobRegistry::new();
        let inv = registry.register("k", locator());

        inv.request_cancel(false);

        assert_eq!(inv.status(), RunStatus::Cancelled);
        assert!(!inv.begin());
        let outcome = inv.outcome().unwrap();
        assert_eq!(outcome.exception.unwrap().kind, "Cancelled");
    }

    #[test]
    fn cancel_running_only_sets_token() {
        let registry = JobRegistry::new();
        let inv = registry.register("k", locator());
        inv.begin();

        inv.request_cancel(true);

        assert_eq!(inv.status(), RunStatus::Running);
        assert!(inv.cancel_requested());
        assert!(inv.force_requested());
    }

    #[test]
    fn cancel_terminal_is_noop() {
        let registry = JobRegistry::new();
        let inv = registry.register("k", locator());
        inv.begin();
        inv.settle(RunStatus::Completed, CallOutcome::ok(Value::Null));

        registry.cancel(&["k".to_string()], true);

        assert_eq!(inv.status(), RunStatus::Completed);
        assert_eq!(inv.log().len(), 1);
    }

    #[test]
    fn cancel_unknown_key_is_noop() {
        let registry = JobRegistry::new();
        registry.cancel(&["ghost".to_string()], false);
    }

    #[test]
    fn concurrent_cancel_and_complete_settle_once() {
        use std::thread;

        for _ in 0..50 {
            let registry = JobRegistry::new();
            let inv = registry.register("k", locator());
            inv.begin();

            let a = Arc::clone(&inv);
            let b = Arc::clone(&inv);
            let complete = thread::spawn(move || {
                a.settle(RunStatus::Completed, CallOutcome::ok(Value::from(1i64)))
            });
            let cancel = thread::spawn(move || {
                b.request_cancel(true);
                b.settle(
                    RunStatus::Cancelled,
                    CallOutcome::error(ExceptionInfo::new("Cancelled", "cancelled", "")),
                )
            });

            let completed = complete.join().unwrap();
            let cancelled = cancel.join().unwrap();

            // Exactly one writer won.
            assert!(completed ^ cancelled);
            assert!(inv.status().is_terminal());
            assert_eq!(inv.log().len(), 1);

            // Repeated reads agree.
            let first = inv.status();
            assert_eq!(inv.status(), first);
        }
    }

    #[test]
    fn remove_terminal_leaves_running_entries() {
        let registry = JobRegistry::new();
        let running = registry.register("running", locator());
        running.begin();
        let done = registry.register("done", locator());
        done.begin();
        done.settle(RunStatus::Completed, CallOutcome::ok(Value::Null));

        registry.remove_terminal(&["running".to_string(), "done".to_string()]);

        assert!(registry.get("running").is_some());
        assert!(registry.get("done").is_none());
    }

    #[tokio::test]
    async fn late_subscriber_replays_full_log() {
        let registry = JobRegistry::new();
        let inv = registry.register("k", locator());
        inv.begin();
        inv.emit_stdout(vec!["a".to_string()]);
        inv.emit_stdout(vec!["b".to_string()]);
        inv.settle(RunStatus::Completed, CallOutcome::ok(Value::from("r")));

        let first = inv.log().wait_from(0).await;
        let second = inv.log().wait_from(1).await;
        let third = inv.log().wait_from(2).await;

        assert!(matches!(first, OutputEvent::Stdout(ref l) if l == &vec!["a".to_string()]));
        assert!(matches!(second, OutputEvent::Stdout(ref l) if l == &vec!["b".to_string()]));
        assert!(matches!(third, OutputEvent::Result(_)));
    }

    #[tokio::test]
    async fn wait_outcome_blocks_until_settled() {
        let registry = JobRegistry::new();
        let inv = registry.register("k", locator());
        inv.begin();

        let waiter = Arc::clone(&inv);
        let task = tokio::spawn(async move { waiter.wait_outcome().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        inv.emit_stdout(vec!["progress".to_string()]);
        inv.settle(RunStatus::Completed, CallOutcome::ok(Value::from(9i64)));

        let outcome = task.await.unwrap();
        assert_eq!(outcome.value, Some(Value::Integer(9)));
    }
}
