//! Optimistic command execution.
//!
//! A [`Command`] is one state-changing operation split into phases so each can
//! be tested in isolation: `optimistic_apply` mutates the local view before
//! persistence is even attempted, `run` does the actual (async, fallible)
//! persistence, `commit` applies the confirmed outcome, and `rollback`
//! restores the pre-optimistic view. [`ActionRunner`] drives the phases and
//! owns the retry policy and the user-facing feedback hooks.
//!
//! The invariant the runner maintains: after `execute` returns, the local view
//! either reflects a committed write or is exactly what it was before the
//! call. There is no path that leaves the optimistic guess in place after a
//! failure.

use std::rc::Rc;

use chrono::TimeDelta;

use crate::time::Sleeper;

/// What a command's `run` phase reports back. `success: false` is a
/// definitive refusal from the persistence layer and is not retried; only an
/// `Err` from `run` counts as transient.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub success: bool,
    pub message: String,
}

impl RunReport {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// One state-changing operation, split into phases.
pub trait Command {
    type Error: std::fmt::Display;

    /// Mutates the in-memory view before persistence confirms anything.
    fn optimistic_apply(&mut self) {}

    /// Restores the view to its pre-optimistic state. Called on every failure
    /// path, including when `optimistic_apply` was never invoked, so it must
    /// tolerate having nothing to undo.
    fn rollback(&mut self) {}

    /// Applies the confirmed outcome. Called exactly once, after a successful
    /// `run`.
    fn commit(&mut self, report: &RunReport) {
        let _ = report;
    }

    /// Performs the persistence. An `Err` is treated as transient and
    /// retried; a `RunReport { success: false, .. }` is final.
    async fn run(&mut self) -> Result<RunReport, Self::Error>;

    /// Toast to show on success; `None` suppresses it.
    fn success_toast(&self, report: &RunReport) -> Option<String> {
        Some(report.message.clone())
    }

    /// Toast to show on failure; `None` suppresses it.
    fn error_toast(&self, message: &str) -> Option<String> {
        Some(message.to_string())
    }
}

/// Fire-and-forget feedback hooks. Toasts are not part of the result
/// contract; a host that doesn't render anything can use [`NullNotifier`].
pub trait Notifier {
    fn success_toast(&self, message: &str) {
        let _ = message;
    }
    fn error_toast(&self, message: &str) {
        let _ = message;
    }
    fn set_last_error(&self, message: &str) {
        let _ = message;
    }
}

pub struct NullNotifier;

impl Notifier for NullNotifier {}

/// Fixed attempt count with a fixed backoff between attempts. There is no
/// cancellation token: a stale retry that succeeds after its context went
/// away is a benign extra write.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: TimeDelta,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: TimeDelta::milliseconds(300),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            backoff: TimeDelta::zero(),
        }
    }
}

/// What the caller gets back. Failures arrive here as values; nothing from
/// the persistence layer escapes `execute` as a panic or an unhandled error.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            error: Some(message.clone()),
            message,
        }
    }
}

pub struct ActionRunner {
    retry: RetryPolicy,
    sleeper: Rc<dyn Sleeper>,
    notifier: Rc<dyn Notifier>,
}

impl ActionRunner {
    pub fn new(retry: RetryPolicy, sleeper: Rc<dyn Sleeper>, notifier: Rc<dyn Notifier>) -> Self {
        Self {
            retry,
            sleeper,
            notifier,
        }
    }

    pub fn notifier(&self) -> Rc<dyn Notifier> {
        self.notifier.clone()
    }

    /// Full execution: optimistic apply, persist with retries, then commit or
    /// roll back.
    pub async fn execute<C: Command>(&self, mut command: C) -> ExecutionResult {
        command.optimistic_apply();
        self.settle(&mut command).await
    }

    /// Persist-only execution for commands whose optimistic change already
    /// happened (replay of queued offline actions).
    pub async fn execute_prepared<C: Command>(&self, mut command: C) -> ExecutionResult {
        self.settle(&mut command).await
    }

    async fn settle<C: Command>(&self, command: &mut C) -> ExecutionResult {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match command.run().await {
                Ok(report) => break Ok(report),
                Err(error) if attempt < attempts => {
                    log::warn!("attempt {attempt}/{attempts} failed, retrying: {error}");
                    self.sleeper.sleep(self.retry.backoff).await;
                }
                Err(error) => break Err(error),
            }
        };

        match outcome {
            Ok(report) if report.success => {
                command.commit(&report);
                if let Some(toast) = command.success_toast(&report) {
                    self.notifier.success_toast(&toast);
                }
                ExecutionResult::success(report.message)
            }
            Ok(report) => self.fail(command, report.message),
            Err(error) => self.fail(command, error.to_string()),
        }
    }

    fn fail<C: Command>(&self, command: &mut C, message: String) -> ExecutionResult {
        command.rollback();
        self.notifier.set_last_error(&message);
        if let Some(toast) = command.error_toast(&message) {
            self.notifier.error_toast(&toast);
        }
        ExecutionResult::failure(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::NoopSleeper;
    use futures::executor::block_on;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Trace {
        optimistic: u32,
        rollbacks: u32,
        commits: u32,
        runs: u32,
    }

    /// Scripted command: each entry is one `run` outcome.
    struct Scripted<'a> {
        script: Vec<Result<RunReport, String>>,
        trace: &'a RefCell<Trace>,
    }

    impl Command for Scripted<'_> {
        type Error = String;

        fn optimistic_apply(&mut self) {
            self.trace.borrow_mut().optimistic += 1;
        }

        fn rollback(&mut self) {
            self.trace.borrow_mut().rollbacks += 1;
        }

        fn commit(&mut self, _report: &RunReport) {
            self.trace.borrow_mut().commits += 1;
        }

        async fn run(&mut self) -> Result<RunReport, String> {
            self.trace.borrow_mut().runs += 1;
            self.script.remove(0)
        }
    }

    struct ToastNotifier(Rc<RefCell<Vec<String>>>);

    impl Notifier for ToastNotifier {
        fn success_toast(&self, message: &str) {
            self.0.borrow_mut().push(format!("ok:{message}"));
        }
        fn error_toast(&self, message: &str) {
            self.0.borrow_mut().push(format!("err:{message}"));
        }
    }

    fn runner(retry: RetryPolicy) -> ActionRunner {
        ActionRunner::new(retry, Rc::new(NoopSleeper), Rc::new(NullNotifier))
    }

    #[test]
    fn test_two_rejections_then_success_within_budget() {
        let trace = RefCell::new(Trace::default());
        let command = Scripted {
            script: vec![
                Err("flaky".into()),
                Err("flaky".into()),
                Ok(RunReport::success("done")),
            ],
            trace: &trace,
        };

        let result = block_on(runner(RetryPolicy::default()).execute(command));
        assert!(result.success);

        let trace = trace.borrow();
        assert_eq!(trace.runs, 3);
        assert_eq!(trace.optimistic, 1);
        assert_eq!(trace.rollbacks, 0);
        assert_eq!(trace.commits, 1);
    }

    #[test]
    fn test_exhausted_retries_roll_back() {
        let trace = RefCell::new(Trace::default());
        let command = Scripted {
            script: vec![Err("down".into()), Err("down".into()), Err("down".into())],
            trace: &trace,
        };

        let result = block_on(runner(RetryPolicy::default()).execute(command));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("down"));

        let trace = trace.borrow();
        assert_eq!(trace.runs, 3);
        assert_eq!(trace.rollbacks, 1);
        assert_eq!(trace.commits, 0);
    }

    #[test]
    fn test_definitive_refusal_is_not_retried() {
        let trace = RefCell::new(Trace::default());
        let command = Scripted {
            script: vec![Ok(RunReport::failure("no such record"))],
            trace: &trace,
        };

        let result = block_on(runner(RetryPolicy::default()).execute(command));
        assert!(!result.success);

        let trace = trace.borrow();
        assert_eq!(trace.runs, 1);
        assert_eq!(trace.rollbacks, 1);
    }

    #[test]
    fn test_prepared_execution_skips_optimistic_apply() {
        let trace = RefCell::new(Trace::default());
        let command = Scripted {
            script: vec![Ok(RunReport::success("done"))],
            trace: &trace,
        };

        let result = block_on(runner(RetryPolicy::no_retry()).execute_prepared(command));
        assert!(result.success);
        assert_eq!(trace.borrow().optimistic, 0);
    }

    #[test]
    fn test_toasts_fire_on_both_paths() {
        let trace = RefCell::new(Trace::default());
        let toasts: Rc<RefCell<Vec<String>>> = Rc::default();

        let ok = Scripted {
            script: vec![Ok(RunReport::success("saved"))],
            trace: &trace,
        };
        let bad = Scripted {
            script: vec![Err("lost".into())],
            trace: &trace,
        };

        let runner = ActionRunner::new(
            RetryPolicy::no_retry(),
            Rc::new(NoopSleeper),
            Rc::new(ToastNotifier(toasts.clone())),
        );
        block_on(runner.execute(ok));
        block_on(runner.execute(bad));

        assert_eq!(*toasts.borrow(), vec!["ok:saved", "err:lost"]);
    }
}
