//! EventTask: a single handler invocation with timeout, retry, and
//! cancellation discipline (§4.2).
//!
//! Grounded on the teacher's cancellation-racing pattern in
//! `agent/runtime/impls/retry.rs` (`tokio::time::sleep` + retry loop) and
//! `agent/runtime/impls/dag_executor.rs` (`tokio::spawn` + join), but
//! reworked around `tokio_util::sync::CancellationToken` composition so
//! that external signal, timeout, and explicit cancel are a single union
//! source, per §5 "Cancellation & timeouts".

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::retry::RetryDelayFn;
use crate::state_machine::{StateMachine, TaskState};

/// A boxed async handler: takes the context-carrying payload and an
/// augmented cancellation token, returns the handler's result or an error
/// message (§4.2: "Output: either the handler's return value, or ... the
/// last handler error").
pub type HandlerFn<P, R> = Arc<
    dyn Fn(P, CancellationToken) -> Pin<Box<dyn Future<Output = Result<R, String>> + Send>>
        + Send
        + Sync,
>;

/// Options controlling one task execution (§6 "Task options").
#[derive(Clone)]
pub struct TaskOptions {
    pub id: Option<String>,
    pub name: Option<String>,
    pub max_retries: u32,
    pub retry_delay: RetryDelayFn,
    pub timeout: Option<Duration>,
    pub is_retryable: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    pub on_state_change: Option<Arc<dyn Fn(TaskState) + Send + Sync>>,
    pub on_retry: Option<Arc<dyn Fn(u32, &str) + Send + Sync>>,
    pub on_timeout: Option<Arc<dyn Fn(Duration) + Send + Sync>>,
    pub on_cancel: Option<Arc<dyn Fn() + Send + Sync>>,
    pub throw_on_error: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            max_retries: 0,
            retry_delay: crate::retry::fixed(Duration::from_millis(0)),
            timeout: None,
            is_retryable: Arc::new(|_| true),
            on_state_change: None,
            on_retry: None,
            on_timeout: None,
            on_cancel: None,
            throw_on_error: false,
        }
    }
}

impl std::fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOptions")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("throw_on_error", &self.throw_on_error)
            .finish()
    }
}

/// One execution of one handler, single-shot.
pub struct EventTask<P, R> {
    handler: HandlerFn<P, R>,
    options: TaskOptions,
    external_signal: CancellationToken,
    state: StateMachine,
    started: bool,
}

impl<P: Clone + Send + 'static, R: Send + 'static> EventTask<P, R> {
    pub fn new(handler: HandlerFn<P, R>, options: TaskOptions, external_signal: CancellationToken) -> Self {
        Self {
            handler,
            options,
            external_signal,
            state: StateMachine::new(),
            started: false,
        }
    }

    fn fire_state(&mut self, to: TaskState) {
        self.state
            .transition(to)
            .expect("illegal task state transition");
        if let Some(cb) = &self.options.on_state_change {
            cb(to);
        }
    }

    pub fn state(&self) -> TaskState {
        self.state.state()
    }

    /// Run the task to completion per the algorithm in §4.2.
    pub async fn execute(&mut self, payload: P) -> Result<R, TaskError> {
        if self.started {
            return Err(TaskError::AlreadyStarted);
        }
        self.started = true;

        // Step 1: pre-aborted signal short-circuits before any handler call.
        if self.external_signal.is_cancelled() {
            if let Some(cb) = &self.options.on_cancel {
                cb();
            }
            self.fire_state(TaskState::Cancelled);
            return Err(TaskError::Cancelled);
        }

        self.fire_state(TaskState::Scheduled);
        self.fire_state(TaskState::Running);

        let max_attempts = 1 + self.options.max_retries;
        let mut last_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            // Compose an internal cancellation source firing on (a) the
            // external signal, (b) timeout expiry (§4.2 step 3).
            let attempt_token = self.external_signal.child_token();

            let handler = self.handler.clone();
            let payload_clone = payload.clone();
            let handler_fut = (handler)(payload_clone, attempt_token.clone());

            let outcome = match self.options.timeout {
                Some(timeout) => {
                    tokio::select! {
                        biased;
                        _ = self.external_signal.cancelled() => Attempt::Cancelled,
                        res = tokio::time::timeout(timeout, catch_panic(handler_fut)) => {
                            match res {
                                Ok(inner) => Attempt::Resolved(inner),
                                Err(_) => Attempt::TimedOut,
                            }
                        }
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = self.external_signal.cancelled() => Attempt::Cancelled,
                        inner = catch_panic(handler_fut) => Attempt::Resolved(inner),
                    }
                }
            };

            match outcome {
                Attempt::Resolved(Ok(value)) => {
                    self.fire_state(TaskState::Completed);
                    return Ok(value);
                }
                Attempt::Cancelled => {
                    attempt_token.cancel();
                    if let Some(cb) = &self.options.on_cancel {
                        cb();
                    }
                    self.fire_state(TaskState::Cancelled);
                    return Err(TaskError::Cancelled);
                }
                Attempt::TimedOut => {
                    attempt_token.cancel();
                    let timeout = self.options.timeout.unwrap();
                    if let Some(cb) = &self.options.on_timeout {
                        cb(timeout);
                    }
                    self.fire_state(TaskState::Timeout);
                    last_error = Some(format!("timed out after {:?}", timeout));
                    // Timeout is always retryable (§4.2 step 3).
                    if attempt >= max_attempts {
                        self.fire_state(TaskState::Failed);
                        return Err(TaskError::Timeout { timeout });
                    }
                }
                Attempt::Resolved(Err(message)) => {
                    let retryable = (self.options.is_retryable)(&message);
                    last_error = Some(message.clone());
                    if !retryable || attempt >= max_attempts {
                        self.fire_state(TaskState::Failed);
                        return Err(TaskError::Handler {
                            message,
                            attempts: attempt,
                        });
                    }
                }
            }

            // Between attempts: retrying -> sleep -> running (§4.2 step 4).
            self.fire_state(TaskState::Retrying);
            if let Some(cb) = &self.options.on_retry {
                cb(attempt, last_error.as_deref().unwrap_or(""));
            }
            let delay = (self.options.retry_delay)(attempt);
            tokio::select! {
                biased;
                _ = self.external_signal.cancelled() => {
                    if let Some(cb) = &self.options.on_cancel {
                        cb();
                    }
                    self.fire_state(TaskState::Cancelled);
                    return Err(TaskError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            self.fire_state(TaskState::Running);
        }

        // Unreachable: loop always returns before exhausting max_attempts+1.
        self.fire_state(TaskState::Failed);
        Err(TaskError::Handler {
            message: last_error.unwrap_or_default(),
            attempts: max_attempts,
        })
    }
}

enum Attempt<R> {
    Resolved(Result<R, String>),
    TimedOut,
    Cancelled,
}

/// Wrap a handler future so a panic becomes a `Handler` error instead of
/// unwinding across the task boundary, matching §7's rule that the error
/// channel must never itself abort dispatch.
async fn catch_panic<R>(
    fut: impl Future<Output = Result<R, String>> + Send,
) -> Result<R, String> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(message)
        }
    }
}
