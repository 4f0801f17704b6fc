use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::dispatch::{Dispatch, Job, ThreadDispatch};
use crate::error::{append_error, is_cancellation, ErrorList, ScheduleError};
use crate::state::State;
use crate::wait::Wait;

/// Deferred second phase produced by a task's primary body.
pub type PostBody = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

type ExecFn = Box<dyn FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send>;
type PostHandleFn = Box<dyn FnMut(State, &[Arc<anyhow::Error>]) -> anyhow::Result<()> + Send>;

const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_millis(20);

struct Body {
    state: State,
    exec: Option<ExecFn>,
    post_handle: Option<PostHandleFn>,
    errors: ErrorList,
    attach_timeout: Duration,
}

struct Inner {
    body: Mutex<Body>,
    cond: Condvar,
    dispatcher: Arc<dyn Dispatch>,
}

/// Two-phase work unit.
///
/// The primary body may return a deferred post body; if the primary
/// succeeded, that post body runs before the post handler, and both may be
/// placed on a different executor than the primary — the classic "work on a
/// pool thread, callback on the looper thread" split. Where each phase runs
/// is decided by the [`Dispatch`] object the task was created with,
/// normally owned by its [`TaskStack`] or [`TaskSpawner`].
///
/// [`TaskStack`]: crate::TaskStack
/// [`TaskSpawner`]: crate::TaskSpawner
#[derive(Clone)]
pub struct Task {
    inner: Arc<Inner>,
}

impl Task {
    pub fn new(dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            inner: Arc::new(Inner {
                body: Mutex::new(Body {
                    state: State::empty(),
                    exec: None,
                    post_handle: None,
                    errors: Arc::new(Vec::new()),
                    attach_timeout: DEFAULT_ATTACH_TIMEOUT,
                }),
                cond: Condvar::new(),
                dispatcher,
            }),
        }
    }

    /// Standalone task on the default direct-thread binding.
    pub fn from_fn<F>(exec: F) -> Self
    where
        F: FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static,
    {
        let task = Self::new(Arc::new(ThreadDispatch));
        task.set_exec(exec);
        task
    }

    /// Attach (or replace) the primary body and pulse anyone parked on the
    /// attach grace.
    pub fn set_exec<F>(&self, exec: F)
    where
        F: FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static,
    {
        let mut body = self.inner.body.lock();
        body.exec = Some(Box::new(exec));
        self.inner.cond.notify_all();
    }

    /// Attach the post handler observing `(state, errors)` after the run.
    pub fn set_post_handle<F>(&self, post: F)
    where
        F: FnMut(State, &[Arc<anyhow::Error>]) -> anyhow::Result<()> + Send + 'static,
    {
        self.inner.body.lock().post_handle = Some(Box::new(post));
    }

    pub fn set_attach_timeout(&self, timeout: Duration) {
        self.inner.body.lock().attach_timeout = timeout;
    }

    // ----- Accessors ---------------------------------------------------------

    pub fn state(&self) -> State {
        self.inner.body.lock().state
    }

    pub fn errors(&self) -> ErrorList {
        self.inner.body.lock().errors.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state().is_started()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn is_canceled(&self) -> bool {
        self.state().is_canceled()
    }

    pub fn is_success(&self) -> bool {
        self.state().is_success()
    }

    pub fn is_failed(&self) -> bool {
        self.state().is_failed()
    }

    pub fn is_post_failed(&self) -> bool {
        self.state().is_post_failed()
    }

    /// Whether two handles refer to the same unit.
    pub fn same(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ----- Lifecycle ---------------------------------------------------------

    /// Launch the task: claim it and hand the composed two-phase body to
    /// the exec hook.
    ///
    /// If the exec hook itself fails, the same body falls back to the post
    /// hook, so at least the post phase still gets a chance to run.
    /// Returns `!is_canceled()`.
    pub fn execute(&self) -> bool {
        {
            let mut body = self.inner.body.lock();
            if !body.state.is_started() {
                body.state.insert(State::STARTED);
                body.errors = Arc::new(Vec::new());
            }
        }

        if let Err(err) = self.inner.dispatcher.dispatch_exec(self.phase_job()) {
            tracing::warn!(error = %err, "exec dispatch failed; falling back to post dispatch");
            {
                let mut body = self.inner.body.lock();
                append_error(&mut body.errors, err.into());
                body.state.insert(State::FAILED);
            }
            if let Err(err) = self.inner.dispatcher.dispatch_post(self.phase_job()) {
                let mut body = self.inner.body.lock();
                tracing::warn!(error = %err, "post dispatch fallback failed");
                append_error(&mut body.errors, err.into());
                body.state.insert(State::FAILED | State::POST_FAILED);
                self.inner.cond.notify_all();
            }
        }

        !self.is_canceled()
    }

    /// Advisory cancellation; pulses waiters. A phase already inside user
    /// code runs to completion and observes the terminal state afterwards.
    pub fn cancel(&self) -> bool {
        let mut body = self.inner.body.lock();
        if body.state.is_done() && !body.state.is_canceled() {
            return false;
        }
        body.state.insert(State::STARTED | State::CANCELED | State::DONE);
        body.state.remove(State::RUNNING);
        tracing::debug!(state = ?body.state, "task canceled");
        self.inner.cond.notify_all();
        true
    }

    /// Park until the task is terminal or the wait elapses; returns the
    /// state seen last.
    pub fn wait_done(&self, wait: Wait) -> State {
        let deadline = match wait {
            Wait::Timeout(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut body = self.inner.body.lock();
        loop {
            if body.state.is_done() {
                return body.state;
            }
            match (wait, deadline) {
                (Wait::NoWait, _) => return body.state,
                (Wait::Forever, _) => self.inner.cond.wait(&mut body),
                (_, Some(deadline)) => {
                    if self.inner.cond.wait_until(&mut body, deadline).timed_out() {
                        return body.state;
                    }
                }
                (_, None) => unreachable!("timeout wait always has a deadline"),
            }
        }
    }

    // ----- Internals ---------------------------------------------------------

    fn phase_job(&self) -> Job {
        let task = self.clone();
        Box::new(move || task.run_phases())
    }

    /// The composed two-phase body; runs on whatever thread the exec hook
    /// chose.
    fn run_phases(&self) {
        let (mut exec, skip) = {
            let mut body = self.inner.body.lock();
            if body.state.is_done() {
                // canceled (or finished) before the phase began
                return;
            }
            body.state.insert(State::STARTED | State::READY | State::RUNNING);
            if body.exec.is_none() && !body.state.has_skip_bit() {
                // tolerate a brief post-construction attach race
                let deadline = Instant::now() + body.attach_timeout;
                while body.exec.is_none() && !body.state.is_done() {
                    if self.inner.cond.wait_until(&mut body, deadline).timed_out() {
                        break;
                    }
                }
            }
            (body.exec.take(), body.state.has_skip_bit())
        };

        let mut succeeded = false;
        let mut canceled = false;
        let mut failure: Option<anyhow::Error> = None;
        let mut post_body: Option<PostBody> = None;
        if !skip {
            match exec.as_mut() {
                Some(f) => match f(self) {
                    Ok(deferred) => {
                        succeeded = true;
                        post_body = deferred;
                    }
                    Err(err) if is_cancellation(&err) => {
                        canceled = true;
                        tracing::debug!(error = %err, "body raised cancellation");
                    }
                    Err(err) => failure = Some(err),
                },
                None => failure = Some(ScheduleError::MissingAttachment("exec").into()),
            }
        }

        let (ended, has_post_handle) = {
            let mut body = self.inner.body.lock();
            if let Some(f) = exec {
                body.exec = Some(f);
            }
            let ended = body.state.is_done();
            if ended {
                if let Some(err) = failure {
                    tracing::debug!(error = %err, "body outcome discarded; task already terminal");
                }
            } else {
                if succeeded {
                    body.state.insert(State::SUCCESS);
                }
                if canceled {
                    body.state.insert(State::CANCELED);
                }
                if let Some(err) = failure {
                    tracing::warn!(error = %err, "task body failed");
                    append_error(&mut body.errors, err);
                    body.state.insert(State::FAILED);
                }
                body.state.remove(State::RUNNING);
                body.state.insert(State::DONE);
                self.inner.cond.notify_all();
            }
            (ended, body.post_handle.is_some())
        };

        if ended || (post_body.is_none() && !has_post_handle) {
            return;
        }

        let task = self.clone();
        let post: Job = Box::new(move || task.run_post(post_body, succeeded));
        if skip {
            // a preset outcome short-circuits straight to the post phase
            post();
        } else if let Err(err) = self.inner.dispatcher.dispatch_post(post) {
            let mut body = self.inner.body.lock();
            tracing::warn!(error = %err, "post dispatch failed");
            append_error(&mut body.errors, err.into());
            body.state.insert(State::POST_FAILED);
            self.inner.cond.notify_all();
        }
    }

    /// The deferred phase: post body first (only after a successful
    /// primary), then the post handler. The legs fail independently.
    fn run_post(&self, post_body: Option<PostBody>, succeeded: bool) {
        if succeeded {
            if let Some(deferred) = post_body {
                if let Err(err) = deferred() {
                    self.record_post_failure(err);
                }
            }
        }
        let handle = self.inner.body.lock().post_handle.take();
        if let Some(mut handle) = handle {
            let (state, errors) = {
                let body = self.inner.body.lock();
                (body.state, body.errors.clone())
            };
            let result = handle(state, &errors);
            self.inner.body.lock().post_handle = Some(handle);
            if let Err(err) = result {
                self.record_post_failure(err);
            }
        }
    }

    fn record_post_failure(&self, err: anyhow::Error) {
        let mut body = self.inner.body.lock();
        tracing::warn!(error = %err, "post phase failed");
        append_error(&mut body.errors, err);
        body.state.insert(State::POST_FAILED);
        self.inner.cond.notify_all();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("state", &self.state()).finish()
    }
}
