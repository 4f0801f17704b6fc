use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::dispatch::Job;
use crate::error::{append_error, is_cancellation, ErrorList, ScheduleError};
use crate::state::State;
use crate::wait::Wait;

type ExecFn = Box<dyn FnMut(&Request) -> anyhow::Result<()> + Send>;
type PostFn = Box<dyn FnMut(State, &[Arc<anyhow::Error>]) -> anyhow::Result<()> + Send>;
type PrepareFn = Box<dyn FnMut(&Request) -> anyhow::Result<bool> + Send>;
type DispatchFn = Box<dyn Fn(Job) + Send + Sync>;

const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_millis(20);

struct Body {
    state: State,
    exec: Option<ExecFn>,
    post_exec: Option<PostFn>,
    prepare: Option<PrepareFn>,
    post_dispatch: Option<DispatchFn>,
    errors: ErrorList,
    attach_timeout: Duration,
}

struct Inner {
    body: Mutex<Body>,
    cond: Condvar,
}

/// Single-phase work unit driven by a handler.
///
/// Carries its own lock, condition variable, bitfield [`State`] and
/// copy-on-append error list. Cloning yields another handle to the same
/// unit. The progression is cooperative: a scheduler calls [`start`],
/// [`ready`] and [`execute`]; [`cancel`] is advisory and never interrupts a
/// body that is already running.
///
/// [`start`]: Request::start
/// [`ready`]: Request::ready
/// [`execute`]: Request::execute
/// [`cancel`]: Request::cancel
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                body: Mutex::new(Body {
                    state: State::empty(),
                    exec: None,
                    post_exec: None,
                    prepare: None,
                    post_dispatch: None,
                    errors: Arc::new(Vec::new()),
                    attach_timeout: DEFAULT_ATTACH_TIMEOUT,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn from_fn<F>(exec: F) -> Self
    where
        F: FnMut(&Request) -> anyhow::Result<()> + Send + 'static,
    {
        let request = Self::new();
        request.set_exec(exec);
        request
    }

    /// Wrap a zero-argument runnable; it runs at most once.
    pub fn from_runnable<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = Some(f);
        Self::from_fn(move |_| {
            if let Some(f) = slot.take() {
                f();
            }
            Ok(())
        })
    }

    /// Attach (or replace) the primary body and pulse anyone parked in
    /// `execute` waiting for it.
    pub fn set_exec<F>(&self, exec: F)
    where
        F: FnMut(&Request) -> anyhow::Result<()> + Send + 'static,
    {
        let mut body = self.inner.body.lock();
        body.exec = Some(Box::new(exec));
        self.inner.cond.notify_all();
    }

    /// Attach the post-exec callback; it observes `(state, errors)` once the
    /// run that produced DONE finishes.
    pub fn set_post_exec<F>(&self, post: F)
    where
        F: FnMut(State, &[Arc<anyhow::Error>]) -> anyhow::Result<()> + Send + 'static,
    {
        self.inner.body.lock().post_exec = Some(Box::new(post));
    }

    /// Override the prepare gate consulted by [`Request::ready`].
    pub fn set_prepare_hook<F>(&self, hook: F)
    where
        F: FnMut(&Request) -> anyhow::Result<bool> + Send + 'static,
    {
        self.inner.body.lock().prepare = Some(Box::new(hook));
    }

    /// Override where the post-exec callback runs; the default is inline on
    /// the executing thread.
    pub fn set_post_dispatch<F>(&self, dispatch: F)
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        self.inner.body.lock().post_dispatch = Some(Box::new(dispatch));
    }

    pub fn set_attach_timeout(&self, timeout: Duration) {
        self.inner.body.lock().attach_timeout = timeout;
    }

    // ----- Accessors ---------------------------------------------------------

    pub fn state(&self) -> State {
        self.inner.body.lock().state
    }

    /// Snapshot of the error list.
    pub fn errors(&self) -> ErrorList {
        self.inner.body.lock().errors.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state().is_started()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
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

    /// Started but neither running nor terminal: the shape a queued entry
    /// must have to stay in a handler's queues.
    pub(crate) fn is_pending(&self) -> bool {
        let s = self.state();
        s.is_started() && s.is_waiting()
    }

    /// Whether two handles refer to the same unit.
    pub fn same(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ----- Lifecycle ---------------------------------------------------------

    /// Claim the unit: NONE -> STARTED, clearing stale errors. Idempotent —
    /// past NONE this is a no-op.
    pub fn start(&self) {
        let mut body = self.inner.body.lock();
        if body.state.is_started() || body.state.is_done() {
            return;
        }
        body.state.insert(State::STARTED);
        body.errors = Arc::new(Vec::new());
        tracing::trace!(state = ?body.state, "request started");
    }

    /// Run the prepare gate: STARTED -> READY.
    ///
    /// While the hook runs the state holds the transient preparing shape
    /// (READY bit without STARTED). A hook error presets FAILED and still
    /// reports ready, so a drainer takes the skip path instead of stalling
    /// on this unit. A refusal leaves the unit STARTED; cancellation
    /// observed during preparation short-circuits to not-ready.
    pub fn ready(&self) -> bool {
        let mut hook = {
            let mut body = self.inner.body.lock();
            let state = body.state;
            if state.is_ready() {
                return true;
            }
            if !state.is_started() || state.is_running() || state.is_done() {
                return false;
            }
            body.state.remove(State::STARTED);
            body.state.insert(State::READY);
            body.prepare.take()
        };

        let verdict = match hook.as_mut() {
            Some(hook) => hook(self),
            None => Ok(true),
        };

        let mut body = self.inner.body.lock();
        if let Some(hook) = hook {
            body.prepare = Some(hook);
        }
        match verdict {
            Ok(true) => {
                if body.state.is_canceled() {
                    false
                } else {
                    body.state.insert(State::STARTED);
                    true
                }
            }
            Ok(false) => {
                body.state.remove(State::READY);
                body.state.insert(State::STARTED);
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "prepare hook failed");
                append_error(&mut body.errors, err);
                body.state.insert(State::STARTED | State::FAILED);
                true
            }
        }
    }

    /// Advisory cancellation; pulses waiters.
    ///
    /// Returns whether the cancellation took effect, which includes repeat
    /// calls on an already-canceled unit. A unit that finished without
    /// cancellation reports `false`.
    pub fn cancel(&self) -> bool {
        let mut body = self.inner.body.lock();
        if body.state.is_done() && !body.state.is_canceled() {
            return false;
        }
        body.state.insert(State::STARTED | State::CANCELED | State::DONE);
        body.state.remove(State::RUNNING);
        tracing::debug!(state = ?body.state, "request canceled");
        self.inner.cond.notify_all();
        true
    }

    /// Run the unit on the calling thread.
    ///
    /// Precondition: the full READY pattern, neither running nor terminal.
    /// Returns true iff the primary body ran and succeeded. User failures
    /// never unwind out of here — they land in the error list and the state.
    pub fn execute(&self) -> bool {
        let (mut exec, skip) = {
            let mut body = self.inner.body.lock();
            let state = body.state;
            if !state.is_ready() || state.is_running() || state.is_done() {
                return false;
            }
            body.state.insert(State::RUNNING);
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
        if !skip {
            match exec.as_mut() {
                Some(f) => match f(self) {
                    Ok(()) => succeeded = true,
                    Err(err) if is_cancellation(&err) => {
                        canceled = true;
                        tracing::debug!(error = %err, "body raised cancellation");
                    }
                    Err(err) => failure = Some(err),
                },
                None => failure = Some(ScheduleError::MissingAttachment("exec").into()),
            }
        }

        let (post, dispatch) = {
            let mut body = self.inner.body.lock();
            if let Some(f) = exec {
                body.exec = Some(f);
            }
            let was_done = body.state.is_done();
            // the outcome of this run is recorded even when a concurrent
            // cancel got to DONE first: a lost cancel race still reads
            // CANCELED | DONE | SUCCESS
            if succeeded {
                body.state.insert(State::SUCCESS);
            }
            if canceled {
                body.state.insert(State::CANCELED);
            }
            if let Some(err) = failure {
                tracing::warn!(error = %err, "request body failed");
                append_error(&mut body.errors, err);
                body.state.insert(State::FAILED);
            }
            body.state.remove(State::RUNNING);
            body.state.insert(State::STARTED | State::READY | State::DONE);
            self.inner.cond.notify_all();
            // the post-exec callback belongs to whichever run produced DONE
            if !was_done && body.post_exec.is_some() {
                (body.post_exec.take(), body.post_dispatch.take())
            } else {
                (None, None)
            }
        };

        if let Some(post) = post {
            self.dispatch_post_exec(post, dispatch);
        }

        succeeded
    }

    fn dispatch_post_exec(&self, mut post: PostFn, dispatch: Option<DispatchFn>) {
        let this = self.clone();
        let job: Job = Box::new(move || {
            let (state, errors) = {
                let body = this.inner.body.lock();
                (body.state, body.errors.clone())
            };
            let result = post(state, &errors);
            let mut body = this.inner.body.lock();
            body.post_exec = Some(post);
            if let Err(err) = result {
                tracing::warn!(error = %err, "post-exec callback failed");
                append_error(&mut body.errors, err);
                body.state.insert(State::POST_FAILED);
                this.inner.cond.notify_all();
            }
        });
        match dispatch {
            Some(dispatch) => {
                dispatch(job);
                self.inner.body.lock().post_dispatch = Some(dispatch);
            }
            None => job(),
        }
    }

    /// Park until the unit is terminal or the wait elapses; returns the
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
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Canceled;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn readied(request: &Request) -> bool {
        request.start();
        request.ready()
    }

    #[test]
    fn start_is_idempotent() {
        let r = Request::from_fn(|_| Ok(()));
        r.start();
        let first = r.state();
        r.start();
        assert_eq!(r.state(), first);
        assert_eq!(first, State::STARTED);
    }

    #[test]
    fn plain_run_ends_in_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let r = Request::from_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(readied(&r));
        assert!(r.execute());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let s = r.state();
        assert!(s.is_done() && s.is_success() && !s.is_running());
        assert!(r.errors().is_empty());
    }

    #[test]
    fn execute_requires_ready() {
        let r = Request::from_fn(|_| Ok(()));
        assert!(!r.execute());
        r.start();
        assert!(!r.execute());
        assert!(!r.is_done());
    }

    #[test]
    fn failure_is_captured_not_propagated() {
        let r = Request::from_fn(|_| Err(anyhow::anyhow!("boom")));
        assert!(readied(&r));
        assert!(!r.execute());
        let s = r.state();
        assert!(s.is_done() && s.is_failed() && !s.is_success());
        let errors = r.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "boom");
    }

    #[test]
    fn cancellation_error_promotes_to_canceled() {
        let r = Request::from_fn(|_| Err(Canceled.into()));
        assert!(readied(&r));
        assert!(!r.execute());
        let s = r.state();
        assert!(s.is_done() && s.is_canceled() && !s.is_failed());
        assert!(r.errors().is_empty());
    }

    #[test]
    fn cancel_before_execute_skips_the_body() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let r = Request::from_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        r.start();
        assert!(r.cancel());
        assert!(!r.ready());
        assert!(!r.execute());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(r.state().is_canceled() && r.state().is_done());
    }

    #[test]
    fn cancel_losing_the_race_still_records_success() {
        // stages: 0 = not running, 1 = body entered, 2 = cancel landed
        let gate = Arc::new((Mutex::new(0u8), Condvar::new()));
        let r = {
            let gate = gate.clone();
            Request::from_fn(move |_| {
                let (stage, cond) = &*gate;
                let mut stage = stage.lock();
                *stage = 1;
                cond.notify_all();
                while *stage < 2 {
                    cond.wait(&mut stage);
                }
                Ok(())
            })
        };
        assert!(readied(&r));

        let runner = {
            let r = r.clone();
            thread::spawn(move || r.execute())
        };
        {
            let (stage, cond) = &*gate;
            let mut stage = stage.lock();
            while *stage < 1 {
                cond.wait(&mut stage);
            }
        }
        // the body is mid-flight; this cancel loses the race
        assert!(r.cancel());
        {
            let (stage, cond) = &*gate;
            *stage.lock() = 2;
            cond.notify_all();
        }

        assert!(runner.join().unwrap());
        let s = r.state();
        assert!(s.is_done() && s.is_canceled() && s.is_success());
        assert!(!s.is_running());
    }

    #[test]
    fn cancel_reports_too_late_after_success() {
        let r = Request::from_fn(|_| Ok(()));
        assert!(readied(&r));
        r.execute();
        assert!(!r.cancel());
        // repeat cancel on an already-canceled unit still takes effect
        let c = Request::from_fn(|_| Ok(()));
        c.start();
        assert!(c.cancel());
        assert!(c.cancel());
    }

    #[test]
    fn preset_skip_bit_bypasses_the_body() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let r = Request::from_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let observed = Arc::new(AtomicUsize::new(0));
        let post_seen = observed.clone();
        r.set_post_exec(move |state, _| {
            assert!(state.is_done());
            post_seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        r.set_prepare_hook(|_| Err(anyhow::anyhow!("prepare broke")));
        r.start();
        // the failed prepare presets FAILED and still reports ready
        assert!(r.ready());
        assert!(r.state().is_failed() && !r.state().is_done());
        assert!(!r.execute());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert!(r.state().is_done() && r.state().is_failed());
    }

    #[test]
    fn prepare_refusal_keeps_the_request_started() {
        let r = Request::from_fn(|_| Ok(()));
        r.set_prepare_hook(|_| Ok(false));
        r.start();
        assert!(!r.ready());
        let s = r.state();
        assert!(s.is_started() && !s.is_ready() && !s.is_done());
    }

    #[test]
    fn late_exec_attachment_is_tolerated() {
        let r = Request::new();
        r.start();
        assert!(r.ready());
        let attach = r.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            attach.set_exec(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        });
        assert!(r.execute());
        worker.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_exec_after_grace_fails() {
        let r = Request::new();
        r.set_attach_timeout(Duration::from_millis(1));
        r.start();
        assert!(r.ready());
        assert!(!r.execute());
        assert!(r.state().is_failed() && r.state().is_done());
        assert_eq!(r.errors().len(), 1);
    }

    #[test]
    fn post_exec_sees_the_terminal_snapshot() {
        let observed = Arc::new(Mutex::new(None));
        let slot = observed.clone();
        let r = Request::from_fn(|_| Ok(()));
        r.set_post_exec(move |state, errors| {
            *slot.lock() = Some((state, errors.len()));
            Ok(())
        });
        assert!(readied(&r));
        assert!(r.execute());
        let seen = observed.lock().expect("post-exec ran");
        assert!(seen.0.is_done() && seen.0.is_success());
        assert_eq!(seen.1, 0);
    }

    #[test]
    fn post_exec_failure_sets_post_failed_only() {
        let r = Request::from_fn(|_| Ok(()));
        r.set_post_exec(|_, _| Err(anyhow::anyhow!("post broke")));
        assert!(readied(&r));
        assert!(r.execute());
        let s = r.state();
        assert!(s.is_success() && s.is_post_failed() && !s.is_failed());
        assert_eq!(r.errors().len(), 1);
    }

    #[test]
    fn wait_done_returns_after_a_pulse() {
        let r = Request::from_fn(|_| Ok(()));
        assert!(readied(&r));
        let waiter = {
            let r = r.clone();
            thread::spawn(move || r.wait_done(Wait::Forever))
        };
        thread::sleep(Duration::from_millis(5));
        r.execute();
        let state = waiter.join().unwrap();
        assert!(state.is_done() && state.is_success());
    }

    #[test]
    fn wait_done_times_out_on_an_idle_request() {
        let r = Request::from_fn(|_| Ok(()));
        let state = r.wait_done(Wait::Timeout(Duration::from_millis(5)));
        assert!(!state.is_done());
    }
}
