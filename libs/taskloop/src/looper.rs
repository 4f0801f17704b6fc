use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::config::Timings;
use crate::handler::Handler;
use crate::state::State;
use crate::wait::Wait;

type FailFn = Box<dyn Fn(Option<&anyhow::Error>) + Send + Sync>;

struct Flags {
    state: State,
    stop_requested: bool,
}

/// Driver that repeatedly pulls one ready request from a handler and runs it
/// on the calling thread.
///
/// Its state is the NONE / STARTED / READY subset of the shared [`State`]
/// word: [`start`] makes it READY, each [`handle`] drops to STARTED for the
/// duration of one iteration, and [`stop`] clears READY for good and pulses
/// both the looper and the handler so parked iterations wake up.
///
/// [`start`]: Looper::start
/// [`handle`]: Looper::handle
/// [`stop`]: Looper::stop
pub struct Looper {
    flags: Mutex<Flags>,
    handler: Arc<Handler>,
    on_fail: Mutex<Option<FailFn>>,
    timings: Timings,
}

impl Looper {
    pub fn new(handler: Arc<Handler>) -> Self {
        Self {
            flags: Mutex::new(Flags { state: State::empty(), stop_requested: false }),
            handler,
            on_fail: Mutex::new(None),
            timings: Timings::default(),
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Invoked when an iteration fails: with `None` when the looper was
    /// stopped mid-iteration, with the first recorded error when the
    /// executed request finished FAILED.
    pub fn set_fail_handler<F>(&self, f: F)
    where
        F: Fn(Option<&anyhow::Error>) + Send + Sync + 'static,
    {
        *self.on_fail.lock() = Some(Box::new(f));
    }

    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    pub fn state(&self) -> State {
        self.flags.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.flags.lock().state.is_ready()
    }

    pub fn start(&self) {
        let mut flags = self.flags.lock();
        flags.stop_requested = false;
        flags.state.insert(State::STARTED | State::READY);
        tracing::debug!("looper ready");
    }

    pub fn stop(&self) {
        {
            let mut flags = self.flags.lock();
            flags.state.remove(State::READY);
            flags.stop_requested = true;
        }
        // wake an iteration parked inside the handler
        self.handler.pulse();
        tracing::debug!("looper stopped");
    }

    /// One scheduling iteration: pull the next ready request and execute it.
    ///
    /// Returns true iff a request was pulled and run. Failures never unwind
    /// out of here; they reach the fail handler instead.
    pub fn handle(&self, wait: Wait) -> bool {
        {
            let mut flags = self.flags.lock();
            if !flags.state.is_ready() {
                return false;
            }
            flags.state.remove(State::READY);
        }

        let next = if self.handler.is_closed() { None } else { self.handler.next(wait) };
        let stopped = self.flags.lock().stop_requested;

        let mut handled = false;
        match next {
            None if stopped => self.invoke_fail(None),
            None => {}
            Some(_) if stopped => {
                // stopped while waiting: the pulled request is not run
                self.invoke_fail(None);
            }
            Some(request) => {
                let ok = request.execute();
                handled = true;
                if !ok && request.state().is_failed() {
                    let errors = request.errors();
                    tracing::warn!("handled request failed");
                    self.invoke_fail(errors.first().map(|e| e.as_ref()));
                }
            }
        }

        {
            let mut flags = self.flags.lock();
            if flags.state.is_started() && !flags.stop_requested && !self.handler.is_closed() {
                flags.state.insert(State::READY);
            }
        }
        handled
    }

    /// Drive [`Looper::handle`] until stopped.
    pub fn run(&self) {
        while self.is_ready() {
            self.handle(Wait::Timeout(self.timings.handle_timeout));
        }
        tracing::debug!("looper run loop exited");
    }

    /// Start `looper` and drive its run loop on a dedicated thread.
    pub fn spawn_on_thread(looper: &Arc<Looper>) -> std::io::Result<thread::JoinHandle<()>> {
        looper.start();
        let looper = Arc::clone(looper);
        thread::Builder::new()
            .name("taskloop-looper".into())
            .spawn(move || looper.run())
    }

    fn invoke_fail(&self, err: Option<&anyhow::Error>) {
        // take the callback out so user code never runs under our lock
        let callback = self.on_fail.lock().take();
        if let Some(callback) = callback {
            callback(err);
            let mut slot = self.on_fail.lock();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}
