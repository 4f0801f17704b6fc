use std::sync::Arc;
use std::thread;

use crate::error::ScheduleError;
use crate::handler::Handler;

/// Work handed to an executor or handler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where a task's two phases run.
///
/// Task groups own one of these instead of subclassing: the exec hook
/// places the primary phase, the post hook places the deferred phase, and
/// `close` releases collaborators the binding owns.
pub trait Dispatch: Send + Sync {
    fn dispatch_exec(&self, job: Job) -> Result<(), ScheduleError>;
    fn dispatch_post(&self, job: Job) -> Result<(), ScheduleError>;
    /// Called when the owning group closes.
    fn close(&self) {}
}

/// External thread-pool seam. Implemented for any `Fn(Job)`, so a pool
/// binding is one closure away:
///
/// ```ignore
/// let pool: Arc<dyn Executor> = Arc::new(|job: Job| my_pool.submit(job));
/// ```
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

impl<F> Executor for F
where
    F: Fn(Job) + Send + Sync,
{
    fn execute(&self, job: Job) {
        self(job)
    }
}

/// Primary phase on a fresh thread, post phase inline.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDispatch;

impl Dispatch for ThreadDispatch {
    fn dispatch_exec(&self, job: Job) -> Result<(), ScheduleError> {
        thread::Builder::new()
            .name("taskloop-exec".into())
            .spawn(job)
            .map(drop)
            .map_err(ScheduleError::Spawn)
    }

    fn dispatch_post(&self, job: Job) -> Result<(), ScheduleError> {
        job();
        Ok(())
    }
}

/// Both phases posted to handlers — run the work on one looper thread and
/// the callback on another (or the same one).
pub struct HandlerDispatch {
    exec: Option<Arc<Handler>>,
    post: Option<Arc<Handler>>,
    shutdown: bool,
}

impl HandlerDispatch {
    pub fn new(exec: Option<Arc<Handler>>, post: Option<Arc<Handler>>) -> Self {
        Self { exec, post, shutdown: false }
    }

    /// Close the attached handlers when the owning group closes.
    pub fn with_shutdown(mut self, shutdown: bool) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn submit(
        handler: Option<&Arc<Handler>>,
        job: Job,
        role: &'static str,
    ) -> Result<(), ScheduleError> {
        let handler = handler.ok_or(ScheduleError::MissingAttachment(role))?;
        handler.post_fn(job).map(drop)
    }
}

impl Dispatch for HandlerDispatch {
    fn dispatch_exec(&self, job: Job) -> Result<(), ScheduleError> {
        Self::submit(self.exec.as_ref(), job, "exec handler")
    }

    fn dispatch_post(&self, job: Job) -> Result<(), ScheduleError> {
        Self::submit(self.post.as_ref(), job, "post handler")
    }

    fn close(&self) {
        if self.shutdown {
            if let Some(handler) = &self.exec {
                handler.close();
            }
            if let Some(handler) = &self.post {
                handler.close();
            }
        }
    }
}

/// Primary phase on an external executor, post phase inline.
pub struct ExecutorDispatch {
    executor: Arc<dyn Executor>,
}

impl ExecutorDispatch {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

impl Dispatch for ExecutorDispatch {
    fn dispatch_exec(&self, job: Job) -> Result<(), ScheduleError> {
        self.executor.execute(job);
        Ok(())
    }

    fn dispatch_post(&self, job: Job) -> Result<(), ScheduleError> {
        job();
        Ok(())
    }
}

/// Primary phase on an external executor, post phase on a handler: the
/// worker does the work, a looper thread runs the callback.
pub struct AsyncDispatch {
    executor: Arc<dyn Executor>,
    post: Option<Arc<Handler>>,
    shutdown: bool,
}

impl AsyncDispatch {
    pub fn new(executor: Arc<dyn Executor>, post: Option<Arc<Handler>>) -> Self {
        Self { executor, post, shutdown: false }
    }

    /// Close the post handler when the owning group closes.
    pub fn with_shutdown(mut self, shutdown: bool) -> Self {
        self.shutdown = shutdown;
        self
    }
}

impl Dispatch for AsyncDispatch {
    fn dispatch_exec(&self, job: Job) -> Result<(), ScheduleError> {
        self.executor.execute(job);
        Ok(())
    }

    fn dispatch_post(&self, job: Job) -> Result<(), ScheduleError> {
        let handler = self.post.as_ref().ok_or(ScheduleError::MissingAttachment("post handler"))?;
        handler.post_fn(job).map(drop)
    }

    fn close(&self) {
        if self.shutdown {
            if let Some(handler) = &self.post {
                handler.close();
            }
        }
    }
}

/// Run both phases inline on the dispatching thread. Mostly useful in tests
/// and for callers that already sit on a worker thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatch;

impl Dispatch for InlineDispatch {
    fn dispatch_exec(&self, job: Job) -> Result<(), ScheduleError> {
        job();
        Ok(())
    }

    fn dispatch_post(&self, job: Job) -> Result<(), ScheduleError> {
        job();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn thread_dispatch_runs_the_job_elsewhere() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let here = thread::current().id();
        let done = Arc::new((parking_lot::Mutex::new(false), parking_lot::Condvar::new()));
        let signal = done.clone();
        ThreadDispatch
            .dispatch_exec(Box::new(move || {
                assert_ne!(thread::current().id(), here);
                seen.fetch_add(1, Ordering::SeqCst);
                *signal.0.lock() = true;
                signal.1.notify_all();
            }))
            .unwrap();
        let mut flag = done.0.lock();
        while !*flag {
            if done.1.wait_for(&mut flag, Duration::from_secs(5)).timed_out() {
                break;
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_dispatch_without_attachment_is_an_error() {
        let dispatch = HandlerDispatch::new(None, None);
        let result = dispatch.dispatch_exec(Box::new(|| {}));
        assert!(matches!(result, Err(ScheduleError::MissingAttachment(_))));
    }

    #[test]
    fn handler_dispatch_posts_to_its_handlers() {
        let exec = Arc::new(Handler::new());
        let post = Arc::new(Handler::new());
        let dispatch = HandlerDispatch::new(Some(exec.clone()), Some(post.clone()));
        dispatch.dispatch_exec(Box::new(|| {})).unwrap();
        dispatch.dispatch_post(Box::new(|| {})).unwrap();
        assert_eq!(exec.len(), 1);
        assert_eq!(post.len(), 1);
    }

    #[test]
    fn shutdown_binding_closes_owned_handlers() {
        let exec = Arc::new(Handler::new());
        let dispatch = HandlerDispatch::new(Some(exec.clone()), None).with_shutdown(true);
        dispatch.close();
        assert!(exec.is_closed());
    }

    #[test]
    fn executor_dispatch_uses_the_pool_seam() {
        let submitted = Arc::new(AtomicUsize::new(0));
        let counter = submitted.clone();
        let executor: Arc<dyn Executor> = Arc::new(move |job: Job| {
            counter.fetch_add(1, Ordering::SeqCst);
            job();
        });
        let dispatch = ExecutorDispatch::new(executor);
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        dispatch
            .dispatch_exec(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(submitted.load(Ordering::SeqCst), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn async_dispatch_splits_the_phases() {
        let post = Arc::new(Handler::new());
        let executor: Arc<dyn Executor> = Arc::new(|job: Job| job());
        let dispatch = AsyncDispatch::new(executor, Some(post.clone()));
        dispatch.dispatch_exec(Box::new(|| {})).unwrap();
        assert!(post.is_empty());
        dispatch.dispatch_post(Box::new(|| {})).unwrap();
        assert_eq!(post.len(), 1);
    }
}
