use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatch::{Dispatch, ThreadDispatch};
use crate::error::ScheduleError;
use crate::state::State;
use crate::task::{PostBody, Task};

struct StackInner {
    tasks: Vec<Task>,
    closed: bool,
}

/// Ordered collection of tasks sharing one pair of dispatch hooks.
///
/// The *primary* task is the most recently added one that is still live.
/// Reads prune lazily: entries that finished, or that were created but
/// never launched, drop out of the list.
pub struct TaskStack {
    inner: Mutex<StackInner>,
    dispatcher: Arc<dyn Dispatch>,
}

impl TaskStack {
    pub fn new() -> Self {
        Self::with_dispatcher(Arc::new(ThreadDispatch))
    }

    pub fn with_dispatcher(dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            inner: Mutex::new(StackInner { tasks: Vec::new(), closed: false }),
            dispatcher,
        }
    }

    fn update(inner: &mut StackInner) {
        inner.tasks.retain(|task| {
            let state = task.state();
            state.is_started() && !state.is_done()
        });
    }

    /// Create a task bound to this stack's hooks and append it.
    pub fn next<F>(&self, exec: F) -> Result<Task, ScheduleError>
    where
        F: FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ScheduleError::Closed);
        }
        let task = Task::new(Arc::clone(&self.dispatcher));
        task.set_exec(exec);
        inner.tasks.push(task.clone());
        Ok(task)
    }

    /// [`TaskStack::next`] with a post handler attached.
    pub fn next_with_post<F, P>(&self, exec: F, post: P) -> Result<Task, ScheduleError>
    where
        F: FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static,
        P: FnMut(State, &[Arc<anyhow::Error>]) -> anyhow::Result<()> + Send + 'static,
    {
        let task = self.next(exec)?;
        task.set_post_handle(post);
        Ok(task)
    }

    /// Create and immediately launch.
    pub fn execute<F>(&self, exec: F) -> Result<Task, ScheduleError>
    where
        F: FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static,
    {
        let task = self.next(exec)?;
        task.execute();
        Ok(task)
    }

    /// Create with a post handler and immediately launch.
    pub fn execute_with_post<F, P>(&self, exec: F, post: P) -> Result<Task, ScheduleError>
    where
        F: FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static,
        P: FnMut(State, &[Arc<anyhow::Error>]) -> anyhow::Result<()> + Send + 'static,
    {
        let task = self.next_with_post(exec, post)?;
        task.execute();
        Ok(task)
    }

    /// The most recently added live task.
    pub fn primary_task(&self) -> Option<Task> {
        let mut inner = self.inner.lock();
        Self::update(&mut inner);
        inner.tasks.last().cloned()
    }

    /// Remove and cancel the primary task.
    pub fn cancel(&self) -> Option<Task> {
        let victim = {
            let mut inner = self.inner.lock();
            Self::update(&mut inner);
            inner.tasks.pop()
        };
        if let Some(task) = &victim {
            task.cancel();
        }
        victim
    }

    /// Cancel every task and clear the list. The list is cleared first so
    /// the cancellations cannot observe half-torn-down state.
    pub fn cancel_all(&self) {
        let victims = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.tasks)
        };
        for task in &victims {
            task.cancel();
        }
        tracing::debug!(count = victims.len(), "canceled stacked tasks");
    }

    /// Keep only the primary; cancel everything older.
    pub fn cancel_previous(&self) {
        let victims = {
            let mut inner = self.inner.lock();
            Self::update(&mut inner);
            let keep = inner.tasks.pop();
            let victims = std::mem::take(&mut inner.tasks);
            if let Some(keep) = keep {
                inner.tasks.push(keep);
            }
            victims
        };
        for task in &victims {
            task.cancel();
        }
    }

    /// Cancel everything, close the dispatcher's owned collaborators and
    /// refuse all further task creation. Absorbing.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.cancel_all();
        self.dispatcher.close();
        tracing::debug!("task stack closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        Self::update(&mut inner);
        inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Unbounded factory of independent tasks sharing one pair of dispatch
/// hooks. Keeps no list: every spawned task is owned by its caller.
pub struct TaskSpawner {
    dispatcher: Arc<dyn Dispatch>,
    closed: AtomicBool,
}

impl TaskSpawner {
    pub fn new() -> Self {
        Self::with_dispatcher(Arc::new(ThreadDispatch))
    }

    pub fn with_dispatcher(dispatcher: Arc<dyn Dispatch>) -> Self {
        Self { dispatcher, closed: AtomicBool::new(false) }
    }

    pub fn spawn<F>(&self, exec: F) -> Result<Task, ScheduleError>
    where
        F: FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static,
    {
        if self.is_closed() {
            return Err(ScheduleError::Closed);
        }
        let task = Task::new(Arc::clone(&self.dispatcher));
        task.set_exec(exec);
        Ok(task)
    }

    pub fn spawn_with_post<F, P>(&self, exec: F, post: P) -> Result<Task, ScheduleError>
    where
        F: FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static,
        P: FnMut(State, &[Arc<anyhow::Error>]) -> anyhow::Result<()> + Send + 'static,
    {
        let task = self.spawn(exec)?;
        task.set_post_handle(post);
        Ok(task)
    }

    /// Spawn and immediately launch.
    pub fn spawn_execute<F>(&self, exec: F) -> Result<Task, ScheduleError>
    where
        F: FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static,
    {
        let task = self.spawn(exec)?;
        task.execute();
        Ok(task)
    }

    /// Refuse further spawns; tasks already out there run to completion.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.dispatcher.close();
        tracing::debug!("task spawner closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for TaskSpawner {
    fn default() -> Self {
        Self::new()
    }
}
