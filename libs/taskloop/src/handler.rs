use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use taskloop_deque::DStack;

use crate::clock::{Clock, SystemClock};
use crate::config::Timings;
use crate::error::ScheduleError;
use crate::request::Request;
use crate::wait::Wait;

struct TimedEntry {
    request: Request,
    due_ms: i64,
}

struct Queues {
    immediate: DStack<Request>,
    /// Ordered by due time descending, so the next-due entry sits at the
    /// end (O(1) pop). Equal due times land nearest the drain end: LIFO.
    timed: Vec<TimedEntry>,
    busy: bool,
    closed: bool,
}

impl Queues {
    fn insert_timed(&mut self, entry: TimedEntry) {
        let at = self.timed.partition_point(|e| e.due_ms >= entry.due_ms);
        self.timed.insert(at, entry);
    }
}

/// Dual-queue scheduler: an immediate LIFO stack plus a time-ordered
/// delayed queue.
///
/// Any number of threads may post; any number may call [`Handler::next`],
/// but the busy flag grants only one of them the drain at a time — the rest
/// park on the condition variable until pulsed.
pub struct Handler {
    queues: Mutex<Queues>,
    cond: Condvar,
    clock: Arc<dyn Clock>,
    timings: Timings,
}

impl Handler {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: Mutex::new(Queues {
                immediate: DStack::new(),
                timed: Vec::new(),
                busy: false,
                closed: false,
            }),
            cond: Condvar::new(),
            clock,
            timings: Timings::default(),
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Current time in milliseconds since the epoch, per this handler's
    /// clock.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Wake everything parked in [`Handler::next`].
    pub fn pulse(&self) {
        self.cond.notify_all();
    }

    // ----- Posting -----------------------------------------------------------

    /// Start the request and put it on the immediate stack; the most recent
    /// post runs first.
    pub fn post(&self, request: Request) -> Result<Request, ScheduleError> {
        self.enqueue(request, None)
    }

    /// Start the request and schedule it for `delay` from now.
    pub fn post_delayed(&self, request: Request, delay: Duration) -> Result<Request, ScheduleError> {
        let due = self.clock.now_ms().saturating_add(delay.as_millis() as i64);
        self.enqueue(request, Some(due))
    }

    /// Start the request and schedule it for the absolute time `at_ms`
    /// (milliseconds since the epoch).
    pub fn post_at(&self, request: Request, at_ms: i64) -> Result<Request, ScheduleError> {
        if at_ms < 0 {
            return Err(ScheduleError::InvalidArgument("absolute due time before the epoch"));
        }
        self.enqueue(request, Some(at_ms))
    }

    /// Wrap a zero-argument runnable and post it.
    pub fn post_fn<F>(&self, f: F) -> Result<Request, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Request::from_runnable(f))
    }

    /// Wrap a zero-argument runnable and post it delayed.
    pub fn post_fn_delayed<F>(&self, f: F, delay: Duration) -> Result<Request, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_delayed(Request::from_runnable(f), delay)
    }

    /// Wrap a request-consuming body and post it.
    pub fn post_with<F>(&self, f: F) -> Result<Request, ScheduleError>
    where
        F: FnMut(&Request) -> anyhow::Result<()> + Send + 'static,
    {
        self.post(Request::from_fn(f))
    }

    fn enqueue(&self, request: Request, due_ms: Option<i64>) -> Result<Request, ScheduleError> {
        let mut q = self.queues.lock();
        if q.closed {
            return Err(ScheduleError::Closed);
        }
        request.start();
        match due_ms {
            None => {
                q.immediate
                    .push(request.clone())
                    .map_err(|_| ScheduleError::InvalidArgument("immediate queue exhausted"))?;
            }
            Some(due) => q.insert_timed(TimedEntry { request: request.clone(), due_ms: due }),
        }
        tracing::trace!(delayed = due_ms.is_some(), "request posted");
        self.cond.notify_all();
        Ok(request)
    }

    // ----- Bulk operations ---------------------------------------------------

    /// Snapshot of the queued requests, immediate entries oldest-first, then
    /// timed entries soonest-first.
    pub fn get_all(&self, exclude_timed: bool) -> Vec<Request> {
        let q = self.queues.lock();
        let mut out: Vec<Request> = q.immediate.iter().cloned().collect();
        if !exclude_timed {
            out.extend(q.timed.iter().rev().map(|e| e.request.clone()));
        }
        out
    }

    /// Clear the queues, then cancel everything that was in them. Clearing
    /// first keeps a concurrent `next` from re-entering the victims.
    pub fn cancel_all(&self, exclude_timed: bool) {
        let victims = {
            let mut q = self.queues.lock();
            let mut victims: Vec<Request> = q.immediate.iter().cloned().collect();
            q.immediate.clear();
            if !exclude_timed {
                victims.extend(q.timed.drain(..).rev().map(|e| e.request));
            }
            victims
        };
        for request in &victims {
            request.cancel();
        }
        tracing::debug!(count = victims.len(), "canceled queued requests");
        self.cond.notify_all();
    }

    /// Clear the queues without canceling.
    pub fn remove_all(&self, exclude_timed: bool) {
        {
            let mut q = self.queues.lock();
            q.immediate.clear();
            if !exclude_timed {
                q.timed.clear();
            }
        }
        self.cond.notify_all();
    }

    /// Cancel everything and refuse all further posting. Absorbing.
    pub fn close(&self) {
        {
            let mut q = self.queues.lock();
            if q.closed {
                return;
            }
            q.closed = true;
        }
        tracing::debug!("handler closed");
        self.cancel_all(false);
    }

    pub fn is_closed(&self) -> bool {
        self.queues.lock().closed
    }

    pub fn len(&self) -> usize {
        let q = self.queues.lock();
        q.immediate.len() + q.timed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ----- Draining ----------------------------------------------------------

    /// Take the next request that passes its ready gate, or `None` once the
    /// wait elapses.
    ///
    /// At most one thread holds the drain at a time; the busy flag is read
    /// and written only under the mutex so late posts cannot slip past a
    /// parked drainer. After any wake the call makes one more non-blocking
    /// pass and returns whatever that pass finds.
    pub fn next(&self, wait: Wait) -> Option<Request> {
        let mut pass_wait = wait;
        loop {
            let claimed = {
                let mut q = self.queues.lock();
                if q.closed {
                    return None;
                }
                if q.busy {
                    false
                } else {
                    q.busy = true;
                    true
                }
            };

            let mut timeout = pass_wait;
            let mut retry = false;
            if claimed {
                let found = self.drain(&mut timeout, &mut retry);
                self.queues.lock().busy = false;
                if found.is_some() {
                    // hand the floor to the next parked drainer
                    self.cond.notify_all();
                    return found;
                }
            }

            {
                let mut q = self.queues.lock();
                if q.closed {
                    return None;
                }
                if timeout == Wait::NoWait {
                    return None;
                }
                let now = self.clock.now_ms();
                let raced_in = claimed
                    && !retry
                    && (!q.immediate.is_empty()
                        || q.timed.last().is_some_and(|e| e.due_ms <= now));
                if !raced_in {
                    match timeout {
                        Wait::NoWait => return None,
                        Wait::Forever => self.cond.wait(&mut q),
                        Wait::Timeout(d) => {
                            let _ = self.cond.wait_for(&mut q, d);
                        }
                    }
                }
            }
            pass_wait = Wait::NoWait;
        }
    }

    /// One drain attempt. Runs with the busy flag held but takes the queue
    /// lock piecewise, so ready gates never run under the handler mutex.
    fn drain(&self, timeout: &mut Wait, retry: &mut bool) -> Option<Request> {
        // Timed branch: pop entries that are due, pruning dead ones.
        loop {
            let entry = {
                let mut q = self.queues.lock();
                loop {
                    let (due_ms, pending) = match q.timed.last() {
                        None => break None,
                        Some(e) => (e.due_ms, e.request.is_pending()),
                    };
                    if !pending {
                        q.timed.pop();
                        continue;
                    }
                    let remaining = due_ms - self.clock.now_ms();
                    if remaining > 0 {
                        *timeout = timeout.cap(Duration::from_millis(remaining as u64));
                        break None;
                    }
                    break q.timed.pop();
                }
            };
            let Some(entry) = entry else { break };
            if entry.request.ready() {
                tracing::trace!("timed request became ready");
                return Some(entry.request);
            }
            // refused readiness: requeue at its due slot, retry shortly
            self.queues.lock().insert_timed(entry);
            *retry = true;
            break;
        }

        // Immediate branch: LIFO pop, pruning dead entries.
        loop {
            let request = {
                let mut q = self.queues.lock();
                loop {
                    match q.immediate.pop() {
                        None => break None,
                        Some(r) if !r.is_pending() => {}
                        Some(r) => break Some(r),
                    }
                }
            };
            let Some(request) = request else { break };
            if request.ready() {
                return Some(request);
            }
            // push back on top so a retry revisits it first
            let _ = self.queues.lock().immediate.push(request);
            *retry = true;
            break;
        }

        if *retry {
            *timeout = timeout.cap(self.timings.retry_timeout);
        }
        None
    }
}

impl Default for Handler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manual() -> (Arc<ManualClock>, Handler) {
        let clock = Arc::new(ManualClock::new(0));
        let handler = Handler::with_clock(clock.clone());
        (clock, handler)
    }

    #[test]
    fn post_grows_the_queue_by_one() {
        let handler = Handler::new();
        assert!(handler.is_empty());
        handler.post_fn(|| {}).unwrap();
        assert_eq!(handler.len(), 1);
        handler
            .post_delayed(Request::from_runnable(|| {}), Duration::from_secs(1))
            .unwrap();
        assert_eq!(handler.len(), 2);
    }

    #[test]
    fn next_is_lifo_over_immediate_posts() {
        let handler = Handler::new();
        let a = handler.post_fn(|| {}).unwrap();
        let b = handler.post_fn(|| {}).unwrap();
        let c = handler.post_fn(|| {}).unwrap();
        assert!(handler.next(Wait::NoWait).unwrap().same(&c));
        assert!(handler.next(Wait::NoWait).unwrap().same(&b));
        assert!(handler.next(Wait::NoWait).unwrap().same(&a));
        assert!(handler.next(Wait::NoWait).is_none());
    }

    #[test]
    fn next_only_returns_ready_requests() {
        let handler = Handler::new();
        handler.post_fn(|| {}).unwrap();
        let r = handler.next(Wait::NoWait).unwrap();
        assert!(r.state().is_ready());
    }

    #[test]
    fn timed_entries_wait_for_their_due_time() {
        let (clock, handler) = manual();
        let delayed = handler
            .post_delayed(Request::from_runnable(|| {}), Duration::from_millis(50))
            .unwrap();
        assert!(handler.next(Wait::NoWait).is_none());
        clock.advance(49);
        assert!(handler.next(Wait::NoWait).is_none());
        clock.advance(1);
        assert!(handler.next(Wait::NoWait).unwrap().same(&delayed));
    }

    #[test]
    fn due_timed_entry_beats_immediate_entries() {
        let (clock, handler) = manual();
        let timed = handler
            .post_delayed(Request::from_runnable(|| {}), Duration::from_millis(10))
            .unwrap();
        let immediate = handler.post_fn(|| {}).unwrap();
        clock.advance(10);
        assert!(handler.next(Wait::NoWait).unwrap().same(&timed));
        assert!(handler.next(Wait::NoWait).unwrap().same(&immediate));
    }

    #[test]
    fn equal_due_times_break_lifo() {
        let (clock, handler) = manual();
        let first = handler.post_at(Request::from_runnable(|| {}), 100).unwrap();
        let second = handler.post_at(Request::from_runnable(|| {}), 100).unwrap();
        clock.set(100);
        assert!(handler.next(Wait::NoWait).unwrap().same(&second));
        assert!(handler.next(Wait::NoWait).unwrap().same(&first));
    }

    #[test]
    fn dead_entries_are_pruned_during_next() {
        let handler = Handler::new();
        let canceled = handler.post_fn(|| {}).unwrap();
        let live = handler.post_fn(|| {}).unwrap();
        canceled.cancel();
        assert!(handler.next(Wait::NoWait).unwrap().same(&live));
        assert!(handler.next(Wait::NoWait).is_none());
        assert!(handler.is_empty());
    }

    #[test]
    fn refused_readiness_is_pushed_back_on_top() {
        let handler = Handler::new();
        let stubborn = Request::from_fn(|_| Ok(()));
        stubborn.set_prepare_hook(|_| Ok(false));
        let stubborn = handler.post(stubborn).unwrap();
        let _other = handler.post_fn(|| {}).unwrap();
        // the stubborn entry is on top; it refuses, the other one is taken
        let got = handler.next(Wait::NoWait).unwrap();
        assert!(!got.same(&stubborn));
        // the stubborn one is pushed back on top rather than dropped
        assert!(handler.next(Wait::NoWait).is_none());
        assert_eq!(handler.len(), 1);
        assert!(handler.get_all(false)[0].same(&stubborn));
    }

    #[test]
    fn cancel_all_empties_and_cancels() {
        let handler = Handler::new();
        let a = handler.post_fn(|| {}).unwrap();
        let b = handler
            .post_delayed(Request::from_runnable(|| {}), Duration::from_secs(10))
            .unwrap();
        handler.cancel_all(false);
        assert!(handler.is_empty());
        assert!(a.is_canceled() && b.is_canceled());
    }

    #[test]
    fn cancel_all_can_spare_the_timed_queue() {
        let handler = Handler::new();
        let imm = handler.post_fn(|| {}).unwrap();
        let timed = handler
            .post_delayed(Request::from_runnable(|| {}), Duration::from_secs(10))
            .unwrap();
        handler.cancel_all(true);
        assert!(imm.is_canceled());
        assert!(!timed.is_canceled());
        assert_eq!(handler.len(), 1);
    }

    #[test]
    fn remove_all_clears_without_canceling() {
        let handler = Handler::new();
        let a = handler.post_fn(|| {}).unwrap();
        handler.remove_all(false);
        assert!(handler.is_empty());
        assert!(!a.is_canceled());
    }

    #[test]
    fn closed_handler_rejects_posts_and_drains_nothing() {
        let handler = Handler::new();
        let queued = handler.post_fn(|| {}).unwrap();
        handler.close();
        assert!(queued.is_canceled());
        assert!(matches!(handler.post_fn(|| {}), Err(ScheduleError::Closed)));
        assert!(handler.next(Wait::Forever).is_none());
        assert!(handler.is_closed());
    }

    #[test]
    fn get_all_preserves_order() {
        let (clock, handler) = manual();
        let _ = clock;
        let a = handler.post_fn(|| {}).unwrap();
        let b = handler.post_fn(|| {}).unwrap();
        let t1 = handler.post_at(Request::from_runnable(|| {}), 10).unwrap();
        let t2 = handler.post_at(Request::from_runnable(|| {}), 5).unwrap();
        let all = handler.get_all(false);
        assert_eq!(all.len(), 4);
        assert!(all[0].same(&a) && all[1].same(&b));
        // timed part comes soonest-first
        assert!(all[2].same(&t2) && all[3].same(&t1));
        let untimed = handler.get_all(true);
        assert_eq!(untimed.len(), 2);
    }

    #[test]
    fn next_times_out_on_an_empty_handler() {
        let handler = Handler::new();
        let began = std::time::Instant::now();
        assert!(handler.next(Wait::Timeout(Duration::from_millis(10))).is_none());
        assert!(began.elapsed() >= Duration::from_millis(10));
    }
}
