//! Deterministic virtual-time scheduler.

use crate::platform::{lock, Scheduler, TimerCallback, TimerId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct SimState {
    elapsed: Duration,
    next_id: u64,
    /// Ordered by deadline, then by scheduling order.
    queue: BTreeMap<(Duration, TimerId), TimerCallback>,
    deadlines: HashMap<TimerId, Duration>,
}

/// [`Scheduler`] whose clock only moves when told to.
///
/// Callbacks run on the thread calling [`advance`](Self::advance) or
/// [`step`](Self::step), outside the scheduler's lock, so they may schedule
/// or cancel further timers. Timers sharing a deadline fire in the order they
/// were scheduled.
pub struct SimScheduler {
    base: Instant,
    state: Mutex<SimState>,
}

impl Default for SimScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SimScheduler {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            state: Mutex::new(SimState {
                elapsed: Duration::ZERO,
                next_id: 1,
                queue: BTreeMap::new(),
                deadlines: HashMap::new(),
            }),
        }
    }

    /// Virtual time since creation.
    pub fn elapsed(&self) -> Duration {
        lock(&self.state).elapsed
    }

    /// Number of timers waiting to fire.
    pub fn pending(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Virtual time at which the next timer fires.
    pub fn next_deadline(&self) -> Option<Duration> {
        lock(&self.state).queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Fire the earliest timer, moving the clock to its deadline.
    ///
    /// Returns `false` when nothing is scheduled.
    pub fn step(&self) -> bool {
        let callback = {
            let mut state = lock(&self.state);
            let Some(((deadline, id), callback)) = state.queue.pop_first() else {
                return false;
            };
            state.deadlines.remove(&id);
            if deadline > state.elapsed {
                state.elapsed = deadline;
            }
            callback
        };
        callback();
        true
    }

    /// Move the clock forward by `duration`, firing every timer that falls
    /// due on the way (including ones scheduled by those callbacks).
    ///
    /// Returns the number of callbacks run.
    pub fn advance(&self, duration: Duration) -> usize {
        let target = self.elapsed() + duration;
        let mut fired = 0;
        while self.next_deadline().is_some_and(|deadline| deadline <= target) {
            self.step();
            fired += 1;
        }
        let mut state = lock(&self.state);
        if state.elapsed < target {
            state.elapsed = target;
        }
        fired
    }

    /// Fire timers until `done` returns true or `limit` of virtual time has
    /// passed. Returns whether `done` was satisfied.
    pub fn run_until<F>(&self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let end = self.elapsed() + limit;
        loop {
            if done() {
                return true;
            }
            match self.next_deadline() {
                Some(deadline) if deadline <= end => {
                    self.step();
                }
                _ => {
                    let mut state = lock(&self.state);
                    if state.elapsed < end {
                        state.elapsed = end;
                    }
                    drop(state);
                    return done();
                }
            }
        }
    }

    /// Fire timers until none are left or `limit` has passed.
    ///
    /// Returns `true` if the scheduler went idle.
    pub fn run_until_idle(&self, limit: Duration) -> bool {
        self.run_until(limit, || self.pending() == 0)
    }
}

impl Scheduler for SimScheduler {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let mut state = lock(&self.state);
        let id = TimerId::new(state.next_id);
        state.next_id += 1;
        let deadline = state.elapsed + delay;
        state.queue.insert((deadline, id), callback);
        state.deadlines.insert(id, deadline);
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut state = lock(&self.state);
        match state.deadlines.remove(&id) {
            Some(deadline) => state.queue.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> TimerCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |tag: u32| -> TimerCallback {
            let sink = sink.clone();
            Box::new(move || sink.lock().unwrap().push(tag))
        };
        (log, make)
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let sched = SimScheduler::new();
        let (log, make) = recorder();

        sched.schedule(Duration::from_millis(30), make(3));
        sched.schedule(Duration::from_millis(10), make(1));
        sched.schedule(Duration::from_millis(20), make(2));
        sched.schedule(Duration::from_millis(10), make(11));

        assert_eq!(sched.advance(Duration::from_millis(15)), 2);
        assert_eq!(*log.lock().unwrap(), vec![1, 11]);
        assert_eq!(sched.elapsed(), Duration::from_millis(15));

        sched.advance(Duration::from_millis(100));
        assert_eq!(*log.lock().unwrap(), vec![1, 11, 2, 3]);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_cancel() {
        let sched = SimScheduler::new();
        let (log, make) = recorder();

        let id = sched.schedule(Duration::from_millis(5), make(1));
        sched.schedule(Duration::from_millis(5), make(2));
        assert!(sched.cancel(id));
        assert!(!sched.cancel(id));

        sched.advance(Duration::from_millis(5));
        assert_eq!(*log.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_callback_can_reschedule() {
        let sched = Arc::new(SimScheduler::new());
        let count = Arc::new(Mutex::new(0u32));

        fn tick(sched: Arc<SimScheduler>, count: Arc<Mutex<u32>>) {
            *count.lock().unwrap() += 1;
            if *count.lock().unwrap() < 5 {
                let next = sched.clone();
                sched.schedule(
                    Duration::from_millis(10),
                    Box::new(move || tick(next, count)),
                );
            }
        }

        let (s, c) = (sched.clone(), count.clone());
        sched.schedule(Duration::from_millis(10), Box::new(move || tick(s, c)));

        sched.advance(Duration::from_millis(35));
        assert_eq!(*count.lock().unwrap(), 3);
        assert!(sched.run_until_idle(Duration::from_secs(1)));
        assert_eq!(*count.lock().unwrap(), 5);
        assert_eq!(sched.elapsed(), Duration::from_millis(50));
    }

    #[test]
    fn test_clock_tracks_elapsed() {
        let sched = SimScheduler::new();
        let start = sched.now();
        sched.advance(Duration::from_millis(250));
        assert_eq!(sched.now() - start, Duration::from_millis(250));
    }

    #[test]
    fn test_run_until_predicate() {
        let sched = SimScheduler::new();
        let (log, make) = recorder();
        for i in 0..10 {
            sched.schedule(Duration::from_millis(10 * (i + 1) as u64), make(i));
        }

        let done = sched.run_until(Duration::from_secs(1), || log.lock().unwrap().len() == 4);
        assert!(done);
        assert_eq!(sched.elapsed(), Duration::from_millis(40));

        let done = sched.run_until(Duration::from_millis(5), || false);
        assert!(!done);
        assert_eq!(sched.elapsed(), Duration::from_millis(45));
    }
}
