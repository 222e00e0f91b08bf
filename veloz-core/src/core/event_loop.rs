//! Priority-scheduled task dispatcher.
//!
//! Single dispatcher thread; task bodies run strictly sequentially. Producer
//! threads only enqueue — wake-up is a cross-thread condvar notifier so the
//! dispatcher never busy-polls, the teacher's own `AsyncJournal` writer
//! thread pattern (`execution/journal.rs`) applied to pulling work instead of
//! pushing it. Delayed tasks are kept in a `BinaryHeap`; the resilience
//! notes in `spec.md` §5 call a heap sufficient below ~10^3 outstanding
//! timers, which is the expected population here.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub type Task = Box<dyn FnOnce() + Send>;
pub type Router = Box<dyn Fn(&[String], Box<dyn FnOnce() + Send>) + Send + Sync>;
pub type Filter = Box<dyn Fn(&[String], Priority) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

struct ReadyItem {
    priority: Priority,
    enqueue_order: u64,
    tags: Vec<String>,
    task: Option<Task>,
    /// When this item became eligible for dispatch: the `post()` call for
    /// an immediate task, or the moment a delayed task was promoted out of
    /// the timer heap. Queue-wait is measured from here, not from
    /// `post_delayed`'s original enqueue time.
    ready_since: Instant,
}

impl ReadyItem {
    fn take(&mut self) -> Task {
        self.task.take().expect("task taken twice")
    }
}

/// Max-heap by `(priority, -enqueue_order)`: higher priority first, FIFO
/// within a priority tier.
impl Ord for ReadyItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueue_order.cmp(&self.enqueue_order))
    }
}
impl PartialOrd for ReadyItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for ReadyItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.enqueue_order == other.enqueue_order
    }
}
impl Eq for ReadyItem {}

struct DelayedItem {
    due: Instant,
    priority: Priority,
    enqueue_order: u64,
    tags: Vec<String>,
    task: Option<Task>,
}

/// Min-heap by due time: soonest deadline first.
impl Ord for DelayedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.enqueue_order.cmp(&self.enqueue_order))
    }
}
impl PartialOrd for DelayedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for DelayedItem {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.enqueue_order == other.enqueue_order
    }
}
impl Eq for DelayedItem {}

/// Tracks a run of consecutive task panics for the panic-storm safety stop
/// (spec §7): three panics within one second trips the configured handler.
/// A successful dispatch resets the streak.
#[derive(Debug, Default)]
struct PanicStreak {
    count: u32,
    first_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Counters {
    posted: u64,
    processed: u64,
    failed: u64,
    filtered: u64,
    by_priority: [u64; 4],
    queue_wait_ns_sum: u64,
    queue_wait_ns_max: u64,
    processing_ns_sum: u64,
    processing_ns_max: u64,
}

#[derive(Debug, Clone, Default)]
pub struct EventLoopStats {
    pub posted: u64,
    pub processed: u64,
    pub failed: u64,
    pub filtered: u64,
    pub by_priority: [u64; 4],
    pub queue_wait_ns_sum: u64,
    pub queue_wait_ns_max: u64,
    pub processing_ns_sum: u64,
    pub processing_ns_max: u64,
}

impl EventLoopStats {
    pub fn to_string_snapshot(&self) -> String {
        format!(
            "posted={} processed={} failed={} filtered={} queue_wait_avg_ns={} proc_avg_ns={}",
            self.posted,
            self.processed,
            self.failed,
            self.filtered,
            self.queue_wait_ns_sum.checked_div(self.processed.max(1)).unwrap_or(0),
            self.processing_ns_sum.checked_div(self.processed.max(1)).unwrap_or(0),
        )
    }
}

struct Queues {
    ready: BinaryHeap<ReadyItem>,
    delayed: BinaryHeap<DelayedItem>,
}

/// The priority dispatcher. Cheap to clone a handle (`Arc`-backed) for
/// cross-thread producers; only one thread should call [`EventLoop::run`].
pub struct EventLoop {
    queues: Mutex<Queues>,
    not_empty: Condvar,
    next_enqueue_order: AtomicU64,
    next_task_id: AtomicU64,
    running: AtomicBool,
    stop_requested: AtomicBool,
    filters: Mutex<Vec<Filter>>,
    router: Mutex<Option<Router>>,
    counters: Mutex<Counters>,
    panic_streak: Mutex<PanicStreak>,
    panic_storm_handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues {
                ready: BinaryHeap::new(),
                delayed: BinaryHeap::new(),
            }),
            not_empty: Condvar::new(),
            next_enqueue_order: AtomicU64::new(0),
            next_task_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            filters: Mutex::new(Vec::new()),
            router: Mutex::new(None),
            counters: Mutex::new(Counters::default()),
            panic_streak: Mutex::new(PanicStreak::default()),
            panic_storm_handler: Mutex::new(None),
        }
    }

    /// Register the callback invoked when three task panics land within one
    /// second of each other (spec §7's panic-storm safety stop). Only one
    /// handler is kept; a later call replaces an earlier one.
    pub fn set_panic_storm_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.panic_storm_handler.lock() = Some(Box::new(handler));
    }

    /// Enqueue `task` at `priority`. Higher-priority ready tasks always
    /// dispatch before lower-priority ones that are ready at the same time.
    pub fn post(&self, task: Task, priority: Priority, tags: Vec<String>) {
        let order = self.next_enqueue_order.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut counters = self.counters.lock();
            counters.posted += 1;
            counters.by_priority[priority as usize] += 1;
        }
        let mut queues = self.queues.lock();
        queues.ready.push(ReadyItem {
            priority,
            enqueue_order: order,
            tags,
            task: Some(task),
            ready_since: Instant::now(),
        });
        drop(queues);
        self.not_empty.notify_one();
    }

    /// Becomes ready at `now + delay`; a past-due deadline is promoted
    /// immediately on the next scheduling pass.
    pub fn post_delayed(
        &self,
        task: Task,
        delay: Duration,
        priority: Priority,
        tags: Vec<String>,
    ) -> TaskId {
        let id = TaskId(self.next_task_id.fetch_add(1, AtomicOrdering::Relaxed));
        let order = self.next_enqueue_order.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut counters = self.counters.lock();
            counters.posted += 1;
        }
        let mut queues = self.queues.lock();
        queues.delayed.push(DelayedItem {
            due: Instant::now() + delay,
            priority,
            enqueue_order: order,
            tags,
            task: Some(task),
        });
        drop(queues);
        self.not_empty.notify_one();
        id
    }

    /// Drop every task whose tags/priority match any registered filter.
    pub fn add_filter(&self, filter: Filter) {
        self.filters.lock().push(filter);
    }

    pub fn set_router(&self, router: Router) {
        *self.router.lock() = Some(router);
    }

    /// Run the dispatcher loop on the calling thread until `stop()` is
    /// called. Not reentrant: a second concurrent call returns immediately.
    pub fn run(&self) {
        if self.running.swap(true, AtomicOrdering::AcqRel) {
            warn!("event loop run() called while already running; ignoring");
            return;
        }
        self.stop_requested.store(false, AtomicOrdering::Release);

        loop {
            if self.stop_requested.load(AtomicOrdering::Acquire) {
                break;
            }
            self.promote_due_delayed();

            let next = {
                let mut queues = self.queues.lock();
                if queues.ready.is_empty() {
                    let wait = self.next_wake(&queues);
                    match wait {
                        Some(d) => {
                            self.not_empty.wait_for(&mut queues, d);
                        }
                        None => {
                            self.not_empty.wait(&mut queues);
                        }
                    }
                    continue;
                }
                queues.ready.pop()
            };

            let Some(mut item) = next else { continue };

            if self.is_filtered(&item.tags, item.priority) {
                self.counters.lock().filtered += 1;
                continue;
            }

            let started = Instant::now();
            let wait_ns = started.saturating_duration_since(item.ready_since).as_nanos() as u64;
            let task = item.take();

            let result = {
                let router = self.router.lock();
                if let Some(router) = router.as_ref() {
                    let tags = item.tags.clone();
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        router(&tags, task);
                    }));
                    outcome
                } else {
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(task))
                }
            };

            let elapsed_ns = started.elapsed().as_nanos() as u64;
            let mut counters = self.counters.lock();
            counters.queue_wait_ns_sum += wait_ns;
            counters.queue_wait_ns_max = counters.queue_wait_ns_max.max(wait_ns);
            counters.processing_ns_sum += elapsed_ns;
            counters.processing_ns_max = counters.processing_ns_max.max(elapsed_ns);
            match result {
                Ok(()) => {
                    counters.processed += 1;
                    drop(counters);
                    self.panic_streak.lock().count = 0;
                }
                Err(_) => {
                    counters.failed += 1;
                    warn!("task panicked; continuing dispatch loop");
                    drop(counters);
                    self.record_panic_and_maybe_trip();
                }
            }
        }

        self.running.store(false, AtomicOrdering::Release);
    }

    pub fn stop(&self) {
        self.stop_requested.store(true, AtomicOrdering::Release);
        self.not_empty.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn stats(&self) -> EventLoopStats {
        let c = self.counters.lock();
        EventLoopStats {
            posted: c.posted,
            processed: c.processed,
            failed: c.failed,
            filtered: c.filtered,
            by_priority: c.by_priority,
            queue_wait_ns_sum: c.queue_wait_ns_sum,
            queue_wait_ns_max: c.queue_wait_ns_max,
            processing_ns_sum: c.processing_ns_sum,
            processing_ns_max: c.processing_ns_max,
        }
    }

    fn is_filtered(&self, tags: &[String], priority: Priority) -> bool {
        self.filters.lock().iter().any(|f| f(tags, priority))
    }

    /// Extends the consecutive-panic streak and, once three panics have
    /// landed within a one-second window, fires the panic-storm handler and
    /// resets the streak so it does not retrigger on every subsequent panic.
    fn record_panic_and_maybe_trip(&self) {
        let now = Instant::now();
        let mut streak = self.panic_streak.lock();
        let within_window = streak
            .first_at
            .map(|first| now.duration_since(first) <= Duration::from_secs(1))
            .unwrap_or(false);
        if within_window {
            streak.count += 1;
        } else {
            streak.count = 1;
            streak.first_at = Some(now);
        }
        let tripped = streak.count >= 3;
        if tripped {
            streak.count = 0;
            streak.first_at = None;
        }
        drop(streak);

        if tripped {
            warn!("three task panics within one second; invoking panic-storm handler");
            if let Some(handler) = self.panic_storm_handler.lock().as_ref() {
                handler();
            }
        }
    }

    fn promote_due_delayed(&self) {
        let mut queues = self.queues.lock();
        let now = Instant::now();
        let mut promoted = Vec::new();
        while let Some(top) = queues.delayed.peek() {
            if top.due <= now {
                promoted.push(queues.delayed.pop().unwrap());
            } else {
                break;
            }
        }
        for mut item in promoted {
            let task = item.take();
            queues.ready.push(ReadyItem {
                priority: item.priority,
                enqueue_order: item.enqueue_order,
                tags: item.tags,
                task: Some(task),
                ready_since: now,
            });
        }
    }

    fn next_wake(&self, queues: &Queues) -> Option<Duration> {
        queues.delayed.peek().map(|item| {
            let now = Instant::now();
            if item.due > now {
                item.due - now
            } else {
                Duration::from_millis(0)
            }
        })
    }
}

/// RAII scoped latency guard: reports elapsed time into an
/// [`EventLoopStats`]-style accumulator on `Drop`, guaranteeing the sample is
/// recorded on every exit path (including early `return` and panics that
/// unwind through it).
pub struct ScopedTimer {
    started: Instant,
    sink: Arc<Mutex<(u64, u64)>>, // (sum_ns, max_ns)
}

impl ScopedTimer {
    pub fn start(sink: Arc<Mutex<(u64, u64)>>) -> Self {
        Self {
            started: Instant::now(),
            sink,
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed_ns = self.started.elapsed().as_nanos() as u64;
        let mut sink = self.sink.lock();
        sink.0 += elapsed_ns;
        sink.1 = sink.1.max(elapsed_ns);
        debug!(elapsed_ns, "scoped timer recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn higher_priority_task_runs_before_lower_when_both_ready() {
        let event_loop = Arc::new(EventLoop::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        event_loop.post(Box::new(move || o1.lock().push("normal")), Priority::Normal, vec![]);
        let o2 = order.clone();
        event_loop.post(Box::new(move || o2.lock().push("high")), Priority::High, vec![]);

        let el = event_loop.clone();
        let (tx, rx) = mpsc::channel();
        let o3 = order.clone();
        el.post(
            Box::new(move || {
                o3.lock().push("stop-marker");
                tx.send(()).ok();
            }),
            Priority::Low,
            vec![],
        );

        let el_run = event_loop.clone();
        let handle = std::thread::spawn(move || el_run.run());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        event_loop.stop();
        handle.join().unwrap();

        let seen = order.lock();
        assert_eq!(seen[0], "high");
        assert_eq!(seen[1], "normal");
    }

    #[test]
    fn panicking_task_is_counted_and_loop_continues() {
        let event_loop = Arc::new(EventLoop::new());
        event_loop.post(Box::new(|| panic!("boom")), Priority::Normal, vec![]);

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let (tx, rx) = mpsc::channel();
        event_loop.post(
            Box::new(move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
                tx.send(()).ok();
            }),
            Priority::Normal,
            vec![],
        );

        let el_run = event_loop.clone();
        let handle = std::thread::spawn(move || el_run.run());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        event_loop.stop();
        handle.join().unwrap();

        assert_eq!(counter.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(event_loop.stats().failed, 1);
        assert_eq!(event_loop.stats().processed, 1);
    }

    #[test]
    fn queue_wait_stats_reflect_actual_dispatch_delay() {
        let event_loop = Arc::new(EventLoop::new());
        let (tx, rx) = mpsc::channel();

        // Block the dispatcher on a sleeping task first so the next post()
        // sits in the queue for a measurable stretch before it is picked up.
        event_loop.post(Box::new(|| std::thread::sleep(Duration::from_millis(30))), Priority::Normal, vec![]);
        event_loop.post(
            Box::new(move || {
                tx.send(()).ok();
            }),
            Priority::Normal,
            vec![],
        );

        let el_run = event_loop.clone();
        let handle = std::thread::spawn(move || el_run.run());
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        event_loop.stop();
        handle.join().unwrap();

        assert!(event_loop.stats().queue_wait_ns_sum > 0);
    }

    #[test]
    fn three_consecutive_panics_within_a_second_trip_the_storm_handler() {
        let event_loop = Arc::new(EventLoop::new());
        let tripped = Arc::new(AtomicUsize::new(0));
        let t = tripped.clone();
        event_loop.set_panic_storm_handler(move || {
            t.fetch_add(1, AtomicOrdering::Relaxed);
        });

        for _ in 0..3 {
            event_loop.post(Box::new(|| panic!("boom")), Priority::Normal, vec![]);
        }
        let (tx, rx) = mpsc::channel();
        event_loop.post(
            Box::new(move || {
                tx.send(()).ok();
            }),
            Priority::Normal,
            vec![],
        );

        let el_run = event_loop.clone();
        let handle = std::thread::spawn(move || el_run.run());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        event_loop.stop();
        handle.join().unwrap();

        assert_eq!(tripped.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(event_loop.stats().failed, 3);
    }

    #[test]
    fn past_due_delayed_task_is_promoted_immediately() {
        let event_loop = Arc::new(EventLoop::new());
        let (tx, rx) = mpsc::channel();
        event_loop.post_delayed(
            Box::new(move || {
                tx.send(()).ok();
            }),
            Duration::from_millis(0),
            Priority::Normal,
            vec![],
        );
        let el_run = event_loop.clone();
        let handle = std::thread::spawn(move || el_run.run());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        event_loop.stop();
        handle.join().unwrap();
    }
}
