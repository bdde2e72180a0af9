//! Bounded input queue plus id-ordered output heap: the coordination
//! primitive behind the multithreaded BGZF codecs.
//!
//! Producers push jobs with dense, ascending ids. Workers take jobs in any
//! order and push results onto the output side, where a min-heap keyed on the
//! id lets the consumer drain strictly in order. POISON travels on the input
//! queue (and is re-injected so every worker wakes); LAST travels on the
//! output heap with id one past the largest input id, so the consumer sees it
//! exactly once, after every real job.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Condvar, Mutex};

/// A unit of work in flight through the queue system.
#[derive(Debug)]
pub struct Job<T> {
    /// Sequential id; dense and ascending per producer.
    pub id: u64,
    /// What kind of message this is.
    pub kind: JobKind<T>,
}

/// Job payload or control sentinel.
#[derive(Debug)]
pub enum JobKind<T> {
    /// A real payload.
    Data(T),
    /// End-of-stream marker for workers; re-injected on take.
    Poison,
    /// End-of-stream marker for the consumer; id = max input id + 1.
    Last,
}

impl<T> Job<T> {
    /// A payload-carrying job.
    pub fn data(id: u64, payload: T) -> Job<T> {
        Job { id: id, kind: JobKind::Data(payload) }
    }

    fn poison() -> Job<T> {
        Job { id: u64::MAX, kind: JobKind::Poison }
    }

    fn last(id: u64) -> Job<T> {
        Job { id: id, kind: JobKind::Last }
    }

    /// True for the worker-side sentinel.
    pub fn is_poison(&self) -> bool {
        matches!(self.kind, JobKind::Poison)
    }
}

// heap ordering is by id only; BinaryHeap is a max-heap, so reverse
struct OrderedJob<T>(Job<T>);

impl<T> PartialEq for OrderedJob<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl<T> Eq for OrderedJob<T> {}

impl<T> PartialOrd for OrderedJob<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for OrderedJob<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.id.cmp(&self.0.id)
    }
}

struct Inner<T> {
    input: VecDeque<Job<T>>,
    output: BinaryHeap<OrderedJob<T>>,
    next_out: u64,
    max_seen_id: Option<u64>,
    last_sent: bool,
    cancelled: bool,
}

/// The queue system: one instance coordinates one producer, N workers and one
/// consumer.
pub struct OrderedQueueSystem<T> {
    inner: Mutex<Inner<T>>,
    input_ready: Condvar,
    output_ready: Condvar,
    input_cap: usize,
    output_cap: usize,
}

impl<T> OrderedQueueSystem<T> {
    /// Build with the given input and output capacities (both at least 1).
    pub fn new(input_cap: usize, output_cap: usize) -> OrderedQueueSystem<T> {
        OrderedQueueSystem {
            inner: Mutex::new(Inner {
                input: VecDeque::new(),
                output: BinaryHeap::new(),
                next_out: 0,
                max_seen_id: None,
                last_sent: false,
                cancelled: false,
            }),
            input_ready: Condvar::new(),
            output_ready: Condvar::new(),
            input_cap: input_cap.max(1),
            output_cap: output_cap.max(1),
        }
    }

    /// Enqueue a job for the workers; blocks while the input queue is full.
    /// Returns false (dropping the job) after LAST has been sent or the
    /// system was cancelled.
    pub fn add_input(&self, job: Job<T>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.input.len() >= self.input_cap
              && !inner.cancelled
              && !inner.last_sent {
            inner = self.input_ready.wait(inner).unwrap();
        }
        if inner.cancelled || inner.last_sent {
            return false;
        }

        inner.max_seen_id = Some(match inner.max_seen_id {
            Some(max) => max.max(job.id),
            None => job.id,
        });
        inner.input.push_back(job);
        self.input_ready.notify_all();
        true
    }

    /// Take the next job for a worker; blocks while the queue is empty.
    /// POISON is re-injected before being returned so sibling workers wake
    /// and terminate too.
    pub fn take_input(&self) -> Job<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.cancelled {
                return Job::poison();
            }
            if let Some(job) = inner.input.pop_front() {
                if job.is_poison() {
                    inner.input.push_back(Job::poison());
                    self.input_ready.notify_all();
                }
                self.input_ready.notify_all();
                return job;
            }
            inner = self.input_ready.wait(inner).unwrap();
        }
    }

    /// Declare end of input: POISON goes to the workers and LAST is placed on
    /// the output heap at id = (max input id) + 1.
    pub fn poison(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.last_sent {
            return;
        }
        inner.last_sent = true;
        let last_id = inner.max_seen_id.map(|m| m + 1).unwrap_or(0);
        inner.input.push_back(Job::poison());
        inner.output.push(OrderedJob(Job::last(last_id)));
        self.input_ready.notify_all();
        self.output_ready.notify_all();
    }

    /// Push a finished job onto the ordered output heap. Blocks while the
    /// heap is at capacity, unless this job is the one the consumer is
    /// waiting for.
    pub fn add_output(&self, job: Job<T>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.output.len() >= self.output_cap
              && job.id != inner.next_out
              && !inner.cancelled {
            inner = self.output_ready.wait(inner).unwrap();
        }
        if inner.cancelled {
            return false;
        }
        inner.output.push(OrderedJob(job));
        self.output_ready.notify_all();
        true
    }

    /// Take the next payload in id order; `None` once LAST is consumed or the
    /// system was cancelled.
    pub fn get_output(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.cancelled {
                return None;
            }
            let head_is_next = inner.output.peek()
                .map(|j| j.0.id == inner.next_out)
                .unwrap_or(false);
            if head_is_next {
                let job = inner.output.pop().unwrap().0;
                inner.next_out = job.id + 1;
                self.output_ready.notify_all();
                match job.kind {
                    JobKind::Data(payload) => return Some(payload),
                    JobKind::Last => return None,
                    JobKind::Poison => continue,
                }
            }
            inner = self.output_ready.wait(inner).unwrap();
        }
    }

    /// Cancel everything: workers and blocked callers wake and exit.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.cancelled = true;
        inner.input.push_back(Job::poison());
        self.input_ready.notify_all();
        self.output_ready.notify_all();
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().cancelled
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use super::*;

    #[test]
    fn output_drains_in_id_order() {
        let q: OrderedQueueSystem<u32> = OrderedQueueSystem::new(8, 8);
        assert!(q.add_output(Job::data(2, 20)));
        assert!(q.add_output(Job::data(0, 0)));
        assert!(q.add_output(Job::data(1, 10)));
        q.poison();

        assert_eq!(Some(0), q.get_output());
        assert_eq!(Some(10), q.get_output());
        assert_eq!(Some(20), q.get_output());
    }

    #[test]
    fn last_terminates_the_consumer() {
        let q: OrderedQueueSystem<u32> = OrderedQueueSystem::new(8, 8);
        assert!(q.add_input(Job::data(0, 5)));
        let job = q.take_input();
        assert_eq!(0, job.id);
        q.add_output(Job::data(0, 5));
        q.poison();

        assert_eq!(Some(5), q.get_output());
        assert_eq!(None, q.get_output());
    }

    #[test]
    fn poison_reaches_every_worker() {
        let q: Arc<OrderedQueueSystem<u32>> = Arc::new(OrderedQueueSystem::new(8, 8));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                loop {
                    let job = q.take_input();
                    if job.is_poison() {
                        return true;
                    }
                }
            }));
        }

        q.poison();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn input_rejected_after_last() {
        let q: OrderedQueueSystem<u32> = OrderedQueueSystem::new(8, 8);
        assert!(q.add_input(Job::data(0, 1)));
        q.poison();
        assert!(!q.add_input(Job::data(1, 2)));
    }

    #[test]
    fn cancel_wakes_blocked_consumer() {
        let q: Arc<OrderedQueueSystem<u32>> = Arc::new(OrderedQueueSystem::new(2, 2));
        let q2 = q.clone();
        let consumer = thread::spawn(move || q2.get_output());

        q.cancel();
        assert_eq!(None, consumer.join().unwrap());
        assert!(q.is_cancelled());
        assert!(!q.add_input(Job::data(0, 1)));
    }

    #[test]
    fn pipeline_end_to_end_preserves_order() {
        let q: Arc<OrderedQueueSystem<u64>> = Arc::new(OrderedQueueSystem::new(4, 4));
        const N: u64 = 200;

        let mut workers = Vec::new();
        for _ in 0..3 {
            let q = q.clone();
            workers.push(thread::spawn(move || {
                loop {
                    let job = q.take_input();
                    match job.kind {
                        JobKind::Data(v) => {
                            // simulate uneven completion
                            if v % 7 == 0 {
                                thread::yield_now();
                            }
                            q.add_output(Job::data(job.id, v * 2));
                        },
                        _ => return,
                    }
                }
            }));
        }

        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..N {
                    assert!(q.add_input(Job::data(i, i)));
                }
                q.poison();
            })
        };

        let mut received = Vec::new();
        while let Some(v) = q.get_output() {
            received.push(v);
        }

        producer.join().unwrap();
        for w in workers {
            w.join().unwrap();
        }

        let expected: Vec<u64> = (0..N).map(|i| i * 2).collect();
        assert_eq!(expected, received);
    }

    #[test]
    fn bounded_input_backpressure_releases() {
        let q: Arc<OrderedQueueSystem<u32>> = Arc::new(OrderedQueueSystem::new(1, 8));
        assert!(q.add_input(Job::data(0, 0)));

        let q2 = q.clone();
        let producer = thread::spawn(move || q2.add_input(Job::data(1, 1)));

        // consume one so the blocked producer can proceed
        let job = q.take_input();
        assert_eq!(0, job.id);
        assert!(producer.join().unwrap());
    }
}
