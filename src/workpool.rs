//! Generic concurrent worker pool — single producer, N workers, single
//! consumer draining results in submission order (spec.md §4.4, §5).
//!
//! A single shared `Mutex<PoolState<I, O>>` guards both the work queue and
//! the completed-result map. Two condition variables hang off it:
//!
//! - `work_available`: workers wait on this when the queue is empty.
//! - `all_ready`: the consumer waits on this when the result it wants next
//!   (by submission sequence number, not completion order) isn't in yet.
//!
//! Workers may finish out of order; `take_in_order` enforces the
//! single-writer ordering contract by making the consumer ask for results
//! strictly by sequence number, regardless of which worker produced them or
//! when.
//!
//! `spin_wait` reproduces the original tool's 10ms polling loop instead of
//! blocking on `all_ready`, kept only so the documented legacy timing
//! behavior can be exercised in tests; the condvar path is the default and
//! is what production callers should use.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SPIN_WAIT_INTERVAL: Duration = Duration::from_millis(10);

struct PoolState<I, O> {
    queue: VecDeque<(u64, I)>,
    results: HashMap<u64, O>,
    next_seq: u64,
    shutdown: bool,
}

/// A pool of `num_workers` threads, each running the same transform
/// `I -> O`, fed by `submit` and drained in submission order by
/// `take_in_order`.
pub struct WorkerPool<I, O> {
    state: Arc<Mutex<PoolState<I, O>>>,
    work_available: Arc<Condvar>,
    all_ready: Arc<Condvar>,
    workers: Vec<JoinHandle<()>>,
    spin_wait: bool,
}

impl<I, O> WorkerPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Spawn `num_workers` threads applying `transform`. `num_workers == 0`
    /// is rejected — callers that want synchronous, unpooled processing
    /// should bypass the pool entirely (spec.md §5's "N == 0 means run on
    /// the calling thread" is a driver-level decision, not this pool's).
    pub fn new<F>(num_workers: usize, spin_wait: bool, transform: F) -> Self
    where
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        assert!(num_workers > 0, "WorkerPool requires at least one worker");

        let state = Arc::new(Mutex::new(PoolState {
            queue: VecDeque::new(),
            results: HashMap::new(),
            next_seq: 0,
            shutdown: false,
        }));
        let work_available = Arc::new(Condvar::new());
        let all_ready = Arc::new(Condvar::new());
        let transform = Arc::new(transform);

        let workers = (0..num_workers)
            .map(|_| {
                let state = Arc::clone(&state);
                let work_available = Arc::clone(&work_available);
                let all_ready = Arc::clone(&all_ready);
                let transform = Arc::clone(&transform);
                thread::spawn(move || worker_loop(state, work_available, all_ready, transform))
            })
            .collect();

        Self {
            state,
            work_available,
            all_ready,
            workers,
            spin_wait,
        }
    }

    /// Enqueue one item, returning its submission sequence number.
    pub fn submit(&self, item: I) -> u64 {
        let mut st = self.state.lock().unwrap();
        let seq = st.next_seq;
        st.next_seq += 1;
        st.queue.push_back((seq, item));
        self.work_available.notify_one();
        seq
    }

    /// Block until `seq`'s result is ready and return it. Callers must ask
    /// for sequence numbers in ascending order to observe submission order.
    pub fn take_in_order(&self, seq: u64) -> O {
        let mut st = self.state.lock().unwrap();
        loop {
            if let Some(out) = st.results.remove(&seq) {
                return out;
            }
            if self.spin_wait {
                drop(st);
                thread::sleep(SPIN_WAIT_INTERVAL);
                st = self.state.lock().unwrap();
            } else {
                st = self.all_ready.wait(st).unwrap();
            }
        }
    }

    /// Signal every worker to exit once the queue drains, and join them.
    pub fn shutdown(self) {
        {
            let mut st = self.state.lock().unwrap();
            st.shutdown = true;
        }
        self.work_available.notify_all();
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop<I, O>(
    state: Arc<Mutex<PoolState<I, O>>>,
    work_available: Arc<Condvar>,
    all_ready: Arc<Condvar>,
    transform: Arc<dyn Fn(I) -> O + Send + Sync>,
) {
    loop {
        let (seq, item) = {
            let mut st = state.lock().unwrap();
            loop {
                if let Some(front) = st.queue.pop_front() {
                    break front;
                }
                if st.shutdown {
                    return;
                }
                st = work_available.wait(st).unwrap();
            }
        };

        let out = transform(item);

        let mut st = state.lock().unwrap();
        st.results.insert(seq, out);
        drop(st);
        all_ready.notify_all();
    }
}
