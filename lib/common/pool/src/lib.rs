//! Fixed-size worker pool with per-key access modes.
//!
//! Jobs are executed in submission order, except that jobs for the same key respect
//! their [`AccessMode`]: any number of [`AccessMode::Shared`] jobs may run concurrently for a
//! key, while an [`AccessMode::Exclusive`] job runs alone. A job blocked by its key never
//! blocks jobs of other keys.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use worker::worker_loop;

mod worker;

// Smaller sequence number means submitted earlier, which means higher priority.
type Seq = usize;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessMode {
    /// May run alongside other shared jobs of the same key.
    Shared,
    /// Runs alone for its key.
    Exclusive,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum KeyState {
    Shared(usize), // number of running shared jobs
    Exclusive,
}

pub struct WorkerPool<Key> {
    threads: Vec<JoinHandle<()>>,
    queue: Arc<Mutex<JobQueue<Key>>>,
    job_available: Arc<Condvar>,
    terminate: Arc<AtomicBool>,
}

impl<Key> Drop for WorkerPool<Key> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<Key> WorkerPool<Key> {
    /// Stop all workers once every submitted job has finished.
    pub fn stop(&mut self) {
        {
            let _queue = self.queue.lock();
            self.terminate.store(true, Ordering::Relaxed);
            self.job_available.notify_all();
        }

        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::warn!("Worker thread terminated with a panic");
            }
        }
    }

    /// Number of jobs submitted and not yet finished.
    pub fn pending(&self) -> usize {
        self.queue.lock().pending
    }
}

impl<Key: Clone + Hash + Eq + Send + 'static> WorkerPool<Key> {
    pub fn new(threads: usize, name: &str) -> io::Result<Self> {
        let job_available = Arc::<Condvar>::default();
        let queue = Arc::<Mutex<JobQueue<Key>>>::default();
        let terminate = Arc::<AtomicBool>::default();

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let job_available = job_available.clone();
            let queue = queue.clone();
            let terminate = terminate.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{}", i + 1))
                .spawn(move || worker_loop(job_available, queue, terminate))?;
            handles.push(handle);
        }

        Ok(Self {
            threads: handles,
            queue,
            job_available,
            terminate,
        })
    }

    pub fn submit(&self, key: Key, mode: AccessMode, job: impl FnOnce() + Send + 'static) {
        let mut queue = self.queue.lock();
        queue.submit(key, mode, Box::new(job), &self.job_available);
    }
}

struct JobQueue<Key> {
    next_seq: Seq,
    pending: usize,
    runnable: BinaryHeap<Ticket<(Running<Key>, Job)>>,
    blocked: HashMap<Key, KeyQueue>,
}

impl<Key> Default for JobQueue<Key> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            pending: 0,
            runnable: BinaryHeap::new(),
            blocked: HashMap::new(),
        }
    }
}

impl<Key: Clone + Eq + Hash> JobQueue<Key> {
    fn submit(&mut self, key: Key, mode: AccessMode, job: Job, condvar: &Condvar) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending += 1;

        let JobQueue {
            blocked, runnable, ..
        } = self;

        let key_queue = blocked.entry(key.clone()).or_default();
        key_queue.waiting.push(Ticket::new(seq, (mode, job)));
        key_queue.promote(&key, runnable, condvar);
    }

    fn next_job(&mut self) -> Option<(Running<Key>, Job)> {
        self.runnable.pop().map(|Ticket(_, payload)| payload)
    }

    fn complete(&mut self, running: &Running<Key>, condvar: &Condvar) {
        self.pending = self.pending.saturating_sub(1);

        let JobQueue {
            blocked, runnable, ..
        } = self;

        let Some(key_queue) = blocked.get_mut(&running.key) else {
            log::error!("Completed a job for a key that has no queue");
            return;
        };
        key_queue.finish(running.mode);
        key_queue.promote(&running.key, runnable, condvar);
        if key_queue.is_idle() {
            blocked.remove(&running.key);
        }
    }
}

struct Running<Key> {
    key: Key,
    mode: AccessMode,
}

/// Max-heap entry ordered by reversed sequence number.
struct Ticket<V>(Reverse<Seq>, V);

impl<V> Ticket<V> {
    fn new(seq: Seq, val: V) -> Self {
        Self(Reverse(seq), val)
    }
}

impl<V> PartialEq for Ticket<V> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<V> Eq for Ticket<V> {}

impl<V> PartialOrd for Ticket<V> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<V> Ord for Ticket<V> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

#[derive(Default)]
struct KeyQueue {
    state: Option<KeyState>,
    waiting: BinaryHeap<Ticket<(AccessMode, Job)>>,
}

impl KeyQueue {
    fn is_idle(&self) -> bool {
        self.state.is_none() && self.waiting.is_empty()
    }

    fn finish(&mut self, mode: AccessMode) {
        self.state = match (self.state, mode) {
            (Some(KeyState::Shared(count)), AccessMode::Shared) if count > 1 => {
                Some(KeyState::Shared(count - 1))
            }
            (Some(KeyState::Shared(_)), AccessMode::Shared) => None,
            (Some(KeyState::Exclusive), AccessMode::Exclusive) => None,
            (state, mode) => {
                log::error!("Job finished in {mode:?} mode while key state is {state:?}");
                None
            }
        };
    }

    /// Move every job that may start now into the runnable heap.
    fn promote<Key: Clone>(
        &mut self,
        key: &Key,
        runnable: &mut BinaryHeap<Ticket<(Running<Key>, Job)>>,
        condvar: &Condvar,
    ) {
        while let Some(Ticket(_, (mode, _))) = self.waiting.peek() {
            let next_state = match (self.state, *mode) {
                (None, AccessMode::Shared) => KeyState::Shared(1),
                (None, AccessMode::Exclusive) => KeyState::Exclusive,
                (Some(KeyState::Shared(count)), AccessMode::Shared) => {
                    KeyState::Shared(count + 1)
                }
                _ => break,
            };
            let Some(Ticket(seq, (mode, job))) = self.waiting.pop() else {
                break;
            };
            self.state = Some(next_state);
            let running = Running {
                key: key.clone(),
                mode,
            };
            runnable.push(Ticket(seq, (running, job)));
            condvar.notify_one();
        }
    }
}
