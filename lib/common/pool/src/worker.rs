use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::JobQueue;

pub(crate) fn worker_loop<Key: Eq + Hash + Clone>(
    job_available: Arc<Condvar>,
    queue: Arc<Mutex<JobQueue<Key>>>,
    terminate: Arc<AtomicBool>,
) {
    loop {
        let (running, job) = {
            let mut guard = queue.lock();
            loop {
                if let Some(next) = guard.next_job() {
                    break next;
                }
                // Mutex and Condvar already impose the ordering we need
                if terminate.load(Ordering::Relaxed) && guard.pending == 0 {
                    return;
                }
                job_available.wait(&mut guard);
            }
        };

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("Worker job panicked");
        }

        let mut guard = queue.lock();
        guard.complete(&running, job_available.as_ref());
        if guard.pending == 0 && terminate.load(Ordering::Relaxed) {
            job_available.notify_all();
        }
    }
}
