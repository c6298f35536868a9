use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cache::ContentId;
use parking_lot::{Condvar, Mutex};

use crate::simulator::SimHost;

/// Request ids waiting on the network, shared by the coordinator and the request state machines.
#[derive(Debug, Default)]
pub(crate) struct NetworkQueues {
    /// Requests to be sent to, or being served by, a simulator.
    network: BTreeSet<ContentId>,
    /// Transfers to cancel, per simulator.
    cancel: BTreeMap<SimHost, BTreeSet<ContentId>>,
    /// Requests waiting for an HTTP slot.
    http_waiters: BTreeSet<ContentId>,
    /// Requests with an HTTP exchange in flight.
    http_active: BTreeSet<ContentId>,
    last_flush: Option<Instant>,
}

impl NetworkQueues {
    pub fn add_to_network(&mut self, id: ContentId) {
        self.network.insert(id);
        for ids in self.cancel.values_mut() {
            ids.remove(&id);
        }
    }

    /// Take `id` off the network queue, telling `cancel_host` to stop sending it.
    pub fn remove_from_network(&mut self, id: ContentId, cancel_host: Option<SimHost>) {
        let queued = self.network.remove(&id);
        if let (true, Some(host)) = (queued, cancel_host) {
            self.cancel.entry(host).or_default().insert(id);
        }
    }

    pub fn cancel(&mut self, host: SimHost, id: ContentId) {
        self.network.remove(&id);
        self.cancel.entry(host).or_default().insert(id);
    }

    pub fn network_ids(&self) -> Vec<ContentId> {
        self.network.iter().copied().collect()
    }

    pub fn network_len(&self) -> usize {
        self.network.len()
    }

    pub fn take_cancels(&mut self) -> BTreeMap<SimHost, BTreeSet<ContentId>> {
        std::mem::take(&mut self.cancel)
    }

    pub fn add_http_waiter(&mut self, id: ContentId) {
        self.http_waiters.insert(id);
    }

    pub fn remove_http_waiter(&mut self, id: ContentId) {
        self.http_waiters.remove(&id);
    }

    pub fn is_http_waiter(&self, id: &ContentId) -> bool {
        self.http_waiters.contains(id)
    }

    pub fn http_waiter_ids(&self) -> Vec<ContentId> {
        self.http_waiters.iter().copied().collect()
    }

    pub fn add_http_active(&mut self, id: ContentId) {
        self.http_active.insert(id);
    }

    pub fn remove_http_active(&mut self, id: ContentId) {
        self.http_active.remove(&id);
    }

    pub fn http_active_len(&self) -> usize {
        self.http_active.len()
    }

    /// Whether `interval` has passed since the last flush, starting a new one if so.
    pub fn start_flush(&mut self, interval: Duration) -> bool {
        let now = Instant::now();
        match self.last_flush {
            Some(last) if now.duration_since(last) < interval => false,
            _ => {
                self.last_flush = Some(now);
                true
            }
        }
    }

    /// Stop waiting on the network for `id`, cancelling its simulator transfer if it had one.
    pub fn forget_waiting(&mut self, id: ContentId, cancel_host: Option<SimHost>) {
        self.remove_from_network(id, cancel_host);
        self.http_waiters.remove(&id);
    }

    /// Forget `id` everywhere.
    pub fn forget(&mut self, id: ContentId, cancel_host: Option<SimHost>) {
        self.forget_waiting(id, cancel_host);
        self.http_active.remove(&id);
    }
}

/// Counts HTTP exchanges in flight against high and low water marks.
#[derive(Debug)]
pub(crate) struct HttpSemaphore {
    in_flight: AtomicUsize,
    high_water: usize,
    low_water: usize,
}

impl HttpSemaphore {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            high_water,
            low_water,
        }
    }

    /// Take a slot unless the high water mark is reached.
    pub fn try_acquire(&self) -> bool {
        let high_water = self.high_water;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < high_water).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn release(&self) {
        let released = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        debug_assert!(released.is_ok(), "HTTP slot released twice");
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waiters may be let through.
    pub fn is_drained(&self) -> bool {
        self.in_flight() <= self.low_water
    }
}

/// Wakes the coordinator's driver when a completion arrives.
#[derive(Debug, Default)]
pub(crate) struct WorkSignal {
    ready: Mutex<bool>,
    condvar: Condvar,
}

impl WorkSignal {
    pub fn notify(&self) {
        *self.ready.lock() = true;
        self.condvar.notify_one();
    }

    /// Wait for a notification, at most `timeout`. Returns whether one came.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.lock();
        if !*ready {
            self.condvar.wait_for(&mut ready, timeout);
        }
        std::mem::replace(&mut *ready, false)
    }
}
