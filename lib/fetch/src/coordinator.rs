//! Owner of all fetch requests, the network queues and the driver thread.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cache::{CacheManager, ContentId};
use itertools::Itertools;
use parking_lot::Mutex;
use validator::Validate;

use crate::config::FetchConfig;
use crate::decode::DecodeService;
use crate::error::{FetchError, Result};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::queues::{HttpSemaphore, NetworkQueues, WorkSignal};
use crate::request::{
    FetchRequest, FetchSource, FetchState, FetchStatus, RequestInner, SimRequest,
};
use crate::simulator::{
    send_batched, ImageRequestBlock, SimHost, SimulatorChannel, IMAGE_TYPE_NORMAL,
};
use crate::worker::Progress;

/// An unchanged simulator request is re-sent early when its priority moved this much...
const MIN_DELTA_PRIORITY: f32 = 1000.0;
/// ...and at least this long passed since it was last sent.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(1);
const HTTP_WORKER_THREADS: usize = 2;
/// Longest the driver sleeps when no completion wakes it.
const DRIVER_IDLE_WAIT: Duration = Duration::from_millis(20);

/// State shared between the coordinator, its driver thread, and the request state machines.
pub(crate) struct FetchShared {
    pub config: FetchConfig,
    pub cache: Arc<CacheManager>,
    pub http: Option<Arc<dyn HttpTransport>>,
    pub simulator: Option<Arc<dyn SimulatorChannel>>,
    pub decoder: Arc<dyn DecodeService>,
    pub requests: Mutex<HashMap<ContentId, Arc<FetchRequest>>>,
    pub queues: Mutex<NetworkQueues>,
    pub semaphore: HttpSemaphore,
    pub signal: Arc<WorkSignal>,
    shutting_down: AtomicBool,
}

impl FetchShared {
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    fn request(&self, id: &ContentId) -> Option<Arc<FetchRequest>> {
        self.requests.lock().get(id).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<FetchRequest>> {
        self.requests.lock().values().cloned().collect()
    }

    /// One tick of the pipeline. Returns the number of requests still working.
    fn update(&self) -> usize {
        self.release_http_waiters();
        self.send_requests_to_simulators();
        let working = self.run_requests();
        self.remove_deleted();
        self.cache.update();
        working
    }

    /// Hand freed HTTP slots to waiting requests, highest priority first.
    fn release_http_waiters(&self) {
        if !self.semaphore.is_drained() {
            return;
        }
        let waiting = self.queues.lock().http_waiter_ids();
        if waiting.is_empty() {
            return;
        }

        let mut ranked = Vec::with_capacity(waiting.len());
        for id in waiting {
            match self.request(&id) {
                Some(request) => {
                    let priority = request.inner.lock().work_priority;
                    ranked.push((priority, request));
                }
                None => self.queues.lock().remove_http_waiter(id),
            }
        }
        ranked.sort_by(|(a, _), (b, _)| b.cmp(a));

        for (_, request) in ranked {
            let mut inner = request.inner.lock();
            let waiting = inner.state == FetchState::WaitHttpResource2
                && inner.has_work
                && !inner.delete_requested;
            if waiting {
                if !self.semaphore.try_acquire() {
                    break;
                }
                inner.http_permit = true;
                inner.state = FetchState::SendHttpReq;
                inner.high_priority = true;
            }
            self.queues.lock().remove_http_waiter(request.id);
        }
    }

    /// Send pending simulator requests and cancels, at most every flush interval.
    fn send_requests_to_simulators(&self) {
        let Some(simulator) = self.simulator.as_deref() else {
            return;
        };
        let ids = {
            let mut queues = self.queues.lock();
            if !queues.start_flush(self.config.simulator_flush_interval()) {
                return;
            }
            queues.network_ids()
        };

        let now = Instant::now();
        let lazy_flush = self.config.lazy_flush_interval();
        let mut per_host: BTreeMap<SimHost, Vec<(f32, Arc<FetchRequest>)>> = BTreeMap::new();
        for id in ids {
            let Some(request) = self.request(&id) else {
                self.queues.lock().remove_from_network(id, None);
                continue;
            };
            let inner = request.inner.lock();
            let on_network = matches!(
                inner.state,
                FetchState::LoadFromNetwork | FetchState::LoadFromSimulator
            );
            let host = inner.source.sim_host();
            let Some(host) = host.filter(|_| on_network) else {
                log::debug!("Texture {id}: dropped from the network queue in {}", inner.state);
                self.queues.lock().remove_from_network(id, None);
                continue;
            };
            if inner.sim_request == SimRequest::Sent && inner.packets.is_complete() {
                continue;
            }

            let elapsed = inner.sim_requested_at.map(|at| now.duration_since(at));
            let priority_delta = (inner.image_priority - inner.sim_requested_priority).abs();
            let due = inner.sim_requested_discard != inner.desired_discard
                || elapsed.map_or(true, |elapsed| elapsed >= lazy_flush)
                || (elapsed.is_some_and(|elapsed| elapsed >= MIN_REQUEST_INTERVAL)
                    && priority_delta > MIN_DELTA_PRIORITY);
            if due {
                per_host
                    .entry(host)
                    .or_default()
                    .push((inner.image_priority, request.clone()));
            }
        }

        let per_message = self.config.max_images_per_message;
        for (host, mut requests) in per_host {
            requests.sort_by(|(a, ra), (b, rb)| b.total_cmp(a).then_with(|| ra.id.cmp(&rb.id)));
            let blocks = requests
                .iter()
                .map(|(_, request)| {
                    let mut inner = request.inner.lock();
                    if inner.sim_request != SimRequest::Sent {
                        inner.setup_packet_data(request.id, self);
                    }
                    inner.sim_request = SimRequest::Sent;
                    inner.sim_requested_discard = inner.desired_discard;
                    inner.sim_requested_priority = inner.image_priority;
                    inner.sim_requested_at = Some(now);
                    ImageRequestBlock {
                        id: request.id,
                        discard: inner.desired_discard.clamp(0, i32::from(i8::MAX)) as i8,
                        priority: inner.image_priority,
                        packet: inner.packets.next_packet() as u32,
                        image_type: IMAGE_TYPE_NORMAL,
                    }
                })
                .collect_vec();
            let count = blocks.len();
            let messages = send_batched(simulator, host, blocks, per_message);
            log::trace!("Requested {count} textures from {host} in {messages} messages");
        }

        let cancels = self.queues.lock().take_cancels();
        for (host, ids) in cancels {
            if ids.is_empty() {
                continue;
            }
            log::trace!("Cancelling {} textures on {host}", ids.len());
            let blocks = ids.into_iter().map(ImageRequestBlock::cancel);
            send_batched(simulator, host, blocks, per_message);
        }
    }

    /// Run every request with work left, highest priority first.
    fn run_requests(&self) -> usize {
        let mut ranked = self
            .snapshot()
            .into_iter()
            .filter_map(|request| {
                let inner = request.inner.lock();
                let priority = inner.effective_priority();
                let has_work = inner.has_work;
                drop(inner);
                has_work.then_some((priority, request))
            })
            .collect_vec();
        ranked.sort_by(|(a, _), (b, _)| b.cmp(a));

        let mut working = 0;
        for (_, request) in ranked {
            let mut inner = request.inner.lock();
            if !inner.has_work {
                continue;
            }
            match inner.do_work(request.id, self) {
                Progress::Waiting => working += 1,
                Progress::Finished => inner.has_work = false,
            }
        }
        working
    }

    /// Drop requests whose deletion was put off, once nothing refers to them anymore.
    fn remove_deleted(&self) {
        for request in self.snapshot() {
            let mut inner = request.inner.lock();
            if !inner.delete_requested {
                continue;
            }
            inner.drain_pending(&self.semaphore);
            let mut queues = self.queues.lock();
            if !inner.is_deletable(&request.id, &queues) {
                continue;
            }
            queues.forget(request.id, inner.source.sim_host());
            drop(queues);
            inner.release_http_permit(&self.semaphore);
            inner.has_work = false;
            drop(inner);
            self.requests.lock().remove(&request.id);
            log::trace!("Texture {}: request removed", request.id);
        }
    }
}

/// Schedules texture fetches from the cache, HTTP and simulators.
///
/// Ticks either from the caller via [`FetchCoordinator::update`] or from the driver thread
/// started with [`FetchCoordinator::start`].
pub struct FetchCoordinator {
    shared: Arc<FetchShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl FetchCoordinator {
    pub fn new(
        config: FetchConfig,
        cache: Arc<CacheManager>,
        decoder: Arc<dyn DecodeService>,
        http: Option<Arc<dyn HttpTransport>>,
        simulator: Option<Arc<dyn SimulatorChannel>>,
    ) -> Self {
        let (high_water, low_water) = config.http_water_marks();
        let shared = FetchShared {
            config,
            cache,
            http,
            simulator,
            decoder,
            requests: Mutex::new(HashMap::new()),
            queues: Mutex::new(NetworkQueues::default()),
            semaphore: HttpSemaphore::new(high_water, low_water),
            signal: Arc::new(WorkSignal::default()),
            shutting_down: AtomicBool::new(false),
        };
        Self {
            shared: Arc::new(shared),
            driver: Mutex::new(None),
        }
    }

    /// Coordinator fetching over [`ReqwestTransport`] when HTTP is enabled.
    pub fn with_http(
        config: FetchConfig,
        cache: Arc<CacheManager>,
        decoder: Arc<dyn DecodeService>,
        simulator: Option<Arc<dyn SimulatorChannel>>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|err| FetchError::bad_input(format!("fetch config: {err}")))?;
        let http: Option<Arc<dyn HttpTransport>> = if config.http_enabled {
            let transport = ReqwestTransport::new(HTTP_WORKER_THREADS, config.http_timeout())?;
            Some(Arc::new(transport))
        } else {
            None
        };
        Ok(Self::new(config, cache, decoder, http, simulator))
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.shared.cache
    }

    pub fn config(&self) -> &FetchConfig {
        &self.shared.config
    }

    /// Start fetching `id`, or update the wanted detail and priority of its request.
    ///
    /// Returns false when the request can't be (re)started right now: a nil id, a request
    /// being deleted, or one bound to another simulator (which gets deleted).
    pub fn create_or_update_request(
        &self,
        id: ContentId,
        source: FetchSource,
        priority: f32,
        desired_discard: i32,
        desired_size: usize,
    ) -> bool {
        self.create_or_update_request_with_aux(
            id,
            source,
            priority,
            desired_discard,
            desired_size,
            false,
        )
    }

    /// Like [`Self::create_or_update_request`], also asking for the auxiliary channel.
    pub fn create_or_update_request_with_aux(
        &self,
        id: ContentId,
        source: FetchSource,
        priority: f32,
        desired_discard: i32,
        desired_size: usize,
        need_aux: bool,
    ) -> bool {
        if id.is_nil() {
            return false;
        }
        let shared = &self.shared;
        let request = {
            let mut requests = shared.requests.lock();
            match requests.entry(id) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    let mut inner = RequestInner::new(
                        source,
                        priority,
                        desired_discard,
                        desired_size,
                        need_aux,
                        &shared.config,
                    );
                    inner.can_use_http &= shared.http.is_some();
                    inner.high_priority = true;
                    entry.insert(FetchRequest::new(id, inner));
                    drop(requests);
                    log::trace!("Texture {id}: new request, discard {desired_discard}");
                    shared.signal.notify();
                    return true;
                }
            }
        };

        let mut inner = request.inner.lock();
        if inner.delete_requested {
            return false;
        }
        if inner.source.sim_host() != source.sim_host() {
            log::debug!("Texture {id}: request moved to another simulator");
            drop(inner);
            self.delete_request(id, false);
            return false;
        }
        if inner.source != source {
            inner.url = source.url().map(str::to_string);
            inner.can_use_http =
                shared.config.http_enabled && inner.url.is_some() && shared.http.is_some();
            inner.source = source;
        }
        inner.set_image_priority(priority);
        inner.set_desired(desired_discard, desired_size);
        inner.need_aux |= need_aux;
        if !inner.has_work {
            inner.state = FetchState::Init;
            inner.has_work = true;
            inner.high_priority = true;
        }
        drop(inner);
        shared.signal.notify();
        true
    }

    /// Progress of `id`. Unknown ids report done without data.
    pub fn poll_request(&self, id: ContentId) -> FetchStatus {
        match self.shared.request(&id) {
            Some(request) => request.inner.lock().status(),
            None => FetchStatus::unknown(),
        }
    }

    pub fn update_priority(&self, id: ContentId, priority: f32) -> bool {
        match self.shared.request(&id) {
            Some(request) => {
                request.inner.lock().set_image_priority(priority);
                true
            }
            None => false,
        }
    }

    /// Remove the request of `id`.
    ///
    /// Without `force`, a request with operations in flight is only flagged and removed by a
    /// later [`Self::update`]; the call then returns false.
    pub fn delete_request(&self, id: ContentId, force: bool) -> bool {
        let shared = &self.shared;
        let Some(request) = shared.request(&id) else {
            return false;
        };
        let mut inner = request.inner.lock();
        inner.delete_requested = true;
        inner.drain_pending(&shared.semaphore);

        let mut queues = shared.queues.lock();
        if !force && !inner.is_deletable(&id, &queues) {
            log::trace!("Texture {id}: deletion put off in {}", inner.state);
            return false;
        }
        queues.forget(id, inner.source.sim_host());
        drop(queues);
        inner.release_http_permit(&shared.semaphore);
        inner.has_work = false;
        drop(inner);
        shared.requests.lock().remove(&id);
        true
    }

    /// Delete every request that can go right away. Returns the deleted ids.
    pub fn delete_all_requests(&self) -> BTreeSet<ContentId> {
        let ids = self.shared.requests.lock().keys().copied().collect_vec();
        log::info!("Deleting {} texture requests", ids.len());
        ids.into_iter()
            .filter(|id| self.delete_request(*id, false))
            .collect()
    }

    /// First packet of a simulator transfer.
    pub fn receive_image_header(
        &self,
        host: SimHost,
        id: ContentId,
        codec: u8,
        packets: u16,
        total_bytes: u32,
        data: Bytes,
    ) -> bool {
        let shared = &self.shared;
        let Some(request) = shared.request(&id) else {
            log::debug!("Texture {id}: header for an unknown request");
            shared.queues.lock().cancel(host, id);
            return false;
        };
        let mut inner = request.inner.lock();
        let expected = inner.state == FetchState::LoadFromNetwork
            && inner.sim_request == SimRequest::Sent
            && !inner.packets.is_started();
        if !expected || data.is_empty() {
            log::debug!("Texture {id}: unexpected header in {}", inner.state);
            shared.queues.lock().cancel(host, id);
            return false;
        }
        if let Err(err) = inner
            .packets
            .start(usize::from(packets), total_bytes as usize, data)
        {
            log::warn!("Texture {id}: bad header: {err}");
            return false;
        }
        log::trace!("Texture {id}: header, codec {codec}, {packets} packets, {total_bytes} bytes");
        inner.file_size = total_bytes as usize;
        inner.state = FetchState::LoadFromSimulator;
        inner.high_priority = true;
        drop(inner);
        shared.signal.notify();
        true
    }

    /// A data packet of a simulator transfer.
    pub fn receive_image_packet(
        &self,
        host: SimHost,
        id: ContentId,
        packet: u16,
        data: Bytes,
    ) -> bool {
        let shared = &self.shared;
        let Some(request) = shared.request(&id) else {
            shared.queues.lock().cancel(host, id);
            return false;
        };
        let mut inner = request.inner.lock();
        if !inner.packets.is_started() {
            log::debug!("Texture {id}: packet {packet} before the header");
            return false;
        }

        let result = inner.packets.insert(usize::from(packet), data);
        if let Err(err) = &result {
            log::debug!("Texture {id}: packet rejected: {err}");
        }
        match inner.state {
            FetchState::LoadFromNetwork | FetchState::LoadFromSimulator => {
                inner.state = FetchState::LoadFromSimulator;
                inner.high_priority = true;
            }
            state => {
                log::debug!("Texture {id}: packet {packet} in {state}, cancelling transfer");
                shared.queues.lock().cancel(host, id);
            }
        }
        drop(inner);
        shared.signal.notify();
        result.is_ok()
    }

    pub fn request_state(&self, id: ContentId) -> Option<FetchState> {
        let request = self.shared.request(&id)?;
        let state = request.inner.lock().state;
        Some(state)
    }

    pub fn request_count(&self) -> usize {
        self.shared.requests.lock().len()
    }

    pub fn http_in_flight(&self) -> usize {
        self.shared.semaphore.in_flight()
    }

    pub fn network_queue_len(&self) -> usize {
        self.shared.queues.lock().network_len()
    }

    /// Run one tick. Returns the number of requests still working.
    pub fn update(&self) -> usize {
        self.shared.update()
    }

    /// Block until a completion arrives or `timeout` passes.
    pub fn wait_for_progress(&self, timeout: Duration) -> bool {
        self.shared.signal.wait(timeout)
    }

    /// Tick from a dedicated thread until [`Self::stop`].
    pub fn start(&self) -> io::Result<()> {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("texture-fetch".to_string())
            .spawn(move || {
                while !shared.is_shutting_down() {
                    shared.update();
                    shared.signal.wait(DRIVER_IDLE_WAIT);
                }
            })?;
        *driver = Some(handle);
        Ok(())
    }

    /// Stop the driver thread. Requests still fetching are abandoned on their next tick.
    pub fn stop(&self) {
        self.shared.shutting_down.store(true, Ordering::Relaxed);
        self.shared.signal.notify();
        if let Some(handle) = self.driver.lock().take() {
            if handle.join().is_err() {
                log::error!("Texture fetch driver panicked");
            }
        }
    }
}

impl Drop for FetchCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
