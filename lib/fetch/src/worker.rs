//! The fetch state machine of a single request.

use std::sync::Arc;

use bytes::Bytes;
use cache::ContentId;
use tokio::sync::oneshot;

use crate::coordinator::FetchShared;
use crate::error::{DecodeError, TransportError};
use crate::http::{
    HttpReply, RangeRequest, HTTP_NOT_FOUND, HTTP_RANGE_NOT_SATISFIABLE,
    HTTP_SERVICE_UNAVAILABLE,
};
use crate::j2c::supported_discard;
use crate::packets::PacketResume;
use crate::request::{
    poll_completion, CacheLoad, Completion, FetchState, Pending, RequestInner, SimRequest,
    WriteMode, MIN_IMAGE_PRIORITY,
};

/// Where a pass of the state machine left the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Waiting on a completion, a timer, or the simulator.
    Waiting,
    /// Nothing left to do until the request is revived.
    Finished,
}

enum Step {
    Next,
    Wait,
    Finish,
}

impl RequestInner {
    /// Advance the state machine as far as it goes without blocking.
    pub(crate) fn do_work(&mut self, id: ContentId, shared: &FetchShared) -> Progress {
        if let Some(reason) = self.abort_reason(shared) {
            log::debug!("Texture {id}: {reason} in {}", self.state);
            self.abandon(id, shared);
            return Progress::Finished;
        }

        loop {
            let step = match self.state {
                FetchState::Init => self.init(id, shared),
                FetchState::LoadFromCache => self.load_from_cache(id, shared),
                FetchState::CachePost => self.cache_post(id),
                FetchState::LoadFromNetwork => self.load_from_network(id, shared),
                FetchState::LoadFromSimulator => self.load_from_simulator(id, shared),
                FetchState::WaitHttpResource => self.wait_http_resource(id, shared),
                FetchState::WaitHttpResource2 => Step::Wait,
                FetchState::SendHttpReq => self.send_http_req(id, shared),
                FetchState::WaitHttpReq => self.wait_http_req(id, shared),
                FetchState::DecodeImage => self.decode_image(id, shared),
                FetchState::DecodeImageUpdate => self.decode_image_update(id, shared),
                FetchState::WriteToCache => self.write_to_cache(id, shared),
                FetchState::WaitOnWrite => self.wait_on_write(id),
                FetchState::Done => self.done(id),
            };
            match step {
                Step::Next => continue,
                Step::Wait => return Progress::Waiting,
                Step::Finish => return Progress::Finished,
            }
        }
    }

    fn abort_reason(&self, shared: &FetchShared) -> Option<&'static str> {
        let before_decode = self.state < FetchState::DecodeImage;
        if before_decode && shared.is_shutting_down() {
            return Some("shutting down");
        }
        if before_decode && self.delete_requested {
            return Some("deleted");
        }
        let can_abandon = matches!(
            self.state,
            FetchState::Init | FetchState::LoadFromNetwork | FetchState::LoadFromSimulator
        );
        if can_abandon && self.image_priority < MIN_IMAGE_PRIORITY {
            return Some("priority dropped to zero");
        }
        let on_network = self.state > FetchState::CachePost && before_decode;
        if on_network && !self.can_use_http && !self.can_use_net {
            return Some("nowhere to fetch from");
        }
        None
    }

    /// Leave the network queues, keeping the HTTP slot while an exchange is still in flight.
    fn abandon(&mut self, id: ContentId, shared: &FetchShared) {
        shared
            .queues
            .lock()
            .forget_waiting(id, self.source.sim_host());
        if self.pending.http.is_none() {
            self.release_http_permit(&shared.semaphore);
        }
        self.high_priority = false;
    }

    fn remove_from_cache(&self, id: ContentId, shared: &FetchShared) {
        if let Err(err) = shared.cache.remove(id) {
            log::warn!("Texture {id}: failed to remove from cache: {err}");
        }
    }

    fn init(&mut self, id: ContentId, shared: &FetchShared) -> Step {
        // Late completions of a previous round are of no use anymore
        self.pending = Pending::default();
        self.release_http_permit(&shared.semaphore);
        shared.queues.lock().remove_http_waiter(id);

        self.reset();
        self.state = if self.skip_cache_read {
            FetchState::LoadFromNetwork
        } else {
            FetchState::LoadFromCache
        };
        self.skip_cache_read = false;
        Step::Next
    }

    fn load_from_cache(&mut self, id: ContentId, shared: &FetchShared) -> Step {
        if self.pending.cache_read.is_none() {
            let (tx, rx) = oneshot::channel();
            let signal = shared.signal.clone();
            if let Some(path) = self.source.local_path() {
                shared
                    .cache
                    .read_file_async(id, path.to_path_buf(), move |result| {
                        let load = match result {
                            Ok(data) => CacheLoad::Hit {
                                image_size: data.len(),
                                data,
                                have_all: true,
                            },
                            Err(err) => CacheLoad::Failed(err.to_string()),
                        };
                        let _ = tx.send(load);
                        signal.notify();
                    });
            } else {
                shared
                    .cache
                    .read_async(id, 0, self.desired_size, move |result| {
                        let load = match result {
                            Ok(Some(read)) => CacheLoad::Hit {
                                data: read.data,
                                image_size: read.image_size.max(0) as usize,
                                have_all: read.have_all,
                            },
                            Ok(None) => CacheLoad::Miss,
                            Err(err) => CacheLoad::Failed(err.to_string()),
                        };
                        let _ = tx.send(load);
                        signal.notify();
                    });
            }
            self.pending.cache_read = Some(rx);
            self.high_priority = false;
        }

        match poll_completion(&mut self.pending.cache_read) {
            Completion::Pending => return Step::Wait,
            Completion::Ready(CacheLoad::Hit {
                data,
                image_size,
                have_all,
            }) => {
                self.formatted = data;
                self.file_size = image_size;
                self.have_all = have_all;
            }
            Completion::Ready(CacheLoad::Miss) => {}
            Completion::Ready(CacheLoad::Failed(err)) => {
                log::debug!("Texture {id}: cache read failed: {err}");
            }
            Completion::Lost => log::debug!("Texture {id}: cache read dropped"),
        }
        self.high_priority = true;
        self.state = FetchState::CachePost;
        Step::Next
    }

    fn cache_post(&mut self, id: ContentId) -> Step {
        self.cached_size = self.formatted.len();
        if self.cached_size > 0 && (self.cached_size >= self.desired_size || self.have_all) {
            // Enough cached data, nothing to write back
            self.loaded_discard = self.desired_discard;
            self.write_mode = WriteMode::NotWrite;
            self.state = FetchState::DecodeImage;
            return Step::Next;
        }
        if self.source.is_local_file() {
            log::warn!("Texture {id}: failed to load local file");
            self.state = FetchState::Done;
            return Step::Next;
        }
        self.state = FetchState::LoadFromNetwork;
        Step::Next
    }

    fn load_from_network(&mut self, id: ContentId, shared: &FetchShared) -> Step {
        if self.retry_policy.retries() > 0 && !self.retry_policy.wait_time().is_zero() {
            self.high_priority = false;
            return Step::Wait;
        }

        if self.can_use_http && self.url.is_some() {
            self.state = FetchState::WaitHttpResource;
            self.high_priority = true;
            return Step::Next;
        }

        if self.sim_request == SimRequest::Unsent && self.can_use_net {
            self.requested_size = self.desired_size;
            self.requested_discard = self.desired_discard;
            self.sim_request = SimRequest::Queued;
            shared.queues.lock().add_to_network(id);
        }
        self.high_priority = false;
        Step::Wait
    }

    fn load_from_simulator(&mut self, id: ContentId, shared: &FetchShared) -> Step {
        let Some((data, have_all)) = self.packets.take_loaded(&self.formatted, self.requested_size)
        else {
            // Keep asking until enough packets arrived
            shared.queues.lock().add_to_network(id);
            self.high_priority = false;
            return Step::Wait;
        };

        shared.queues.lock().remove_from_network(id, None);
        if data.is_empty() {
            self.state = FetchState::Done;
            return Step::Next;
        }
        self.formatted = data;
        self.have_all |= have_all;
        self.file_size = self.packets.file_size();
        self.loaded_discard = self.requested_discard;
        if self.write_mode != WriteMode::NotWrite {
            self.write_mode = WriteMode::ShouldWrite;
        }
        self.high_priority = true;
        self.state = FetchState::DecodeImage;
        Step::Next
    }

    /// Line the bytes already held up with the packet layout, before the first simulator request.
    pub(crate) fn setup_packet_data(&mut self, id: ContentId, shared: &FetchShared) {
        let resume = self.packets.resume_from(self.formatted.len(), self.file_size);
        if resume == PacketResume::Mismatch {
            log::debug!(
                "Texture {id}: {} held bytes don't match the packet layout, refetching",
                self.formatted.len()
            );
            self.remove_from_cache(id, shared);
            self.formatted = Vec::new();
            self.file_size = 0;
            self.packets.clear();
        }
    }

    fn wait_http_resource(&mut self, id: ContentId, shared: &FetchShared) -> Step {
        if !shared.semaphore.try_acquire() {
            shared.queues.lock().add_http_waiter(id);
            self.high_priority = false;
            self.state = FetchState::WaitHttpResource2;
            return Step::Wait;
        }
        self.http_permit = true;
        self.state = FetchState::SendHttpReq;
        Step::Next
    }

    fn send_http_req(&mut self, id: ContentId, shared: &FetchShared) -> Step {
        let (Some(http), Some(url)) = (shared.http.as_ref(), self.url.clone()) else {
            self.release_http_permit(&shared.semaphore);
            self.can_use_http = false;
            self.state = FetchState::LoadFromNetwork;
            return Step::Next;
        };
        shared.queues.lock().remove_from_network(id, None);

        let cur_size = self.formatted.len();
        if cur_size > 0 && (self.have_all || cur_size >= self.desired_size) {
            self.release_http_permit(&shared.semaphore);
            self.loaded_discard = self.desired_discard;
            self.state = FetchState::DecodeImage;
            return Step::Next;
        }

        // Ask for the last held byte again, to check the reply lines up with it
        let mut offset = cur_size;
        let mut size = self.desired_size - cur_size;
        if offset > 0 {
            offset -= 1;
            size += 1;
        }
        self.requested_offset = offset;
        self.requested_size = size;
        self.requested_discard = self.desired_discard;

        let request = RangeRequest {
            url,
            offset,
            size: (offset + size <= shared.config.range_cap_bytes).then_some(size),
        };
        log::trace!("Texture {id}: {:?}", request.header_value());

        let (tx, rx) = oneshot::channel();
        let signal = shared.signal.clone();
        self.pending.http = Some(rx);
        shared.queues.lock().add_http_active(id);
        http.get(
            request,
            Box::new(move |result| {
                let _ = tx.send(result);
                signal.notify();
            }),
        );
        self.high_priority = false;
        self.state = FetchState::WaitHttpReq;
        Step::Next
    }

    fn wait_http_req(&mut self, id: ContentId, shared: &FetchShared) -> Step {
        let result = match poll_completion(&mut self.pending.http) {
            Completion::Pending => return Step::Wait,
            Completion::Ready(result) => result,
            Completion::Lost => Err(TransportError::Cancelled),
        };
        shared.queues.lock().remove_http_active(id);
        self.release_http_permit(&shared.semaphore);

        match result {
            Ok(reply) => self.http_succeeded(id, reply, shared),
            Err(err) => self.http_failed(id, err),
        }
    }

    fn http_failed(&mut self, id: ContentId, err: TransportError) -> Step {
        self.last_http_status = err.status();
        if err.is_transient() {
            self.retry_policy.on_failure(err.retry_after());
            if self.retry_policy.should_retry() {
                log::info!(
                    "Texture {id}: HTTP GET failed ({err}), retry {} in {:?}",
                    self.retry_policy.retries(),
                    self.retry_policy.wait_time(),
                );
                self.high_priority = false;
                self.state = FetchState::LoadFromNetwork;
                return Step::Wait;
            }
            log::warn!(
                "Texture {id}: giving up HTTP after {} retries",
                self.retry_policy.retries()
            );
        }

        match err.status() {
            Some(HTTP_NOT_FOUND) if self.write_mode == WriteMode::NotWrite => {
                log::debug!("Texture {id}: not found");
                self.state = FetchState::Done;
                return Step::Next;
            }
            Some(HTTP_RANGE_NOT_SATISFIABLE) => {
                // Asked past the end, what is held is everything
                self.have_all = true;
                return self.decode_what_is_held(id);
            }
            Some(HTTP_SERVICE_UNAVAILABLE) => log::info!("Texture {id}: texture server busy"),
            _ => log::info!("Texture {id}: HTTP GET failed: {err}"),
        }

        if self.can_use_net {
            log::info!("Texture {id}: falling back to the simulator");
            self.can_use_http = false;
            self.high_priority = true;
            self.state = FetchState::Init;
            return Step::Wait;
        }
        self.decode_what_is_held(id)
    }

    fn decode_what_is_held(&mut self, id: ContentId) -> Step {
        if self.formatted.is_empty() {
            log::warn!("Texture {id}: fetch failed, no data");
            self.state = FetchState::Done;
            return Step::Next;
        }
        self.loaded_discard = if self.have_all {
            0
        } else {
            supported_discard(self.formatted.len(), self.desired_discard, self.desired_size)
        };
        self.state = FetchState::DecodeImage;
        Step::Next
    }

    fn http_succeeded(&mut self, id: ContentId, reply: HttpReply, shared: &FetchShared) -> Step {
        self.retry_policy.on_success();
        self.last_http_status = Some(reply.status);

        let body = reply.body.clone();
        let mut reply_offset = self.requested_offset;
        if body.is_empty() {
            self.have_all = true;
        } else if !reply.is_partial() {
            // The whole asset
            self.have_all = true;
            self.formatted = Vec::new();
            reply_offset = 0;
        } else {
            if let Some(range) = reply.content_range {
                reply_offset = range.first;
                if range.total.is_some_and(|total| range.last + 1 >= total) {
                    self.have_all = true;
                }
            }
            if body.len() > self.requested_size {
                log::warn!(
                    "Texture {id}: got {} bytes for a {} bytes request, treating as full asset",
                    body.len(),
                    self.requested_size
                );
                self.have_all = true;
                self.formatted = Vec::new();
                reply_offset = 0;
            } else if body.len() < self.requested_size {
                self.have_all = true;
            }
        }
        self.requested_size = body.len();

        if body.is_empty() {
            return self.decode_what_is_held(id);
        }

        let cur_size = self.formatted.len();
        let mut src_offset = 0;
        if reply_offset != cur_size {
            if reply_offset > cur_size || cur_size > reply_offset + body.len() {
                log::warn!(
                    "Texture {id}: reply at offset {reply_offset} doesn't line up with \
                     {cur_size} held bytes, refetching"
                );
                self.remove_from_cache(id, shared);
                self.high_priority = true;
                self.state = FetchState::Init;
                return Step::Wait;
            }
            src_offset = cur_size - reply_offset;
        }

        let appended = body.len() - src_offset;
        let total = cur_size + appended;
        if self.formatted.try_reserve_exact(appended).is_err() {
            log::warn!("Texture {id}: out of memory for {total} bytes");
            self.formatted = Vec::new();
            self.state = FetchState::Done;
            return Step::Next;
        }
        self.formatted.extend_from_slice(&body[src_offset..]);
        self.file_size = if self.have_all { total } else { total + 1 };
        self.loaded_discard = self.requested_discard;
        if self.write_mode != WriteMode::NotWrite {
            self.write_mode = WriteMode::ShouldWrite;
        }
        self.high_priority = true;
        self.state = FetchState::DecodeImage;
        Step::Next
    }

    fn decode_image(&mut self, id: ContentId, shared: &FetchShared) -> Step {
        self.high_priority = false;
        if self.desired_discard < 0 || self.formatted.is_empty() || self.loaded_discard < 0 {
            log::debug!("Texture {id}: nothing to decode");
            self.state = FetchState::Done;
            return Step::Next;
        }
        self.raster = None;
        self.aux = None;

        let discard = if self.have_all {
            0
        } else {
            supported_discard(self.formatted.len(), self.desired_discard, self.desired_size)
                .max(self.loaded_discard)
        };
        let (tx, rx) = oneshot::channel();
        let signal = shared.signal.clone();
        self.pending.decode = Some(rx);
        shared.decoder.decode(
            id,
            Bytes::copy_from_slice(&self.formatted),
            discard,
            self.need_aux,
            Box::new(move |result| {
                let _ = tx.send(result);
                signal.notify();
            }),
        );
        self.state = FetchState::DecodeImageUpdate;
        Step::Next
    }

    fn decode_image_update(&mut self, id: ContentId, shared: &FetchShared) -> Step {
        let result = match poll_completion(&mut self.pending.decode) {
            Completion::Pending => return Step::Wait,
            Completion::Ready(result) => result,
            Completion::Lost => Err(DecodeError::Cancelled),
        };

        match result {
            Ok(image) => {
                self.decoded_discard = image.discard;
                self.raster = Some(Arc::new(image.raster));
                self.aux = image.aux.map(Arc::new);
                self.high_priority = true;
                self.state = FetchState::WriteToCache;
                Step::Next
            }
            Err(DecodeError::Cancelled) => {
                self.decoded_discard = -1;
                self.state = FetchState::Done;
                Step::Next
            }
            Err(err) => {
                log::warn!("Texture {id}: decode failed: {err}");
                self.decoded_discard = -1;
                if self.source.is_local_file() {
                    self.state = FetchState::Done;
                    return Step::Next;
                }
                self.remove_from_cache(id, shared);
                if self.cached_size > 0 && self.decode_retries == 0 {
                    // Cached bytes may be bad, fetch them again once
                    self.decode_retries += 1;
                    self.skip_cache_read = true;
                    self.high_priority = true;
                    self.state = FetchState::Init;
                    return Step::Wait;
                }
                self.state = FetchState::Done;
                Step::Next
            }
        }
    }

    fn write_to_cache(&mut self, id: ContentId, shared: &FetchShared) -> Step {
        if self.write_mode != WriteMode::ShouldWrite
            || self.formatted.is_empty()
            || shared.cache.is_read_only()
        {
            self.state = FetchState::Done;
            return Step::Next;
        }
        self.high_priority = false;

        let len = self.formatted.len();
        if self.file_size < len {
            self.file_size = if self.have_all { len } else { len + 1 };
        }
        let image_size = i32::try_from(self.file_size).unwrap_or(i32::MAX);

        let (tx, rx) = oneshot::channel();
        let signal = shared.signal.clone();
        self.pending.cache_write = Some(rx);
        shared.cache.write_async(
            id,
            self.formatted.clone(),
            image_size,
            self.raster.clone(),
            move |result| {
                let _ = tx.send(result);
                signal.notify();
            },
        );
        self.state = FetchState::WaitOnWrite;
        Step::Next
    }

    fn wait_on_write(&mut self, id: ContentId) -> Step {
        match poll_completion(&mut self.pending.cache_write) {
            Completion::Pending => return Step::Wait,
            Completion::Ready(Ok(outcome)) => {
                log::trace!("Texture {id}: cache write {outcome:?}");
            }
            Completion::Ready(Err(err)) => log::warn!("Texture {id}: failed to cache: {err}"),
            Completion::Lost => log::warn!("Texture {id}: cache write dropped"),
        }
        self.state = FetchState::Done;
        Step::Next
    }

    fn done(&mut self, id: ContentId) -> Step {
        if self.decoded_discard > 0 && self.desired_discard < self.decoded_discard {
            log::debug!(
                "Texture {id}: decoded at {}, {} wanted, fetching more",
                self.decoded_discard,
                self.desired_discard
            );
            self.high_priority = true;
            self.state = FetchState::Init;
            return Step::Wait;
        }
        self.high_priority = false;
        Step::Finish
    }
}
