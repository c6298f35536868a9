//! Per-texture fetch requests.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use cache::{CacheResult, ContentId, Raster, WriteOutcome, INLINE_HEADER_SIZE};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::config::FetchConfig;
use crate::decode::DecodedImage;
use crate::error::{DecodeError, TransportError};
use crate::http::HttpReply;
use crate::packets::PacketBuffer;
use crate::queues::{HttpSemaphore, NetworkQueues};
use crate::retry::AdaptiveRetryPolicy;
use crate::simulator::SimHost;

/// Work priorities are scaled into these bits.
pub const PRIORITY_LOW_BITS: u32 = 0x0FFF_FFFF;
/// Added to the work priority of requests that can make progress right away.
pub const PRIORITY_HIGH_BOOST: u32 = 0x4000_0000;
/// Image priority mapped to [`PRIORITY_LOW_BITS`].
pub const MAX_IMAGE_PRIORITY: f32 = 1_000_000.0;
/// Requests below this priority are abandoned before any network traffic.
pub const MIN_IMAGE_PRIORITY: f32 = 0.001;

/// Scale an image priority into the work priority bits.
pub fn work_priority(image_priority: f32) -> u32 {
    let scale = PRIORITY_LOW_BITS as f32 / MAX_IMAGE_PRIORITY;
    // Float to int casts saturate, negative priorities end up as 0
    ((image_priority * scale) as u32).min(PRIORITY_LOW_BITS)
}

/// Steps of a request, in the order they normally run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FetchState {
    Init,
    LoadFromCache,
    CachePost,
    LoadFromNetwork,
    LoadFromSimulator,
    WaitHttpResource,
    /// Parked until an HTTP slot frees up.
    WaitHttpResource2,
    SendHttpReq,
    WaitHttpReq,
    DecodeImage,
    DecodeImageUpdate,
    WriteToCache,
    WaitOnWrite,
    Done,
}

impl FetchState {
    pub fn name(&self) -> &'static str {
        match self {
            FetchState::Init => "INIT",
            FetchState::LoadFromCache => "LOAD_FROM_TEXTURE_CACHE",
            FetchState::CachePost => "CACHE_POST",
            FetchState::LoadFromNetwork => "LOAD_FROM_NETWORK",
            FetchState::LoadFromSimulator => "LOAD_FROM_SIMULATOR",
            FetchState::WaitHttpResource => "WAIT_HTTP_RESOURCE",
            FetchState::WaitHttpResource2 => "WAIT_HTTP_RESOURCE2",
            FetchState::SendHttpReq => "SEND_HTTP_REQ",
            FetchState::WaitHttpReq => "WAIT_HTTP_REQ",
            FetchState::DecodeImage => "DECODE_IMAGE",
            FetchState::DecodeImageUpdate => "DECODE_IMAGE_UPDATE",
            FetchState::WriteToCache => "WRITE_TO_CACHE",
            FetchState::WaitOnWrite => "WAIT_ON_WRITE",
            FetchState::Done => "DONE",
        }
    }
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a texture's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSource {
    /// Asset addressed by its id: over HTTP from `url` when there is one, otherwise (or when
    /// HTTP fails) from the simulator at `host`. Fetched bytes are written to the cache.
    Asset {
        url: Option<String>,
        host: Option<SimHost>,
    },
    /// Image at a fixed URL. Cached copies are used, fetched bytes are never stored.
    Url { url: String },
    /// File on local disk, read whole.
    LocalFile { path: PathBuf },
}

impl FetchSource {
    pub fn url(&self) -> Option<&str> {
        match self {
            FetchSource::Asset { url, .. } => url.as_deref(),
            FetchSource::Url { url } => Some(url),
            FetchSource::LocalFile { .. } => None,
        }
    }

    pub fn sim_host(&self) -> Option<SimHost> {
        match self {
            FetchSource::Asset { host, .. } => *host,
            _ => None,
        }
    }

    pub fn is_local_file(&self) -> bool {
        matches!(self, FetchSource::LocalFile { .. })
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            FetchSource::LocalFile { path } => Some(path),
            _ => None,
        }
    }

    fn write_mode(&self) -> WriteMode {
        match self {
            FetchSource::Asset { .. } => WriteMode::CanWrite,
            _ => WriteMode::NotWrite,
        }
    }
}

/// Whether fetched bytes go back to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    NotWrite,
    CanWrite,
    ShouldWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SimRequest {
    Unsent,
    Queued,
    Sent,
}

/// What a cache read produced.
#[derive(Debug)]
pub(crate) enum CacheLoad {
    Hit {
        data: Vec<u8>,
        image_size: usize,
        have_all: bool,
    },
    Miss,
    Failed(String),
}

pub(crate) enum Completion<T> {
    Ready(T),
    Pending,
    /// The producer went away without answering.
    Lost,
}

/// Check the completion in `slot` without blocking, emptying the slot once it resolved.
pub(crate) fn poll_completion<T>(slot: &mut Option<oneshot::Receiver<T>>) -> Completion<T> {
    let Some(receiver) = slot.as_mut() else {
        return Completion::Lost;
    };
    match receiver.try_recv() {
        Ok(value) => {
            *slot = None;
            Completion::Ready(value)
        }
        Err(TryRecvError::Empty) => Completion::Pending,
        Err(TryRecvError::Closed) => {
            *slot = None;
            Completion::Lost
        }
    }
}

/// Outstanding asynchronous operations of a request.
#[derive(Default)]
pub(crate) struct Pending {
    pub cache_read: Option<oneshot::Receiver<CacheLoad>>,
    pub cache_write: Option<oneshot::Receiver<CacheResult<WriteOutcome>>>,
    pub http: Option<oneshot::Receiver<Result<HttpReply, TransportError>>>,
    pub decode: Option<oneshot::Receiver<Result<DecodedImage, DecodeError>>>,
}

impl Pending {
    pub fn is_idle(&self) -> bool {
        self.cache_read.is_none()
            && self.cache_write.is_none()
            && self.http.is_none()
            && self.decode.is_none()
    }

    /// Drop completions that arrived for work nobody waits on anymore.
    ///
    /// Returns whether the HTTP exchange was among them.
    fn drain(&mut self) -> bool {
        fn resolved<T>(slot: &mut Option<oneshot::Receiver<T>>) -> bool {
            slot.is_some() && !matches!(poll_completion(slot), Completion::Pending)
        }
        resolved(&mut self.cache_read);
        resolved(&mut self.cache_write);
        resolved(&mut self.decode);
        resolved(&mut self.http)
    }
}

/// Snapshot of a request for its caller.
#[derive(Debug, Clone)]
pub struct FetchStatus {
    /// The request has nothing left to do, successfully or not.
    pub done: bool,
    pub state: Option<FetchState>,
    /// Discard level of `raster`, -1 without one.
    pub discard_level: i32,
    pub raster: Option<Arc<Raster>>,
    pub aux_raster: Option<Arc<Raster>>,
    pub last_http_status: Option<u16>,
}

impl FetchStatus {
    pub(crate) fn unknown() -> Self {
        Self {
            done: true,
            state: None,
            discard_level: -1,
            raster: None,
            aux_raster: None,
            last_http_status: None,
        }
    }
}

pub(crate) struct FetchRequest {
    pub id: ContentId,
    pub inner: Mutex<RequestInner>,
}

impl FetchRequest {
    pub fn new(id: ContentId, inner: RequestInner) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(inner),
        })
    }
}

pub(crate) struct RequestInner {
    pub source: FetchSource,
    pub state: FetchState,
    pub write_mode: WriteMode,
    /// Caller's priority of the image.
    pub image_priority: f32,
    pub work_priority: u32,
    pub high_priority: bool,
    /// The state machine has work left. Cleared when it finishes, set again on revival.
    pub has_work: bool,
    pub delete_requested: bool,

    pub desired_discard: i32,
    pub desired_size: usize,
    pub requested_discard: i32,
    pub requested_size: usize,
    pub requested_offset: usize,
    pub loaded_discard: i32,
    pub decoded_discard: i32,
    pub need_aux: bool,

    /// Bytes fetched so far, from offset 0.
    pub formatted: Vec<u8>,
    /// Known size of the whole asset, or a lower bound for partial data.
    pub file_size: usize,
    pub cached_size: usize,
    pub have_all: bool,
    pub raster: Option<Arc<Raster>>,
    pub aux: Option<Arc<Raster>>,
    /// Decode failures that triggered a refetch.
    pub decode_retries: u32,
    pub skip_cache_read: bool,

    pub url: Option<String>,
    pub can_use_http: bool,
    pub can_use_net: bool,
    /// Holds one of the HTTP slots.
    pub http_permit: bool,
    pub last_http_status: Option<u16>,
    pub retry_policy: AdaptiveRetryPolicy,

    pub sim_request: SimRequest,
    /// Discard level and priority last sent to the simulator, and when.
    pub sim_requested_discard: i32,
    pub sim_requested_priority: f32,
    pub sim_requested_at: Option<Instant>,
    pub packets: PacketBuffer,

    pub pending: Pending,
}

impl RequestInner {
    pub fn new(
        source: FetchSource,
        priority: f32,
        desired_discard: i32,
        desired_size: usize,
        need_aux: bool,
        config: &FetchConfig,
    ) -> Self {
        let url = source.url().map(str::to_string);
        let can_use_http = config.http_enabled && url.is_some();
        let can_use_net = source.sim_host().is_some();
        Self {
            write_mode: source.write_mode(),
            source,
            state: FetchState::Init,
            image_priority: priority,
            work_priority: work_priority(priority),
            high_priority: false,
            has_work: true,
            delete_requested: false,
            desired_discard,
            desired_size: desired_size.max(INLINE_HEADER_SIZE),
            requested_discard: -1,
            requested_size: 0,
            requested_offset: 0,
            loaded_discard: -1,
            decoded_discard: -1,
            need_aux,
            formatted: Vec::new(),
            file_size: 0,
            cached_size: 0,
            have_all: false,
            raster: None,
            aux: None,
            decode_retries: 0,
            skip_cache_read: false,
            url,
            can_use_http,
            can_use_net,
            http_permit: false,
            last_http_status: None,
            retry_policy: config.retry_policy(),
            sim_request: SimRequest::Unsent,
            sim_requested_discard: -1,
            sim_requested_priority: 0.0,
            sim_requested_at: None,
            packets: PacketBuffer::default(),
            pending: Pending::default(),
        }
    }

    /// Clear everything fetched, ready to start over from [`FetchState::Init`].
    pub fn reset(&mut self) {
        self.write_mode = self.source.write_mode();
        self.requested_discard = -1;
        self.requested_size = 0;
        self.requested_offset = 0;
        self.loaded_discard = -1;
        self.decoded_discard = -1;
        self.formatted = Vec::new();
        self.file_size = 0;
        self.cached_size = 0;
        self.have_all = false;
        self.raster = None;
        self.aux = None;
        self.sim_request = SimRequest::Unsent;
        self.sim_requested_discard = -1;
        self.packets.clear();
        self.desired_size = self.desired_size.max(INLINE_HEADER_SIZE);
    }

    pub fn set_image_priority(&mut self, priority: f32) {
        self.image_priority = priority;
        self.work_priority = work_priority(priority);
    }

    /// Priority the coordinator runs requests by.
    pub fn effective_priority(&self) -> u32 {
        if self.high_priority {
            self.work_priority | PRIORITY_HIGH_BOOST
        } else {
            self.work_priority
        }
    }

    /// Ask for a different level of detail, reviving a finished request if needed.
    pub fn set_desired(&mut self, discard: i32, size: usize) {
        let mut prioritize = false;
        if self.desired_discard != discard {
            if self.has_work && discard < self.desired_discard {
                prioritize = true;
            }
            self.desired_discard = discard;
            self.desired_size = size;
        } else if size > self.desired_size {
            self.desired_size = size;
            prioritize = true;
        }
        self.desired_size = self.desired_size.max(INLINE_HEADER_SIZE);

        if self.state == FetchState::Done || (prioritize && self.state == FetchState::Init) {
            self.state = FetchState::Init;
            self.high_priority = true;
        }
    }

    pub fn release_http_permit(&mut self, semaphore: &HttpSemaphore) {
        if std::mem::take(&mut self.http_permit) {
            semaphore.release();
        }
    }

    /// Drop completions of abandoned work, giving back the HTTP slot with the exchange.
    pub fn drain_pending(&mut self, semaphore: &HttpSemaphore) {
        if self.pending.drain() {
            self.release_http_permit(semaphore);
        }
    }

    /// Whether the request may be removed without leaving an operation pointing at it.
    pub fn is_deletable(&self, id: &ContentId, queues: &NetworkQueues) -> bool {
        if !self.pending.is_idle() {
            return false;
        }
        match self.state {
            FetchState::WaitHttpResource2 => !queues.is_http_waiter(id),
            FetchState::WriteToCache | FetchState::WaitOnWrite => !self.has_work,
            _ => true,
        }
    }

    pub fn status(&self) -> FetchStatus {
        let mut status = FetchStatus {
            done: !self.has_work,
            state: Some(self.state),
            discard_level: -1,
            raster: None,
            aux_raster: None,
            last_http_status: self.last_http_status,
        };
        // Decoded data is handed out once the decode completed, even while it is being cached
        if !self.has_work || self.state >= FetchState::WriteToCache {
            if let Some(raster) = &self.raster {
                status.discard_level = self.decoded_discard;
                status.raster = Some(raster.clone());
                status.aux_raster = self.aux.clone();
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_priority_scaling() {
        assert_eq!(work_priority(0.0), 0);
        assert_eq!(work_priority(-5.0), 0);
        assert_eq!(work_priority(MAX_IMAGE_PRIORITY), PRIORITY_LOW_BITS);
        assert_eq!(work_priority(MAX_IMAGE_PRIORITY * 4.0), PRIORITY_LOW_BITS);
        assert!(work_priority(1000.0) < work_priority(2000.0));
        assert_eq!(work_priority(1e9) & PRIORITY_HIGH_BOOST, 0);
    }

    #[test]
    fn test_state_order() {
        assert!(FetchState::Init < FetchState::LoadFromCache);
        assert!(FetchState::WaitHttpReq < FetchState::DecodeImage);
        assert!(FetchState::WaitOnWrite < FetchState::Done);
        assert_eq!(FetchState::WaitHttpResource2.to_string(), "WAIT_HTTP_RESOURCE2");
    }

    #[test]
    fn test_finished_request_revives_on_new_detail() {
        let source = FetchSource::Asset {
            url: Some("http://localhost/t".to_string()),
            host: None,
        };
        let mut inner = RequestInner::new(source, 100.0, 3, 0, false, &FetchConfig::default());
        assert_eq!(inner.desired_size, INLINE_HEADER_SIZE);
        assert!(inner.can_use_http);
        assert!(!inner.can_use_net);

        inner.state = FetchState::Done;
        inner.has_work = false;
        inner.set_desired(1, 16_384);
        assert_eq!(inner.state, FetchState::Init);
        assert_eq!(inner.desired_discard, 1);
        assert_eq!(inner.desired_size, 16_384);
        assert!(inner.high_priority);
    }

    #[test]
    fn test_fixed_url_is_never_written_back() {
        let source = FetchSource::Url {
            url: "http://localhost/map".to_string(),
        };
        let mut config = FetchConfig::default();
        let inner = RequestInner::new(source.clone(), 1.0, 0, 1 << 20, false, &config);
        assert_eq!(inner.write_mode, WriteMode::NotWrite);
        assert!(inner.can_use_http);

        config.http_enabled = false;
        let inner = RequestInner::new(source, 1.0, 0, 1 << 20, false, &config);
        assert!(!inner.can_use_http);
    }
}
