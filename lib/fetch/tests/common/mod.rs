#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cache::{CacheConfig, CacheManager, ContentId};
use fetch::decode::DecodeCallback;
use fetch::http::{HttpCallback, HTTP_PARTIAL_CONTENT};
use fetch::{
    ContentRange, DecodeError, DecodeService, FetchConfig, FetchCoordinator, FetchStatus,
    HttpReply, HttpTransport, ImageDecoder, ImageRequestBlock, PassThroughDecoder,
    RangeRequest, SimHost, SimulatorChannel, TransportError,
};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const URL: &str = "http://textures.test/asset";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic asset bytes.
pub fn asset(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

pub fn host() -> SimHost {
    "127.0.0.1:13005".parse().unwrap()
}

pub fn open_cache() -> (TempDir, Arc<CacheManager>) {
    let dir = tempfile::Builder::new()
        .prefix("fetch-cache")
        .tempdir()
        .unwrap();
    let config = CacheConfig::new(dir.path(), 64 * 1024 * 1024);
    let (cache, _) = CacheManager::init(&config).unwrap();
    (dir, Arc::new(cache))
}

/// Retries right away, so tests don't sleep through backoff.
pub fn test_config() -> FetchConfig {
    FetchConfig {
        retry_min_secs: 0.0,
        retry_max_secs: 0.0,
        ..FetchConfig::default()
    }
}

pub fn partial(body: &[u8], first: usize, total: Option<usize>) -> HttpReply {
    HttpReply {
        status: HTTP_PARTIAL_CONTENT,
        content_range: total.map(|total| ContentRange {
            first,
            last: first + body.len() - 1,
            total: Some(total),
        }),
        body: Bytes::copy_from_slice(body),
    }
}

pub fn full(body: &[u8]) -> HttpReply {
    HttpReply {
        status: 200,
        content_range: None,
        body: Bytes::copy_from_slice(body),
    }
}

pub fn status(status: u16) -> Result<HttpReply, TransportError> {
    Err(TransportError::Status {
        status,
        retry_after: None,
    })
}

enum Responder {
    /// Replies in order, 404 once they run out.
    Script(Mutex<VecDeque<Result<HttpReply, TransportError>>>),
    /// Serves byte ranges of an asset.
    Asset(Vec<u8>),
}

/// HTTP transport answering from a script or an in-memory asset.
pub struct FakeHttp {
    responder: Responder,
    requests: Mutex<Vec<RangeRequest>>,
    /// When set, callbacks are kept until [`FakeHttp::complete_held`].
    hold: bool,
    held: Mutex<Vec<(Result<HttpReply, TransportError>, HttpCallback)>>,
}

impl FakeHttp {
    pub fn scripted(replies: Vec<Result<HttpReply, TransportError>>) -> Arc<Self> {
        Arc::new(Self::new(Responder::Script(Mutex::new(replies.into()))))
    }

    pub fn serving(asset: Vec<u8>) -> Arc<Self> {
        Arc::new(Self::new(Responder::Asset(asset)))
    }

    pub fn holding(asset: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            hold: true,
            ..Self::new(Responder::Asset(asset))
        })
    }

    fn new(responder: Responder) -> Self {
        Self {
            responder,
            requests: Mutex::new(Vec::new()),
            hold: false,
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RangeRequest> {
        self.requests.lock().clone()
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Deliver every held reply, oldest first.
    pub fn complete_held(&self) -> usize {
        let held = std::mem::take(&mut *self.held.lock());
        let count = held.len();
        for (reply, on_done) in held {
            on_done(reply);
        }
        count
    }

    fn respond(&self, request: &RangeRequest) -> Result<HttpReply, TransportError> {
        match &self.responder {
            Responder::Script(replies) => replies.lock().pop_front().unwrap_or_else(|| status(404)),
            Responder::Asset(data) => {
                if request.offset >= data.len() {
                    return status(416);
                }
                let end = match request.size {
                    Some(size) => (request.offset + size).min(data.len()),
                    None => data.len(),
                };
                let body = &data[request.offset..end];
                if request.offset == 0 && end == data.len() {
                    Ok(full(body))
                } else {
                    Ok(partial(body, request.offset, Some(data.len())))
                }
            }
        }
    }
}

impl HttpTransport for FakeHttp {
    fn get(&self, request: RangeRequest, on_done: HttpCallback) {
        let reply = self.respond(&request);
        self.requests.lock().push(request);
        if self.hold {
            self.held.lock().push((reply, on_done));
        } else {
            on_done(reply);
        }
    }
}

/// Decodes inline, optionally failing the first few calls.
#[derive(Default)]
pub struct FakeDecoder {
    failures_left: AtomicUsize,
    calls: Mutex<Vec<(usize, i32)>>,
}

impl FakeDecoder {
    pub fn failing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(times),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Byte count and discard level of every decode.
    pub fn calls(&self) -> Vec<(usize, i32)> {
        self.calls.lock().clone()
    }
}

impl DecodeService for FakeDecoder {
    fn decode(
        &self,
        _id: ContentId,
        data: Bytes,
        discard: i32,
        need_aux: bool,
        on_done: DecodeCallback,
    ) {
        self.calls.lock().push((data.len(), discard));
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            on_done(Err(DecodeError::Malformed("scripted failure".to_string())));
        } else {
            on_done(PassThroughDecoder.decode(&data, discard, need_aux));
        }
    }
}

#[derive(Default)]
pub struct FakeSimulator {
    sent: Mutex<Vec<(SimHost, Vec<ImageRequestBlock>)>>,
}

impl FakeSimulator {
    pub fn blocks(&self) -> Vec<ImageRequestBlock> {
        self.sent
            .lock()
            .iter()
            .flat_map(|(_, blocks)| blocks.iter().copied())
            .collect()
    }

    /// Blocks of every message sent, in order.
    pub fn messages(&self) -> Vec<Vec<ImageRequestBlock>> {
        self.sent
            .lock()
            .iter()
            .map(|(_, blocks)| blocks.clone())
            .collect()
    }
}

impl SimulatorChannel for FakeSimulator {
    fn send_image_requests(&self, host: SimHost, blocks: Vec<ImageRequestBlock>) {
        self.sent.lock().push((host, blocks));
    }
}

/// Tick until `id` is done.
pub fn run_until_done(coordinator: &FetchCoordinator, id: ContentId) -> FetchStatus {
    run_until(coordinator, || {
        let status = coordinator.poll_request(id);
        status.done.then_some(status)
    })
}

/// Tick until `check` yields something.
pub fn run_until<T>(coordinator: &FetchCoordinator, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        coordinator.update();
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "fetch made no progress");
        coordinator.wait_for_progress(Duration::from_millis(5));
    }
}
