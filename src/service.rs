use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cache::{CacheManager, ContentId};
use fetch::j2c::MAX_IMAGE_DATA_SIZE;
use fetch::{FetchCoordinator, FetchSource, FetchStatus, PassThroughDecoder, ThreadedDecoder};

use crate::settings::Settings;

/// Priority of textures fetched from the command line.
const CLI_FETCH_PRIORITY: f32 = 1000.0;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Texture cache plus the pipeline filling it, owned in one place for the process lifetime.
pub struct TextureService {
    cache: Arc<CacheManager>,
    decoder: Arc<ThreadedDecoder>,
    coordinator: FetchCoordinator,
}

impl TextureService {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let cache = open_cache(settings)?;
        let decoder = Arc::new(ThreadedDecoder::new(
            Arc::new(PassThroughDecoder),
            settings.fetch.decode_threads,
        )?);
        let coordinator = FetchCoordinator::with_http(
            settings.fetch.clone(),
            cache.clone(),
            decoder.clone(),
            None,
        )?;
        coordinator.start()?;
        Ok(Self {
            cache,
            decoder,
            coordinator,
        })
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Fetch whole textures over HTTP, `{id}` in `url_template` standing for each id.
    ///
    /// Gives up on textures still pending after `timeout`; their status is returned as is.
    pub fn fetch(
        &self,
        url_template: &str,
        ids: &[ContentId],
        timeout: Duration,
    ) -> Vec<(ContentId, FetchStatus)> {
        for id in ids {
            let source = FetchSource::Asset {
                url: Some(url_template.replace("{id}", &id.to_string())),
                host: None,
            };
            if !self.coordinator.create_or_update_request(
                *id,
                source,
                CLI_FETCH_PRIORITY,
                0,
                MAX_IMAGE_DATA_SIZE,
            ) {
                log::warn!("Texture {id}: request refused");
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let statuses = ids
                .iter()
                .map(|id| (*id, self.coordinator.poll_request(*id)))
                .collect::<Vec<_>>();
            let pending = statuses.iter().filter(|(_, status)| !status.done).count();
            if pending == 0 || Instant::now() >= deadline {
                if pending > 0 {
                    log::warn!("{pending} textures still pending after {timeout:?}");
                }
                for id in ids {
                    self.coordinator.delete_request(*id, true);
                }
                return statuses;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Stop fetching and persist the cache. Idempotent.
    pub fn shutdown(&self) {
        self.coordinator.stop();
        self.decoder.stop();
        self.cache.shutdown();
    }
}

impl Drop for TextureService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open the cache alone, for maintenance commands.
pub fn open_cache(settings: &Settings) -> anyhow::Result<Arc<CacheManager>> {
    let (cache, unused) = CacheManager::init(&settings.cache)?;
    log::debug!("{unused} bytes of the cache budget left unused");
    Ok(Arc::new(cache))
}
