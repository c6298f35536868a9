//! Turning fetched bytes into rasters.

use std::sync::Arc;

use bytes::Bytes;
use cache::{ContentId, Raster};
use parking_lot::Mutex;
use pool::{AccessMode, WorkerPool};

use crate::error::DecodeError;

/// Pixels decoded from a request's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub raster: Raster,
    /// Auxiliary channel, when it was asked for and the data carries one.
    pub aux: Option<Raster>,
    /// Discard level the raster was decoded at.
    pub discard: i32,
}

pub type DecodeCallback = Box<dyn FnOnce(Result<DecodedImage, DecodeError>) + Send + 'static>;

/// Decodes asynchronously and reports through a callback, from any thread.
pub trait DecodeService: Send + Sync {
    fn decode(
        &self,
        id: ContentId,
        data: Bytes,
        discard: i32,
        need_aux: bool,
        on_done: DecodeCallback,
    );
}

/// A codec decoding on the calling thread.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, data: &[u8], discard: i32, need_aux: bool)
        -> Result<DecodedImage, DecodeError>;
}

/// Runs an [`ImageDecoder`] on a pool of threads.
pub struct ThreadedDecoder {
    decoder: Arc<dyn ImageDecoder>,
    pool: Mutex<Option<WorkerPool<ContentId>>>,
}

impl ThreadedDecoder {
    pub fn new(decoder: Arc<dyn ImageDecoder>, threads: usize) -> std::io::Result<Self> {
        let pool = WorkerPool::new(threads, "texture-decode")?;
        Ok(Self {
            decoder,
            pool: Mutex::new(Some(pool)),
        })
    }

    /// Stop the decode threads once queued jobs have finished.
    pub fn stop(&self) {
        if let Some(mut pool) = self.pool.lock().take() {
            pool.stop();
        }
    }
}

impl DecodeService for ThreadedDecoder {
    fn decode(
        &self,
        id: ContentId,
        data: Bytes,
        discard: i32,
        need_aux: bool,
        on_done: DecodeCallback,
    ) {
        let pool = self.pool.lock();
        let Some(pool) = pool.as_ref() else {
            on_done(Err(DecodeError::Cancelled));
            return;
        };
        let decoder = self.decoder.clone();
        pool.submit(id, AccessMode::Exclusive, move || {
            on_done(decoder.decode(&data, discard, need_aux));
        });
    }
}

/// Stands in for a real codec: the raster is the raw bytes, one byte per pixel.
///
/// Empty data fails, so failure handling can be exercised without a codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughDecoder;

impl ImageDecoder for PassThroughDecoder {
    fn decode(
        &self,
        data: &[u8],
        discard: i32,
        need_aux: bool,
    ) -> Result<DecodedImage, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Truncated("no bytes".to_string()));
        }
        let raster = Raster::new(data.len() as u32, 1, 1, data.to_vec());
        let aux = need_aux.then(|| Raster::new(1, 1, 1, vec![0]));
        Ok(DecodedImage {
            raster,
            aux,
            discard,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    #[test]
    fn test_threaded_decoder_reports_results() {
        let decoder = ThreadedDecoder::new(Arc::new(PassThroughDecoder), 2).unwrap();

        let (tx, rx) = oneshot::channel();
        decoder.decode(
            ContentId::new_random(),
            Bytes::from_static(b"abc"),
            2,
            true,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        let image = rx.blocking_recv().unwrap().unwrap();
        assert_eq!(image.raster.data, b"abc");
        assert_eq!(image.discard, 2);
        assert!(image.aux.is_some());

        let (tx, rx) = oneshot::channel();
        decoder.decode(
            ContentId::new_random(),
            Bytes::new(),
            0,
            false,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        assert!(matches!(
            rx.blocking_recv().unwrap(),
            Err(DecodeError::Truncated(_))
        ));

        decoder.stop();
        let (tx, rx) = oneshot::channel();
        decoder.decode(
            ContentId::new_random(),
            Bytes::from_static(b"x"),
            0,
            false,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        assert_eq!(rx.blocking_recv().unwrap(), Err(DecodeError::Cancelled));
    }

    #[test]
    fn test_stop_finishes_queued_decodes() {
        let decoder = ThreadedDecoder::new(Arc::new(PassThroughDecoder), 1).unwrap();
        let receivers: Vec<_> = (0..50)
            .map(|_| {
                let (tx, rx) = oneshot::channel();
                decoder.decode(
                    ContentId::new_random(),
                    Bytes::from_static(b"abc"),
                    0,
                    false,
                    Box::new(move |res| {
                        let _ = tx.send(res);
                    }),
                );
                rx
            })
            .collect();

        decoder.stop();
        for mut rx in receivers {
            assert!(rx.try_recv().unwrap().is_ok());
        }
    }
}
