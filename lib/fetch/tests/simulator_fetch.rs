mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use cache::{CacheManager, ContentId};
use common::*;
use fetch::j2c::MAX_IMAGE_DATA_SIZE;
use fetch::{
    FetchCoordinator, FetchSource, FetchState, HttpTransport, ImageRequestBlock,
    SimulatorChannel,
};

struct Harness {
    _dir: tempfile::TempDir,
    cache: Arc<CacheManager>,
    simulator: Arc<FakeSimulator>,
    decoder: Arc<FakeDecoder>,
    coordinator: FetchCoordinator,
}

fn harness(http: Option<Arc<FakeHttp>>) -> Harness {
    init_logger();
    let (dir, cache) = open_cache();
    let simulator = Arc::new(FakeSimulator::default());
    let decoder = Arc::new(FakeDecoder::default());
    let http = http.map(|http| -> Arc<dyn HttpTransport> { http });
    let channel: Arc<dyn SimulatorChannel> = simulator.clone();
    let coordinator = FetchCoordinator::new(
        test_config(),
        cache.clone(),
        decoder.clone(),
        http,
        Some(channel),
    );
    Harness {
        _dir: dir,
        cache,
        simulator,
        decoder,
        coordinator,
    }
}

fn sim_source() -> FetchSource {
    FetchSource::Asset {
        url: None,
        host: Some(host()),
    }
}

fn packet(data: &[u8], from: usize, to: usize) -> Bytes {
    Bytes::copy_from_slice(&data[from..to])
}

impl Harness {
    fn sent_for(&self, id: ContentId) -> Vec<ImageRequestBlock> {
        self.simulator
            .blocks()
            .into_iter()
            .filter(|block| block.id == id)
            .collect()
    }

    fn wait_for_block(&self, id: ContentId, cancel: bool) -> ImageRequestBlock {
        run_until(&self.coordinator, || {
            self.sent_for(id)
                .into_iter()
                .find(|block| block.is_cancel() == cancel)
        })
    }
}

#[test]
fn test_http_not_found_falls_back_to_simulator() {
    let data = asset(2600);
    let h = harness(Some(FakeHttp::scripted(vec![status(404)])));
    let id = ContentId::new_random();
    let source = FetchSource::Asset {
        url: Some(URL.to_string()),
        host: Some(host()),
    };

    h.coordinator
        .create_or_update_request(id, source, 500.0, 0, MAX_IMAGE_DATA_SIZE);
    let block = h.wait_for_block(id, false);
    assert_eq!(block.discard, 0);
    assert_eq!(block.packet, 0);
    assert_eq!(block.priority, 500.0);

    // Packets only count once the header arrived
    assert!(!h.coordinator.receive_image_packet(host(), id, 1, packet(&data, 600, 1600)));
    assert!(h
        .coordinator
        .receive_image_header(host(), id, 0, 3, 2600, packet(&data, 0, 600)));
    assert_eq!(
        h.coordinator.request_state(id),
        Some(FetchState::LoadFromSimulator)
    );
    assert!(h.coordinator.receive_image_packet(host(), id, 2, packet(&data, 1600, 2600)));
    assert!(h.coordinator.receive_image_packet(host(), id, 1, packet(&data, 600, 1600)));
    assert!(!h.coordinator.receive_image_packet(host(), id, 1, packet(&data, 600, 1600)));

    let status = run_until_done(&h.coordinator, id);
    assert_eq!(status.last_http_status, Some(404));
    assert_eq!(status.discard_level, 0);
    assert_eq!(status.raster.unwrap().data, data);
    assert_eq!(h.decoder.calls(), vec![(2600, 0)]);

    let cached = h.cache.read(id, 0, MAX_IMAGE_DATA_SIZE).unwrap().unwrap();
    assert!(cached.have_all);
    assert_eq!(cached.data, data);
}

#[test]
fn test_transfer_resumes_after_cached_packets() {
    let data = asset(3600);
    let h = harness(None);
    let id = ContentId::new_random();
    h.cache.write(id, &data[..1600], 3600, None).unwrap();

    h.coordinator
        .create_or_update_request(id, sim_source(), 500.0, 0, MAX_IMAGE_DATA_SIZE);
    let block = h.wait_for_block(id, false);
    assert_eq!(block.packet, 2);

    // A resumed transfer has no header
    assert!(h.coordinator.receive_image_packet(host(), id, 3, packet(&data, 2600, 3600)));
    assert!(h.coordinator.receive_image_packet(host(), id, 2, packet(&data, 1600, 2600)));

    let status = run_until_done(&h.coordinator, id);
    assert_eq!(status.raster.unwrap().data, data);
    assert_eq!(h.cache.cached_size(&id), Some(3600));
}

#[test]
fn test_misaligned_cache_entry_refetched_from_start() {
    let data = asset(3600);
    let h = harness(None);
    let id = ContentId::new_random();
    h.cache.write(id, &data[..1024], 3600, None).unwrap();

    h.coordinator
        .create_or_update_request(id, sim_source(), 500.0, 0, MAX_IMAGE_DATA_SIZE);
    let block = h.wait_for_block(id, false);
    assert_eq!(block.packet, 0);
    assert!(!h.cache.is_in_cache(&id));

    assert!(h
        .coordinator
        .receive_image_header(host(), id, 0, 4, 3600, packet(&data, 0, 600)));
    for (index, from) in [(1, 600), (2, 1600), (3, 2600)] {
        assert!(h
            .coordinator
            .receive_image_packet(host(), id, index, packet(&data, from, from + 1000)));
    }

    let status = run_until_done(&h.coordinator, id);
    assert_eq!(status.raster.unwrap().data, data);
    assert_eq!(h.cache.cached_size(&id), Some(3600));
}

#[test]
fn test_unknown_transfer_is_cancelled() {
    let h = harness(None);
    let id = ContentId::new_random();

    assert!(!h
        .coordinator
        .receive_image_header(host(), id, 0, 1, 100, Bytes::from_static(&[1; 100])));
    let block = h.wait_for_block(id, true);
    assert_eq!(block.discard, -1);
    assert_eq!(h.coordinator.request_count(), 0);
}

#[test]
fn test_deleted_request_cancels_transfer() {
    let h = harness(None);
    let id = ContentId::new_random();

    h.coordinator
        .create_or_update_request(id, sim_source(), 500.0, 2, 4096);
    h.wait_for_block(id, false);
    assert_eq!(h.coordinator.network_queue_len(), 1);

    assert!(h.coordinator.delete_request(id, false));
    assert_eq!(h.coordinator.network_queue_len(), 0);
    h.wait_for_block(id, true);
    assert!(h.coordinator.poll_request(id).raster.is_none());
}

#[test]
fn test_requests_batched_by_priority() {
    let h = harness(None);
    let ids: Vec<_> = (0..60).map(|_| ContentId::new_random()).collect();
    for (i, id) in ids.iter().enumerate() {
        h.coordinator
            .create_or_update_request(*id, sim_source(), (i + 1) as f32, 0, MAX_IMAGE_DATA_SIZE);
    }

    let expected: BTreeSet<_> = ids.iter().copied().collect();
    run_until(&h.coordinator, || {
        let sent: BTreeSet<_> = h.simulator.blocks().iter().map(|b| b.id).collect();
        (sent == expected).then_some(())
    });

    let messages = h.simulator.messages();
    assert!(messages.len() >= 2);
    for message in &messages {
        assert!(message.len() <= 50);
        assert!(message
            .windows(2)
            .all(|pair| pair[0].priority >= pair[1].priority));
    }
}

#[test]
fn test_priority_change_resends_request() {
    let h = harness(None);
    let id = ContentId::new_random();

    h.coordinator
        .create_or_update_request(id, sim_source(), 10.0, 0, MAX_IMAGE_DATA_SIZE);
    h.wait_for_block(id, false);
    assert!(h.coordinator.update_priority(id, 5000.0));

    let resent = run_until(&h.coordinator, || {
        let sent = h.sent_for(id);
        (sent.len() == 2).then(|| sent[1])
    });
    assert_eq!(resent.priority, 5000.0);
    assert!(!h.coordinator.update_priority(ContentId::new_random(), 1.0));
}
