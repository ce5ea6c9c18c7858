use anyhow::Result;
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use detection_relay::collector::{CollectorConfig, CollectorServer};
use detection_relay::config::RelayConfig;
use detection_relay::{Pipeline, PipelineState};

fn loopback_config(collector_port: u16) -> RelayConfig {
    let mut cfg = RelayConfig::default();
    cfg.camera.width = 320;
    cfg.camera.height = 240;
    cfg.camera.fps = 100;
    cfg.stream.bind = "127.0.0.1".to_string();
    cfg.stream.port = 0;
    cfg.stream.width = 320;
    cfg.stream.height = 240;
    cfg.publisher.host = "127.0.0.1".to_string();
    cfg.publisher.port = collector_port;
    cfg.publisher.publish_interval = Duration::from_millis(100);
    cfg.publisher.flush_interval = Duration::from_millis(10);
    cfg
}

#[test]
fn event_cadence_follows_publish_interval_not_frame_rate() -> Result<()> {
    let collector = CollectorServer::new(CollectorConfig {
        addr: "127.0.0.1:0".to_string(),
        ..CollectorConfig::default()
    })
    .spawn()?;
    let cfg = loopback_config(collector.addr.port());

    let mut pipeline = Pipeline::from_config(&cfg)?;
    pipeline.initialize()?;
    assert_eq!(pipeline.state(), PipelineState::Ready);
    assert!(pipeline
        .stream_url()
        .is_some_and(|url| url.starts_with("http://127.0.0.1:") && url.ends_with("/stream")));

    let stop = pipeline.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_secs(1));
        stop.request_stop();
    });
    let stats = pipeline.run()?;
    stopper.join().unwrap();

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert!(
        (7..=12).contains(&stats.batches_forwarded),
        "forwarded {} batches",
        stats.batches_forwarded
    );
    assert!(stats.frames_processed > stats.batches_forwarded);
    assert_eq!(stats.stream.frames_pushed, stats.frames_processed);
    assert_eq!(stats.stream.frames_idle, stats.frames_processed);
    assert!(stats.detections_total > 0);
    assert_eq!(stats.publisher.published as usize, collector.received_count());
    assert!(collector.received_count() >= 5);

    let body: serde_json::Value = serde_json::from_str(&collector.received()[0])?;
    assert_eq!(body["camera_id"], "camera_0");
    assert_eq!(body["frame_width"], 320);
    assert!(body["detection_count"].as_u64().is_some_and(|n| n > 0));

    collector.stop()
}

#[test]
fn occupied_stream_port_is_an_initialization_fault() -> Result<()> {
    let occupied = TcpListener::bind("127.0.0.1:0")?;
    let mut cfg = loopback_config(9);
    cfg.stream.port = occupied.local_addr()?.port();

    let mut pipeline = Pipeline::from_config(&cfg)?;
    assert!(pipeline.initialize().is_err());
    assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    assert!(pipeline.run().is_err());
    Ok(())
}

#[cfg(not(feature = "rtsp-gstreamer"))]
#[test]
fn rtsp_transport_requires_feature() {
    let mut cfg = loopback_config(9);
    cfg.stream.transport = detection_relay::StreamTransport::Rtsp;
    assert!(Pipeline::from_config(&cfg).is_err());
}

#[cfg(not(feature = "backend-tract"))]
#[test]
fn tract_backend_requires_feature() {
    let mut cfg = loopback_config(9);
    cfg.detection.backend = detection_relay::BackendKind::Tract;
    assert!(Pipeline::from_config(&cfg).is_err());
}
