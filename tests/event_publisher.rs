use anyhow::Result;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use std::time::{Duration, Instant};

use detection_relay::collector::{CollectorConfig, CollectorHandle, CollectorServer};
use detection_relay::detect::{BoundingBox, Detection, DetectionBatch};
use detection_relay::publish::{EventPublisher, HttpSink, PublisherConfig};

fn collector(status: u16) -> Result<CollectorHandle> {
    CollectorServer::new(CollectorConfig {
        addr: "127.0.0.1:0".to_string(),
        status,
        ..CollectorConfig::default()
    })
    .spawn()
}

fn publisher_for(handle: &CollectorHandle) -> Result<EventPublisher> {
    let sink = HttpSink::new(
        "127.0.0.1",
        handle.addr.port(),
        "/metadata",
        Duration::from_secs(5),
    )?;
    EventPublisher::new(
        Box::new(sink),
        PublisherConfig {
            flush_interval: Duration::from_millis(10),
            queue_capacity: 100,
        },
    )
}

fn person_batch(camera: &str) -> DetectionBatch {
    let captured = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
    DetectionBatch::new(
        vec![Detection {
            class_id: 0,
            label: "person",
            confidence: 0.87654,
            bbox: BoundingBox::from_corners(10.0, 20.0, 110.5, 220.25),
        }],
        captured,
        640,
        480,
        camera,
    )
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn batches_arrive_at_collector_as_json() -> Result<()> {
    let handle = collector(200)?;
    let mut publisher = publisher_for(&handle)?;
    publisher.start()?;
    assert!(publisher.enqueue(person_batch("camera_0")));
    assert!(publisher.enqueue(DetectionBatch::new(Vec::new(), Utc::now(), 640, 480, "camera_0")));

    assert!(handle.wait_for(2, Duration::from_secs(5)));
    assert!(wait_until(Duration::from_secs(2), || publisher.stats().published == 2));

    let bodies = handle.received();
    let first: Value = serde_json::from_str(&bodies[0])?;
    assert_eq!(first["timestamp"], "2024-05-01T08:30:00.000Z");
    assert_eq!(first["camera_id"], "camera_0");
    assert_eq!(first["frame_width"], 640);
    assert_eq!(first["detection_count"], 1);
    assert_eq!(first["detections"][0]["class_name"], "person");
    assert_eq!(first["detections"][0]["bbox"]["width"].as_f64(), Some(100.5));
    assert!(bodies[0].contains(r#""confidence":0.8765"#));

    let second: Value = serde_json::from_str(&bodies[1])?;
    assert_eq!(second["detection_count"], 0);
    assert_eq!(second["detections"], Value::Array(Vec::new()));

    publisher.stop()?;
    handle.stop()
}

#[test]
fn non_200_responses_are_counted_as_failures() -> Result<()> {
    let handle = collector(202)?;
    let mut publisher = publisher_for(&handle)?;
    publisher.start()?;
    publisher.enqueue(person_batch("camera_1"));

    assert!(wait_until(Duration::from_secs(5), || publisher.stats().failed == 1));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.received_count(), 1);
    assert_eq!(publisher.stats().published, 0);

    publisher.stop()?;
    handle.stop()
}

#[test]
fn absent_collector_never_blocks_enqueue() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let sink = HttpSink::new("127.0.0.1", port, "/metadata", Duration::from_millis(200))?;
    let mut publisher = EventPublisher::new(Box::new(sink), PublisherConfig::default())?;
    publisher.start()?;
    let started = Instant::now();
    for i in 0..150 {
        assert!(publisher.enqueue(person_batch(&format!("camera_{i}"))));
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(publisher.queue_depth() <= 100);
    assert!(publisher.stats().evicted >= 50);

    publisher.stop()?;
    assert_eq!(publisher.queue_depth(), 0);
    Ok(())
}
