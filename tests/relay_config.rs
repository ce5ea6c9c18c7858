use std::sync::Mutex;
use std::time::Duration;

use tempfile::{tempdir, NamedTempFile};

use detection_relay::config::{BackendKind, RelayConfig, StreamTransport};
use detection_relay::NmsPolicy;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RELAY_CONFIG",
        "RELAY_CAMERA_URL",
        "RELAY_CAMERA_ID",
        "RELAY_STREAM_PORT",
        "RELAY_STREAM_TRANSPORT",
        "RELAY_COLLECTOR_HOST",
        "RELAY_COLLECTOR_PORT",
        "RELAY_PUBLISH_INTERVAL_MS",
        "RELAY_CONFIDENCE_THRESHOLD",
        "RELAY_NMS_THRESHOLD",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "detection": {
            "confidence_threshold": 0.5,
            "nms_threshold": 0.3,
            "class_agnostic_nms": false
        },
        "camera": {
            "url": "rtsp://camera-1/live",
            "camera_id": "loading_bay",
            "width": 1280,
            "height": 720,
            "fps": 15
        },
        "stream": {
            "port": 9554,
            "mount": "/live"
        },
        "publisher": {
            "host": "collector.local",
            "port": 9000,
            "publish_interval_ms": 250
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("RELAY_CONFIG", file.path());
    std::env::set_var("RELAY_CAMERA_ID", "rear_gate");
    std::env::set_var("RELAY_COLLECTOR_PORT", "9100");
    std::env::set_var("RELAY_NMS_THRESHOLD", "0.6");

    let cfg = RelayConfig::load().expect("load config");

    assert_eq!(cfg.detection.confidence_threshold, 0.5);
    assert_eq!(cfg.detection.nms_threshold, 0.6);
    assert_eq!(cfg.postprocess_params().nms_policy, NmsPolicy::PerClass);
    assert_eq!(cfg.camera.url, "rtsp://camera-1/live");
    assert_eq!(cfg.camera.camera_id, "rear_gate");
    assert_eq!(cfg.camera_config().target_fps, 15);
    assert_eq!(cfg.stream.port, 9554);
    assert_eq!(cfg.stream.mount, "/live");
    assert_eq!((cfg.stream.width, cfg.stream.height), (1280, 720));
    assert_eq!(cfg.publisher.host, "collector.local");
    assert_eq!(cfg.publisher.port, 9100);
    assert_eq!(cfg.publisher.publish_interval, Duration::from_millis(250));
    assert_eq!(cfg.source.as_deref(), Some(file.path()));

    clear_env();
}

#[test]
fn reads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("relay.toml");
    std::fs::write(
        &path,
        r#"
[detection]
backend = "tract"
model_path = "/opt/models/detector.onnx"

[stream]
transport = "rtsp"
bitrate_kbps = 2500
"#,
    )
    .expect("write config");

    let cfg = RelayConfig::load_from(Some(&path)).expect("load config");
    assert_eq!(cfg.detection.backend, BackendKind::Tract);
    assert_eq!(
        cfg.detection.model_path,
        std::path::PathBuf::from("/opt/models/detector.onnx")
    );
    assert_eq!(cfg.stream.transport, StreamTransport::Rtsp);
    assert_eq!(cfg.stream.bitrate_kbps, 2500);

    clear_env();
}

#[test]
fn missing_file_is_created_with_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("conf").join("relay.json");
    let cfg = RelayConfig::load_from(Some(&path)).expect("load config");
    assert!(path.exists());
    assert_eq!(cfg.publisher.endpoint, "/metadata");

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read back")).expect("json");
    assert_eq!(written["publisher"]["queue_capacity"], 100);
    assert_eq!(written["detection"]["nms_threshold"].as_f64().map(|v| (v * 100.0).round()), Some(45.0));

    let reloaded = RelayConfig::load_from(Some(&path)).expect("reload");
    assert_eq!(reloaded.stream.port, cfg.stream.port);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{"publisher":{"endpoint":"metadata"}}"#)
        .expect("write config");
    assert!(RelayConfig::load_from(Some(file.path())).is_err());

    std::env::set_var("RELAY_CONFIDENCE_THRESHOLD", "1.7");
    assert!(RelayConfig::load_from(None).is_err());
    std::env::set_var("RELAY_CONFIDENCE_THRESHOLD", "high");
    assert!(RelayConfig::load_from(None).is_err());

    clear_env();
}
