use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::detect::{NmsPolicy, PostprocessParams};
use crate::ingest::CameraConfig;
use crate::pipeline::CapturePolicy;
use crate::publish::PublisherConfig;
use crate::stream::MjpegConfig;

const DEFAULT_MODEL_PATH: &str = "models/yolov4-tiny.onnx";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
const DEFAULT_INPUT_SIZE: u32 = 416;
const DEFAULT_MIN_BOX_SIZE: f32 = 10.0;
const DEFAULT_CAMERA_URL: &str = "stub://camera_0";
const DEFAULT_CAMERA_ID: &str = "camera_0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_STREAM_BIND: &str = "0.0.0.0";
const DEFAULT_STREAM_PORT: u16 = 8554;
const DEFAULT_STREAM_MOUNT: &str = "/stream";
const DEFAULT_BITRATE_KBPS: u32 = 1000;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_COLLECTOR_HOST: &str = "localhost";
const DEFAULT_COLLECTOR_PORT: u16 = 8080;
const DEFAULT_COLLECTOR_ENDPOINT: &str = "/metadata";
const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 100;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CAPTURE_RETRIES: u32 = 3;
const DEFAULT_CAPTURE_BACKOFF_MS: u64 = 10;
const DEFAULT_SKIP_BACKOFF_MS: u64 = 100;

#[derive(Debug, Deserialize, Serialize, Default)]
struct RelayConfigFile {
    detection: Option<DetectionFile>,
    camera: Option<CameraFile>,
    stream: Option<StreamFile>,
    publisher: Option<PublisherFile>,
    pipeline: Option<PipelineFile>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct DetectionFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    input_size: Option<u32>,
    class_agnostic_nms: Option<bool>,
    min_box_size: Option<f32>,
    draw_detections: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct CameraFile {
    url: Option<String>,
    camera_id: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct StreamFile {
    transport: Option<String>,
    bind: Option<String>,
    port: Option<u16>,
    mount: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    bitrate_kbps: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct PublisherFile {
    host: Option<String>,
    port: Option<u16>,
    endpoint: Option<String>,
    publish_interval_ms: Option<u64>,
    flush_interval_ms: Option<u64>,
    queue_capacity: Option<usize>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct PipelineFile {
    capture_retries: Option<u32>,
    capture_backoff_ms: Option<u64>,
    skip_backoff_ms: Option<u64>,
    max_consecutive_capture_failures: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Stub,
    Tract,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "stub" => Ok(Self::Stub),
            "tract" => Ok(Self::Tract),
            other => Err(anyhow!("unknown detector backend '{}'; expected stub or tract", other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stub => "stub",
            Self::Tract => "tract",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamTransport {
    #[default]
    Mjpeg,
    Rtsp,
}

impl FromStr for StreamTransport {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "mjpeg" | "http" => Ok(Self::Mjpeg),
            "rtsp" => Ok(Self::Rtsp),
            other => Err(anyhow!("unknown stream transport '{}'; expected mjpeg or rtsp", other)),
        }
    }
}

impl fmt::Display for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mjpeg => "mjpeg",
            Self::Rtsp => "rtsp",
        })
    }
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: BackendKind,
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub input_size: u32,
    pub class_agnostic_nms: bool,
    pub min_box_size: f32,
    pub draw_detections: bool,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub url: String,
    pub camera_id: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub transport: StreamTransport,
    pub bind: String,
    pub port: u16,
    pub mount: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub host: String,
    pub port: u16,
    pub endpoint: String,
    /// Minimum spacing between batches handed to the publisher.
    pub publish_interval: Duration,
    /// Publisher worker wake cadence.
    pub flush_interval: Duration,
    pub queue_capacity: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub detection: DetectionSettings,
    pub camera: CameraSettings,
    pub stream: StreamSettings,
    pub publisher: PublisherSettings,
    pub pipeline: CapturePolicy,
    /// File the configuration was read from (or written to), if any.
    pub source: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_parts(
            RelayConfigFile::default(),
            BackendKind::default(),
            StreamTransport::default(),
        )
    }
}

impl RelayConfig {
    /// Load from `RELAY_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("RELAY_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from `path`, writing a default file there first when it does not
    /// exist. Environment overrides are applied on top.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) if path.exists() => read_config_file(path)?,
            Some(path) => {
                write_default_config(path)?;
                log::info!("config file {} not found; wrote defaults", path.display());
                RelayConfigFile::default()
            }
            None => RelayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.source = path.map(Path::to_path_buf);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Result<Self> {
        let backend = file
            .detection
            .as_ref()
            .and_then(|detection| detection.backend.as_deref())
            .map(str::parse)
            .transpose()?
            .unwrap_or_default();
        let transport = file
            .stream
            .as_ref()
            .and_then(|stream| stream.transport.as_deref())
            .map(str::parse)
            .transpose()?
            .unwrap_or_default();
        Ok(Self::from_parts(file, backend, transport))
    }

    /// Fill every unset field with its default. Enum fields arrive already
    /// parsed so this step cannot fail.
    fn from_parts(
        file: RelayConfigFile,
        backend: BackendKind,
        transport: StreamTransport,
    ) -> Self {
        let detection = file.detection.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let publisher = file.publisher.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();

        let camera_width = camera.width.unwrap_or(DEFAULT_WIDTH);
        let camera_height = camera.height.unwrap_or(DEFAULT_HEIGHT);
        let camera_fps = camera.fps.unwrap_or(DEFAULT_FPS);

        Self {
            detection: DetectionSettings {
                backend,
                model_path: detection
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                confidence_threshold: detection
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                nms_threshold: detection.nms_threshold.unwrap_or(DEFAULT_NMS_THRESHOLD),
                input_size: detection.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
                class_agnostic_nms: detection.class_agnostic_nms.unwrap_or(true),
                min_box_size: detection.min_box_size.unwrap_or(DEFAULT_MIN_BOX_SIZE),
                draw_detections: detection.draw_detections.unwrap_or(true),
            },
            camera: CameraSettings {
                url: camera
                    .url
                    .unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                camera_id: camera
                    .camera_id
                    .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string()),
                width: camera_width,
                height: camera_height,
                fps: camera_fps,
            },
            stream: StreamSettings {
                transport,
                bind: stream
                    .bind
                    .unwrap_or_else(|| DEFAULT_STREAM_BIND.to_string()),
                port: stream.port.unwrap_or(DEFAULT_STREAM_PORT),
                mount: stream
                    .mount
                    .unwrap_or_else(|| DEFAULT_STREAM_MOUNT.to_string()),
                width: stream.width.unwrap_or(camera_width),
                height: stream.height.unwrap_or(camera_height),
                fps: stream.fps.unwrap_or(camera_fps),
                bitrate_kbps: stream.bitrate_kbps.unwrap_or(DEFAULT_BITRATE_KBPS),
                jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            publisher: PublisherSettings {
                host: publisher
                    .host
                    .unwrap_or_else(|| DEFAULT_COLLECTOR_HOST.to_string()),
                port: publisher.port.unwrap_or(DEFAULT_COLLECTOR_PORT),
                endpoint: publisher
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_COLLECTOR_ENDPOINT.to_string()),
                publish_interval: Duration::from_millis(
                    publisher
                        .publish_interval_ms
                        .unwrap_or(DEFAULT_PUBLISH_INTERVAL_MS),
                ),
                flush_interval: Duration::from_millis(
                    publisher
                        .flush_interval_ms
                        .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
                ),
                queue_capacity: publisher.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                timeout: Duration::from_millis(publisher.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
            },
            pipeline: CapturePolicy {
                retries: pipeline.capture_retries.unwrap_or(DEFAULT_CAPTURE_RETRIES),
                backoff: Duration::from_millis(
                    pipeline
                        .capture_backoff_ms
                        .unwrap_or(DEFAULT_CAPTURE_BACKOFF_MS),
                ),
                skip_backoff: Duration::from_millis(
                    pipeline.skip_backoff_ms.unwrap_or(DEFAULT_SKIP_BACKOFF_MS),
                ),
                max_consecutive_failures: pipeline.max_consecutive_capture_failures.unwrap_or(0),
            },
            source: None,
        }
    }

    fn to_file(&self) -> RelayConfigFile {
        RelayConfigFile {
            detection: Some(DetectionFile {
                backend: Some(self.detection.backend.to_string()),
                model_path: Some(self.detection.model_path.clone()),
                confidence_threshold: Some(self.detection.confidence_threshold),
                nms_threshold: Some(self.detection.nms_threshold),
                input_size: Some(self.detection.input_size),
                class_agnostic_nms: Some(self.detection.class_agnostic_nms),
                min_box_size: Some(self.detection.min_box_size),
                draw_detections: Some(self.detection.draw_detections),
            }),
            camera: Some(CameraFile {
                url: Some(self.camera.url.clone()),
                camera_id: Some(self.camera.camera_id.clone()),
                width: Some(self.camera.width),
                height: Some(self.camera.height),
                fps: Some(self.camera.fps),
            }),
            stream: Some(StreamFile {
                transport: Some(self.stream.transport.to_string()),
                bind: Some(self.stream.bind.clone()),
                port: Some(self.stream.port),
                mount: Some(self.stream.mount.clone()),
                width: Some(self.stream.width),
                height: Some(self.stream.height),
                fps: Some(self.stream.fps),
                bitrate_kbps: Some(self.stream.bitrate_kbps),
                jpeg_quality: Some(self.stream.jpeg_quality),
            }),
            publisher: Some(PublisherFile {
                host: Some(self.publisher.host.clone()),
                port: Some(self.publisher.port),
                endpoint: Some(self.publisher.endpoint.clone()),
                publish_interval_ms: Some(self.publisher.publish_interval.as_millis() as u64),
                flush_interval_ms: Some(self.publisher.flush_interval.as_millis() as u64),
                queue_capacity: Some(self.publisher.queue_capacity),
                timeout_ms: Some(self.publisher.timeout.as_millis() as u64),
            }),
            pipeline: Some(PipelineFile {
                capture_retries: Some(self.pipeline.retries),
                capture_backoff_ms: Some(self.pipeline.backoff.as_millis() as u64),
                skip_backoff_ms: Some(self.pipeline.skip_backoff.as_millis() as u64),
                max_consecutive_capture_failures: Some(self.pipeline.max_consecutive_failures),
            }),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("RELAY_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Some(camera_id) = env_string("RELAY_CAMERA_ID") {
            self.camera.camera_id = camera_id;
        }
        if let Some(port) = env_parse::<u16>("RELAY_STREAM_PORT")? {
            self.stream.port = port;
        }
        if let Some(transport) = env_string("RELAY_STREAM_TRANSPORT") {
            self.stream.transport = transport.parse()?;
        }
        if let Some(host) = env_string("RELAY_COLLECTOR_HOST") {
            self.publisher.host = host;
        }
        if let Some(port) = env_parse::<u16>("RELAY_COLLECTOR_PORT")? {
            self.publisher.port = port;
        }
        if let Some(ms) = env_parse::<u64>("RELAY_PUBLISH_INTERVAL_MS")? {
            self.publisher.publish_interval = Duration::from_millis(ms);
        }
        if let Some(threshold) = env_parse::<f32>("RELAY_CONFIDENCE_THRESHOLD")? {
            self.detection.confidence_threshold = threshold;
        }
        if let Some(threshold) = env_parse::<f32>("RELAY_NMS_THRESHOLD")? {
            self.detection.nms_threshold = threshold;
        }
        Ok(())
    }

    /// Point the publisher at `host:port`.
    pub fn set_collector(&mut self, host_port: &str) -> Result<()> {
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("collector '{}' must be host:port", host_port))?;
        if host.trim().is_empty() {
            return Err(anyhow!("collector '{}' has an empty host", host_port));
        }
        self.publisher.port = port
            .parse()
            .map_err(|_| anyhow!("collector port '{}' is not a valid port", port))?;
        self.publisher.host = host.to_string();
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("confidence_threshold", self.detection.confidence_threshold),
            ("nms_threshold", self.detection.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.detection.input_size == 0 {
            return Err(anyhow!("detection input_size must be greater than zero"));
        }
        if !self.detection.min_box_size.is_finite() || self.detection.min_box_size < 0.0 {
            return Err(anyhow!("detection min_box_size must be a non-negative number"));
        }
        if self.camera.width == 0 || self.camera.height == 0 || self.camera.fps == 0 {
            return Err(anyhow!("camera width, height and fps must be greater than zero"));
        }
        if self.camera.camera_id.trim().is_empty() {
            return Err(anyhow!("camera_id must not be empty"));
        }
        if self.stream.width == 0 || self.stream.height == 0 || self.stream.fps == 0 {
            return Err(anyhow!("stream width, height and fps must be greater than zero"));
        }
        if !self.stream.mount.starts_with('/') {
            return Err(anyhow!("stream mount '{}' must start with '/'", self.stream.mount));
        }
        if !self.publisher.endpoint.starts_with('/') {
            return Err(anyhow!(
                "publisher endpoint '{}' must start with '/'",
                self.publisher.endpoint
            ));
        }
        if self.publisher.queue_capacity == 0 {
            return Err(anyhow!("publisher queue_capacity must be greater than zero"));
        }
        if self.publisher.publish_interval.is_zero()
            || self.publisher.flush_interval.is_zero()
            || self.publisher.timeout.is_zero()
        {
            return Err(anyhow!("publisher intervals and timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn postprocess_params(&self) -> PostprocessParams {
        PostprocessParams {
            confidence_threshold: self.detection.confidence_threshold,
            nms_threshold: self.detection.nms_threshold,
            min_box_size: self.detection.min_box_size,
            nms_policy: if self.detection.class_agnostic_nms {
                NmsPolicy::ClassAgnostic
            } else {
                NmsPolicy::PerClass
            },
        }
    }

    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            url: self.camera.url.clone(),
            target_fps: self.camera.fps,
            width: self.camera.width,
            height: self.camera.height,
        }
    }

    pub fn mjpeg_config(&self) -> MjpegConfig {
        MjpegConfig {
            bind: self.stream.bind.clone(),
            port: self.stream.port,
            mount: self.stream.mount.clone(),
            width: self.stream.width,
            height: self.stream.height,
            fps: self.stream.fps,
            jpeg_quality: self.stream.jpeg_quality,
        }
    }

    #[cfg(feature = "rtsp-gstreamer")]
    pub fn rtsp_config(&self) -> crate::stream::RtspConfig {
        crate::stream::RtspConfig {
            bind: self.stream.bind.clone(),
            port: self.stream.port,
            mount: self.stream.mount.clone(),
            width: self.stream.width,
            height: self.stream.height,
            fps: self.stream.fps,
            bitrate_kbps: self.stream.bitrate_kbps,
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            flush_interval: self.publisher.flush_interval,
            queue_capacity: self.publisher.queue_capacity,
        }
    }

    /// Multi-line summary for the startup log.
    pub fn summary(&self) -> String {
        format!(
            "detection: backend={} model={} confidence>={} nms={} input={} class_agnostic={} draw={}\n\
             camera: {} id={} {}x{}@{}fps\n\
             stream: {} {}:{}{} {}x{}@{}fps\n\
             publisher: http://{}:{}{} interval={:?} flush={:?} capacity={} timeout={:?}\n\
             capture: retries={} backoff={:?} skip={:?} max_consecutive_failures={}",
            self.detection.backend,
            self.detection.model_path.display(),
            self.detection.confidence_threshold,
            self.detection.nms_threshold,
            self.detection.input_size,
            self.detection.class_agnostic_nms,
            self.detection.draw_detections,
            self.camera.url,
            self.camera.camera_id,
            self.camera.width,
            self.camera.height,
            self.camera.fps,
            self.stream.transport,
            self.stream.bind,
            self.stream.port,
            self.stream.mount,
            self.stream.width,
            self.stream.height,
            self.stream.fps,
            self.publisher.host,
            self.publisher.port,
            self.publisher.endpoint,
            self.publisher.publish_interval,
            self.publisher.flush_interval,
            self.publisher.queue_capacity,
            self.publisher.timeout,
            self.pipeline.retries,
            self.pipeline.backoff,
            self.pipeline.skip_backoff,
            self.pipeline.max_consecutive_failures,
        )
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if is_toml(path) {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn write_default_config(path: &Path) -> Result<()> {
    let defaults = RelayConfig::default().to_file();
    let rendered = if is_toml(path) {
        toml::to_string_pretty(&defaults).context("render default TOML config")?
    } else {
        serde_json::to_string_pretty(&defaults).context("render default JSON config")?
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create config directory {}", parent.display()))?;
    }
    std::fs::write(path, rendered)
        .with_context(|| format!("write default config to {}", path.display()))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", name, value)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.detection.backend, BackendKind::Stub);
        assert_eq!(cfg.detection.confidence_threshold, 0.25);
        assert_eq!(cfg.detection.nms_threshold, 0.45);
        assert_eq!(cfg.stream.port, 8554);
        assert_eq!(cfg.stream.mount, "/stream");
        assert_eq!(cfg.stream.transport, StreamTransport::Mjpeg);
        assert_eq!(cfg.publisher.endpoint, "/metadata");
        assert_eq!(cfg.publisher.publish_interval, Duration::from_millis(100));
        assert_eq!(cfg.publisher.queue_capacity, 100);
        assert_eq!(cfg.publisher.timeout, Duration::from_secs(5));
        assert_eq!(cfg.pipeline.retries, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn default_equals_an_empty_file() -> Result<()> {
        let built = RelayConfig::default();
        let parsed = RelayConfig::from_file(RelayConfigFile::default())?;
        assert_eq!(format!("{:?}", built), format!("{:?}", parsed));
        Ok(())
    }

    #[test]
    fn unknown_enum_strings_in_file_are_errors() -> Result<()> {
        let file: RelayConfigFile =
            serde_json::from_str(r#"{"detection":{"backend":"cuda"}}"#)?;
        assert!(RelayConfig::from_file(file).is_err());
        let file: RelayConfigFile =
            serde_json::from_str(r#"{"stream":{"transport":"webrtc"}}"#)?;
        assert!(RelayConfig::from_file(file).is_err());
        let file: RelayConfigFile =
            serde_json::from_str(r#"{"stream":{"transport":"HTTP"}}"#)?;
        assert_eq!(RelayConfig::from_file(file)?.stream.transport, StreamTransport::Mjpeg);
        Ok(())
    }

    #[test]
    fn stream_geometry_follows_camera_when_unset() -> Result<()> {
        let file: RelayConfigFile =
            serde_json::from_str(r#"{"camera":{"width":1280,"height":720,"fps":15}}"#)?;
        let cfg = RelayConfig::from_file(file)?;
        assert_eq!((cfg.stream.width, cfg.stream.height, cfg.stream.fps), (1280, 720, 15));
        Ok(())
    }

    #[test]
    fn collector_override_parses_host_port() -> Result<()> {
        let mut cfg = RelayConfig::default();
        cfg.set_collector("10.0.0.5:9000")?;
        assert_eq!(cfg.publisher.host, "10.0.0.5");
        assert_eq!(cfg.publisher.port, 9000);
        assert!(cfg.set_collector("nohost").is_err());
        assert!(cfg.set_collector("host:notaport").is_err());
        Ok(())
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = RelayConfig::default();
        cfg.detection.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.publisher.endpoint = "metadata".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.stream.fps = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_transport_is_rejected() {
        assert!("webrtc".parse::<StreamTransport>().is_err());
        assert_eq!("RTSP".parse::<StreamTransport>().ok(), Some(StreamTransport::Rtsp));
    }
}
