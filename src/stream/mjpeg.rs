//! MJPEG-over-HTTP live stream.
//!
//! Viewers issue `GET <mount>` and receive a `multipart/x-mixed-replace`
//! response carrying one JPEG per frame. Each pushed frame is encoded once
//! and the same bytes go to every viewer. Every viewer connection has its own
//! thread fed through a two-slot channel; a full channel drops that frame for
//! that viewer only.

use anyhow::{anyhow, bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::frame::{Frame, PixelFormat};
use crate::http::{read_request, write_json_response};
use crate::stream::registry::{Delivery, ViewerRegistry, ViewerSink};
use crate::stream::{
    prepare_frame, should_log_frame, DistributorCounters, DistributorStats, FrameDistributor,
    OutputFormat, PtsClock,
};

const BOUNDARY: &str = "frame";
const VIEWER_BUFFER: usize = 2;
const ACCEPT_IDLE: Duration = Duration::from_millis(50);
const VIEWER_POLL: Duration = Duration::from_millis(200);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct MjpegConfig {
    pub bind: String,
    pub port: u16,
    /// Request path viewers must use, e.g. "/stream".
    pub mount: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub jpeg_quality: u8,
}

impl Default for MjpegConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8554,
            mount: "/stream".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            jpeg_quality: 80,
        }
    }
}

impl MjpegConfig {
    pub fn output(&self) -> OutputFormat {
        OutputFormat {
            width: self.width,
            height: self.height,
            fps: self.fps,
            pixel_format: PixelFormat::Rgb24,
        }
    }
}

/// One encoded frame, shared by every viewer it is delivered to.
#[derive(Debug)]
pub struct MjpegPart {
    pub jpeg: Vec<u8>,
    pub pts_ns: u64,
    pub duration_ns: u64,
    pub sequence: u64,
}

struct MjpegViewer {
    tx: SyncSender<Arc<MjpegPart>>,
}

impl ViewerSink for MjpegViewer {
    type Item = Arc<MjpegPart>;

    fn deliver(&self, part: &Arc<MjpegPart>) -> Delivery {
        match self.tx.try_send(Arc::clone(part)) {
            Ok(()) => Delivery::Accepted,
            Err(TrySendError::Full(_)) => Delivery::Backpressure,
            Err(TrySendError::Disconnected(_)) => Delivery::Closed,
        }
    }
}

struct ServerContext {
    mount: String,
    shutdown: Arc<AtomicBool>,
    registry: Arc<ViewerRegistry<MjpegViewer>>,
    counters: Arc<DistributorCounters>,
}

struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

pub struct MjpegDistributor {
    config: MjpegConfig,
    output: OutputFormat,
    registry: Arc<ViewerRegistry<MjpegViewer>>,
    counters: Arc<DistributorCounters>,
    clock: PtsClock,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    server: Option<ServerHandle>,
}

impl MjpegDistributor {
    pub fn new(config: MjpegConfig) -> Result<Self> {
        let output = config.output();
        output.validate()?;
        if !config.mount.starts_with('/') {
            bail!("stream mount '{}' must start with '/'", config.mount);
        }
        Ok(Self {
            clock: PtsClock::new(output.fps)?,
            output,
            config,
            registry: Arc::new(ViewerRegistry::new()),
            counters: Arc::new(DistributorCounters::default()),
            listener: None,
            local_addr: None,
            server: None,
        })
    }

    /// Bound address, available after `initialize`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn encode(&mut self, frame: &Frame) -> Result<MjpegPart> {
        let prepared = prepare_frame(frame, &self.output)?;
        let mut jpeg = Vec::with_capacity(prepared.byte_len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.config.jpeg_quality.clamp(1, 100))
            .encode(
                prepared.pixels(),
                prepared.width,
                prepared.height,
                ExtendedColorType::Rgb8,
            )
            .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
        let (pts_ns, duration_ns) = self.clock.tick();
        Ok(MjpegPart {
            jpeg,
            pts_ns,
            duration_ns,
            sequence: frame.sequence,
        })
    }
}

impl FrameDistributor for MjpegDistributor {
    fn name(&self) -> &'static str {
        "mjpeg"
    }

    fn initialize(&mut self) -> Result<()> {
        if self.listener.is_some() || self.server.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind((self.config.bind.as_str(), self.config.port))
            .with_context(|| {
                format!(
                    "bind MJPEG stream on {}:{}",
                    self.config.bind, self.config.port
                )
            })?;
        listener.set_nonblocking(true)?;
        self.local_addr = Some(listener.local_addr()?);
        self.listener = Some(listener);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("MJPEG distributor started before initialize"))?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(ServerContext {
            mount: self.config.mount.clone(),
            shutdown: Arc::clone(&shutdown),
            registry: Arc::clone(&self.registry),
            counters: Arc::clone(&self.counters),
        });
        let join = thread::Builder::new()
            .name("mjpeg-accept".to_string())
            .spawn(move || run_accept_loop(listener, ctx))
            .context("spawn MJPEG accept thread")?;
        self.server = Some(ServerHandle { shutdown, join });
        if let Some(url) = self.stream_url() {
            log::info!("MjpegDistributor: streaming at {}", url);
        }
        Ok(())
    }

    fn push_frame(&mut self, frame: &Frame) -> bool {
        if self.server.is_none() {
            return false;
        }
        let pushed = DistributorCounters::bump(&self.counters.frames_pushed);
        if self.registry.ready_count() == 0 {
            DistributorCounters::bump(&self.counters.frames_idle);
            if should_log_frame(pushed, 0) {
                log::debug!("MjpegDistributor: frame {} pushed, waiting for viewers", pushed);
            }
            return true;
        }

        let part = match self.encode(frame) {
            Ok(part) => Arc::new(part),
            Err(err) => {
                DistributorCounters::bump(&self.counters.encode_failures);
                log::warn!("MjpegDistributor: {}", err);
                return false;
            }
        };
        let report = self.registry.deliver_all(&part);
        self.counters.record(&report);
        if should_log_frame(pushed, report.accepted) {
            log::debug!(
                "MjpegDistributor: frame {} pushed to {} viewer(s), {} dropped",
                pushed,
                report.accepted,
                report.backpressure
            );
        }
        true
    }

    fn stop(&mut self) -> Result<()> {
        self.listener = None;
        let Some(server) = self.server.take() else {
            return Ok(());
        };
        server.shutdown.store(true, Ordering::SeqCst);
        let detached = self.registry.detach_all();
        server
            .join
            .join()
            .map_err(|_| anyhow!("MJPEG accept thread panicked"))?;
        self.clock.reset();
        log::info!(
            "MjpegDistributor: stopped ({} viewer(s) detached)",
            detached
        );
        Ok(())
    }

    fn viewer_count(&self) -> usize {
        self.registry.ready_count()
    }

    fn stats(&self) -> DistributorStats {
        self.counters.snapshot(self.viewer_count())
    }

    fn stream_url(&self) -> Option<String> {
        self.local_addr
            .map(|addr| format!("http://{}{}", addr, self.config.mount))
    }
}

impl Drop for MjpegDistributor {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("MjpegDistributor: stop during drop failed: {}", err);
        }
    }
}

/// A viewer thread plus a second handle on its socket, so shutdown can
/// unblock whatever read or write the thread is parked in.
struct Connection {
    socket: Option<TcpStream>,
    join: JoinHandle<()>,
}

fn run_accept_loop(listener: TcpListener, ctx: Arc<ServerContext>) {
    let mut connections: Vec<Connection> = Vec::new();
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                DistributorCounters::bump(&ctx.counters.clients_connected);
                let socket = match stream.try_clone() {
                    Ok(socket) => Some(socket),
                    Err(err) => {
                        log::warn!("MjpegDistributor: cannot clone socket for {}: {}", peer, err);
                        None
                    }
                };
                let conn_ctx = Arc::clone(&ctx);
                let spawned = thread::Builder::new()
                    .name("mjpeg-viewer".to_string())
                    .spawn(move || {
                        if let Err(err) = serve_connection(stream, peer, &conn_ctx) {
                            log::debug!("MjpegDistributor: connection from {} ended: {}", peer, err);
                        }
                        DistributorCounters::bump(&conn_ctx.counters.clients_closed);
                    });
                match spawned {
                    Ok(join) => connections.push(Connection { socket, join }),
                    Err(err) => log::warn!("MjpegDistributor: cannot spawn viewer thread: {}", err),
                }
                connections.retain(|conn| !conn.join.is_finished());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
            }
            Err(err) => {
                log::error!("MjpegDistributor: accept failed: {}", err);
                break;
            }
        }
    }
    for conn in &connections {
        if let Some(socket) = &conn.socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
    for conn in connections {
        let _ = conn.join.join();
    }
}

fn serve_connection(mut stream: TcpStream, peer: SocketAddr, ctx: &ServerContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    if request.path != ctx.mount {
        write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
        return Ok(());
    }

    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let (tx, rx) = mpsc::sync_channel::<Arc<MjpegPart>>(VIEWER_BUFFER);
    let id = ctx.registry.attach(Arc::new(MjpegViewer { tx }));
    DistributorCounters::bump(&ctx.counters.viewers_total);

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={BOUNDARY}\r\n\
         Cache-Control: no-cache, no-store\r\nPragma: no-cache\r\nConnection: close\r\n\r\n"
    );
    if let Err(err) = stream.write_all(header.as_bytes()) {
        ctx.registry.detach(id);
        return Err(err.into());
    }
    ctx.registry.mark_ready(id);
    log::info!("MjpegDistributor: viewer {} attached from {}", id, peer);

    let result = loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match rx.recv_timeout(VIEWER_POLL) {
            Ok(part) => {
                if let Err(err) = write_part(&mut stream, &part) {
                    break Err(err);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };
    ctx.registry.detach(id);
    log::info!("MjpegDistributor: viewer {} detached", id);
    result
}

fn write_part(stream: &mut TcpStream, part: &MjpegPart) -> Result<()> {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Pts-Ns: {}\r\n\r\n",
        part.jpeg.len(),
        part.pts_ns
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&part.jpeg)?;
    stream.write_all(b"\r\n")?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> MjpegConfig {
        MjpegConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            width: 32,
            height: 24,
            ..MjpegConfig::default()
        }
    }

    #[test]
    fn push_without_viewers_is_accepted_and_counted() -> Result<()> {
        let mut distributor = MjpegDistributor::new(loopback())?;
        distributor.initialize()?;
        distributor.start()?;
        let frame = Frame::filled(1920, 1080, PixelFormat::Bgr24, 90)?;
        let started = std::time::Instant::now();
        for _ in 0..5 {
            assert!(distributor.push_frame(&frame));
        }
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(50), "idle pushes took {:?}", elapsed);
        let stats = distributor.stats();
        assert_eq!(stats.frames_pushed, 5);
        assert_eq!(stats.frames_idle, 5);
        assert_eq!(stats.frames_delivered, 0);
        distributor.stop()?;
        Ok(())
    }

    #[test]
    fn push_before_start_is_refused() -> Result<()> {
        let mut distributor = MjpegDistributor::new(loopback())?;
        let frame = Frame::filled(32, 24, PixelFormat::Bgr24, 0)?;
        assert!(!distributor.push_frame(&frame));
        assert!(distributor.start().is_err());
        Ok(())
    }

    #[test]
    fn rejects_relative_mount() {
        let config = MjpegConfig {
            mount: "stream".to_string(),
            ..loopback()
        };
        assert!(MjpegDistributor::new(config).is_err());
    }

    #[test]
    fn stop_is_idempotent() -> Result<()> {
        let mut distributor = MjpegDistributor::new(loopback())?;
        distributor.initialize()?;
        distributor.start()?;
        distributor.stop()?;
        distributor.stop()?;
        Ok(())
    }
}
