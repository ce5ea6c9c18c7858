#![cfg(feature = "rtsp-gstreamer")]

//! RTSP live stream backed by the GStreamer RTSP server.
//!
//! One shared media factory serves the mount path: every client of that path
//! receives the same `appsrc ! x264enc ! rtph264pay` bitstream and joins it at
//! the current point. The server's GLib main loop runs on its own thread and
//! reports media lifecycle through signals, which only touch the registry:
//! `media-constructed` attaches the appsrc injection point, `prepared` marks
//! it ready and `unprepared` detaches it.

use anyhow::{anyhow, bail, Context, Result};
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_rtsp_server as gst_rtsp_server;
use gstreamer_rtsp_server::prelude::*;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::frame::{Frame, PixelFormat};
use crate::stream::registry::{Delivery, ViewerRegistry, ViewerSink};
use crate::stream::{
    prepare_frame, should_log_frame, DistributorCounters, DistributorStats, FrameDistributor,
    OutputFormat, PtsClock,
};

/// Frames waiting in the appsrc beyond which it counts as backed up.
const MAX_QUEUED_FRAMES: u64 = 4;

#[derive(Clone, Debug)]
pub struct RtspConfig {
    pub bind: String,
    pub port: u16,
    pub mount: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8554,
            mount: "/stream".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            bitrate_kbps: 1000,
        }
    }
}

impl RtspConfig {
    pub fn output(&self) -> OutputFormat {
        OutputFormat {
            width: self.width,
            height: self.height,
            fps: self.fps,
            pixel_format: PixelFormat::Bgr24,
        }
    }

    fn launch_description(&self) -> String {
        format!(
            "( appsrc name=src is-live=true format=time do-timestamp=false ! videoconvert ! \
             x264enc tune=zerolatency speed-preset=ultrafast bitrate={} key-int-max={} ! \
             rtph264pay name=pay0 pt=96 config-interval=1 )",
            self.bitrate_kbps, self.fps
        )
    }
}

/// Injection point of one constructed shared media.
struct RtspInjection {
    appsrc: gstreamer_app::AppSrc,
    max_queued_bytes: u64,
}

impl ViewerSink for RtspInjection {
    type Item = gst::Buffer;

    fn deliver(&self, buffer: &gst::Buffer) -> Delivery {
        if self.appsrc.current_level_bytes() > self.max_queued_bytes {
            return Delivery::Backpressure;
        }
        match self.appsrc.push_buffer(buffer.clone()) {
            Ok(_) => Delivery::Accepted,
            Err(gst::FlowError::Flushing) | Err(gst::FlowError::Eos) => Delivery::Closed,
            Err(_) => Delivery::Backpressure,
        }
    }

    fn close(&self) {
        let _ = self.appsrc.end_of_stream();
    }
}

struct ServerHandle {
    main_loop: glib::MainLoop,
    source_id: Option<glib::SourceId>,
    join: JoinHandle<()>,
}

pub struct RtspDistributor {
    config: RtspConfig,
    output: OutputFormat,
    registry: Arc<ViewerRegistry<RtspInjection>>,
    counters: Arc<DistributorCounters>,
    clock: PtsClock,
    server: Option<gst_rtsp_server::RTSPServer>,
    context: Option<glib::MainContext>,
    running: Option<ServerHandle>,
}

impl RtspDistributor {
    pub fn new(config: RtspConfig) -> Result<Self> {
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
            server: None,
            context: None,
            running: None,
        })
    }

    fn build_factory(&self) -> gst_rtsp_server::RTSPMediaFactory {
        let factory = gst_rtsp_server::RTSPMediaFactory::new();
        factory.set_launch(&self.config.launch_description());
        factory.set_shared(true);
        factory.set_protocols(gstreamer_rtsp::RTSPLowerTrans::TCP);

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", self.output.pixel_format.caps_name())
            .field("width", self.output.width as i32)
            .field("height", self.output.height as i32)
            .field("framerate", gst::Fraction::new(self.output.fps as i32, 1))
            .build();
        let frame_bytes = (self.output.width as u64)
            * (self.output.height as u64)
            * self.output.pixel_format.bytes_per_pixel() as u64;
        let registry = Arc::clone(&self.registry);

        factory.connect_media_constructed(move |_factory, media| {
            let Some(appsrc) = media
                .element()
                .downcast_ref::<gst::Bin>()
                .and_then(|bin| bin.by_name_recurse_up("src"))
                .and_then(|element| element.downcast::<gstreamer_app::AppSrc>().ok())
            else {
                log::warn!("RtspDistributor: constructed media has no appsrc");
                return;
            };
            appsrc.set_caps(Some(&caps));
            appsrc.set_format(gst::Format::Time);
            appsrc.set_is_live(true);

            let id = registry.attach(Arc::new(RtspInjection {
                appsrc,
                max_queued_bytes: frame_bytes * MAX_QUEUED_FRAMES,
            }));
            log::info!("RtspDistributor: media {} constructed", id);

            let ready_registry = Arc::clone(&registry);
            media.connect_prepared(move |_media| {
                ready_registry.mark_ready(id);
                log::info!("RtspDistributor: media {} ready", id);
            });
            let teardown_registry = Arc::clone(&registry);
            media.connect_unprepared(move |_media| {
                if teardown_registry.detach(id) {
                    log::info!("RtspDistributor: media {} torn down", id);
                }
            });
        });
        factory
    }

    fn to_buffer(&mut self, frame: &Frame) -> Result<gst::Buffer> {
        let prepared = prepare_frame(frame, &self.output)?;
        let (pts_ns, duration_ns) = self.clock.tick();
        let mut buffer = gst::Buffer::from_mut_slice(prepared.into_pixels());
        let meta = buffer
            .get_mut()
            .ok_or_else(|| anyhow!("fresh buffer is not writable"))?;
        meta.set_pts(gst::ClockTime::from_nseconds(pts_ns));
        meta.set_duration(gst::ClockTime::from_nseconds(duration_ns));
        Ok(buffer)
    }
}

impl FrameDistributor for RtspDistributor {
    fn name(&self) -> &'static str {
        "rtsp"
    }

    fn initialize(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        gst::init().context("initialize gstreamer")?;

        let server = gst_rtsp_server::RTSPServer::new();
        server.set_address(&self.config.bind);
        server.set_service(&self.config.port.to_string());
        let mounts = server
            .mount_points()
            .ok_or_else(|| anyhow!("RTSP server has no mount points"))?;
        mounts.add_factory(&self.config.mount, self.build_factory());

        let counters = Arc::clone(&self.counters);
        server.connect_client_connected(move |_server, client| {
            DistributorCounters::bump(&counters.clients_connected);
            log::info!("RtspDistributor: client connected");
            let closed = Arc::clone(&counters);
            client.connect_closed(move |_client| {
                DistributorCounters::bump(&closed.clients_closed);
                log::info!("RtspDistributor: client disconnected");
            });
        });

        self.context = Some(glib::MainContext::new());
        self.server = Some(server);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let (Some(server), Some(context)) = (self.server.as_ref(), self.context.as_ref()) else {
            bail!("RTSP distributor started before initialize");
        };
        let source_id = server
            .attach(Some(context))
            .context("attach RTSP server to main context")?;
        let main_loop = glib::MainLoop::new(Some(context), false);
        let loop_handle = main_loop.clone();
        let loop_context = context.clone();
        let join = thread::Builder::new()
            .name("rtsp-server".to_string())
            .spawn(move || {
                if let Err(err) = loop_context.with_thread_default(|| loop_handle.run()) {
                    log::error!("RtspDistributor: main loop failed: {}", err);
                }
            })
            .context("spawn RTSP server thread")?;
        self.running = Some(ServerHandle {
            main_loop,
            source_id: Some(source_id),
            join,
        });
        if let Some(url) = self.stream_url() {
            log::info!("RtspDistributor: streaming at {}", url);
        }
        Ok(())
    }

    fn push_frame(&mut self, frame: &Frame) -> bool {
        if self.running.is_none() {
            return false;
        }
        let pushed = DistributorCounters::bump(&self.counters.frames_pushed);
        if self.registry.ready_count() == 0 {
            DistributorCounters::bump(&self.counters.frames_idle);
            if should_log_frame(pushed, 0) {
                log::debug!("RtspDistributor: frame {} pushed, waiting for clients", pushed);
            }
            return true;
        }
        let buffer = match self.to_buffer(frame) {
            Ok(buffer) => buffer,
            Err(err) => {
                DistributorCounters::bump(&self.counters.encode_failures);
                log::warn!("RtspDistributor: {}", err);
                return false;
            }
        };
        let report = self.registry.deliver_all(&buffer);
        self.counters.record(&report);
        if should_log_frame(pushed, report.accepted) {
            log::debug!(
                "RtspDistributor: frame {} pushed to {} media, {} dropped",
                pushed,
                report.accepted,
                report.backpressure
            );
        }
        true
    }

    fn stop(&mut self) -> Result<()> {
        let detached = self.registry.detach_all();
        if let Some(mut running) = self.running.take() {
            if let Some(source_id) = running.source_id.take() {
                source_id.remove();
            }
            running.main_loop.quit();
            running
                .join
                .join()
                .map_err(|_| anyhow!("RTSP server thread panicked"))?;
            log::info!("RtspDistributor: stopped ({} media detached)", detached);
        }
        self.server = None;
        self.context = None;
        self.clock.reset();
        Ok(())
    }

    fn viewer_count(&self) -> usize {
        self.registry.ready_count()
    }

    fn stats(&self) -> DistributorStats {
        self.counters.snapshot(self.viewer_count())
    }

    fn stream_url(&self) -> Option<String> {
        self.server.as_ref().map(|_| {
            format!(
                "rtsp://{}:{}{}",
                self.config.bind, self.config.port, self.config.mount
            )
        })
    }
}

impl Drop for RtspDistributor {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("RtspDistributor: stop during drop failed: {}", err);
        }
    }
}
