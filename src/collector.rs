//! Loopback HTTP collector for detection events.
//!
//! Accepts `POST <path>` bodies, records them and answers with a fixed
//! status. Backs the `event_sink` binary and the publisher integration tests.

use anyhow::{anyhow, Result};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::http::{read_request, write_json_response};

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub addr: String,
    pub path: String,
    /// Status returned for accepted POSTs.
    pub status: u16,
    /// Log each received body at info level.
    pub echo: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            path: "/metadata".to_string(),
            status: 200,
            echo: false,
        }
    }
}

type Received = Arc<Mutex<Vec<String>>>;

fn lock(received: &Received) -> MutexGuard<'_, Vec<String>> {
    received.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct CollectorHandle {
    pub addr: SocketAddr,
    received: Received,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl CollectorHandle {
    /// Bodies received so far, in arrival order.
    pub fn received(&self) -> Vec<String> {
        lock(&self.received).clone()
    }

    pub fn received_count(&self) -> usize {
        lock(&self.received).len()
    }

    /// Poll until at least `count` bodies arrived or `timeout` passes.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.received_count() >= count {
                return true;
            }
            if started.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("collector thread panicked"))?;
        }
        Ok(())
    }
}

pub struct CollectorServer {
    cfg: CollectorConfig,
}

impl CollectorServer {
    pub fn new(cfg: CollectorConfig) -> Self {
        Self { cfg }
    }

    pub fn spawn(self) -> Result<CollectorHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let received_thread = received.clone();
        let cfg = self.cfg;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_collector(listener, cfg, received_thread, shutdown_thread) {
                log::error!("collector stopped: {}", err);
            }
        });

        Ok(CollectorHandle {
            addr,
            received,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_collector(
    listener: TcpListener,
    cfg: CollectorConfig,
    received: Received,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &cfg, &received) {
                    log::warn!("collector request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, cfg: &CollectorConfig, received: &Received) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.path != cfg.path {
        write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
        return Ok(());
    }
    if request.method != "POST" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    let body = String::from_utf8_lossy(&request.body).into_owned();
    if cfg.echo {
        log::info!(
            "collector received ({}): {}",
            request.header("content-type").unwrap_or("no content-type"),
            body
        );
    }
    lock(received).push(body);
    write_json_response(&mut stream, cfg.status, r#"{"status":"received"}"#)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(status: u16) -> Result<CollectorHandle> {
        CollectorServer::new(CollectorConfig {
            addr: "127.0.0.1:0".to_string(),
            status,
            ..CollectorConfig::default()
        })
        .spawn()
    }

    #[test]
    fn records_posted_bodies() -> Result<()> {
        let handle = loopback(200)?;
        let url = format!("http://{}/metadata", handle.addr);
        let response = ureq::post(&url)
            .set("Content-Type", "application/json")
            .send_string(r#"{"detection_count":0}"#)?;
        assert_eq!(response.status(), 200);
        assert!(handle.wait_for(1, Duration::from_secs(1)));
        assert_eq!(handle.received(), vec![r#"{"detection_count":0}"#.to_string()]);
        handle.stop()
    }

    #[test]
    fn unknown_path_is_not_found() -> Result<()> {
        let handle = loopback(200)?;
        let url = format!("http://{}/other", handle.addr);
        match ureq::post(&url).send_string("{}") {
            Err(ureq::Error::Status(status, _)) => assert_eq!(status, 404),
            other => panic!("expected 404, got {:?}", other.map(|r| r.status())),
        }
        assert_eq!(handle.received_count(), 0);
        handle.stop()
    }
}
