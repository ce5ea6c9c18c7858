use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

/// Where event batches are delivered.
pub trait EventSink: Send {
    /// POST one serialized batch. `Ok` carries the HTTP status whatever it
    /// is; `Err` means no response was received.
    fn send(&mut self, body: &str) -> Result<u16>;

    /// Human-readable destination for logs.
    fn describe(&self) -> String;
}

/// HTTP collector reached with a blocking `ureq` agent.
pub struct HttpSink {
    agent: ureq::Agent,
    url: Url,
}

impl HttpSink {
    pub fn new(host: &str, port: u16, endpoint: &str, timeout: Duration) -> Result<Self> {
        if !endpoint.starts_with('/') {
            return Err(anyhow!("collector endpoint '{}' must start with '/'", endpoint));
        }
        let url = Url::parse(&format!("http://{}:{}{}", host, port, endpoint))
            .with_context(|| format!("parse collector url for {}:{}{}", host, port, endpoint))?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { agent, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl EventSink for HttpSink {
    fn send(&mut self, body: &str) -> Result<u16> {
        match self
            .agent
            .post(self.url.as_str())
            .set("Content-Type", "application/json")
            .send_string(body)
        {
            Ok(response) => Ok(response.status()),
            Err(ureq::Error::Status(status, _)) => Ok(status),
            Err(err) => Err(anyhow!("POST {} failed: {}", self.url, err)),
        }
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_collector_url() -> Result<()> {
        let sink = HttpSink::new("localhost", 8080, "/metadata", Duration::from_secs(5))?;
        assert_eq!(sink.url().as_str(), "http://localhost:8080/metadata");
        Ok(())
    }

    #[test]
    fn rejects_relative_endpoint() {
        assert!(HttpSink::new("localhost", 8080, "metadata", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn unreachable_collector_is_a_transport_error() -> Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        drop(listener);
        let mut sink = HttpSink::new("127.0.0.1", port, "/metadata", Duration::from_millis(500))?;
        assert!(sink.send("{}").is_err());
        Ok(())
    }
}
