use std::time::Duration;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::runtime::HttpProbe;

/// `reqwest`-backed HTTP probe.
///
/// Each request is capped at a short timeout so a hung endpoint cannot stall a
/// readiness loop past its own deadline.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Self {
        Self::with_request_timeout(Duration::from_secs(2))
    }

    pub fn with_request_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpProbe for HttpProber {
    async fn http_status(&self, url: &str) -> Result<u16, RuntimeError> {
        match self.client.get(url).send().await {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(e) if e.is_connect() => Err(RuntimeError::Probe(format!(
                "connection refused at {url}"
            ))),
            Err(e) => Err(RuntimeError::Probe(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_port_is_probe_error() {
        // Bind then drop a listener to obtain a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = HttpProber::new();
        let result = prober.http_status(&format!("http://127.0.0.1:{port}/")).await;
        assert!(matches!(result, Err(RuntimeError::Probe(_))));
    }
}
