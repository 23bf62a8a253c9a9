//! Readiness strategies.
//!
//! Exactly two conditions exist: an HTTP endpoint answering with the expected
//! status, or a substring appearing in the container's combined log stream.
//! A TCP-connect check would be a third [`ReadyCondition`] variant plus one
//! match arm in [`WaitStrategy::wait_until_ready`].
//!
//! Every wait is bounded by its strategy's timeout and aborts promptly on
//! cancellation. All polling happens inside the awaited future, so dropping
//! it (on success, failure or cancellation) leaves nothing running.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RuntimeError, WaitError};
use crate::runtime::{ContainerRuntime, HttpProbe};

/// Upper bound for the HTTP poll backoff.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How often a waiting HTTP strategy checks that the container is still alive.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// A condition that must hold before a container counts as usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyCondition {
    /// `GET http://<host>:<mapped port><path>` answers with `expected_status`,
    /// or any 2xx when unset.
    Http {
        path: String,
        port: u16,
        expected_status: Option<u16>,
    },
    /// The combined stdout/stderr stream contains `substring`.
    LogLine { substring: String },
}

/// A readiness condition plus its polling policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitStrategy {
    pub condition: ReadyCondition,
    pub timeout: Duration,
    /// Initial delay between HTTP polls; doubles up to [`MAX_POLL_INTERVAL`].
    pub poll_interval: Duration,
}

impl WaitStrategy {
    pub fn http(path: impl Into<String>, port: u16) -> Self {
        Self {
            condition: ReadyCondition::Http {
                path: path.into(),
                port,
                expected_status: None,
            },
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn log_line(substring: impl Into<String>) -> Self {
        Self {
            condition: ReadyCondition::LogLine {
                substring: substring.into(),
            },
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Require an exact status instead of any 2xx. No-op for log strategies.
    pub fn with_expected_status(mut self, status: u16) -> Self {
        if let ReadyCondition::Http {
            expected_status, ..
        } = &mut self.condition
        {
            *expected_status = Some(status);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Block until the condition holds for a started container.
    ///
    /// `ports` maps container-internal ports to the host ports the runtime
    /// bound them to.
    pub async fn wait_until_ready<R>(
        &self,
        runtime: &R,
        container_id: &str,
        host: &str,
        ports: &HashMap<u16, u16>,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError>
    where
        R: ContainerRuntime + ?Sized,
    {
        match &self.condition {
            ReadyCondition::Http {
                path,
                port,
                expected_status,
            } => {
                let host_port = ports.get(port).ok_or(WaitError::UnknownPort(*port))?;
                let url = format!("http://{host}:{host_port}/{}", path.trim_start_matches('/'));
                tokio::select! {
                    result = wait_for_http(
                        runtime,
                        &url,
                        *expected_status,
                        self.timeout,
                        self.poll_interval,
                        cancel,
                    ) => result,
                    _ = watch_for_exit(runtime, container_id) => Err(WaitError::Exited),
                }
            }
            ReadyCondition::LogLine { substring } => {
                let logs = runtime.follow_logs(container_id);
                wait_for_log_line(logs, substring, self.timeout, cancel).await
            }
        }
    }
}

fn status_matches(status: u16, expected: Option<u16>) -> bool {
    match expected {
        Some(expected) => status == expected,
        None => (200..300).contains(&status),
    }
}

/// Poll `url` until it answers with the expected status.
///
/// Connection failures and non-matching statuses are retried with a backoff
/// that starts at `poll_interval`, doubles per attempt, is capped at
/// [`MAX_POLL_INTERVAL`], and never sleeps past the deadline.
pub async fn wait_for_http<P>(
    probe: &P,
    url: &str,
    expected_status: Option<u16>,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), WaitError>
where
    P: HttpProbe + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let mut interval = poll_interval;
    let mut last_observation = format!("no response from {url}");

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            attempt = tokio::time::timeout_at(deadline, probe.http_status(url)) => attempt,
        };

        match attempt {
            Err(_) => {
                return Err(WaitError::Timeout {
                    reason: last_observation,
                });
            }
            Ok(Ok(status)) if status_matches(status, expected_status) => {
                tracing::debug!(url, status, "HTTP readiness check passed");
                return Ok(());
            }
            Ok(Ok(status)) => last_observation = format!("{url} returned {status}"),
            Ok(Err(e)) => last_observation = e.to_string(),
        }
        tracing::trace!(url, observation = %last_observation, "Not ready yet");

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout {
                reason: last_observation,
            });
        }

        let pause = interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
        interval = (interval * 2).min(MAX_POLL_INTERVAL);
    }
}

/// Consume `logs` until `substring` appears.
///
/// Matches spanning chunk boundaries are found; only a tail as long as the
/// substring is retained between chunks. The stream ending means the
/// container exited.
pub async fn wait_for_log_line(
    mut logs: BoxStream<'_, Result<String, RuntimeError>>,
    substring: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    let deadline = Instant::now() + timeout;
    let mut window = String::new();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            next = tokio::time::timeout_at(deadline, logs.next()) => next,
        };

        match next {
            Err(_) => {
                return Err(WaitError::Timeout {
                    reason: format!("'{substring}' not seen in container logs"),
                });
            }
            Ok(None) => return Err(WaitError::Exited),
            Ok(Some(Err(e))) => return Err(WaitError::Stream(e.to_string())),
            Ok(Some(Ok(chunk))) => {
                window.push_str(&chunk);
                if window.contains(substring) {
                    tracing::debug!(substring, "Log readiness line observed");
                    return Ok(());
                }
                retain_tail(&mut window, substring.len());
            }
        }
    }
}

/// Keep at most the last `len` bytes of `window`, cut on a char boundary.
fn retain_tail(window: &mut String, len: usize) {
    if window.len() <= len {
        return;
    }
    let mut cut = window.len() - len;
    while !window.is_char_boundary(cut) {
        cut -= 1;
    }
    window.drain(..cut);
}

/// Resolve once the container is observed not running.
async fn watch_for_exit<R>(runtime: &R, container_id: &str)
where
    R: ContainerRuntime + ?Sized,
{
    loop {
        tokio::time::sleep(LIVENESS_INTERVAL).await;
        match runtime.is_running(container_id).await {
            Ok(false) => return,
            Err(e) if e.is_not_found() => return,
            Ok(true) => {}
            Err(e) => tracing::trace!(container_id, "Liveness check failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::stream;

    use super::*;

    /// Returns the queued statuses in order, repeating the last one.
    struct ScriptedProbe {
        statuses: Mutex<Vec<u16>>,
    }

    impl ScriptedProbe {
        fn new(statuses: &[u16]) -> Self {
            let mut statuses = statuses.to_vec();
            statuses.reverse();
            Self {
                statuses: Mutex::new(statuses),
            }
        }
    }

    #[async_trait]
    impl HttpProbe for ScriptedProbe {
        async fn http_status(&self, _url: &str) -> Result<u16, RuntimeError> {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.pop().unwrap())
            } else {
                Ok(statuses[0])
            }
        }
    }

    fn chunks(items: &[&str]) -> BoxStream<'static, Result<String, RuntimeError>> {
        let items: Vec<Result<String, RuntimeError>> =
            items.iter().map(|s| Ok(s.to_string())).collect();
        stream::iter(items).boxed()
    }

    #[test]
    fn test_status_matching() {
        assert!(status_matches(200, None));
        assert!(status_matches(204, None));
        assert!(!status_matches(500, None));
        assert!(!status_matches(200, Some(401)));
        assert!(status_matches(401, Some(401)));
    }

    #[test]
    fn test_expected_status_only_applies_to_http() {
        let http = WaitStrategy::http("/health", 8080).with_expected_status(204);
        assert_eq!(
            http.condition,
            ReadyCondition::Http {
                path: "/health".to_string(),
                port: 8080,
                expected_status: Some(204),
            }
        );

        let log = WaitStrategy::log_line("started").with_expected_status(204);
        assert_eq!(
            log.condition,
            ReadyCondition::LogLine {
                substring: "started".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_http_retries_until_success() {
        let probe = ScriptedProbe::new(&[503, 503, 200]);
        let cancel = CancellationToken::new();
        let result = wait_for_http(
            &probe,
            "http://127.0.0.1:1/health",
            None,
            Duration::from_secs(5),
            Duration::from_millis(5),
            &cancel,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_http_times_out_with_last_observation() {
        let probe = ScriptedProbe::new(&[500]);
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let result = wait_for_http(
            &probe,
            "http://127.0.0.1:1/health",
            None,
            Duration::from_millis(200),
            Duration::from_millis(20),
            &cancel,
        )
        .await;

        match result {
            Err(WaitError::Timeout { reason }) => assert!(reason.contains("500")),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_http_cancellation_is_not_a_timeout() {
        let probe = ScriptedProbe::new(&[500]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = wait_for_http(
            &probe,
            "http://127.0.0.1:1/health",
            None,
            Duration::from_secs(30),
            Duration::from_millis(20),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(WaitError::Cancelled)));
    }

    #[tokio::test]
    async fn test_log_line_found_across_chunk_boundary() {
        let cancel = CancellationToken::new();
        let logs = chunks(&["INFO boot\n======== SERVER ", "STARTED ========\n"]);
        let result =
            wait_for_log_line(logs, "======== SERVER STARTED ========", Duration::from_secs(1), &cancel)
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_log_stream_end_means_exited() {
        let cancel = CancellationToken::new();
        let logs = chunks(&["starting\n", "fatal: bad config\n"]);
        let result = wait_for_log_line(logs, "SERVER STARTED", Duration::from_secs(1), &cancel).await;
        assert!(matches!(result, Err(WaitError::Exited)));
    }

    #[tokio::test]
    async fn test_log_wait_times_out_on_silent_stream() {
        let cancel = CancellationToken::new();
        let logs = stream::pending::<Result<String, RuntimeError>>().boxed();
        let result =
            wait_for_log_line(logs, "SERVER STARTED", Duration::from_millis(50), &cancel).await;
        assert!(matches!(result, Err(WaitError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_log_wait_cancelled() {
        let cancel = CancellationToken::new();
        let logs = stream::pending::<Result<String, RuntimeError>>().boxed();
        let waiter = wait_for_log_line(logs, "SERVER STARTED", Duration::from_secs(30), &cancel);
        cancel.cancel();
        assert!(matches!(waiter.await, Err(WaitError::Cancelled)));
    }

    #[test]
    fn test_retain_tail_respects_char_boundaries() {
        let mut window = "héllo wörld".to_string();
        retain_tail(&mut window, 4);
        assert!(window.len() <= 5);
        assert!("héllo wörld".ends_with(&window));
    }
}
