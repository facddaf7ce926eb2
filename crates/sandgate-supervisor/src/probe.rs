//! Readiness and liveness probing.
//!
//! One HTTP `GET` against the backend's readiness path answers both
//! questions: during startup it gates `Ready`, afterwards the watchdog
//! feeds results into a `HealthTracker`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint returned 2xx.
    Healthy,
    /// The endpoint returned non-2xx.
    Unhealthy,
    /// Connection refused, reset or timed out.
    Failed,
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync + 'static {
    async fn probe(&self) -> ProbeResult;
}

/// Probes `GET http://{address}{path}`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    address: String,
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(address: impl Into<String>, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self) -> ProbeResult {
        http_probe(&self.address, &self.path, self.timeout).await
    }
}

/// Perform an HTTP probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "sandgate-probe/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, %uri, "invalid probe request");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "probe timed out");
        ProbeResult::Failed
    })
}

/// Liveness as judged by consecutive probe results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Tracks consecutive probe results for the running backend.
#[derive(Debug)]
pub struct HealthTracker {
    status: Liveness,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32, interval: Duration) -> Self {
        Self {
            status: Liveness::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
            max_backoff: Duration::from_secs(60).max(interval),
        }
    }

    /// Record a probe result and return the new liveness.
    pub fn record(&mut self, result: ProbeResult) -> Liveness {
        match result {
            ProbeResult::Healthy => {
                if self.status == Liveness::Unhealthy {
                    debug!("backend recovered");
                }
                self.consecutive_failures = 0;
                self.current_backoff = self.base_interval;
                self.status = Liveness::Healthy;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);

                if self.consecutive_failures >= self.unhealthy_threshold {
                    if self.status != Liveness::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            "backend marked unhealthy"
                        );
                    }
                    self.status = Liveness::Unhealthy;
                }
            }
        }
        self.status
    }

    /// Forget history, e.g. after the process was replaced.
    pub fn reset(&mut self) {
        self.status = Liveness::Unknown;
        self.consecutive_failures = 0;
        self.current_backoff = self.base_interval;
    }

    pub fn status(&self) -> Liveness {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }

    pub fn needs_replacement(&self) -> bool {
        self.status == Liveness::Unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_unknown() {
        let tracker = HealthTracker::new(3, Duration::from_secs(5));
        assert_eq!(tracker.status(), Liveness::Unknown);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn tracker_tolerates_failures_under_threshold() {
        let mut tracker = HealthTracker::new(3, Duration::from_secs(5));
        tracker.record(ProbeResult::Healthy);

        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Unhealthy);
        assert_eq!(tracker.status(), Liveness::Healthy);
        assert!(!tracker.needs_replacement());

        tracker.record(ProbeResult::Failed);
        assert!(tracker.needs_replacement());
    }

    #[test]
    fn success_resets_failures_and_backoff() {
        let mut tracker = HealthTracker::new(3, Duration::from_secs(1));
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        tracker.record(ProbeResult::Healthy);
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut tracker = HealthTracker::new(100, Duration::from_secs(1));
        for _ in 0..10 {
            tracker.record(ProbeResult::Failed);
        }
        assert_eq!(tracker.next_interval(), Duration::from_secs(60));
    }

    #[test]
    fn reset_forgets_history() {
        let mut tracker = HealthTracker::new(1, Duration::from_secs(1));
        tracker.record(ProbeResult::Failed);
        assert!(tracker.needs_replacement());

        tracker.reset();
        assert_eq!(tracker.status(), Liveness::Unknown);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn probe_refused_connection_fails() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = http_probe(&addr, "/", Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn probe_reads_status_codes() {
        use axum::Router;
        use axum::http::StatusCode;
        use axum::routing::get;

        let app = Router::new()
            .route("/ready", get(|| async { "ok" }))
            .route("/down", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let ready = HttpProbe::new(addr.clone(), "/ready", Duration::from_secs(2));
        assert_eq!(ready.probe().await, ProbeResult::Healthy);

        let down = HttpProbe::new(addr, "/down", Duration::from_secs(2));
        assert_eq!(down.probe().await, ProbeResult::Unhealthy);
    }
}
