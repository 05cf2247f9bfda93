//! Shared backend process state: port ownership, readiness probing, and
//! request forwarding.

use crate::error::{GatewayError, Result};
use crate::process::{self, ChildProcess, SpawnOptions};
use crate::{fetch, streaming};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// First port probed for backend subprocesses. The realtime WebSocket and
/// the gateway itself live elsewhere, so collisions only come from other
/// local services.
pub const BACKEND_PORT_RANGE_START: u16 = 8001;

/// Default readiness wait before a load is declared failed.
pub const READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Default forwarding timeout for JSON requests.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(60);

/// One backend subprocess bound to a loopback port.
///
/// The port is fixed at load time; the child handle sits behind a mutex so
/// `stop` can run from a shared reference while requests are in flight.
#[derive(Debug)]
pub struct BackendProcess {
    name: &'static str,
    port: u16,
    child: Mutex<Option<ChildProcess>>,
}

impl BackendProcess {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            port: 0,
            child: Mutex::new(None),
        }
    }

    /// Human-readable backend server name (e.g. `llama-server`).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The loopback port the backend listens on (0 before load).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `http://127.0.0.1:{port}`.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Full URL for a backend endpoint path.
    pub fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base_url())
    }

    #[cfg(test)]
    pub(crate) fn set_port_for_tests(&mut self, port: u16) {
        self.port = port;
    }

    /// Pick a free port for the upcoming spawn.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Process`] when no port is free.
    pub fn choose_port(&mut self) -> Result<u16> {
        self.port = process::find_free_port(BACKEND_PORT_RANGE_START)?;
        Ok(self.port)
    }

    /// Spawn the backend executable.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Process`] when the spawn fails.
    pub async fn spawn(&self, executable: &str, args: &[String], opts: SpawnOptions) -> Result<()> {
        let child = process::start(executable, args, opts)?;
        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Poll `probe_path` once per second until HTTP 200, watching for an
    /// early child exit each round.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Process`] when the child dies or the
    /// timeout elapses.
    pub async fn wait_for_ready(&self, probe_path: &str, timeout: Duration) -> Result<()> {
        let url = self.url(probe_path);
        info!(backend = self.name, url = %url, "waiting for backend readiness");
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    Some(child) => {
                        if !child.is_running() {
                            let code = child.exit_code();
                            return Err(GatewayError::Process(format!(
                                "{} exited before becoming ready (exit code {:?})",
                                self.name, code
                            )));
                        }
                    }
                    None => {
                        return Err(GatewayError::Process(format!(
                            "{} is not running",
                            self.name
                        )));
                    }
                }
            }

            if fetch::is_reachable(&url, Duration::from_secs(2)).await {
                info!(backend = self.name, "backend is ready");
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Process(format!(
                    "{} did not become ready within {}s",
                    self.name,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Stop the subprocess and reset the port. Idempotent.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            debug!(backend = self.name, pid = ?child.pid(), "stopping backend");
            child.stop().await;
        }
        *guard = None;
    }

    /// Whether a child is currently attached and alive.
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        guard.as_mut().is_some_and(ChildProcess::is_running)
    }

    /// POST JSON to the backend and parse the JSON reply. Non-2xx wraps
    /// the body in a [`GatewayError::Backend`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Network`] / [`GatewayError::Backend`].
    pub async fn forward_json(
        &self,
        endpoint: &str,
        request: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let resp = fetch::post_json(&self.url(endpoint), request, &[], timeout).await?;
        if resp.status >= 300 {
            return Err(GatewayError::Backend {
                backend: self.name.to_owned(),
                message: resp.body,
                status: Some(resp.status),
            });
        }
        resp.json().map_err(|_| GatewayError::Backend {
            backend: self.name.to_owned(),
            message: "backend returned a non-JSON body".to_owned(),
            status: Some(resp.status),
        })
    }

    /// Stream an SSE response from the backend through the proxy.
    pub fn forward_sse(
        &self,
        endpoint: &str,
        request: serde_json::Value,
        timeout: Duration,
        on_complete: Option<streaming::OnComplete>,
    ) -> tokio::sync::mpsc::Receiver<bytes::Bytes> {
        streaming::spawn_sse_proxy(self.url(endpoint), request, timeout, on_complete)
    }

    /// Stream raw bytes from the backend through the proxy.
    pub fn forward_bytes(
        &self,
        endpoint: &str,
        request: serde_json::Value,
        timeout: Duration,
    ) -> tokio::sync::mpsc::Receiver<std::result::Result<bytes::Bytes, GatewayError>> {
        streaming::spawn_byte_proxy(self.url(endpoint), request, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn process_on(port: u16) -> BackendProcess {
        let mut p = BackendProcess::new("test-server");
        p.port = port;
        p
    }

    #[test]
    fn url_building() {
        let p = process_on(8123);
        assert_eq!(p.base_url(), "http://127.0.0.1:8123");
        assert_eq!(
            p.url("/v1/chat/completions"),
            "http://127.0.0.1:8123/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn forward_json_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})),
            )
            .mount(&server)
            .await;

        let port = server.address().port();
        let p = process_on(port);
        let out = p
            .forward_json(
                "/v1/embeddings",
                &serde_json::json!({"input": "x"}),
                Duration::from_secs(5),
            )
            .await
            .expect("forwards");
        assert_eq!(out["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn forward_json_wraps_backend_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("exploded"))
            .mount(&server)
            .await;

        let p = process_on(server.address().port());
        let err = p
            .forward_json(
                "/v1/chat/completions",
                &serde_json::json!({}),
                Duration::from_secs(5),
            )
            .await
            .expect_err("500 is an error");
        assert_eq!(err.kind(), "backend_error");
        assert!(err.to_string().contains("exploded"));
    }

    #[tokio::test]
    async fn wait_for_ready_fails_without_child() {
        let p = process_on(1);
        let err = p
            .wait_for_ready("/health", Duration::from_secs(1))
            .await
            .expect_err("no child attached");
        assert_eq!(err.kind(), "process_error");
    }
}
