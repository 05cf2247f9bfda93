//! HTTP client for driving a running gateway from the CLI.
//!
//! The `list`/`pull`/`delete`/`status`/`stop` subcommands act on a
//! serving process over its own API rather than touching shared state on
//! disk directly.

use crate::error::{GatewayError, Result};
use crate::fetch;
use serde_json::{json, Value};
use std::time::Duration;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// A client bound to one gateway address.
pub struct ServerClient {
    base: String,
}

impl ServerClient {
    pub fn new(host: &str, port: u16) -> Self {
        let host = if host == "0.0.0.0" { "localhost" } else { host };
        Self {
            base: format!("http://{host}:{port}"),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// `GET /api/v1/health`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Network`] when the server is unreachable.
    pub async fn health(&self) -> Result<Value> {
        let resp = fetch::get(&self.url("/api/v1/health"), &[], CLIENT_TIMEOUT).await?;
        resp.json()
    }

    /// Whether a gateway is answering at this address.
    pub async fn is_running(&self) -> bool {
        fetch::is_reachable(&self.url("/api/v1/health"), Duration::from_secs(2)).await
    }

    /// `GET /api/v1/models` (optionally including undownloaded entries).
    ///
    /// # Errors
    ///
    /// Network or malformed-response errors.
    pub async fn list_models(&self, show_all: bool) -> Result<Vec<Value>> {
        let url = if show_all {
            self.url("/api/v1/models?show_all=true")
        } else {
            self.url("/api/v1/models")
        };
        let resp = fetch::get(&url, &[], CLIENT_TIMEOUT).await?;
        let body = resp.json()?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// `POST /api/v1/pull` with SSE progress, printing updates as they
    /// arrive.
    ///
    /// # Errors
    ///
    /// Network errors, or [`GatewayError::Download`] when the server
    /// reports a failed pull.
    pub async fn pull(&self, body: Value) -> Result<()> {
        let mut request = body;
        request["stream"] = json!(true);

        let mut failed: Option<String> = None;
        let mut line_buffer = String::new();
        let status = fetch::post_stream(
            &self.url("/api/v1/pull"),
            &request,
            |chunk| {
                line_buffer.push_str(&String::from_utf8_lossy(chunk));
                while let Some(pos) = line_buffer.find("\n\n") {
                    let event: String = line_buffer.drain(..pos + 2).collect();
                    if let Some(error) = print_pull_event(&event) {
                        failed = Some(error);
                    }
                }
                true
            },
            &[],
            Duration::from_secs(24 * 3600),
        )
        .await?;

        if let Some(error) = failed {
            return Err(GatewayError::Download(error));
        }
        if status != 200 {
            return Err(GatewayError::Download(format!(
                "pull failed with HTTP {status}"
            )));
        }
        println!("Done.");
        Ok(())
    }

    /// `POST /api/v1/load`; blocks until the model is ready.
    ///
    /// # Errors
    ///
    /// Network errors, or the server's error envelope as
    /// [`GatewayError::Internal`].
    pub async fn load(&self, model: &str) -> Result<Value> {
        self.post_expect_ok(
            "/api/v1/load",
            &json!({ "model_name": model }),
            Duration::from_secs(1800),
        )
        .await
    }

    /// `POST /api/v1/delete`.
    ///
    /// # Errors
    ///
    /// Network errors or the server's error envelope.
    pub async fn delete(&self, model: &str) -> Result<Value> {
        self.post_expect_ok(
            "/api/v1/delete",
            &json!({ "model_name": model }),
            CLIENT_TIMEOUT,
        )
        .await
    }

    /// `POST /internal/shutdown`.
    ///
    /// # Errors
    ///
    /// Network errors.
    pub async fn stop(&self) -> Result<()> {
        fetch::post_json(&self.url("/internal/shutdown"), &json!({}), &[], CLIENT_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn post_expect_ok(&self, path: &str, body: &Value, timeout: Duration) -> Result<Value> {
        let resp = fetch::post_json(&self.url(path), body, &[], timeout).await?;
        let parsed = resp.json()?;
        if resp.status >= 400 {
            let message = parsed
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_owned();
            return Err(GatewayError::Internal(message));
        }
        Ok(parsed)
    }
}

/// Print one SSE pull event; returns the error message for `error`
/// events.
fn print_pull_event(raw_event: &str) -> Option<String> {
    let mut event_name = "";
    let mut data = "";
    for line in raw_event.lines() {
        if let Some(rest) = line.strip_prefix("event: ") {
            event_name = rest.trim();
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data = rest.trim();
        }
    }
    let parsed: Value = serde_json::from_str(data).unwrap_or(Value::Null);
    match event_name {
        "progress" => {
            let file = parsed.get("file").and_then(Value::as_str).unwrap_or("?");
            let index = parsed.get("file_index").and_then(Value::as_u64).unwrap_or(0);
            let total = parsed.get("total_files").and_then(Value::as_u64).unwrap_or(0);
            let percent = parsed.get("percent").and_then(Value::as_u64).unwrap_or(0);
            println!("  [{index}/{total}] {file}: {percent}%");
            None
        }
        "complete" => None,
        "error" => Some(
            parsed
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("pull failed")
                .to_owned(),
        ),
        _ => None,
    }
}
