//! Streaming proxy: byte-transparent forwarding from a backend to the
//! client, with telemetry extraction from the terminal SSE chunk.
//!
//! Chunks are never reassembled or re-encoded on the way through; only a
//! bounded tail copy is kept so the `usage`/`timings` object in the final
//! chunk can be parsed after the stream ends. Long generations therefore
//! cost a fixed amount of proxy memory.

use crate::error::GatewayError;
use crate::fetch;
use crate::telemetry::Telemetry;
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The SSE terminator clients wait for.
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// How much of the stream tail is retained for telemetry parsing.
const TELEMETRY_TAIL_BYTES: usize = 64 * 1024;

/// Channel depth between the proxy task and the HTTP response body.
const PROXY_CHANNEL_DEPTH: usize = 32;

/// Completion callback, invoked with telemetry parsed from the stream
/// tail (when any chunk carried a usage object).
pub type OnComplete = Box<dyn FnOnce(Option<Telemetry>) + Send>;

/// Format an error as a terminal SSE event.
pub fn sse_error_event(err: &GatewayError) -> Bytes {
    Bytes::from(format!("data: {}\n\n", err.to_envelope()))
}

/// Proxy an SSE response from `url` to the returned channel.
///
/// The receiver yields raw upstream bytes. If the upstream closes without
/// `data: [DONE]`, one is synthesized; upstream errors surface as a final
/// `data: {"error": …}` event so the client stream always terminates in a
/// well-formed way. Dropping the receiver (client disconnect) aborts the
/// upstream read.
pub fn spawn_sse_proxy(
    url: String,
    body: serde_json::Value,
    timeout: Duration,
    on_complete: Option<OnComplete>,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(PROXY_CHANNEL_DEPTH);

    tokio::spawn(async move {
        let resp = match fetch::client()
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let err = GatewayError::Network(format!("backend connect failed: {e}"));
                let _ = tx.send(sse_error_event(&err)).await;
                let _ = tx.send(Bytes::from_static(SSE_DONE.as_bytes())).await;
                return;
            }
        };

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            warn!(status, "backend returned error for streaming request");
            let err = GatewayError::Backend {
                backend: "upstream".to_owned(),
                message: body_text,
                status: Some(status),
            };
            let _ = tx.send(sse_error_event(&err)).await;
            let _ = tx.send(Bytes::from_static(SSE_DONE.as_bytes())).await;
            return;
        }

        let mut tail = TailBuffer::new(TELEMETRY_TAIL_BYTES);
        let mut has_done = false;
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Backends close the socket after the final chunk;
                    // treat any read error as end-of-stream.
                    debug!(error = %e, "upstream stream ended");
                    break;
                }
            };
            tail.push(&bytes);
            if !has_done && contains_done(&bytes) {
                has_done = true;
            }
            if tx.send(bytes).await.is_err() {
                debug!("client disconnected, aborting upstream read");
                return;
            }
        }

        if !has_done {
            warn!("backend closed stream without [DONE], synthesizing");
            let _ = tx.send(Bytes::from_static(SSE_DONE.as_bytes())).await;
        }

        if let Some(callback) = on_complete {
            callback(parse_stream_telemetry(tail.as_str()));
        }
    });

    rx
}

/// Proxy a raw byte stream (e.g. TTS audio) without buffering or parsing.
pub fn spawn_byte_proxy(
    url: String,
    body: serde_json::Value,
    timeout: Duration,
) -> mpsc::Receiver<Result<Bytes, GatewayError>> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, GatewayError>>(PROXY_CHANNEL_DEPTH);

    tokio::spawn(async move {
        let resp = match fetch::client()
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let _ = tx
                    .send(Err(GatewayError::Network(format!(
                        "backend connect failed: {e}"
                    ))))
                    .await;
                return;
            }
        };

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            let _ = tx
                .send(Err(GatewayError::Backend {
                    backend: "upstream".to_owned(),
                    message: body_text,
                    status: Some(status),
                }))
                .await;
            return;
        }

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        debug!("client disconnected, aborting byte stream");
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "upstream byte stream ended");
                    break;
                }
            }
        }
    });

    rx
}

fn contains_done(chunk: &[u8]) -> bool {
    chunk
        .windows(6)
        .any(|window| window == b"[DONE]")
}

/// Parse telemetry out of a buffered stream tail.
///
/// Understands plain SSE `data: {json}` lines plus FLM's debug format
/// `ChatCompletionChunk: {json}`. The last line carrying a `usage` or
/// `timings` object wins.
pub fn parse_stream_telemetry(buffer: &str) -> Option<Telemetry> {
    let mut latest = None;
    for line in buffer.lines() {
        let json_str = if let Some(rest) = line.strip_prefix("data: ") {
            rest
        } else if let Some(rest) = line.strip_prefix("ChatCompletionChunk: ") {
            rest
        } else {
            continue;
        };
        if json_str == "[DONE]" {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<serde_json::Value>(json_str) else {
            continue;
        };
        if let Some(telemetry) = Telemetry::from_terminal_chunk(&chunk) {
            latest = Some(telemetry);
        }
    }
    latest
}

/// Fixed-capacity tail of a byte stream, valid-UTF-8 tolerant.
struct TailBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl TailBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > self.capacity {
            let excess = self.data.len() - self.capacity;
            self.data.drain(..excess);
        }
    }

    fn as_str(&self) -> &str {
        // A truncated first line cannot parse as JSON and is skipped by
        // the telemetry parser, so lossy decoding at the boundary is fine.
        std::str::from_utf8(&self.data).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(mut rx: mpsc::Receiver<Bytes>) -> String {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn done_detection() {
        assert!(contains_done(b"data: [DONE]\n\n"));
        assert!(!contains_done(b"data: {\"x\":1}\n\n"));
        assert!(!contains_done(b"[DON"));
    }

    #[test]
    fn tail_buffer_keeps_only_the_tail() {
        let mut tail = TailBuffer::new(8);
        tail.push(b"0123456789abcdef");
        assert_eq!(tail.as_str(), "89abcdef");
        tail.push(b"XY");
        assert_eq!(tail.as_str(), "abcdefXY");
    }

    #[test]
    fn telemetry_parse_takes_last_usage_chunk() {
        let buffer = "data: {\"choices\":[]}\n\n\
                      data: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":5}}\n\n\
                      data: {\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":11}}\n\n\
                      data: [DONE]\n\n";
        let t = parse_stream_telemetry(buffer).expect("usage present");
        assert_eq!(t.input_tokens, 7);
        assert_eq!(t.output_tokens, 11);
    }

    #[test]
    fn telemetry_parse_reads_flm_debug_lines() {
        let buffer =
            "ChatCompletionChunk: {\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":4}}\n";
        let t = parse_stream_telemetry(buffer).expect("usage present");
        assert_eq!(t.input_tokens, 2);
        assert_eq!(t.output_tokens, 4);
    }

    #[test]
    fn telemetry_parse_without_usage_is_none() {
        assert!(parse_stream_telemetry("data: {\"choices\":[]}\n\ndata: [DONE]\n\n").is_none());
    }

    #[tokio::test]
    async fn proxy_passes_stream_through_verbatim() {
        let upstream = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n\
                        data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2}}\n\n\
                        data: [DONE]\n\n";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(upstream))
            .mount(&server)
            .await;

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let rx = spawn_sse_proxy(
            format!("{}/v1/chat/completions", server.uri()),
            serde_json::json!({"stream": true}),
            Duration::from_secs(10),
            Some(Box::new(move |telemetry| {
                let _ = done_tx.send(telemetry);
            })),
        );

        let body = collect(rx).await;
        assert_eq!(body, upstream);

        let telemetry = done_rx.await.expect("callback ran").expect("usage parsed");
        assert_eq!(telemetry.input_tokens, 1);
        assert_eq!(telemetry.output_tokens, 2);
    }

    #[tokio::test]
    async fn proxy_synthesizes_done_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_string("data: {\"x\":1}\n\n"))
            .mount(&server)
            .await;

        let rx = spawn_sse_proxy(
            format!("{}/stream", server.uri()),
            serde_json::json!({}),
            Duration::from_secs(10),
            None,
        );
        let body = collect(rx).await;
        assert!(body.ends_with(SSE_DONE));
    }

    #[tokio::test]
    async fn proxy_emits_error_event_on_backend_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stream"))
            .respond_with(ResponseTemplate::new(500).set_body_string("kaboom"))
            .mount(&server)
            .await;

        let rx = spawn_sse_proxy(
            format!("{}/stream", server.uri()),
            serde_json::json!({}),
            Duration::from_secs(10),
            None,
        );
        let body = collect(rx).await;
        assert!(body.contains("\"type\":\"backend_error\""));
        assert!(body.ends_with(SSE_DONE));
    }

    #[tokio::test]
    async fn byte_proxy_forwards_raw_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(vec![0u8, 1, 2, 3, 255]),
            )
            .mount(&server)
            .await;

        let mut rx = spawn_byte_proxy(
            format!("{}/v1/audio/speech", server.uri()),
            serde_json::json!({"input": "hello"}),
            Duration::from_secs(10),
        );
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk.expect("no errors"));
        }
        assert_eq!(out, vec![0u8, 1, 2, 3, 255]);
    }
}
