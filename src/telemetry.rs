//! Per-model request telemetry.
//!
//! Counters come from two places: the terminal chunk of a streamed SSE
//! response (the `usage` / `timings` object) and, for llama-server, timing
//! lines on the subprocess's stdout. The `stats` endpoint reports the most
//! recent values per loaded model.

use serde::{Deserialize, Serialize};

/// Token counts and timing for the most recent request against a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
    /// Seconds from request to first generated token.
    pub time_to_first_token: f64,
    /// Decode throughput in tokens per second.
    pub tokens_per_second: f64,
    /// Per-token decode times in seconds, when the backend reports them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decode_token_times: Vec<f64>,
}

impl Telemetry {
    /// Reset all counters to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold another measurement into this one, keeping any field the new
    /// measurement left at zero.
    pub fn merge(&mut self, other: &Telemetry) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.time_to_first_token > 0.0 {
            self.time_to_first_token = other.time_to_first_token;
        }
        if other.tokens_per_second > 0.0 {
            self.tokens_per_second = other.tokens_per_second;
        }
        if !other.decode_token_times.is_empty() {
            self.decode_token_times = other.decode_token_times.clone();
        }
    }

    /// Extract telemetry from a terminal SSE chunk's JSON payload.
    ///
    /// Two shapes exist in the wild: OpenAI-style `usage` (with FLM/OGA
    /// extensions `prefill_duration_ttft` and `decoding_speed_tps`) and
    /// llama.cpp `timings` (`prompt_n`, `predicted_n`, `prompt_ms`,
    /// `predicted_per_second`). Returns `None` when the chunk carries
    /// neither.
    pub fn from_terminal_chunk(chunk: &serde_json::Value) -> Option<Self> {
        let usage = chunk.get("usage");
        let timings = chunk.get("timings");
        if usage.is_none() && timings.is_none() {
            return None;
        }

        let mut telemetry = Self::default();

        if let Some(usage) = usage {
            if let Some(n) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                telemetry.input_tokens = n;
            }
            if let Some(n) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                telemetry.output_tokens = n;
            }
            if let Some(s) = usage.get("prefill_duration_ttft").and_then(|v| v.as_f64()) {
                telemetry.time_to_first_token = s;
            }
            if let Some(tps) = usage.get("decoding_speed_tps").and_then(|v| v.as_f64()) {
                telemetry.tokens_per_second = tps;
            }
        }

        if let Some(timings) = timings {
            if let Some(n) = timings.get("prompt_n").and_then(|v| v.as_u64()) {
                telemetry.input_tokens = n;
            }
            if let Some(n) = timings.get("predicted_n").and_then(|v| v.as_u64()) {
                telemetry.output_tokens = n;
            }
            if let Some(ms) = timings.get("prompt_ms").and_then(|v| v.as_f64()) {
                telemetry.time_to_first_token = ms / 1000.0;
            }
            if let Some(tps) = timings.get("predicted_per_second").and_then(|v| v.as_f64()) {
                telemetry.tokens_per_second = tps;
            }
        }

        Some(telemetry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_openai_usage_shape() {
        let chunk = json!({
            "usage": {"prompt_tokens": 12, "completion_tokens": 40}
        });
        let t = Telemetry::from_terminal_chunk(&chunk).expect("usage present");
        assert_eq!(t.input_tokens, 12);
        assert_eq!(t.output_tokens, 40);
    }

    #[test]
    fn parses_flm_usage_extensions() {
        let chunk = json!({
            "usage": {
                "prompt_tokens": 5,
                "completion_tokens": 9,
                "prefill_duration_ttft": 0.42,
                "decoding_speed_tps": 31.5
            }
        });
        let t = Telemetry::from_terminal_chunk(&chunk).expect("usage present");
        assert!((t.time_to_first_token - 0.42).abs() < 1e-9);
        assert!((t.tokens_per_second - 31.5).abs() < 1e-9);
    }

    #[test]
    fn parses_llamacpp_timings_shape() {
        let chunk = json!({
            "timings": {
                "prompt_n": 8,
                "predicted_n": 64,
                "prompt_ms": 250.0,
                "predicted_per_second": 42.0
            }
        });
        let t = Telemetry::from_terminal_chunk(&chunk).expect("timings present");
        assert_eq!(t.input_tokens, 8);
        assert_eq!(t.output_tokens, 64);
        assert!((t.time_to_first_token - 0.25).abs() < 1e-9);
        assert!((t.tokens_per_second - 42.0).abs() < 1e-9);
    }

    #[test]
    fn chunk_without_usage_or_timings_is_none() {
        let chunk = json!({"choices": [{"delta": {"content": "hi"}}]});
        assert!(Telemetry::from_terminal_chunk(&chunk).is_none());
    }

    #[test]
    fn merge_keeps_existing_nonzero_fields() {
        let mut base = Telemetry {
            input_tokens: 10,
            output_tokens: 20,
            time_to_first_token: 0.5,
            tokens_per_second: 30.0,
            decode_token_times: vec![],
        };
        base.merge(&Telemetry {
            output_tokens: 25,
            ..Default::default()
        });
        assert_eq!(base.input_tokens, 10);
        assert_eq!(base.output_tokens, 25);
        assert!((base.tokens_per_second - 30.0).abs() < 1e-9);
    }
}
