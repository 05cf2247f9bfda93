//! Error types for the gateway.
//!
//! Every error carries a wire `kind` string that matches the structured JSON
//! envelope the HTTP layer emits: `{"error": {"message": …, "type": …}}`.
//! Clients switch on `type`, so the kind strings are part of the API.

use serde_json::json;

/// Top-level error type for the inference gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A request arrived before any model (or the named model) was loaded.
    #[error("no model loaded{}", fmt_detail(.0))]
    ModelNotLoaded(String),

    /// A cached model no longer matches its registered checkpoint.
    #[error("model '{model}' was invalidated{}. Please download the model again.", fmt_detail(.reason))]
    ModelInvalidated { model: String, reason: String },

    /// The loaded backend does not implement the requested capability.
    #[error("{operation} not supported{}", fmt_by(.backend))]
    UnsupportedOperation {
        operation: String,
        backend: String,
    },

    /// Malformed request: bad JSON, missing field, invalid variant spec.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The backend subprocess returned a non-2xx status or garbage payload.
    #[error("{backend} error: {message}")]
    Backend {
        backend: String,
        message: String,
        status: Option<u16>,
    },

    /// Connect/read failure talking to a backend or download source.
    #[error("network error: {0}")]
    Network(String),

    /// Backend binary installation failed; the install dir was rolled back.
    #[error("installation error: {0}")]
    Installation(String),

    /// Model or archive download failed after retries.
    #[error("download error: {0}")]
    Download(String),

    /// A subprocess failed to start or exited prematurely.
    #[error("process error: {0}")]
    Process(String),

    /// A required on-disk asset is missing or unreadable. Fatal at startup.
    #[error("file error: {0}")]
    File(String),

    /// Audio pre-flight rejected the upload's format.
    #[error("unsupported audio format: {0}")]
    AudioFormatUnsupported(String),

    /// Audio pre-flight rejected the upload's size.
    #[error("audio file too large: {0}")]
    AudioFileTooLarge(String),

    /// Audio pre-flight rejected the upload as unreadable or empty.
    #[error("invalid audio file: {0}")]
    AudioFileInvalid(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything that does not fit the taxonomy above.
    #[error("{0}")]
    Internal(String),
}

fn fmt_detail(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}

fn fmt_by(backend: &str) -> String {
    if backend.is_empty() {
        String::new()
    } else {
        format!(" by {backend}")
    }
}

impl GatewayError {
    /// Wire-level error kind, as seen in the JSON envelope's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelNotLoaded(_) => "model_not_loaded",
            Self::ModelInvalidated { .. } => "model_invalidated",
            Self::UnsupportedOperation { .. } => "unsupported_operation",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Backend { .. } => "backend_error",
            Self::Network(_) => "network_error",
            Self::Installation(_) => "installation_error",
            Self::Download(_) => "download_error",
            Self::Process(_) => "process_error",
            Self::File(_) => "file_error",
            Self::AudioFormatUnsupported(_) => "audio_format_unsupported",
            Self::AudioFileTooLarge(_) => "audio_file_too_large",
            Self::AudioFileInvalid(_) => "audio_file_invalid",
            Self::Io(_) => "file_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status the envelope should travel with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_)
            | Self::UnsupportedOperation { .. }
            | Self::AudioFormatUnsupported(_)
            | Self::AudioFileTooLarge(_)
            | Self::AudioFileInvalid(_) => 400,
            Self::ModelNotLoaded(_) | Self::ModelInvalidated { .. } => 404,
            Self::Backend { .. } | Self::Network(_) => 502,
            _ => 500,
        }
    }

    /// Structured JSON envelope: `{"error": {"message", "type", …}}`.
    pub fn to_envelope(&self) -> serde_json::Value {
        let mut error = json!({
            "message": self.to_string(),
            "type": self.kind(),
        });
        if let Self::Backend {
            backend, status, ..
        } = self
        {
            error["backend"] = json!(backend);
            if let Some(code) = status {
                error["status_code"] = json!(code);
            }
        }
        json!({ "error": error })
    }

    /// Shorthand for an [`GatewayError::UnsupportedOperation`] error.
    pub fn unsupported(operation: &str, backend: &str) -> Self {
        Self::UnsupportedOperation {
            operation: operation.to_owned(),
            backend: backend.to_owned(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidRequest(format!("bad JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_message_and_type() {
        let err = GatewayError::ModelNotLoaded(String::new());
        let env = err.to_envelope();
        assert_eq!(env["error"]["type"], "model_not_loaded");
        assert_eq!(env["error"]["message"], "no model loaded");
    }

    #[test]
    fn backend_envelope_includes_status() {
        let err = GatewayError::Backend {
            backend: "llama-server".into(),
            message: "boom".into(),
            status: Some(500),
        };
        let env = err.to_envelope();
        assert_eq!(env["error"]["type"], "backend_error");
        assert_eq!(env["error"]["backend"], "llama-server");
        assert_eq!(env["error"]["status_code"], 500);
    }

    #[test]
    fn unsupported_names_operation_and_backend() {
        let err = GatewayError::unsupported("Reranking", "flm");
        assert_eq!(err.to_string(), "Reranking not supported by flm");
        assert_eq!(err.kind(), "unsupported_operation");
    }

    #[test]
    fn audio_errors_map_to_400() {
        assert_eq!(
            GatewayError::AudioFileTooLarge("26 MB".into()).http_status(),
            400
        );
        assert_eq!(
            GatewayError::AudioFileInvalid("empty".into()).http_status(),
            400
        );
    }
}
