//! Multipart audio upload parsing for `POST audio/transcriptions`.

use crate::error::{GatewayError, Result};
use axum::extract::Multipart;
use serde_json::{json, Value};

/// Accepted upload extensions (OpenAI's set).
const SUPPORTED_EXTENSIONS: &[&str] = &[
    "flac", "m4a", "mp3", "mp4", "mpeg", "mpga", "oga", "ogg", "wav", "webm",
];

/// A parsed transcription upload.
#[derive(Debug)]
pub struct TranscriptionUpload {
    pub file_bytes: Vec<u8>,
    pub filename: String,
    pub model: Option<String>,
    /// Pass-through parameters: `language`, `prompt`, `temperature`,
    /// `response_format`.
    pub params: Value,
}

/// Consume the multipart body into a [`TranscriptionUpload`].
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] when the `file` field is
/// missing and [`GatewayError::AudioFormatUnsupported`] for unknown file
/// extensions.
pub async fn parse_transcription_upload(mut multipart: Multipart) -> Result<TranscriptionUpload> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename = String::from("audio.wav");
    let mut model = None;
    let mut params = json!({});

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::InvalidRequest(format!("bad multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" => {
                if let Some(fname) = field.file_name() {
                    filename = fname.to_owned();
                }
                let bytes = field.bytes().await.map_err(|e| {
                    GatewayError::InvalidRequest(format!("could not read file field: {e}"))
                })?;
                file_bytes = Some(bytes.to_vec());
            }
            "model" => {
                let value = read_text(field).await?;
                if !value.is_empty() {
                    model = Some(value);
                }
            }
            "language" | "prompt" | "response_format" => {
                let value = read_text(field).await?;
                params[name] = json!(value);
            }
            "temperature" => {
                let value = read_text(field).await?;
                if let Ok(t) = value.parse::<f64>() {
                    params["temperature"] = json!(t);
                }
            }
            _ => {
                // Unknown fields are ignored, matching OpenAI's tolerance.
            }
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| {
        GatewayError::InvalidRequest("missing required multipart field: file".into())
    })?;
    validate_extension(&filename)?;

    Ok(TranscriptionUpload {
        file_bytes,
        filename,
        model,
        params,
    })
}

fn validate_extension(filename: &str) -> Result<()> {
    let ext = std::path::Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Ok(());
    }
    Err(GatewayError::AudioFormatUnsupported(format!(
        "'{ext}' is not a supported audio format (expected one of {SUPPORTED_EXTENSIONS:?})"
    )))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field
        .text()
        .await
        .map_err(|e| GatewayError::InvalidRequest(format!("could not read form field: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions_pass() {
        for name in ["a.wav", "b.MP3", "clip.flac", "audio.webm"] {
            assert!(validate_extension(name).is_ok(), "{name} should pass");
        }
    }

    #[test]
    fn unknown_extension_rejected() {
        let err = validate_extension("document.pdf").expect_err("pdf rejected");
        assert_eq!(err.kind(), "audio_format_unsupported");
        let err = validate_extension("noextension").expect_err("no extension rejected");
        assert_eq!(err.kind(), "audio_format_unsupported");
    }
}
