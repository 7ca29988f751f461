//! Transcription service client.
//!
//! The clip is shipped as base64 JSON with its negotiated mime type; the
//! service answers with the transcript text or a "no transcript" sentinel.
//! Failures are classified so the controller can log the specific class
//! while showing a generic retry-later message.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;

use crate::error::TranscriptionError;
use crate::platform::AudioClip;

/// Upload ceiling; oversized clips are rejected before any network I/O.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// A transcription result. `text: None` is the no-transcript sentinel (the
/// service heard nothing usable); it is data, not an error.
#[derive(Debug, Clone, Deserialize)]
pub struct Transcript {
    pub text: Option<String>,
}

/// Seam over the transcription service so the controller can be driven by a
/// mock in tests.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, clip: &AudioClip) -> Result<Transcript, TranscriptionError>;
}

pub struct TranscriptionClient {
    endpoint: String,
}

impl TranscriptionClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Transcriber for TranscriptionClient {
    async fn transcribe(&self, clip: &AudioClip) -> Result<Transcript, TranscriptionError> {
        if clip.len() > MAX_UPLOAD_BYTES {
            return Err(TranscriptionError::TooLarge {
                bytes: clip.len(),
                limit: MAX_UPLOAD_BYTES,
            });
        }

        let audio_base64 =
            base64::engine::general_purpose::STANDARD.encode(clip.bytes.as_slice());
        log::debug!(
            "Dispatching transcription: {} bytes as {}",
            clip.len(),
            clip.mime_type
        );

        let response = get_http_client()
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "mime_type": clip.mime_type,
                "audio_base64": audio_base64,
            }))
            .send()
            .await
            .map_err(|e| TranscriptionError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), message));
        }

        response
            .json::<Transcript>()
            .await
            .map_err(|e| TranscriptionError::Parse(e.to_string()))
    }
}

fn classify_status(status: u16, message: String) -> TranscriptionError {
    match status {
        415 => TranscriptionError::UnsupportedFormat(message),
        401 | 402 | 403 => TranscriptionError::AuthOrQuota(message),
        429 => TranscriptionError::RateLimited(message),
        _ => TranscriptionError::Unavailable { status, message },
    }
}
