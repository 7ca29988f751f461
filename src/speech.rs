//! Speech synthesis: fetch, cache, and play synthesized audio for a bubble.
//!
//! Voice playback is an optional enhancement. A backend that reports itself
//! as not configured produces a silent no-op, never an error; synthesis
//! failures block audio at most and are invisible to text rendering.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::arbiter::PlaybackArbiter;
use crate::error::SynthesisError;
use crate::platform::{AudioClip, AudioOutput};

static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Transport seam for the synthesis service.
///
/// `Ok(None)` is the "service not configured" outcome: recognized, non-error,
/// and handled by skipping playback.
#[async_trait]
pub trait SynthesisTransport: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Option<AudioClip>, SynthesisError>;
}

/// HTTP transport: POST `{ "text": ... }`, audio bytes back.
pub struct HttpSynthesis {
    endpoint: String,
}

impl HttpSynthesis {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SynthesisTransport for HttpSynthesis {
    async fn synthesize(&self, text: &str) -> Result<Option<AudioClip>, SynthesisError> {
        let response = get_http_client()
            .post(&self.endpoint)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;

        let status = response.status();
        // 204: synthesis not configured for this deployment.
        if status.as_u16() == 204 {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Service {
                status: status.as_u16(),
                message,
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;
        Ok(Some(AudioClip::new(bytes.to_vec(), "audio/mpeg")))
    }
}

struct CachedSpeech {
    text: String,
    clip: AudioClip,
}

pub struct SpeechSynthesisClient {
    transport: Arc<dyn SynthesisTransport>,
    output: Arc<dyn AudioOutput>,
    arbiter: Arc<PlaybackArbiter>,
    /// One slot: replaying the same bubble costs nothing, a distinct text
    /// evicts the previous entry.
    cache: Mutex<Option<CachedSpeech>>,
    max_chars: usize,
}

impl SpeechSynthesisClient {
    pub fn new(
        transport: Arc<dyn SynthesisTransport>,
        output: Arc<dyn AudioOutput>,
        arbiter: Arc<PlaybackArbiter>,
        max_chars: usize,
    ) -> Self {
        Self {
            transport,
            output,
            arbiter,
            cache: Mutex::new(None),
            max_chars,
        }
    }

    /// Always true; availability is arbitrated server-side (a not-configured
    /// deployment answers with the no-op outcome instead).
    pub fn is_available(&self) -> bool {
        true
    }

    /// Trim and hard-cap the text sent to the service.
    pub fn normalize_text(&self, text: &str) -> String {
        let trimmed = text.trim();
        if trimmed.chars().count() <= self.max_chars {
            return trimmed.to_string();
        }
        let mut capped: String = trimmed.chars().take(self.max_chars).collect();
        capped.push('…');
        capped
    }

    /// Fill the cache without playing, so a later tap plays instantly.
    /// Failures are logged and swallowed; prefetch is fire-and-forget.
    pub async fn prefetch(&self, text: &str) {
        let normalized = self.normalize_text(text);
        if normalized.is_empty() {
            return;
        }
        if let Err(e) = self.fetch(&normalized).await {
            log::warn!("Speech prefetch failed: {}", e);
        }
    }

    /// Synthesize (or reuse cached audio for) `text` and play it through the
    /// arbiter, attributed to `element`. Resolves when playback actually
    /// ends, so callers may await full completion.
    pub async fn speak(&self, text: &str, element: &str) -> Result<(), SynthesisError> {
        let normalized = self.normalize_text(text);
        if normalized.is_empty() {
            return Ok(());
        }
        let clip = match self.fetch(&normalized).await? {
            Some(clip) => clip,
            None => {
                log::debug!("Speech synthesis not configured; skipping playback");
                return Ok(());
            }
        };

        let output = Arc::clone(&self.output);
        match self.arbiter.play(element, move || output.play(&clip)) {
            Ok(Some(done)) => {
                let _ = done.await;
            }
            Ok(None) => {} // toggled the same bubble off
            Err(e) => {
                // Playback trouble never surfaces as a synthesis error.
                log::warn!("Speech playback failed: {}", e);
            }
        }
        Ok(())
    }

    /// Halt active playback immediately.
    pub fn stop(&self) {
        self.arbiter.stop();
    }

    async fn fetch(&self, normalized: &str) -> Result<Option<AudioClip>, SynthesisError> {
        if let Some(cached) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            if cached.text == normalized {
                log::debug!("Speech cache hit ({} chars)", normalized.chars().count());
                return Ok(Some(cached.clip.clone()));
            }
        }
        match self.transport.synthesize(normalized).await? {
            Some(clip) => {
                *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(CachedSpeech {
                    text: normalized.to_string(),
                    clip: clip.clone(),
                });
                Ok(Some(clip))
            }
            None => Ok(None),
        }
    }
}
