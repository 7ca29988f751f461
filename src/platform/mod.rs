//! Platform surfaces consumed by the engine, behind trait seams.
//!
//! The engine never talks to capture hardware, the platform encoder, or the
//! audio output directly; it goes through these traits so tests can inject
//! fakes and so the capability differences between render contexts are
//! resolved once, at startup, instead of re-detected at every call site.

pub mod native;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{AcquisitionError, EncodingError, PlaybackError};

/// Kind of render context the engine is hosted in.
///
/// Constrained/legacy contexts get relaxed capture constraints and a
/// compatibility-leaning encoding candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderContext {
    Standard,
    Constrained,
}

/// Platform capabilities, resolved once at startup and injected everywhere.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub render_context: RenderContext,
    /// Whether a frequency-analysis node is available. When false the
    /// loudness analyzer degrades to inactive (no visualization, no
    /// silence-triggered auto-stop).
    pub frequency_analysis: bool,
    pub haptics: bool,
}

impl Capabilities {
    pub fn standard() -> Self {
        Self {
            render_context: RenderContext::Standard,
            frequency_analysis: true,
            haptics: true,
        }
    }

    pub fn constrained() -> Self {
        Self {
            render_context: RenderContext::Constrained,
            frequency_analysis: false,
            haptics: false,
        }
    }
}

/// Constraints passed to stream acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub sample_rate: Option<u32>,
}

impl CaptureConstraints {
    /// Constraint set for a render context: the full set on standard
    /// contexts, a relaxed single-flag set on constrained/legacy ones where
    /// over-constraining makes acquisition fail outright.
    pub fn for_context(ctx: RenderContext) -> Self {
        match ctx {
            RenderContext::Standard => Self {
                echo_cancellation: true,
                noise_suppression: true,
                sample_rate: Some(44_100),
            },
            RenderContext::Constrained => Self {
                echo_cancellation: true,
                noise_suppression: false,
                sample_rate: None,
            },
        }
    }
}

/// Receiver side of the live sample feed. Multiple readers may subscribe;
/// the loudness analyzer reads the stream this way without ever owning it.
pub type SampleReceiver = broadcast::Receiver<Vec<i16>>;

/// Permission-gated microphone acquisition.
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, AcquisitionError>;
}

/// A live capture stream. Exclusively owned by the active recording session;
/// other components only subscribe to its sample feed.
pub trait CaptureStream: Send {
    fn sample_rate(&self) -> u32;

    /// Subscribe to the live sample feed (mono i16 chunks).
    fn subscribe(&self) -> SampleReceiver;

    /// Stop the hardware tracks. Idempotent.
    fn stop_tracks(&mut self);
}

/// One encoder output fragment. Fragments are only meaningful assembled in
/// order; `last` marks the fragment emitted by finalization.
#[derive(Debug, Clone)]
pub struct EncodedFragment {
    pub data: Vec<u8>,
    pub last: bool,
}

/// The platform's streaming media encoder, used as-is (no codec of our own).
pub trait StreamEncoder: Send {
    /// Take the fragment channel. Yields one fragment per timeslice and a
    /// final `last` fragment after [`finalize`](Self::finalize). May only be
    /// taken once.
    fn fragments(&mut self) -> Option<mpsc::Receiver<EncodedFragment>>;

    /// Ask the encoder to flush and emit its final fragment. Idempotent.
    fn finalize(&mut self);
}

/// Creates encoders and probes mime-type support for format negotiation.
pub trait EncoderFactory: Send + Sync {
    /// Whether the platform accepts this mime type for encoding.
    fn supports(&self, mime_type: &str) -> bool;

    fn create(
        &self,
        stream: &dyn CaptureStream,
        mime_type: &str,
        timeslice: Duration,
    ) -> Box<dyn StreamEncoder>;

    /// Assemble finalized fragments into a playable clip.
    fn assemble(
        &self,
        mime_type: &str,
        sample_rate: u32,
        fragments: &[EncodedFragment],
    ) -> Result<AudioClip, EncodingError>;
}

/// An immutable, fully assembled audio object.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub bytes: Arc<Vec<u8>>,
    pub mime_type: String,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: Arc::new(bytes),
            mime_type: mime_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A clip that has started playing: a handle to stop it, plus a channel that
/// fires when playback drains naturally (not when it is stopped externally).
pub struct ActivePlayback {
    pub handle: Box<dyn PlaybackHandle>,
    pub ended: oneshot::Receiver<()>,
}

/// Control surface for one in-flight playback.
pub trait PlaybackHandle: Send {
    /// Pause/reset the underlying audio immediately. Idempotent.
    fn stop(&mut self);
}

/// Buffered decode-and-play output.
pub trait AudioOutput: Send + Sync {
    fn play(&self, clip: &AudioClip) -> Result<ActivePlayback, PlaybackError>;
}

/// Haptic feedback surface. No-op where unsupported.
pub trait Haptics: Send + Sync {
    fn pulse(&self, duration: Duration);
}

/// Haptics implementation for platforms without a vibration surface.
pub struct NoHaptics;

impl Haptics for NoHaptics {
    fn pulse(&self, _duration: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_constraints_request_full_processing() {
        let c = CaptureConstraints::for_context(RenderContext::Standard);
        assert!(c.echo_cancellation);
        assert!(c.noise_suppression);
        assert_eq!(c.sample_rate, Some(44_100));
    }

    #[test]
    fn constrained_context_relaxes_to_single_flag() {
        let c = CaptureConstraints::for_context(RenderContext::Constrained);
        assert!(c.echo_cancellation);
        assert!(!c.noise_suppression);
        assert_eq!(c.sample_rate, None);
    }

    #[test]
    fn clip_reports_size() {
        let clip = AudioClip::new(vec![0u8; 128], "audio/wav");
        assert_eq!(clip.len(), 128);
        assert!(!clip.is_empty());
    }
}
