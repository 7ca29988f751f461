//! Error taxonomy for the voice engine.
//!
//! Acquisition and encoding errors surface synchronously so the UI can show
//! actionable messaging. Service errors carry a classification that is logged
//! internally while the UI shows a generic retry-later message. Nothing here
//! is fatal to the host app.

/// Errors raised while acquiring the microphone stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    /// The user (or platform policy) denied microphone access.
    PermissionDenied,
    /// No capture device is present.
    DeviceNotFound,
    /// The platform cannot satisfy the requested capture constraints.
    NotSupported,
    /// Any other acquisition failure.
    Failed(String),
}

impl std::fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionError::PermissionDenied => {
                write!(f, "Microphone access denied. Check the app's permission settings.")
            }
            AcquisitionError::DeviceNotFound => write!(f, "No microphone found"),
            AcquisitionError::NotSupported => {
                write!(f, "Microphone capture is not supported in this context")
            }
            AcquisitionError::Failed(e) => write!(f, "Failed to acquire microphone: {}", e),
        }
    }
}

impl std::error::Error for AcquisitionError {}

/// Errors from the platform encoder while a recording is in flight.
///
/// These are not retried; the session is left stopped and must be
/// reinitialized.
#[derive(Debug, Clone)]
pub enum EncodingError {
    /// The fragment stream closed before the final fragment arrived.
    StreamClosed,
    /// Assembling the finalized fragments into a clip failed.
    AssemblyFailed(String),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::StreamClosed => write!(f, "Encoder stopped before finalizing"),
            EncodingError::AssemblyFailed(e) => write!(f, "Failed to assemble audio clip: {}", e),
        }
    }
}

impl std::error::Error for EncodingError {}

/// Classified failures from the transcription service.
#[derive(Debug, Clone)]
pub enum TranscriptionError {
    /// The clip exceeds the upload ceiling; rejected before dispatch.
    TooLarge { bytes: usize, limit: usize },
    /// The service rejected the negotiated audio format (HTTP 415).
    UnsupportedFormat(String),
    /// Authentication or quota failure (HTTP 401/402/403).
    AuthOrQuota(String),
    /// The service asked us to back off (HTTP 429).
    RateLimited(String),
    /// Any other service failure.
    Unavailable { status: u16, message: String },
    /// Transport-level failure before a status was received.
    Network(String),
    /// The response body could not be parsed.
    Parse(String),
}

impl std::fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscriptionError::TooLarge { bytes, limit } => {
                write!(f, "Audio clip too large: {} bytes (limit {})", bytes, limit)
            }
            TranscriptionError::UnsupportedFormat(m) => {
                write!(f, "Audio format rejected by transcription service: {}", m)
            }
            TranscriptionError::AuthOrQuota(m) => {
                write!(f, "Transcription auth/quota error: {}", m)
            }
            TranscriptionError::RateLimited(m) => write!(f, "Transcription rate limited: {}", m),
            TranscriptionError::Unavailable { status, message } => {
                write!(f, "Transcription service error ({}): {}", status, message)
            }
            TranscriptionError::Network(e) => write!(f, "Network error: {}", e),
            TranscriptionError::Parse(e) => write!(f, "Failed to parse service response: {}", e),
        }
    }
}

impl std::error::Error for TranscriptionError {}

/// Failures from the speech-synthesis service.
///
/// A "not configured" response is deliberately *not* represented here; it is
/// a recognized non-error outcome (`None` from the transport).
#[derive(Debug, Clone)]
pub enum SynthesisError {
    Network(String),
    Service { status: u16, message: String },
}

impl std::fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SynthesisError::Network(e) => write!(f, "Synthesis network error: {}", e),
            SynthesisError::Service { status, message } => {
                write!(f, "Synthesis service error ({}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for SynthesisError {}

/// Failures while starting audio playback.
#[derive(Debug, Clone)]
pub enum PlaybackError {
    OutputUnavailable(String),
    Decode(String),
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::OutputUnavailable(e) => write!(f, "Audio output unavailable: {}", e),
            PlaybackError::Decode(e) => write!(f, "Failed to decode audio for playback: {}", e),
        }
    }
}

impl std::error::Error for PlaybackError {}
