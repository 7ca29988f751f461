//! Voice capture and playback engine for the Tally item-tracking assistant.
//!
//! Push-to-talk recording with loudness feedback and silence auto-stop,
//! gesture-driven cancellation, transcription dispatch, typewriter response
//! rendering with concurrent speech synthesis, and single-slot playback
//! arbitration. The host injects the platform seams ([`platform`]) and the
//! service endpoints; [`controller::VoiceController`] runs the event loop.

pub mod arbiter;
pub mod controller;
pub mod error;
pub mod gesture;
pub mod loudness;
pub mod metrics;
pub mod platform;
pub mod session;
pub mod settings;
pub mod speech;
pub mod transcription;
pub mod typewriter;

pub use arbiter::{PlaybackArbiter, VisualUpdate};
pub use controller::{ControllerHandle, UiState, UiUpdate, VoiceController, VoicePlatform};
pub use error::{
    AcquisitionError, EncodingError, PlaybackError, SynthesisError, TranscriptionError,
};
pub use gesture::InputMode;
pub use platform::{AudioClip, Capabilities, RenderContext};
pub use session::{RecordingComplete, RecordingSession, SessionPhase};
pub use settings::{load_settings, save_settings, VoiceSettings};
pub use speech::{HttpSynthesis, SpeechSynthesisClient};
pub use transcription::{Transcriber, TranscriptionClient};
