//! Voice controller: the context object tying the engine together.
//!
//! Owns the recording session, loudness analyzer, gesture state, playback
//! arbiter, speech client, and metrics, and runs the single event loop that
//! everything else feeds. Hosts inject the platform seams and the service
//! clients; tests inject fakes.
//!
//! All asynchronous completions carry the session id that produced them and
//! stale ids are dropped at the loop, so a cancel or a new recording
//! invalidates everything still in flight from the previous one.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::arbiter::{ElementId, PlaybackArbiter, VisualUpdate};
use crate::error::{AcquisitionError, TranscriptionError};
use crate::gesture::{self, GestureEffect, GestureEvent, GestureState, GestureTuning, InputMode};
use crate::loudness::LoudnessAnalyzer;
use crate::metrics::{CycleOutcome, MetricsCollector};
use crate::platform::{
    AudioClip, AudioOutput, Capabilities, CaptureStream, EncoderFactory, Haptics, MicrophoneSource,
};
use crate::session::{RecordingComplete, RecordingSession, SessionPhase};
use crate::settings::VoiceSettings;
use crate::speech::{SpeechSynthesisClient, SynthesisTransport};
use crate::transcription::{Transcriber, Transcript};
use crate::typewriter::{is_sentinel, TypewriterRenderer, ERROR_MESSAGE, NO_TRANSCRIPT_MESSAGE};

/// Cadence of loudness sampling while recording.
const LOUDNESS_TICK: Duration = Duration::from_millis(50);

const HAPTIC_PULSE: Duration = Duration::from_millis(50);

/// Platform seams, resolved once by the host and injected.
pub struct VoicePlatform {
    pub capabilities: Capabilities,
    pub microphone: Arc<dyn MicrophoneSource>,
    pub encoders: Arc<dyn EncoderFactory>,
    pub output: Arc<dyn AudioOutput>,
    pub haptics: Arc<dyn Haptics>,
}

/// UI state sent to the frontend.
/// Tagged union format: { "status": "idle" } or { "status": "recording", "level": 4 }
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UiState {
    Idle,
    Acquiring,
    Recording { level: u8 },
    /// Drag has crossed the cancel threshold; releasing now discards.
    CancelArmed,
    Stopping,
    Transcribing,
    Responding,
    Error { message: String },
}

/// Everything the UI layer consumes, over one channel.
#[derive(Debug)]
pub enum UiUpdate {
    State(UiState),
    /// Playback indicator changes, mirrored from the arbiter slot.
    Visual(VisualUpdate),
    /// A recorded clip became tappable.
    UserBubble { element: ElementId },
    /// One typewriter token of the response bubble.
    ResponseToken(String),
    /// The response bubble finished rendering and became tappable.
    ResponseReady { element: ElementId },
    /// A bubble with nothing to replay was tapped; the host plays its local
    /// fallback sound.
    FallbackSound { element: ElementId },
}

pub enum ControllerEvent {
    Gesture(GestureEvent),
    StreamAcquired {
        result: Result<Box<dyn CaptureStream>, AcquisitionError>,
    },
    LoudnessTick { session_id: Uuid },
    SilenceEpisode { session_id: Uuid },
    RecordingComplete(RecordingComplete),
    TranscriptReady {
        session_id: Uuid,
        result: Result<Transcript, TranscriptionError>,
    },
    ResponseRendered {
        session_id: Uuid,
        outcome: CycleOutcome,
    },
    RestoreIdle { session_id: Uuid },
    BubbleTapped { element: ElementId },
    Shutdown,
}

/// Cheap cloneable sender for feeding the controller from input handlers.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControllerEvent>,
}

impl ControllerHandle {
    pub fn send(&self, event: ControllerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn press(&self, authorized: bool, mode: InputMode) {
        self.send(ControllerEvent::Gesture(GestureEvent::PressStart {
            authorized,
            mode,
        }));
    }

    pub fn moved(&self, rise: f32) {
        self.send(ControllerEvent::Gesture(GestureEvent::Moved { rise }));
    }

    pub fn release(&self) {
        self.send(ControllerEvent::Gesture(GestureEvent::Release));
    }

    pub fn confirm(&self) {
        self.send(ControllerEvent::Gesture(GestureEvent::ConfirmPressed));
    }

    pub fn cancel(&self) {
        self.send(ControllerEvent::Gesture(GestureEvent::CancelPressed));
    }

    pub fn tap(&self, element: impl Into<ElementId>) {
        self.send(ControllerEvent::BubbleTapped {
            element: element.into(),
        });
    }

    pub fn shutdown(&self) {
        self.send(ControllerEvent::Shutdown);
    }
}

pub struct VoiceController {
    settings: VoiceSettings,
    capabilities: Capabilities,
    tuning: GestureTuning,

    session: RecordingSession,
    gesture: GestureState,
    analyzer: Option<LoudnessAnalyzer>,
    ticker: Option<JoinHandle<()>>,
    last_level: u8,

    arbiter: Arc<PlaybackArbiter>,
    speech: Arc<SpeechSynthesisClient>,
    transcriber: Arc<dyn Transcriber>,
    output: Arc<dyn AudioOutput>,
    haptics: Arc<dyn Haptics>,
    metrics: MetricsCollector,

    last_clip: Option<(ElementId, AudioClip)>,
    last_response: Option<(ElementId, String)>,

    event_tx: mpsc::UnboundedSender<ControllerEvent>,
    event_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    ui_tx: mpsc::UnboundedSender<UiUpdate>,
}

impl VoiceController {
    pub fn new(
        platform: VoicePlatform,
        transcriber: Arc<dyn Transcriber>,
        synthesis: Arc<dyn SynthesisTransport>,
        settings: VoiceSettings,
    ) -> (Self, ControllerHandle, mpsc::UnboundedReceiver<UiUpdate>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();

        let (arbiter, mut visuals) = PlaybackArbiter::new();
        {
            let ui_tx = ui_tx.clone();
            tokio::spawn(async move {
                while let Some(update) = visuals.recv().await {
                    if ui_tx.send(UiUpdate::Visual(update)).is_err() {
                        break;
                    }
                }
            });
        }

        let (completion_tx, mut completion_rx) = mpsc::channel(8);
        {
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                while let Some(done) = completion_rx.recv().await {
                    if event_tx
                        .send(ControllerEvent::RecordingComplete(done))
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        let session = RecordingSession::new(
            platform.microphone,
            platform.encoders,
            platform.capabilities,
            &settings,
            completion_tx,
        );
        let speech = Arc::new(SpeechSynthesisClient::new(
            synthesis,
            Arc::clone(&platform.output),
            Arc::clone(&arbiter),
            settings.speech_max_chars,
        ));
        let tuning = GestureTuning {
            commit_delay: Duration::from_millis(settings.press_commit_delay_ms),
            cancel_threshold_px: settings.cancel_threshold_px,
        };

        let controller = Self {
            capabilities: platform.capabilities,
            tuning,
            session,
            gesture: GestureState::default(),
            analyzer: None,
            ticker: None,
            last_level: 1,
            arbiter,
            speech,
            transcriber,
            output: platform.output,
            haptics: platform.haptics,
            metrics: MetricsCollector::new(),
            last_clip: None,
            last_response: None,
            event_tx: event_tx.clone(),
            event_rx,
            ui_tx,
            settings,
        };
        (controller, ControllerHandle { tx: event_tx }, ui_rx)
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Run the event loop until `Shutdown`.
    pub async fn run(mut self) {
        self.emit_state(UiState::Idle);
        log::info!("Voice controller started");

        while let Some(event) = self.event_rx.recv().await {
            match event {
                ControllerEvent::Gesture(ev) => self.handle_gesture(ev),
                ControllerEvent::StreamAcquired { result } => self.handle_acquired(result),
                ControllerEvent::LoudnessTick { session_id } => self.handle_tick(session_id),
                ControllerEvent::SilenceEpisode { session_id } => {
                    if session_id == self.session.session_id() {
                        log::info!("Silence episode; auto-stopping recording");
                        self.stop_recording();
                    }
                }
                ControllerEvent::RecordingComplete(done) => self.handle_completion(done),
                ControllerEvent::TranscriptReady { session_id, result } => {
                    self.handle_transcript(session_id, result)
                }
                ControllerEvent::ResponseRendered { session_id, outcome } => {
                    self.handle_rendered(session_id, outcome)
                }
                ControllerEvent::RestoreIdle { session_id } => {
                    if session_id == self.session.session_id() {
                        self.emit_state(UiState::Idle);
                    }
                }
                ControllerEvent::BubbleTapped { element } => self.handle_tap(element),
                ControllerEvent::Shutdown => {
                    log::info!("Voice controller shutting down");
                    self.stop_monitoring();
                    self.session.cleanup();
                    self.arbiter.stop();
                    break;
                }
            }
        }
    }

    fn handle_gesture(&mut self, event: GestureEvent) {
        let was_canceling = matches!(self.gesture, GestureState::Canceling { .. });
        let (next, effects) = gesture::reduce(&self.gesture, event, &self.tuning);
        let now_canceling = matches!(next, GestureState::Canceling { .. });
        self.gesture = next;

        if now_canceling && !was_canceling {
            self.emit_state(UiState::CancelArmed);
        } else if was_canceling && !now_canceling {
            if matches!(self.gesture, GestureState::Pressed { .. }) {
                self.emit_state(UiState::Recording {
                    level: self.last_level,
                });
            }
        }

        for effect in effects {
            match effect {
                GestureEffect::ScheduleCommit { token, delay } => {
                    let tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(ControllerEvent::Gesture(
                            GestureEvent::CommitDelayElapsed { token },
                        ));
                    });
                }
                GestureEffect::BeginRecording => self.begin_recording(),
                GestureEffect::StopAndDispatch => self.stop_recording(),
                GestureEffect::CancelRecording => self.cancel_recording(),
                GestureEffect::HapticPulse => {
                    if self.capabilities.haptics {
                        self.haptics.pulse(HAPTIC_PULSE);
                    }
                }
            }
        }
    }

    /// Start recording, acquiring the microphone first if no stream is held.
    /// Acquisition runs on its own task and reports back through the event
    /// channel, so the loop keeps serving gesture events while the platform
    /// permission prompt (or device open) is pending.
    fn begin_recording(&mut self) {
        if self.session.has_stream() {
            self.start_recording();
            return;
        }
        self.emit_state(UiState::Acquiring);
        let (microphone, constraints) = self.session.acquisition();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = microphone.acquire(&constraints).await;
            let _ = tx.send(ControllerEvent::StreamAcquired { result });
        });
    }

    fn handle_acquired(&mut self, result: Result<Box<dyn CaptureStream>, AcquisitionError>) {
        match result {
            Ok(stream) => {
                // The stream is kept either way; a press that ended while
                // acquisition was pending just doesn't start recording.
                self.session.attach_stream(stream);
                match self.gesture {
                    GestureState::Pressed { .. } => self.start_recording(),
                    GestureState::Canceling { .. } => {
                        // Still held, cancel armed. Record so a drag back
                        // down resumes normally; the armed state stays on
                        // screen.
                        self.start_recording();
                        self.emit_state(UiState::CancelArmed);
                    }
                    _ => {
                        log::debug!("Press ended during acquisition; holding stream for next start");
                        self.emit_state(UiState::Idle);
                    }
                }
            }
            Err(e) => {
                log::warn!("Microphone acquisition failed: {}", e);
                self.emit_state(UiState::Error {
                    message: e.to_string(),
                });
                self.schedule_restore_idle(self.session.session_id());
            }
        }
    }

    fn start_recording(&mut self) {
        if let Err(e) = self.session.begin() {
            log::warn!("Recording start failed: {}", e);
            self.emit_state(UiState::Error {
                message: e.to_string(),
            });
            self.schedule_restore_idle(self.session.session_id());
            return;
        }
        let session_id = self.session.session_id();
        self.metrics.start_cycle(session_id);
        self.last_level = 1;

        if let Some(stream) = self.session.stream() {
            let mut analyzer = LoudnessAnalyzer::start(
                &self.capabilities,
                stream,
                self.settings.silence_threshold,
                Duration::from_millis(self.settings.silence_timeout_ms),
            );
            if analyzer.is_active() {
                let tx = self.event_tx.clone();
                analyzer.set_silence_callback(move || {
                    let _ = tx.send(ControllerEvent::SilenceEpisode { session_id });
                });
                self.analyzer = Some(analyzer);

                let tx = self.event_tx.clone();
                self.ticker = Some(tokio::spawn(async move {
                    let mut tick = tokio::time::interval(LOUDNESS_TICK);
                    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        tick.tick().await;
                        if tx.send(ControllerEvent::LoudnessTick { session_id }).is_err() {
                            break;
                        }
                    }
                }));
            }
        }
        self.emit_state(UiState::Recording { level: 1 });
    }

    fn handle_tick(&mut self, session_id: Uuid) {
        if session_id != self.session.session_id() {
            return;
        }
        let Some(analyzer) = self.analyzer.as_mut() else {
            return;
        };
        if let Some(frame) = analyzer.sample() {
            self.last_level = frame.level;
            // While the cancel gesture is armed the meter stays hidden.
            if matches!(self.gesture, GestureState::Pressed { .. }) {
                self.emit_state(UiState::Recording { level: frame.level });
            }
        }
    }

    fn stop_recording(&mut self) {
        self.stop_monitoring();
        // A release with nothing recording (acquisition still pending, or it
        // failed) has nothing to stop and must not strand the UI in Stopping.
        if self.session.phase() != SessionPhase::Recording {
            log::debug!("Stop with no active recording ignored");
            return;
        }
        self.session.stop();
        self.emit_state(UiState::Stopping);
    }

    fn cancel_recording(&mut self) {
        self.stop_monitoring();
        self.session.cancel();
        self.metrics.finish(CycleOutcome::Canceled);
        self.emit_state(UiState::Idle);
    }

    fn stop_monitoring(&mut self) {
        if let Some(mut analyzer) = self.analyzer.take() {
            analyzer.stop();
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    fn handle_completion(&mut self, done: RecordingComplete) {
        if done.session_id != self.session.session_id() {
            log::debug!("Dropping completion for stale session {}", done.session_id);
            return;
        }
        self.metrics
            .recording_stopped(done.duration, done.clip.len() as u64);

        let element = format!("user-{}", done.session_id);
        self.last_clip = Some((element.clone(), done.clip.clone()));
        self.emit(UiUpdate::UserBubble { element });

        self.emit_state(UiState::Transcribing);
        self.metrics.transcription_started();
        let transcriber = Arc::clone(&self.transcriber);
        let tx = self.event_tx.clone();
        let session_id = done.session_id;
        tokio::spawn(async move {
            let result = transcriber.transcribe(&done.clip).await;
            let _ = tx.send(ControllerEvent::TranscriptReady { session_id, result });
        });
    }

    fn handle_transcript(
        &mut self,
        session_id: Uuid,
        result: Result<Transcript, TranscriptionError>,
    ) {
        if session_id != self.session.session_id() {
            return;
        }
        let (text, outcome) = match result {
            Ok(Transcript { text: Some(text) }) => {
                self.metrics.transcription_completed(text.chars().count());
                (text, CycleOutcome::Completed)
            }
            Ok(Transcript { text: None }) => {
                log::info!("Service produced no transcript");
                (NO_TRANSCRIPT_MESSAGE.to_string(), CycleOutcome::NoTranscript)
            }
            Err(e) => {
                // The class is logged here; the UI only sees the generic copy.
                log::warn!("Transcription failed: {}", e);
                (ERROR_MESSAGE.to_string(), CycleOutcome::Failed(e.to_string()))
            }
        };

        self.emit_state(UiState::Responding);
        let element = format!("response-{}", session_id);
        self.last_response = Some((element.clone(), text.clone()));

        let typewriter = TypewriterRenderer::new(Duration::from_millis(
            self.settings.typing_interval_ms,
        ));
        let speech = Arc::clone(&self.speech);
        let ui_tx = self.ui_tx.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let (token_tx, mut token_rx) = mpsc::unbounded_channel();
            let forward = {
                let ui_tx = ui_tx.clone();
                tokio::spawn(async move {
                    while let Some(token) = token_rx.recv().await {
                        if ui_tx.send(UiUpdate::ResponseToken(token)).is_err() {
                            break;
                        }
                    }
                })
            };

            let prefetch_text = text.clone();
            let prefetch = move || {
                tokio::spawn(async move {
                    speech.prefetch(&prefetch_text).await;
                });
            };
            typewriter.render(&text, &token_tx, Some(prefetch)).await;
            drop(token_tx);
            let _ = forward.await;

            let _ = event_tx.send(ControllerEvent::ResponseRendered { session_id, outcome });
        });
    }

    fn handle_rendered(&mut self, session_id: Uuid, outcome: CycleOutcome) {
        if session_id != self.session.session_id() {
            return;
        }
        if let Some((element, _)) = &self.last_response {
            self.emit(UiUpdate::ResponseReady {
                element: element.clone(),
            });
        }
        self.metrics.finish(outcome);
        self.schedule_restore_idle(session_id);
    }

    fn schedule_restore_idle(&self, session_id: Uuid) {
        let delay = Duration::from_millis(self.settings.idle_restore_delay_ms);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ControllerEvent::RestoreIdle { session_id });
        });
    }

    fn handle_tap(&mut self, element: ElementId) {
        if let Some((el, clip)) = self.last_clip.as_ref() {
            if *el == element {
                let output = Arc::clone(&self.output);
                let clip = clip.clone();
                if let Err(e) = self.arbiter.play(&element, move || output.play(&clip)) {
                    log::warn!("Clip playback failed: {}", e);
                }
                return;
            }
        }
        if let Some((el, text)) = self.last_response.as_ref() {
            if *el == element {
                if is_sentinel(text) {
                    // Nothing to synthesize; the host plays its local
                    // fallback sound for these.
                    self.emit(UiUpdate::FallbackSound {
                        element: element.clone(),
                    });
                    return;
                }
                let speech = Arc::clone(&self.speech);
                let text = text.clone();
                tokio::spawn(async move {
                    if let Err(e) = speech.speak(&text, &element).await {
                        log::warn!("Speech replay failed: {}", e);
                    }
                });
                return;
            }
        }
        log::debug!("Tap on unknown element ignored");
    }

    fn emit_state(&self, state: UiState) {
        log::debug!("UI state: {:?}", state);
        let _ = self.ui_tx.send(UiUpdate::State(state));
    }

    fn emit(&self, update: UiUpdate) {
        let _ = self.ui_tx.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_state_serializes_as_tagged_union() {
        let json = serde_json::to_string(&UiState::Recording { level: 4 }).unwrap();
        assert_eq!(json, r#"{"status":"recording","level":4}"#);
        let json = serde_json::to_string(&UiState::Idle).unwrap();
        assert_eq!(json, r#"{"status":"idle"}"#);
        let json = serde_json::to_string(&UiState::CancelArmed).unwrap();
        assert_eq!(json, r#"{"status":"cancelArmed"}"#);
    }
}
