//! End-to-end capture scenarios against fake platform backends.
//!
//! The controller runs on a paused clock; timers (commit delay, fragment
//! cadence, silence timeout, recording ceiling, typewriter cadence) advance
//! virtually, so 20-second scenarios finish instantly and deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use tally_voice::controller::{ControllerHandle, UiState, UiUpdate, VoiceController, VoicePlatform};
use tally_voice::error::{AcquisitionError, EncodingError, PlaybackError, SynthesisError, TranscriptionError};
use tally_voice::platform::{
    ActivePlayback, AudioClip, AudioOutput, Capabilities, CaptureConstraints, CaptureStream,
    EncodedFragment, EncoderFactory, Haptics, MicrophoneSource, PlaybackHandle, StreamEncoder,
};
use tally_voice::speech::SynthesisTransport;
use tally_voice::transcription::{Transcriber, Transcript};
use tally_voice::{InputMode, VoiceSettings};

// ---------------------------------------------------------------------------
// Fake platform
// ---------------------------------------------------------------------------

struct FakeMicrophone;

#[async_trait]
impl MicrophoneSource for FakeMicrophone {
    async fn acquire(
        &self,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, AcquisitionError> {
        Ok(Box::new(FakeStream {
            tx: broadcast::channel(64).0,
        }))
    }
}

struct DeniedMicrophone;

#[async_trait]
impl MicrophoneSource for DeniedMicrophone {
    async fn acquire(
        &self,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, AcquisitionError> {
        Err(AcquisitionError::PermissionDenied)
    }
}

/// Models a platform permission prompt left open: acquisition succeeds, but
/// only after a long wait.
struct SlowMicrophone {
    delay: Duration,
}

#[async_trait]
impl MicrophoneSource for SlowMicrophone {
    async fn acquire(
        &self,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, AcquisitionError> {
        tokio::time::sleep(self.delay).await;
        Ok(Box::new(FakeStream {
            tx: broadcast::channel(64).0,
        }))
    }
}

struct FakeStream {
    tx: broadcast::Sender<Vec<i16>>,
}

impl CaptureStream for FakeStream {
    fn sample_rate(&self) -> u32 {
        44_100
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<i16>> {
        self.tx.subscribe()
    }

    fn stop_tracks(&mut self) {}
}

/// Emits one fixed-size fragment per timeslice plus a final fragment on
/// finalize, like the platform encoder.
struct FakeEncoderFactory;

impl EncoderFactory for FakeEncoderFactory {
    fn supports(&self, mime_type: &str) -> bool {
        mime_type == "audio/webm;codecs=opus" || mime_type == "audio/wav"
    }

    fn create(
        &self,
        _stream: &dyn CaptureStream,
        _mime_type: &str,
        timeslice: Duration,
    ) -> Box<dyn StreamEncoder> {
        let (tx, rx) = mpsc::channel(512);
        let (finalize_tx, mut finalize_rx) = watch::channel(false);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(timeslice);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = finalize_rx.changed() => {
                        let _ = tx.send(EncodedFragment { data: vec![1u8; 16], last: true }).await;
                        break;
                    }
                    _ = tick.tick() => {
                        if tx.send(EncodedFragment { data: vec![0u8; 64], last: false }).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Box::new(FakeEncoder {
            rx: Some(rx),
            finalize_tx,
        })
    }

    fn assemble(
        &self,
        mime_type: &str,
        _sample_rate: u32,
        fragments: &[EncodedFragment],
    ) -> Result<AudioClip, EncodingError> {
        let bytes: Vec<u8> = fragments.iter().flat_map(|f| f.data.clone()).collect();
        Ok(AudioClip::new(bytes, mime_type))
    }
}

struct FakeEncoder {
    rx: Option<mpsc::Receiver<EncodedFragment>>,
    finalize_tx: watch::Sender<bool>,
}

impl StreamEncoder for FakeEncoder {
    fn fragments(&mut self) -> Option<mpsc::Receiver<EncodedFragment>> {
        self.rx.take()
    }

    fn finalize(&mut self) {
        let _ = self.finalize_tx.send(true);
    }
}

struct NopHandle;

impl PlaybackHandle for NopHandle {
    fn stop(&mut self) {}
}

/// Playbacks end the moment they start.
struct InstantOutput;

impl AudioOutput for InstantOutput {
    fn play(&self, _clip: &AudioClip) -> Result<ActivePlayback, PlaybackError> {
        let (ended_tx, ended_rx) = oneshot::channel();
        let _ = ended_tx.send(());
        Ok(ActivePlayback {
            handle: Box::new(NopHandle),
            ended: ended_rx,
        })
    }
}

struct CountingHaptics {
    pulses: AtomicUsize,
}

impl Haptics for CountingHaptics {
    fn pulse(&self, _duration: Duration) {
        self.pulses.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeTranscriber {
    calls: AtomicUsize,
    clip_sizes: Mutex<Vec<usize>>,
    text: Option<&'static str>,
}

impl FakeTranscriber {
    fn new(text: Option<&'static str>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            clip_sizes: Mutex::new(Vec::new()),
            text,
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, clip: &AudioClip) -> Result<Transcript, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.clip_sizes.lock().unwrap().push(clip.len());
        Ok(Transcript {
            text: self.text.map(str::to_string),
        })
    }
}

struct FakeSynthesis {
    calls: AtomicUsize,
}

#[async_trait]
impl SynthesisTransport for FakeSynthesis {
    async fn synthesize(&self, _text: &str) -> Result<Option<AudioClip>, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(AudioClip::new(vec![0u8; 32], "audio/mpeg")))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    handle: ControllerHandle,
    ui: mpsc::UnboundedReceiver<UiUpdate>,
    transcriber: Arc<FakeTranscriber>,
    synthesis: Arc<FakeSynthesis>,
    haptics: Arc<CountingHaptics>,
}

fn spawn_controller(capabilities: Capabilities, transcript: Option<&'static str>) -> Harness {
    spawn_controller_with_mic(capabilities, transcript, Arc::new(FakeMicrophone))
}

fn spawn_controller_with_mic(
    capabilities: Capabilities,
    transcript: Option<&'static str>,
    microphone: Arc<dyn MicrophoneSource>,
) -> Harness {
    let transcriber = Arc::new(FakeTranscriber::new(transcript));
    let synthesis = Arc::new(FakeSynthesis {
        calls: AtomicUsize::new(0),
    });
    let haptics = Arc::new(CountingHaptics {
        pulses: AtomicUsize::new(0),
    });
    let platform = VoicePlatform {
        capabilities,
        microphone,
        encoders: Arc::new(FakeEncoderFactory),
        output: Arc::new(InstantOutput),
        haptics: Arc::clone(&haptics) as Arc<dyn Haptics>,
    };
    let (controller, handle, ui) = VoiceController::new(
        platform,
        Arc::clone(&transcriber) as Arc<dyn Transcriber>,
        Arc::clone(&synthesis) as Arc<dyn SynthesisTransport>,
        VoiceSettings::default(),
    );
    tokio::spawn(controller.run());
    Harness {
        handle,
        ui,
        transcriber,
        synthesis,
        haptics,
    }
}

/// Receive UI updates until `stop` matches, returning everything seen
/// (including the match). Panics if nothing matches within virtual time.
async fn drain_until(
    ui: &mut mpsc::UnboundedReceiver<UiUpdate>,
    stop: impl Fn(&UiUpdate) -> bool,
) -> Vec<UiUpdate> {
    let mut seen = Vec::new();
    loop {
        let update = tokio::time::timeout(Duration::from_secs(300), ui.recv())
            .await
            .expect("no matching UI update before virtual deadline")
            .expect("controller hung up");
        let done = stop(&update);
        seen.push(update);
        if done {
            return seen;
        }
    }
}

fn is_state(update: &UiUpdate, state: &UiState) -> bool {
    matches!(update, UiUpdate::State(s) if s == state)
}

fn user_bubbles(updates: &[UiUpdate]) -> usize {
    updates
        .iter()
        .filter(|u| matches!(u, UiUpdate::UserBubble { .. }))
        .count()
}

fn response_text(updates: &[UiUpdate]) -> String {
    updates
        .iter()
        .filter_map(|u| match u {
            UiUpdate::ResponseToken(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn press_speak_release_produces_one_transcribed_bubble() {
    let mut h = spawn_controller(Capabilities::standard(), Some("three apples"));

    h.handle.press(true, InputMode::Gesture);
    drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::State(UiState::Recording { .. }))
    })
    .await;

    tokio::time::advance(Duration::from_secs(3)).await;
    h.handle.release();

    let updates = drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::ResponseReady { .. })
    })
    .await;

    assert_eq!(user_bubbles(&updates), 1, "exactly one completion");
    assert_eq!(response_text(&updates), "three apples");
    assert!(updates.iter().any(|u| is_state(u, &UiState::Transcribing)));

    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 1);
    let sizes = h.transcriber.clip_sizes.lock().unwrap();
    assert!(sizes[0] > 0, "non-empty audio clip");

    // Synthesis was prefetched exactly once, concurrently with rendering.
    drain_until(&mut h.ui, |u| is_state(u, &UiState::Idle)).await;
    assert_eq!(h.synthesis.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn drag_up_past_threshold_cancels_without_dispatch() {
    let mut h = spawn_controller(Capabilities::standard(), Some("never seen"));

    h.handle.press(true, InputMode::Gesture);
    drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::State(UiState::Recording { .. }))
    })
    .await;

    tokio::time::advance(Duration::from_secs(1)).await;
    h.handle.moved(100.0);
    drain_until(&mut h.ui, |u| is_state(u, &UiState::CancelArmed)).await;

    h.handle.release();
    let updates = drain_until(&mut h.ui, |u| is_state(u, &UiState::Idle)).await;

    assert_eq!(user_bubbles(&updates), 0);
    // Give any stray late fragment a chance to surface, then confirm silence.
    tokio::time::advance(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;
    while let Ok(u) = h.ui.try_recv() {
        assert!(
            !matches!(u, UiUpdate::UserBubble { .. }),
            "canceled recording must not dispatch"
        );
    }
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn release_before_commit_delay_never_starts_recording() {
    let mut h = spawn_controller(Capabilities::standard(), Some("never seen"));

    h.handle.press(true, InputMode::Gesture);
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_millis(100)).await;
    h.handle.release();
    tokio::task::yield_now().await;

    tokio::time::advance(Duration::from_secs(2)).await;
    tokio::task::yield_now().await;
    while let Ok(u) = h.ui.try_recv() {
        assert!(
            !matches!(u, UiUpdate::State(UiState::Recording { .. })),
            "aborted press must not record"
        );
    }
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn watchdog_forces_stop_at_the_ceiling() {
    // Frequency analysis off, so the silent fake stream cannot auto-stop
    // the recording before the ceiling.
    let capabilities = Capabilities {
        frequency_analysis: false,
        ..Capabilities::standard()
    };
    let mut h = spawn_controller(capabilities, Some("long ramble"));

    h.handle.press(true, InputMode::Gesture);
    // Never released: the 20 s watchdog has to end it.
    let updates = drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::UserBubble { .. })
    })
    .await;

    assert_eq!(user_bubbles(&updates), 1);
    drain_until(&mut h.ui, |u| matches!(u, UiUpdate::ResponseReady { .. })).await;
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn sustained_silence_auto_stops_the_recording() {
    // The fake stream never produces samples, so every analysis frame is
    // silent; the 4 s episode should end the recording well before the
    // 20 s ceiling.
    let mut h = spawn_controller(Capabilities::standard(), Some("quiet"));

    h.handle.press(true, InputMode::Gesture);
    let updates = drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::UserBubble { .. })
    })
    .await;

    assert_eq!(user_bubbles(&updates), 1);
    assert_eq!(
        updates
            .iter()
            .filter(|u| is_state(u, &UiState::Stopping))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn two_button_mode_matches_gesture_outcomes() {
    let mut h = spawn_controller(Capabilities::standard(), Some("four pears"));

    h.handle.press(true, InputMode::Buttons);
    drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::State(UiState::Recording { .. }))
    })
    .await;

    tokio::time::advance(Duration::from_secs(2)).await;
    h.handle.confirm();

    let updates = drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::ResponseReady { .. })
    })
    .await;
    assert_eq!(user_bubbles(&updates), 1);
    assert_eq!(response_text(&updates), "four pears");
}

#[tokio::test(start_paused = true)]
async fn no_transcript_renders_sentinel_and_skips_synthesis() {
    let mut h = spawn_controller(Capabilities::standard(), None);

    h.handle.press(true, InputMode::Gesture);
    drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::State(UiState::Recording { .. }))
    })
    .await;
    tokio::time::advance(Duration::from_secs(2)).await;
    h.handle.release();

    let updates = drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::ResponseReady { .. })
    })
    .await;

    assert_eq!(
        response_text(&updates),
        tally_voice::typewriter::NO_TRANSCRIPT_MESSAGE
    );
    assert_eq!(h.synthesis.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn denied_microphone_recovers_to_idle() {
    let mut h = spawn_controller_with_mic(
        Capabilities::standard(),
        Some("never seen"),
        Arc::new(DeniedMicrophone),
    );

    h.handle.press(true, InputMode::Gesture);
    let mut updates = drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::State(UiState::Error { .. }))
    })
    .await;

    // The user lets go of a press that never started recording.
    h.handle.release();
    updates.extend(drain_until(&mut h.ui, |u| is_state(u, &UiState::Idle)).await);

    assert!(
        !updates.iter().any(|u| is_state(u, &UiState::Stopping)),
        "nothing was recording, so nothing stops"
    );
    assert_eq!(user_bubbles(&updates), 0);
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_gesture_responds_while_acquisition_is_pending() {
    let mut h = spawn_controller_with_mic(
        Capabilities::standard(),
        Some("never seen"),
        Arc::new(SlowMicrophone {
            delay: Duration::from_secs(10),
        }),
    );

    h.handle.press(true, InputMode::Gesture);
    tokio::task::yield_now().await;
    // Commit the press; acquisition starts and hangs on the slow microphone.
    tokio::time::advance(Duration::from_millis(400)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    // Drag past the cancel threshold mid-acquisition. Only yields from here
    // on: the armed state must appear without the clock moving, which it
    // cannot if the loop is parked inside the acquisition await.
    h.handle.moved(100.0);
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    let mut saw_cancel_armed = false;
    while let Ok(u) = h.ui.try_recv() {
        if is_state(&u, &UiState::CancelArmed) {
            saw_cancel_armed = true;
        }
    }
    assert!(
        saw_cancel_armed,
        "cancel gesture must stay responsive during acquisition"
    );

    h.handle.release();
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    // Acquisition eventually completes, but the interaction is over: the
    // stream is held for the next press and nothing is dispatched.
    tokio::time::advance(Duration::from_secs(15)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    while let Ok(u) = h.ui.try_recv() {
        assert!(
            !matches!(u, UiUpdate::UserBubble { .. }),
            "canceled press must not dispatch"
        );
    }
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn haptic_pulse_respects_capability() {
    let mut h = spawn_controller(Capabilities::standard(), Some("buzz"));
    h.handle.press(true, InputMode::Gesture);
    drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::State(UiState::Recording { .. }))
    })
    .await;
    h.handle.moved(100.0);
    drain_until(&mut h.ui, |u| is_state(u, &UiState::CancelArmed)).await;
    assert_eq!(h.haptics.pulses.load(Ordering::SeqCst), 1);

    let capabilities = Capabilities {
        haptics: false,
        ..Capabilities::standard()
    };
    let mut h = spawn_controller(capabilities, Some("no buzz"));
    h.handle.press(true, InputMode::Gesture);
    drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::State(UiState::Recording { .. }))
    })
    .await;
    h.handle.moved(100.0);
    drain_until(&mut h.ui, |u| is_state(u, &UiState::CancelArmed)).await;
    assert_eq!(h.haptics.pulses.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn sentinel_bubble_tap_requests_fallback_sound() {
    let mut h = spawn_controller(Capabilities::standard(), None);

    h.handle.press(true, InputMode::Gesture);
    drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::State(UiState::Recording { .. }))
    })
    .await;
    tokio::time::advance(Duration::from_secs(2)).await;
    h.handle.release();

    let updates = drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::ResponseReady { .. })
    })
    .await;
    let element = updates
        .iter()
        .find_map(|u| match u {
            UiUpdate::ResponseReady { element } => Some(element.clone()),
            _ => None,
        })
        .expect("response element");

    h.handle.tap(element.clone());
    let requested = drain_until(&mut h.ui, |u| {
        matches!(u, UiUpdate::FallbackSound { .. })
    })
    .await;
    assert!(requested.iter().any(|u| matches!(
        u,
        UiUpdate::FallbackSound { element: el } if *el == element
    )));
    // Replaying the sentinel never reaches the synthesis service.
    assert_eq!(h.synthesis.calls.load(Ordering::SeqCst), 0);
}
