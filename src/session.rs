//! Recording session lifecycle.
//!
//! One session owns the capture stream and the platform encoder for the
//! duration of a recording. Fragments are collected on a background task and
//! assembled into an immutable clip when the encoder finalizes; completion is
//! delivered over a channel so the controller never blocks on assembly.
//!
//! Staleness rule: every start bumps a session epoch, and `cancel()` bumps it
//! again. The collector re-checks the epoch before dispatching a completion,
//! so an encoder's final fragment arriving after a cancel is swallowed
//! instead of dispatched. No listener detach/restore dance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AcquisitionError;
use crate::platform::{
    AudioClip, Capabilities, CaptureConstraints, CaptureStream, EncodedFragment, EncoderFactory,
    MicrophoneSource, RenderContext, StreamEncoder,
};
use crate::settings::VoiceSettings;

/// Encoding candidates tried in order on standard render contexts.
const STANDARD_CANDIDATES: &[&str] = &[
    "audio/webm;codecs=opus",
    "audio/webm",
    "audio/ogg;codecs=opus",
    "audio/wav",
];

/// Candidates for constrained/legacy contexts, ordered for compatibility
/// rather than compression.
const CONSTRAINED_CANDIDATES: &[&str] = &[
    "audio/mp4",
    "audio/mp4;codecs=mp4a.40.2",
    "audio/aac",
    "audio/wav",
];

/// Used when no candidate is accepted. Negotiation never fails outright.
const FALLBACK_MIME: &str = "audio/wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Acquiring,
    Recording,
    Stopping,
    Canceling,
}

/// Delivered once per successfully stopped recording.
#[derive(Debug, Clone)]
pub struct RecordingComplete {
    pub session_id: Uuid,
    pub clip: AudioClip,
    pub mime_type: String,
    pub duration: Duration,
}

pub struct RecordingSession {
    microphone: Arc<dyn MicrophoneSource>,
    encoders: Arc<dyn EncoderFactory>,
    capabilities: Capabilities,
    max_duration: Duration,
    fragment_interval: Duration,

    phase: Arc<Mutex<SessionPhase>>,
    /// Bumped on every start and every cancel. Completions carrying a stale
    /// epoch are dropped by the collector.
    epoch: Arc<AtomicU64>,

    stream: Option<Box<dyn CaptureStream>>,
    encoder: Arc<Mutex<Option<Box<dyn StreamEncoder>>>>,
    watchdog: Option<JoinHandle<()>>,
    collector: Option<JoinHandle<()>>,

    session_id: Uuid,
    mime_type: String,
    completion_tx: mpsc::Sender<RecordingComplete>,
}

impl RecordingSession {
    pub fn new(
        microphone: Arc<dyn MicrophoneSource>,
        encoders: Arc<dyn EncoderFactory>,
        capabilities: Capabilities,
        settings: &VoiceSettings,
        completion_tx: mpsc::Sender<RecordingComplete>,
    ) -> Self {
        Self {
            microphone,
            encoders,
            capabilities,
            max_duration: Duration::from_millis(settings.max_recording_ms),
            fragment_interval: Duration::from_millis(settings.fragment_interval_ms),
            phase: Arc::new(Mutex::new(SessionPhase::Idle)),
            epoch: Arc::new(AtomicU64::new(0)),
            stream: None,
            encoder: Arc::new(Mutex::new(None)),
            watchdog: None,
            collector: None,
            session_id: Uuid::nil(),
            mime_type: FALLBACK_MIME.to_string(),
            completion_tx,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// The live stream, if acquired. The loudness analyzer subscribes
    /// through this; it never owns the stream.
    pub fn stream(&self) -> Option<&dyn CaptureStream> {
        self.stream.as_deref()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// The microphone seam and the context-appropriate constraints, for
    /// acquiring a stream off the caller's loop. Pair with
    /// [`attach_stream`](Self::attach_stream).
    pub fn acquisition(&self) -> (Arc<dyn MicrophoneSource>, CaptureConstraints) {
        (
            Arc::clone(&self.microphone),
            CaptureConstraints::for_context(self.capabilities.render_context),
        )
    }

    /// Adopt an externally acquired stream. The previous stream, if any, is
    /// released first.
    pub fn attach_stream(&mut self, stream: Box<dyn CaptureStream>) {
        log::info!("Microphone acquired at {} Hz", stream.sample_rate());
        if let Some(mut old) = self.stream.replace(stream) {
            old.stop_tracks();
        }
    }

    /// Acquire the microphone with context-appropriate constraints. A no-op
    /// when a stream is already held.
    pub async fn initialize(&mut self) -> Result<(), AcquisitionError> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.set_phase(SessionPhase::Acquiring);
        let constraints = CaptureConstraints::for_context(self.capabilities.render_context);
        match self.microphone.acquire(&constraints).await {
            Ok(stream) => {
                self.attach_stream(stream);
                self.set_phase(SessionPhase::Idle);
                Ok(())
            }
            Err(e) => {
                log::warn!("Microphone acquisition failed: {}", e);
                self.set_phase(SessionPhase::Idle);
                Err(e)
            }
        }
    }

    /// Begin recording. Initializes lazily if needed. A re-entrant call
    /// while already recording is a no-op.
    pub async fn start(&mut self) -> Result<(), AcquisitionError> {
        if self.phase() == SessionPhase::Recording {
            log::debug!("start() while recording ignored");
            return Ok(());
        }
        self.initialize().await?;
        self.begin()
    }

    /// Begin recording on an already-held stream, without awaiting. Errors
    /// when no stream is attached. A re-entrant call while already recording
    /// is a no-op.
    pub fn begin(&mut self) -> Result<(), AcquisitionError> {
        if self.phase() == SessionPhase::Recording {
            log::debug!("begin() while recording ignored");
            return Ok(());
        }
        let stream = match self.stream.as_deref() {
            Some(s) => s,
            None => return Err(AcquisitionError::Failed("no stream attached".into())),
        };

        self.mime_type = negotiate_mime(self.encoders.as_ref(), self.capabilities.render_context);
        self.session_id = Uuid::new_v4();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let sample_rate = stream.sample_rate();

        let mut encoder = self
            .encoders
            .create(stream, &self.mime_type, self.fragment_interval);
        let fragments = match encoder.fragments() {
            Some(rx) => rx,
            None => {
                return Err(AcquisitionError::Failed(
                    "encoder produced no fragment channel".into(),
                ))
            }
        };
        *lock(&self.encoder) = Some(encoder);

        log::info!(
            "Recording started: session={} mime={} epoch={}",
            self.session_id,
            self.mime_type,
            epoch
        );

        self.collector = Some(spawn_collector(CollectorContext {
            session_id: self.session_id,
            mime_type: self.mime_type.clone(),
            sample_rate,
            started_at: Instant::now(),
            epoch_at_start: epoch,
            epoch: Arc::clone(&self.epoch),
            phase: Arc::clone(&self.phase),
            encoders: Arc::clone(&self.encoders),
            completion_tx: self.completion_tx.clone(),
            fragments,
        }));
        self.watchdog = Some(spawn_watchdog(
            self.max_duration,
            epoch,
            Arc::clone(&self.epoch),
            Arc::clone(&self.phase),
            Arc::clone(&self.encoder),
        ));
        self.set_phase(SessionPhase::Recording);
        Ok(())
    }

    /// Finalize the encoder and let the collector dispatch the completion
    /// once the final fragment lands. No-op while idle.
    pub fn stop(&mut self) {
        if self.phase() != SessionPhase::Recording {
            return;
        }
        self.set_phase(SessionPhase::Stopping);
        self.disarm_watchdog();
        self.finalize_encoder();
    }

    /// Like `stop()`, but the completion is suppressed and buffered data is
    /// discarded. Best effort: the hardware cannot be halted instantly, so a
    /// late final fragment is dropped by the epoch check instead.
    pub fn cancel(&mut self) {
        match self.phase() {
            SessionPhase::Recording | SessionPhase::Stopping => {}
            _ => return,
        }
        self.set_phase(SessionPhase::Canceling);
        // Invalidate the in-flight epoch before finalizing, so the final
        // fragment (whenever it arrives) assembles into nothing.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.disarm_watchdog();
        self.finalize_encoder();
        log::info!("Recording canceled: session={}", self.session_id);
    }

    /// Release everything: watchdog, encoder, hardware tracks. Idempotent in
    /// any phase.
    pub fn cleanup(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.disarm_watchdog();
        self.finalize_encoder();
        if let Some(collector) = self.collector.take() {
            collector.abort();
        }
        lock(&self.encoder).take();
        if let Some(mut stream) = self.stream.take() {
            stream.stop_tracks();
        }
        self.set_phase(SessionPhase::Idle);
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    fn disarm_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }

    fn finalize_encoder(&self) {
        if let Some(encoder) = lock(&self.encoder).as_mut() {
            encoder.finalize();
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Pick the first candidate the platform accepts, falling back to the
/// hardcoded default. Never fails.
fn negotiate_mime(encoders: &dyn EncoderFactory, ctx: RenderContext) -> String {
    let candidates = match ctx {
        RenderContext::Standard => STANDARD_CANDIDATES,
        RenderContext::Constrained => CONSTRAINED_CANDIDATES,
    };
    for candidate in candidates {
        if encoders.supports(candidate) {
            return (*candidate).to_string();
        }
    }
    log::warn!("No encoding candidate accepted; falling back to {}", FALLBACK_MIME);
    FALLBACK_MIME.to_string()
}

struct CollectorContext {
    session_id: Uuid,
    mime_type: String,
    sample_rate: u32,
    started_at: Instant,
    epoch_at_start: u64,
    epoch: Arc<AtomicU64>,
    phase: Arc<Mutex<SessionPhase>>,
    encoders: Arc<dyn EncoderFactory>,
    completion_tx: mpsc::Sender<RecordingComplete>,
    fragments: mpsc::Receiver<EncodedFragment>,
}

fn spawn_collector(mut ctx: CollectorContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        let mut finalized = false;
        while let Some(fragment) = ctx.fragments.recv().await {
            let last = fragment.last;
            buffer.push(fragment);
            if last {
                finalized = true;
                break;
            }
        }
        let duration = ctx.started_at.elapsed();
        *ctx.phase.lock().unwrap_or_else(|e| e.into_inner()) = SessionPhase::Idle;

        if !finalized {
            // Mid-recording encoder failure. Not retried; the session must
            // be reinitialized by the caller.
            log::error!(
                "Encoder stream closed before finalizing: session={}",
                ctx.session_id
            );
            return;
        }
        if ctx.epoch.load(Ordering::SeqCst) != ctx.epoch_at_start {
            log::debug!(
                "Dropping stale completion: session={} (canceled)",
                ctx.session_id
            );
            return;
        }

        match ctx
            .encoders
            .assemble(&ctx.mime_type, ctx.sample_rate, &buffer)
        {
            Ok(clip) => {
                log::info!(
                    "Recording complete: session={} bytes={} duration={:?}",
                    ctx.session_id,
                    clip.len(),
                    duration
                );
                let _ = ctx
                    .completion_tx
                    .send(RecordingComplete {
                        session_id: ctx.session_id,
                        clip,
                        mime_type: ctx.mime_type,
                        duration,
                    })
                    .await;
            }
            Err(e) => {
                log::error!("Clip assembly failed: session={}: {}", ctx.session_id, e);
            }
        }
    })
}

/// Force-stops (not cancels) at the recording ceiling, so content captured
/// up to the ceiling is still dispatched.
fn spawn_watchdog(
    max_duration: Duration,
    epoch_at_start: u64,
    epoch: Arc<AtomicU64>,
    phase: Arc<Mutex<SessionPhase>>,
    encoder: Arc<Mutex<Option<Box<dyn StreamEncoder>>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(max_duration).await;
        if epoch.load(Ordering::SeqCst) != epoch_at_start {
            return;
        }
        log::info!("Recording ceiling reached ({:?}); forcing stop", max_duration);
        *phase.lock().unwrap_or_else(|e| e.into_inner()) = SessionPhase::Stopping;
        if let Some(encoder) = encoder.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            encoder.finalize();
        }
    })
}
