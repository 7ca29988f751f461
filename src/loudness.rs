//! Loudness analysis over the live capture feed.
//!
//! Samples frequency energy once per UI frame, derives a quantized loudness
//! level for the level meter, and watches for sustained silence to auto-end
//! a recording when the user stops speaking. Reads the stream's sample feed;
//! never owns the stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::platform::{Capabilities, CaptureStream, SampleReceiver};

/// FFT window size, matching the analysis node's configuration.
pub const FFT_SIZE: usize = 512;

/// Smoothing factor applied to the frequency bins between frames
/// (0.3 = 30% previous frame, 70% current).
pub const SMOOTHING: f32 = 0.3;

/// Bins averaged for the volume estimate: the lower half of the usable
/// spectrum, where speech energy lives.
const LOWER_BIN_COUNT: usize = FFT_SIZE / 4;

/// Divisor mapping the average bin magnitude into [0, 1]. Scaled so that
/// conversational speech sits well above the silence threshold.
const VOLUME_NORMALIZATION: f32 = 8.0;

/// One analysis frame.
#[derive(Debug, Clone, Copy)]
pub struct LoudnessFrame {
    /// Quantized loudness in [1, 10]. Logarithmically compressed so quiet
    /// speech still yields visible feedback.
    pub level: u8,
    /// Normalized volume in [0, 1], pre-compression. This is what the
    /// silence detector compares against the threshold.
    pub normalized: f32,
}

pub struct LoudnessAnalyzer {
    rx: Option<SampleReceiver>,
    fft: Arc<dyn Fft<f32>>,
    window: VecDeque<i16>,
    smoothed: Vec<f32>,
    smoothing_primed: bool,
    threshold: f32,
    timeout: Duration,
    silence_started: Option<Instant>,
    on_silence: Option<Box<dyn FnMut() + Send>>,
}

impl LoudnessAnalyzer {
    /// Attach to a capture stream's sample feed.
    ///
    /// When the platform has no frequency analysis the analyzer starts
    /// inactive instead of failing; callers must tolerate its absence.
    pub fn start(
        capabilities: &Capabilities,
        stream: &dyn CaptureStream,
        threshold: f32,
        timeout: Duration,
    ) -> Self {
        let rx = if capabilities.frequency_analysis {
            Some(stream.subscribe())
        } else {
            log::warn!("Frequency analysis unsupported; loudness analyzer inactive");
            None
        };

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        Self {
            rx,
            fft,
            window: VecDeque::with_capacity(FFT_SIZE),
            smoothed: vec![0.0; FFT_SIZE / 2],
            smoothing_primed: false,
            threshold,
            timeout,
            silence_started: None,
            on_silence: None,
        }
    }

    /// Register the silence callback. Fired exactly once per silence
    /// episode; the episode state resets on firing or when the volume rises
    /// back above the threshold.
    pub fn set_silence_callback(&mut self, callback: impl FnMut() + Send + 'static) {
        self.on_silence = Some(Box::new(callback));
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }

    /// Run one analysis frame. Call once per animation frame while the
    /// recording is live. Returns `None` when inactive.
    pub fn sample(&mut self) -> Option<LoudnessFrame> {
        let rx = self.rx.as_mut()?;
        drain_into_window(rx, &mut self.window);

        let magnitudes = self.compute_magnitudes();
        self.apply_smoothing(&magnitudes);

        let avg: f32 =
            self.smoothed[..LOWER_BIN_COUNT].iter().sum::<f32>() / LOWER_BIN_COUNT as f32;
        let normalized = (avg / VOLUME_NORMALIZATION).min(1.0);
        let level = quantize_level(normalized);

        self.track_silence(normalized);

        Some(LoudnessFrame { level, normalized })
    }

    /// Halt sampling and release the feed subscription. Safe to call
    /// repeatedly.
    pub fn stop(&mut self) {
        self.rx = None;
        self.window.clear();
        self.silence_started = None;
    }

    fn compute_magnitudes(&self) -> Vec<f32> {
        let mut buffer = vec![Complex { re: 0.0f32, im: 0.0f32 }; FFT_SIZE];
        let offset = FFT_SIZE - self.window.len();
        for (i, sample) in self.window.iter().enumerate() {
            buffer[offset + i].re = *sample as f32 / i16::MAX as f32;
        }

        self.fft.process(&mut buffer);

        buffer[..FFT_SIZE / 2].iter().map(|c| c.norm()).collect()
    }

    fn apply_smoothing(&mut self, magnitudes: &[f32]) {
        if !self.smoothing_primed {
            self.smoothed.copy_from_slice(magnitudes);
            self.smoothing_primed = true;
            return;
        }
        for (prev, current) in self.smoothed.iter_mut().zip(magnitudes) {
            *prev = SMOOTHING * *prev + (1.0 - SMOOTHING) * current;
        }
    }

    fn track_silence(&mut self, normalized: f32) {
        if normalized >= self.threshold {
            self.silence_started = None;
            return;
        }

        match self.silence_started {
            None => self.silence_started = Some(Instant::now()),
            Some(started) => {
                if started.elapsed() >= self.timeout {
                    log::info!(
                        "Silence episode reached {:?}; firing auto-stop callback",
                        self.timeout
                    );
                    self.silence_started = None;
                    if let Some(cb) = self.on_silence.as_mut() {
                        cb();
                    }
                }
            }
        }
    }
}

fn drain_into_window(rx: &mut SampleReceiver, window: &mut VecDeque<i16>) {
    loop {
        match rx.try_recv() {
            Ok(chunk) => {
                for sample in chunk {
                    if window.len() == FFT_SIZE {
                        window.pop_front();
                    }
                    window.push_back(sample);
                }
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

/// Map a normalized volume to a level in [1, 10] with logarithmic
/// compression, compensating non-linear loudness perception.
pub fn quantize_level(normalized: f32) -> u8 {
    let compressed = (1.0 + 9.0 * normalized.clamp(0.0, 1.0)).log10();
    let level = 1.0 + (compressed * 9.0).round();
    (level as u8).clamp(1, 10)
}
