//! Per-cycle diagnostics.
//!
//! Tracks how long each voice cycle spends recording and transcribing, how
//! big the captured clip was, and how the cycle ended. Bounded history,
//! never on the hot path.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

const MAX_CYCLE_HISTORY: usize = 50;

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CycleOutcome {
    Completed,
    Canceled,
    NoTranscript,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleMetrics {
    pub cycle_id: String,
    pub recording_duration_ms: u64,
    pub clip_size_bytes: u64,
    pub transcription_duration_ms: u64,
    pub transcript_length_chars: u64,
    pub total_cycle_ms: u64,
    pub outcome: CycleOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_cycles: u64,
    pub completed_cycles: u64,
    pub avg_recording_duration_ms: u64,
    pub avg_transcription_duration_ms: u64,
}

struct CycleInProgress {
    cycle_id: Uuid,
    started_at: Instant,
    recording_duration: Option<Duration>,
    clip_size: u64,
    transcription_started: Option<Instant>,
    transcription_duration: Option<Duration>,
    transcript_length: usize,
}

#[derive(Default)]
pub struct MetricsCollector {
    history: VecDeque<CycleMetrics>,
    current: Option<CycleInProgress>,
    total_cycles: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a cycle. An unfinished previous cycle is closed out as
    /// failed; that indicates a controller bug, not a user action.
    pub fn start_cycle(&mut self, cycle_id: Uuid) {
        if self.current.is_some() {
            log::warn!("Metrics: cycle {} started over an unfinished cycle", cycle_id);
            self.finish(CycleOutcome::Failed("superseded by new cycle".into()));
        }
        self.current = Some(CycleInProgress {
            cycle_id,
            started_at: Instant::now(),
            recording_duration: None,
            clip_size: 0,
            transcription_started: None,
            transcription_duration: None,
            transcript_length: 0,
        });
        self.total_cycles += 1;
    }

    pub fn recording_stopped(&mut self, duration: Duration, clip_size_bytes: u64) {
        if let Some(cycle) = self.current.as_mut() {
            cycle.recording_duration = Some(duration);
            cycle.clip_size = clip_size_bytes;
        }
    }

    pub fn transcription_started(&mut self) {
        if let Some(cycle) = self.current.as_mut() {
            cycle.transcription_started = Some(Instant::now());
        }
    }

    pub fn transcription_completed(&mut self, transcript_len: usize) {
        if let Some(cycle) = self.current.as_mut() {
            cycle.transcription_duration = cycle.transcription_started.map(|t| t.elapsed());
            cycle.transcript_length = transcript_len;
        }
    }

    pub fn finish(&mut self, outcome: CycleOutcome) {
        let Some(cycle) = self.current.take() else {
            return;
        };
        let metrics = CycleMetrics {
            cycle_id: cycle.cycle_id.to_string(),
            recording_duration_ms: millis(cycle.recording_duration),
            clip_size_bytes: cycle.clip_size,
            transcription_duration_ms: millis(cycle.transcription_duration),
            transcript_length_chars: cycle.transcript_length as u64,
            total_cycle_ms: cycle.started_at.elapsed().as_millis() as u64,
            outcome,
        };
        log::info!(
            "Cycle {} ended: {:?}, record {}ms, transcribe {}ms",
            metrics.cycle_id,
            metrics.outcome,
            metrics.recording_duration_ms,
            metrics.transcription_duration_ms
        );
        if self.history.len() == MAX_CYCLE_HISTORY {
            self.history.pop_back();
        }
        self.history.push_front(metrics);
    }

    pub fn recent_cycles(&self) -> impl Iterator<Item = &CycleMetrics> {
        self.history.iter()
    }

    pub fn summary(&self) -> MetricsSummary {
        let completed: Vec<&CycleMetrics> = self
            .history
            .iter()
            .filter(|c| c.outcome == CycleOutcome::Completed)
            .collect();
        MetricsSummary {
            total_cycles: self.total_cycles,
            completed_cycles: completed.len() as u64,
            avg_recording_duration_ms: avg(completed.iter().map(|c| c.recording_duration_ms)),
            avg_transcription_duration_ms: avg(
                completed.iter().map(|c| c.transcription_duration_ms),
            ),
        }
    }
}

fn millis(d: Option<Duration>) -> u64 {
    d.map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn avg(values: impl Iterator<Item = u64>) -> u64 {
    let (sum, count) = values.fold((0u64, 0u64), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0
    } else {
        sum / count
    }
}
