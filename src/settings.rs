//! Engine settings, persisted as JSON under the XDG config directory.
//!
//! The silence threshold and timeout were hardcoded constants in earlier
//! builds; they are configuration now so they can be tuned for noisy rooms
//! without a rebuild.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Hard ceiling on a single recording. The watchdog force-stops (not
    /// cancels) at this point so the captured content is still dispatched.
    pub max_recording_ms: u64,

    /// Cadence at which the platform encoder emits fragments.
    pub fragment_interval_ms: u64,

    /// Normalized volume below which a sample counts as silence.
    pub silence_threshold: f32,

    /// Continuous sub-threshold time before a silence episode fires.
    pub silence_timeout_ms: u64,

    /// How long a press must be held before it commits to recording.
    /// Releases inside this window abort the pending start outright.
    pub press_commit_delay_ms: u64,

    /// Upward drag distance (logical px) that arms cancellation.
    pub cancel_threshold_px: f32,

    /// Per-token interval for the typewriter animation.
    pub typing_interval_ms: u64,

    /// Hard cap on text sent to speech synthesis.
    pub speech_max_chars: usize,

    /// Delay after a completed cycle before the idle UI is restored.
    pub idle_restore_delay_ms: u64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            max_recording_ms: 20_000,
            fragment_interval_ms: 100,
            silence_threshold: 0.02,
            silence_timeout_ms: 4_000,
            press_commit_delay_ms: 320,
            cancel_threshold_px: 80.0,
            typing_interval_ms: 120,
            speech_max_chars: 500,
            idle_restore_delay_ms: 3_000,
        }
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join("tally-voice").join(SETTINGS_FILE_NAME))
}

/// Load settings from the default config path, falling back to defaults on
/// any problem. A missing file is not an error.
pub fn load_settings() -> VoiceSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            VoiceSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> VoiceSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<VoiceSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                VoiceSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => VoiceSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            VoiceSettings::default()
        }
    }
}

pub fn save_settings(settings: &VoiceSettings) -> Result<(), String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)
}

pub fn save_settings_to(path: &Path, settings: &VoiceSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: temp file in the same directory, then rename, so a
    // crash mid-write never leaves a corrupt settings.json.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
