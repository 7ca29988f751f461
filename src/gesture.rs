//! Press-and-drag gesture state machine.
//!
//! All transitions go through the `reduce()` function, which returns a new
//! state and a list of effects to execute. The controller owns the state and
//! runs the effects; this module stays pure so every interaction sequence can
//! be tested without timers or hardware.
//!
//! A press commits to recording only after a short delay, so stray taps never
//! spin up the microphone. Dragging upward past the cancel threshold flips to
//! Canceling (with a haptic pulse); dragging back flips to Pressed. An
//! explicit confirm/cancel button pair feeds the same reducer and produces
//! identical end states.

use std::time::Duration;
use uuid::Uuid;

/// Which input surface owns the current interaction. The two are mutually
/// exclusive: a button press is ignored while a gesture is live and vice
/// versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Gesture,
    Buttons,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GestureState {
    Idle,
    /// Press received, commit delay running. Release here aborts outright.
    PendingPress { token: Uuid, mode: InputMode },
    /// Committed to recording.
    Pressed { token: Uuid, mode: InputMode },
    /// Drag has crossed the cancel threshold; release now cancels.
    Canceling { token: Uuid, mode: InputMode },
}

impl Default for GestureState {
    fn default() -> Self {
        GestureState::Idle
    }
}

#[derive(Debug, Clone)]
pub enum GestureEvent {
    /// Press started (pointer down, touch start, or record button press).
    /// `authorized` is the caller's permission gate; unauthorized presses
    /// are ignored entirely.
    PressStart { authorized: bool, mode: InputMode },
    /// The scheduled commit delay fired (carries the token to drop stale
    /// timers from an already-released press).
    CommitDelayElapsed { token: Uuid },
    /// Pointer moved; `rise` is the vertical displacement above the press
    /// origin in logical pixels (positive = upward).
    Moved { rise: f32 },
    /// Press released (pointer up / touch end).
    Release,
    /// Two-button mode: the confirm (stop) button.
    ConfirmPressed,
    /// Two-button mode: the explicit cancel button.
    CancelPressed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GestureEffect {
    /// Arm a timer that sends `CommitDelayElapsed { token }` after `delay`.
    ScheduleCommit { token: Uuid, delay: Duration },
    BeginRecording,
    /// Stop recording and let the completion flow dispatch transcription.
    StopAndDispatch,
    /// Cancel recording; nothing is dispatched.
    CancelRecording,
    HapticPulse,
}

/// Tuning knobs, drawn from [`VoiceSettings`](crate::settings::VoiceSettings).
#[derive(Debug, Clone, Copy)]
pub struct GestureTuning {
    pub commit_delay: Duration,
    pub cancel_threshold_px: f32,
}

impl Default for GestureTuning {
    fn default() -> Self {
        Self {
            commit_delay: Duration::from_millis(320),
            cancel_threshold_px: 80.0,
        }
    }
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale tokens
/// - Events from the other input mode are ignored while an interaction is live
pub fn reduce(
    state: &GestureState,
    event: GestureEvent,
    tuning: &GestureTuning,
) -> (GestureState, Vec<GestureEffect>) {
    use GestureEffect::*;
    use GestureEvent::*;
    use GestureState::*;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, PressStart { authorized: false, .. }) => {
            log::debug!("Press ignored: not authorized to record");
            (Idle, vec![])
        }
        (Idle, PressStart { authorized: true, mode }) => {
            let token = Uuid::new_v4();
            (
                PendingPress { token, mode },
                vec![ScheduleCommit {
                    token,
                    delay: tuning.commit_delay,
                }],
            )
        }
        (Idle, _) => (Idle, vec![]),

        // -----------------
        // PendingPress
        // -----------------
        (PendingPress { token, mode }, CommitDelayElapsed { token: t }) if *token == t => (
            Pressed {
                token: *token,
                mode: *mode,
            },
            vec![BeginRecording],
        ),
        (PendingPress { mode, .. }, Release) if *mode == InputMode::Gesture => {
            log::debug!("Released before commit delay; pending start aborted");
            (Idle, vec![])
        }
        (PendingPress { mode, .. }, CancelPressed) if *mode == InputMode::Buttons => {
            (Idle, vec![])
        }
        (s @ PendingPress { .. }, _) => (s.clone(), vec![]),

        // -----------------
        // Pressed
        // -----------------
        (Pressed { token, mode }, Moved { rise })
            if *mode == InputMode::Gesture && rise >= tuning.cancel_threshold_px =>
        {
            (
                Canceling {
                    token: *token,
                    mode: *mode,
                },
                vec![HapticPulse],
            )
        }
        (Pressed { mode, .. }, Release) if *mode == InputMode::Gesture => {
            (Idle, vec![StopAndDispatch])
        }
        (Pressed { mode, .. }, ConfirmPressed) if *mode == InputMode::Buttons => {
            (Idle, vec![StopAndDispatch])
        }
        (Pressed { mode, .. }, CancelPressed) if *mode == InputMode::Buttons => {
            (Idle, vec![CancelRecording])
        }
        (s @ Pressed { .. }, _) => (s.clone(), vec![]),

        // -----------------
        // Canceling
        // -----------------
        (Canceling { token, mode }, Moved { rise }) if rise < tuning.cancel_threshold_px => (
            Pressed {
                token: *token,
                mode: *mode,
            },
            vec![],
        ),
        (Canceling { .. }, Release) => (Idle, vec![CancelRecording]),
        (s @ Canceling { .. }, _) => (s.clone(), vec![]),
    }
}
