//! Single-slot playback arbitration.
//!
//! At most one audio source is audible at a time, process-wide. Every
//! playback entry point routes through [`PlaybackArbiter::play`]; nothing may
//! start audio without first consulting the slot. Visual "playing" updates
//! are emitted on the same call path that mutates the slot, so the indicator
//! and the audible state never diverge for more than one loop turn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};

use crate::error::PlaybackError;
use crate::platform::{ActivePlayback, PlaybackHandle};

/// Identifies the clickable element a playback belongs to (a bubble id).
pub type ElementId = String;

/// Emitted whenever the slot changes, for the UI layer to mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisualUpdate {
    Playing(ElementId),
    Stopped(ElementId),
}

struct Slot {
    element: ElementId,
    handle: Box<dyn PlaybackHandle>,
    /// Guards against a natural-completion signal from an already evicted
    /// playback clearing its successor.
    generation: u64,
    done_tx: Option<oneshot::Sender<()>>,
}

pub struct PlaybackArbiter {
    slot: Mutex<Option<Slot>>,
    generation: AtomicU64,
    visual_tx: mpsc::UnboundedSender<VisualUpdate>,
}

impl PlaybackArbiter {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<VisualUpdate>) {
        let (visual_tx, visual_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                slot: Mutex::new(None),
                generation: AtomicU64::new(0),
                visual_tx,
            }),
            visual_rx,
        )
    }

    /// Request playback for `element`.
    ///
    /// If `element` already occupies the slot this is a toggle: the playback
    /// stops and `start` is never called. Otherwise any previous occupant is
    /// evicted first, then `start` runs to produce the new playback.
    ///
    /// Returns `None` on toggle-off; otherwise a receiver that resolves when
    /// this playback ends for any reason (natural completion, eviction, or
    /// an explicit stop).
    pub fn play(
        self: &Arc<Self>,
        element: &str,
        start: impl FnOnce() -> Result<ActivePlayback, PlaybackError>,
    ) -> Result<Option<oneshot::Receiver<()>>, PlaybackError> {
        {
            let mut slot = self.lock_slot();
            if slot.as_ref().map(|s| s.element.as_str()) == Some(element) {
                let occupant = slot.take();
                drop(slot);
                if let Some(occupant) = occupant {
                    self.retire(occupant, true);
                }
                return Ok(None);
            }
            if let Some(previous) = slot.take() {
                drop(slot);
                self.retire(previous, true);
            }
        }

        let playback = start()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (done_tx, done_rx) = oneshot::channel();
        *self.lock_slot() = Some(Slot {
            element: element.to_string(),
            handle: playback.handle,
            generation,
            done_tx: Some(done_tx),
        });
        let _ = self.visual_tx.send(VisualUpdate::Playing(element.to_string()));
        log::debug!("Playback slot -> {}", element);

        self.spawn_end_watcher(playback.ended, generation);
        Ok(Some(done_rx))
    }

    /// Unconditionally stop whatever is playing and clear the slot.
    pub fn stop(&self) {
        let occupant = self.lock_slot().take();
        if let Some(occupant) = occupant {
            self.retire(occupant, true);
        }
    }

    pub fn active_element(&self) -> Option<ElementId> {
        self.lock_slot().as_ref().map(|s| s.element.clone())
    }

    /// Natural completion: the sink drained on its own, so the handle needs
    /// no stop. Ignored when the slot has since moved on.
    fn spawn_end_watcher(self: &Arc<Self>, ended: oneshot::Receiver<()>, generation: u64) {
        let arbiter = Arc::clone(self);
        tokio::spawn(async move {
            if ended.await.is_ok() {
                let occupant = {
                    let mut slot = arbiter.lock_slot();
                    match slot.as_ref() {
                        Some(s) if s.generation == generation => slot.take(),
                        _ => None,
                    }
                };
                if let Some(occupant) = occupant {
                    log::debug!("Playback ended naturally: {}", occupant.element);
                    arbiter.retire(occupant, false);
                }
            }
        });
    }

    fn retire(&self, mut occupant: Slot, stop_handle: bool) {
        if stop_handle {
            occupant.handle.stop();
        }
        let _ = self
            .visual_tx
            .send(VisualUpdate::Stopped(occupant.element.clone()));
        if let Some(done_tx) = occupant.done_tx.take() {
            let _ = done_tx.send(());
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<Slot>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}
