//! Incremental text rendering with concurrent synthesis prefetch.
//!
//! Text is emitted token by token at a fixed cadence. An inline markup span
//! (opening delimiter through its matching close) is one atomic token; it is
//! never split mid-animation, so the UI layer can always parse what it has
//! received so far. The synthesis prefetch is kicked off before the first
//! token, so the network round-trip overlaps the typing animation instead of
//! following it.

use std::time::Duration;

use tokio::sync::mpsc;

/// Shown when the service produced no transcript. Rendered like any other
/// text, but never sent to synthesis (a local fallback sound covers taps).
pub const NO_TRANSCRIPT_MESSAGE: &str = "I didn't catch that. Could you try again?";

/// Shown when transcription failed. Same synthesis exemption.
pub const ERROR_MESSAGE: &str = "Something went wrong. Please try again.";

pub fn is_sentinel(text: &str) -> bool {
    text == NO_TRANSCRIPT_MESSAGE || text == ERROR_MESSAGE
}

pub struct TypewriterRenderer {
    interval: Duration,
}

impl TypewriterRenderer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Render `text` into `sink` one token per interval.
    ///
    /// `prefetch` runs synchronously before the first token is emitted
    /// (callers spawn their network work inside it); it is skipped for the
    /// sentinel messages. Rendering never waits on, and is never interrupted
    /// by, whatever `prefetch` started.
    pub async fn render(
        &self,
        text: &str,
        sink: &mpsc::UnboundedSender<String>,
        prefetch: Option<impl FnOnce()>,
    ) {
        if let Some(prefetch) = prefetch {
            if is_sentinel(text) {
                log::debug!("Sentinel message; skipping synthesis prefetch");
            } else {
                prefetch();
            }
        }
        for token in tokenize(text) {
            if sink.send(token).is_err() {
                // UI went away; nothing to animate for.
                return;
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Split text into render tokens: one per character, except inline markup
/// spans (`**…**`, `*…*`, `` `…` ``) which stay whole. An unclosed delimiter
/// is rendered as a plain character.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        let char_len = c.len_utf8();
        let delimiter = match c {
            '*' if rest[char_len..].starts_with('*') => Some("**"),
            '*' => Some("*"),
            '`' => Some("`"),
            _ => None,
        };
        let span = delimiter.and_then(|d| {
            rest[d.len()..]
                .find(d)
                .map(|i| d.len() + i + d.len())
        });
        match span {
            Some(end) => {
                tokens.push(rest[..end].to_string());
                rest = &rest[end..];
            }
            None => {
                tokens.push(rest[..char_len].to_string());
                rest = &rest[char_len..];
            }
        }
    }
    tokens
}
