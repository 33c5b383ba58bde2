//! Output playback accounting for barge-in.
//!
//! When the user interrupts, the speech model must be told how much of the
//! in-flight assistant item was actually heard. That is the wall-clock time
//! since playback started, capped by how much audio the output device has
//! really consumed; audio received but not yet flushed was never heard.

use tokio::time::Instant;

/// Where to cut the interrupted item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    pub item_id: String,
    pub audio_ms: u64,
    /// Received audio that will never be played.
    pub discarded_bytes: u64,
}

#[derive(Debug, Clone)]
struct ActiveItem {
    item_id: String,
    started_at: Option<Instant>,
    received_bytes: u64,
    flushed_bytes: u64,
}

/// Tracks the assistant item currently being played.
#[derive(Debug, Clone)]
pub struct PlaybackTracker {
    bytes_per_ms: u64,
    active: Option<ActiveItem>,
}

impl PlaybackTracker {
    pub fn new(bytes_per_ms: u64) -> Self {
        Self {
            bytes_per_ms: bytes_per_ms.max(1),
            active: None,
        }
    }

    /// Record received audio for `item_id`. A new item id replaces the
    /// previous one.
    pub fn on_audio(&mut self, item_id: &str, bytes: usize) {
        match &mut self.active {
            Some(item) if item.item_id == item_id => item.received_bytes += bytes as u64,
            _ => {
                self.active = Some(ActiveItem {
                    item_id: item_id.to_string(),
                    started_at: None,
                    received_bytes: bytes as u64,
                    flushed_bytes: 0,
                })
            }
        }
    }

    /// The output device began playing. Only the first call counts.
    pub fn on_playback_started(&mut self, now: Instant) {
        if let Some(item) = &mut self.active {
            item.started_at.get_or_insert(now);
        }
    }

    /// The output device consumed `bytes` more audio. Never exceeds what was
    /// received.
    pub fn on_flushed(&mut self, bytes: u64) {
        if let Some(item) = &mut self.active {
            item.flushed_bytes = (item.flushed_bytes + bytes).min(item.received_bytes);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn item_id(&self) -> Option<&str> {
        self.active.as_ref().map(|i| i.item_id.as_str())
    }

    /// Milliseconds actually heard at `now`: elapsed since playback started,
    /// capped by flushed audio. Zero if playback never started.
    pub fn played_ms(&self, now: Instant) -> u64 {
        let Some(item) = &self.active else {
            return 0;
        };
        let Some(started) = item.started_at else {
            return 0;
        };
        let elapsed = now.saturating_duration_since(started).as_millis() as u64;
        let flushed_ms = item.flushed_bytes / self.bytes_per_ms;
        elapsed.min(flushed_ms)
    }

    /// Stop tracking the current item and report where to truncate it.
    pub fn interrupt(&mut self, now: Instant) -> Option<Truncation> {
        let audio_ms = self.played_ms(now);
        let item = self.active.take()?;
        let heard_bytes = audio_ms * self.bytes_per_ms;
        Some(Truncation {
            item_id: item.item_id,
            audio_ms,
            discarded_bytes: item.received_bytes.saturating_sub(heard_bytes),
        })
    }

    /// The response finished normally.
    pub fn finish(&mut self) {
        self.active = None;
    }
}
