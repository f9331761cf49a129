// Track collection: decoded stems plus per-track gain
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audio::decoder::{self, DecodedBuffer};
use crate::error::{PlayerError, Result};

/// Stable 0-based index of a track, assigned from source order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackId(pub usize);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Gain cell shared between a track and its live voice.
///
/// Writes are picked up by the audio thread on its next callback.
#[derive(Debug, Clone)]
pub struct TrackGain(Arc<Mutex<f32>>);

impl TrackGain {
    pub fn new(gain: f32) -> Self {
        Self(Arc::new(Mutex::new(gain.clamp(0.0, 1.0))))
    }

    pub fn get(&self) -> f32 {
        *self.0.lock()
    }

    pub fn set(&self, gain: f32) {
        *self.0.lock() = gain.clamp(0.0, 1.0);
    }
}

/// How the song length is decided from the decoded stems
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "secs", rename_all = "snake_case")]
pub enum DurationPolicy {
    /// Fixed song length in seconds, regardless of buffer lengths
    Fixed(f64),
    /// Truncate to the shortest stem
    Shortest,
    /// Play to the end of the longest stem; shorter stems go silent
    Longest,
    /// Every stem must have the same length
    Strict,
}

impl Default for DurationPolicy {
    fn default() -> Self {
        DurationPolicy::Fixed(18.0)
    }
}

/// Turns a locator into decoded PCM. Runs on a blocking thread.
pub trait BufferDecoder: Send + Sync + 'static {
    fn decode(&self, locator: &str) -> std::result::Result<DecodedBuffer, String>;
}

/// Decodes files from disk with Symphonia
#[derive(Debug, Clone, Default)]
pub struct SymphoniaDecoder {
    /// Resample every stem to this rate (normally the output device rate)
    pub target_sample_rate: Option<u32>,
}

impl BufferDecoder for SymphoniaDecoder {
    fn decode(&self, locator: &str) -> std::result::Result<DecodedBuffer, String> {
        decoder::decode_file(Path::new(locator), self.target_sample_rate)
    }
}

#[derive(Debug)]
pub struct Track {
    id: TrackId,
    locator: String,
    buffer: Arc<DecodedBuffer>,
    muted: bool,
    gain: TrackGain,
}

impl Track {
    pub fn new(id: TrackId, locator: impl Into<String>, buffer: DecodedBuffer) -> Self {
        Self {
            id,
            locator: locator.into(),
            buffer: Arc::new(buffer),
            muted: false,
            gain: TrackGain::new(1.0),
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn buffer(&self) -> &Arc<DecodedBuffer> {
        &self.buffer
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn gain(&self) -> &TrackGain {
        &self.gain
    }
}

/// Read-only view of a track for the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackView {
    pub id: TrackId,
    pub muted: bool,
}

#[derive(Debug)]
pub struct AssetSet {
    tracks: Vec<Track>,
    total_duration: f64,
}

impl AssetSet {
    /// Decode every source concurrently. Any failure fails the whole set.
    pub async fn load<S, D>(sources: &[S], decoder: D, policy: DurationPolicy) -> Result<Self>
    where
        S: AsRef<str>,
        D: BufferDecoder,
    {
        let decoder = Arc::new(decoder);
        let handles: Vec<_> = sources
            .iter()
            .map(|source| {
                let locator = source.as_ref().to_string();
                let decoder = Arc::clone(&decoder);
                tokio::task::spawn_blocking(move || decoder.decode(&locator))
            })
            .collect();

        // Await all of them so no decode outlives a failed load
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .map_err(|e| format!("Task join error: {}", e))
                    .and_then(|r| r),
            );
        }

        let mut tracks = Vec::with_capacity(results.len());
        for (index, (source, result)) in sources.iter().zip(results).enumerate() {
            let locator = source.as_ref();
            let buffer = result.map_err(|reason| PlayerError::Load {
                track: TrackId(index),
                locator: locator.to_string(),
                reason,
            })?;
            tracks.push(Track::new(TrackId(index), locator, buffer));
        }

        let set = Self::from_tracks(tracks, policy)?;
        log::info!(
            "[Assets] Loaded {} tracks, song length {:.2}s",
            set.len(),
            set.total_duration
        );
        Ok(set)
    }

    /// Build a set from already decoded tracks, applying the duration policy
    pub fn from_tracks(tracks: Vec<Track>, policy: DurationPolicy) -> Result<Self> {
        let first = tracks.first().ok_or_else(|| PlayerError::Load {
            track: TrackId(0),
            locator: String::new(),
            reason: "no sources given".to_string(),
        })?;

        let durations = tracks.iter().map(|t| t.buffer.duration_secs());
        let total_duration = match policy {
            DurationPolicy::Fixed(secs) => secs,
            DurationPolicy::Shortest => durations.fold(f64::INFINITY, f64::min),
            DurationPolicy::Longest => durations.fold(0.0, f64::max),
            DurationPolicy::Strict => {
                let expected = first.buffer.duration_secs();
                for track in &tracks {
                    let rate = track.buffer.sample_rate().max(1) as f64;
                    if (track.buffer.duration_secs() - expected).abs() > 1.0 / rate {
                        return Err(PlayerError::Load {
                            track: track.id,
                            locator: track.locator.clone(),
                            reason: format!(
                                "length {:.3}s differs from {:.3}s",
                                track.buffer.duration_secs(),
                                expected
                            ),
                        });
                    }
                }
                expected
            }
        };

        if !total_duration.is_finite() || total_duration <= 0.0 {
            return Err(PlayerError::Load {
                track: first.id,
                locator: first.locator.clone(),
                reason: format!("song length {} is not positive", total_duration),
            });
        }

        Ok(Self {
            tracks,
            total_duration,
        })
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Song length in seconds shared by every track
    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }

    pub fn views(&self) -> Vec<TrackView> {
        self.tracks
            .iter()
            .map(|t| TrackView {
                id: t.id,
                muted: t.muted,
            })
            .collect()
    }

    /// Mute or unmute a track. Takes effect on a running voice immediately.
    pub fn set_muted(&mut self, id: TrackId, muted: bool) {
        match self.tracks.get_mut(id.0) {
            Some(track) => {
                track.muted = muted;
                track.gain.set(if muted { 0.0 } else { 1.0 });
                log::debug!("[Assets] Track {} muted={}", id, muted);
            }
            None => log::warn!("[Assets] Ignoring mute for unknown track {}", id),
        }
    }

    pub fn toggle_muted(&mut self, id: TrackId) {
        if let Some(muted) = self.track(id).map(|t| t.muted) {
            self.set_muted(id, !muted);
        } else {
            log::warn!("[Assets] Ignoring mute for unknown track {}", id);
        }
    }
}
