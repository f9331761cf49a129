// Player facade
// Wires assets, transport, cursor and seek together behind the command and
// observable surface the presentation layer uses.

use crate::assets::{AssetSet, TrackId, TrackView};
use crate::cursor::{CursorClock, CursorSample};
use crate::error::{PlayerError, Result};
use crate::seek::{SeekController, TrackArea};
use crate::settings::PlayerSettings;
use crate::transport::{AudioBackend, Phase, SeekPosition, Transport};

pub struct Player<B: AudioBackend> {
    assets: Option<AssetSet>,
    transport: Transport<B>,
    cursor: CursorClock,
    seek: SeekController,
    loop_on_start: bool,
}

impl<B: AudioBackend> Player<B> {
    /// A player with no assets yet; playback commands fail with `NotReady`
    /// until [`Player::attach`] is called.
    pub fn new(backend: B, settings: &PlayerSettings) -> Self {
        Self {
            assets: None,
            transport: Transport::new(backend, settings.transport.start_lead_secs()),
            cursor: CursorClock::new(),
            seek: SeekController::new(settings.track_area),
            loop_on_start: settings.transport.loop_on_start,
        }
    }

    /// Hand over the loaded track set, starting from the top of the song
    pub fn attach(&mut self, assets: AssetSet) {
        self.transport.reset();
        self.seek.cancel_drag();
        self.cursor.cancel();
        if self.loop_on_start && !self.transport.is_looping() {
            self.transport.toggle_loop(&assets);
        }
        self.assets = Some(assets);
    }

    pub fn is_ready(&self) -> bool {
        self.assets.is_some()
    }

    pub fn assets(&self) -> Option<&AssetSet> {
        self.assets.as_ref()
    }

    pub fn transport(&self) -> &Transport<B> {
        &self.transport
    }

    // ===== Observables =====

    pub fn phase(&self) -> Phase {
        self.transport.phase()
    }

    pub fn is_looping(&self) -> bool {
        self.transport.is_looping()
    }

    /// Playhead in [0, 1] as last drawn
    pub fn cursor_position(&self) -> f64 {
        self.cursor.position()
    }

    pub fn is_dragging(&self) -> bool {
        self.seek.is_dragging()
    }

    pub fn tracks(&self) -> Vec<TrackView> {
        self.assets.as_ref().map(AssetSet::views).unwrap_or_default()
    }

    /// Song time in seconds
    pub fn elapsed(&self) -> f64 {
        self.transport.elapsed()
    }

    pub fn total_duration(&self) -> Option<f64> {
        self.assets.as_ref().map(AssetSet::total_duration)
    }

    // ===== Commands =====

    pub fn play(&mut self) -> Result<()> {
        let assets = self.assets.as_ref().ok_or(PlayerError::NotReady)?;
        self.transport.play(assets)?;
        self.cursor.start();
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.assets.as_ref().ok_or(PlayerError::NotReady)?;
        self.transport.stop();
        self.cursor.cancel();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        let assets = self.assets.as_ref().ok_or(PlayerError::NotReady)?;
        if self.transport.phase() == Phase::Playing {
            self.transport.pause(assets);
            self.cursor.cancel();
        }
        Ok(())
    }

    pub fn toggle_loop(&mut self) -> Result<()> {
        let assets = self.assets.as_ref().ok_or(PlayerError::NotReady)?;
        self.transport.toggle_loop(assets);
        Ok(())
    }

    pub fn toggle_mute(&mut self, track: TrackId) -> Result<()> {
        let assets = self.assets.as_mut().ok_or(PlayerError::NotReady)?;
        assets.toggle_muted(track);
        Ok(())
    }

    /// Seek to an exact position outside of a drag gesture
    pub fn seek_to(&mut self, position: f64) -> Result<()> {
        let position = SeekPosition::new(position)?;
        let assets = self.assets.as_ref().ok_or(PlayerError::NotReady)?;
        let result = self.transport.seek(assets, position);
        if self.transport.phase() != Phase::Playing {
            // Redraw the frozen playhead
            self.cursor.cancel();
        }
        result
    }

    pub fn set_track_area(&mut self, area: TrackArea) {
        self.seek.set_track_area(area);
    }

    pub fn begin_drag(&mut self, pointer_x: f64) {
        self.seek.begin_drag(pointer_x);
    }

    pub fn update_drag(&mut self, pointer_x: f64) {
        self.seek.update_drag(pointer_x);
    }

    /// Release the playhead. Commits the seek; the phase is left as it was.
    pub fn end_drag(&mut self) -> Result<Option<SeekPosition>> {
        let Some(assets) = self.assets.as_ref() else {
            self.seek.cancel_drag();
            return Err(PlayerError::NotReady);
        };
        let committed = self.seek.end_drag(&mut self.transport, assets);
        if self.cursor.is_scheduled() && self.transport.phase() != Phase::Playing {
            // The restart after the seek failed
            self.cursor.cancel();
        }
        committed
    }

    /// One render frame; returns a new playhead sample when there is one
    pub fn tick(&mut self) -> Option<CursorSample> {
        let assets = self.assets.as_ref()?;
        self.cursor
            .tick(&mut self.transport, assets, self.seek.pending_position())
    }
}
