// Playback transport
// One clock (origin + offset) shared by every track; voices are started,
// stopped and repositioned only as a group.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::assets::{AssetSet, Track, TrackGain, TrackId};
use crate::error::{PlayerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Playing,
    Paused,
}

/// Where and when a voice should start
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceStart {
    /// Seconds into the song
    pub offset: f64,
    /// Hardware clock time at which the first frame is heard
    pub at: f64,
    pub looping: bool,
    /// Song length; the voice ends (or wraps) here
    pub end: f64,
}

/// A live playback of one track
pub trait Voice {
    fn stop(&mut self);
    fn set_looping(&mut self, looping: bool);
}

/// The audio hardware as seen by the transport.
///
/// `now` is read, never waited on. Voices started with the same `at`
/// must begin on the same output frame. A voice that cannot be scheduled
/// is an error, never a silent drop.
pub trait AudioBackend {
    type Voice: Voice;

    /// Hardware clock in seconds
    fn now(&self) -> f64;

    fn start_voice(&mut self, track: &Track, start: VoiceStart) -> Result<Self::Voice>;
}

/// Normalized seek target in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct SeekPosition(f64);

impl SeekPosition {
    pub fn new(position: f64) -> Result<Self> {
        if (0.0..=1.0).contains(&position) {
            Ok(Self(position))
        } else {
            Err(PlayerError::InvalidSeek(position))
        }
    }

    /// Clamp into range; NaN maps to the start
    pub fn clamped(position: f64) -> Self {
        if position.is_nan() {
            return Self(0.0);
        }
        Self(position.clamp(0.0, 1.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportState {
    pub phase: Phase,
    /// Hardware time at the last (re)start
    pub origin_time: f64,
    /// Song position at `origin_time`
    pub playback_offset: f64,
    pub looping: bool,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            phase: Phase::Stopped,
            origin_time: 0.0,
            playback_offset: 0.0,
            looping: false,
        }
    }
}

impl TransportState {
    /// Song time at hardware time `now`
    pub fn elapsed_at(&self, now: f64) -> f64 {
        match self.phase {
            // Voices scheduled in the future have not advanced yet
            Phase::Playing => self.playback_offset + (now - self.origin_time).max(0.0),
            Phase::Stopped | Phase::Paused => self.playback_offset,
        }
    }
}

/// Bring an elapsed time back into `[0, total]`
fn fold_elapsed(elapsed: f64, total: f64, looping: bool) -> f64 {
    if looping {
        elapsed.rem_euclid(total)
    } else {
        elapsed.clamp(0.0, total)
    }
}

/// Live voices of the current run, keyed by track
struct ActiveSession<V: Voice> {
    voices: BTreeMap<TrackId, V>,
}

impl<V: Voice> ActiveSession<V> {
    /// Start one voice per track, or none: voices already started are
    /// dropped (and so stopped) when a later one fails.
    fn start<B>(backend: &mut B, assets: &AssetSet, start: VoiceStart) -> Result<Self>
    where
        B: AudioBackend<Voice = V>,
    {
        let voices = assets
            .tracks()
            .iter()
            .map(|track| -> Result<(TrackId, V)> {
                Ok((track.id(), backend.start_voice(track, start)?))
            })
            .collect::<Result<_>>()?;
        Ok(Self { voices })
    }

    fn set_looping(&mut self, looping: bool) {
        for voice in self.voices.values_mut() {
            voice.set_looping(looping);
        }
    }

    fn stop(mut self) {
        for voice in self.voices.values_mut() {
            voice.stop();
        }
    }
}

pub struct Transport<B: AudioBackend> {
    backend: B,
    state: TransportState,
    session: Option<ActiveSession<B::Voice>>,
    /// How far ahead voices are scheduled so they share a start frame
    start_lead: f64,
}

impl<B: AudioBackend> Transport<B> {
    pub fn new(backend: B, start_lead: f64) -> Self {
        Self {
            backend,
            state: TransportState::default(),
            session: None,
            start_lead: start_lead.max(0.0),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn is_looping(&self) -> bool {
        self.state.looping
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn now(&self) -> f64 {
        self.backend.now()
    }

    /// Canonical song time in seconds
    pub fn elapsed(&self) -> f64 {
        self.state.elapsed_at(self.backend.now())
    }

    /// Playhead in [0, 1]: wrapped when looping, clamped otherwise
    pub fn position(&self, total: f64) -> f64 {
        if total <= 0.0 {
            return 0.0;
        }
        let elapsed = self.elapsed();
        if self.state.looping {
            (elapsed / total).rem_euclid(1.0)
        } else {
            (elapsed / total).clamp(0.0, 1.0)
        }
    }

    /// Start every track from the stored offset. On failure nothing is
    /// left sounding and the phase is unchanged.
    pub fn play(&mut self, assets: &AssetSet) -> Result<()> {
        match self.state.phase {
            Phase::Playing => {
                log::debug!("[Transport] play ignored, already playing");
                return Ok(());
            }
            Phase::Stopped if self.state.playback_offset >= assets.total_duration() => {
                // Finished run; start over
                self.state.playback_offset = 0.0;
            }
            Phase::Stopped | Phase::Paused => {}
        }

        self.start_session(assets)?;
        self.state.phase = Phase::Playing;
        log::debug!(
            "[Transport] Playing {} tracks from {:.3}s",
            assets.len(),
            self.state.playback_offset
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.state.phase == Phase::Stopped {
            return;
        }
        self.teardown();
        self.state.phase = Phase::Stopped;
        self.state.playback_offset = 0.0;
        log::debug!("[Transport] Stopped");
    }

    pub fn pause(&mut self, assets: &AssetSet) {
        if self.state.phase != Phase::Playing {
            log::debug!("[Transport] pause ignored in {:?}", self.state.phase);
            return;
        }
        let elapsed = self.elapsed();
        self.teardown();
        self.state.playback_offset =
            fold_elapsed(elapsed, assets.total_duration(), self.state.looping);
        self.state.phase = Phase::Paused;
        log::debug!("[Transport] Paused at {:.3}s", self.state.playback_offset);
    }

    /// Move every track to `position`, keeping the current phase.
    ///
    /// If the restarted voices cannot be scheduled the transport is left
    /// Paused at `position` with nothing sounding.
    pub fn seek(&mut self, assets: &AssetSet, position: SeekPosition) -> Result<()> {
        let offset = position.value() * assets.total_duration();
        self.state.playback_offset = offset;
        if self.state.phase == Phase::Playing {
            self.teardown();
            if let Err(e) = self.start_session(assets) {
                self.state.phase = Phase::Paused;
                return Err(e);
            }
        }
        log::debug!("[Transport] Seek to {:.3}s ({:?})", offset, self.state.phase);
        Ok(())
    }

    pub fn toggle_loop(&mut self, assets: &AssetSet) {
        let looping = !self.state.looping;
        if self.state.phase == Phase::Playing {
            let now = self.backend.now();
            if now >= self.state.origin_time {
                // Rebase so elapsed stays continuous with what the voices play
                let elapsed = self.state.elapsed_at(now);
                self.state.playback_offset =
                    fold_elapsed(elapsed, assets.total_duration(), self.state.looping);
                self.state.origin_time = now;
            }
            if let Some(session) = self.session.as_mut() {
                session.set_looping(looping);
            }
        }
        self.state.looping = looping;
        log::debug!("[Transport] Loop {}", if looping { "on" } else { "off" });
    }

    /// Drop any running voices and return to Stopped at the top of the song.
    /// The loop flag is kept.
    pub fn reset(&mut self) {
        self.teardown();
        self.state = TransportState {
            looping: self.state.looping,
            ..TransportState::default()
        };
    }

    /// Stop at the end of a non-looping run. Returns true exactly once per run.
    pub fn poll_end_of_track(&mut self, assets: &AssetSet) -> bool {
        if self.state.phase != Phase::Playing || self.state.looping {
            return false;
        }
        let total = assets.total_duration();
        if self.elapsed() < total {
            return false;
        }
        self.teardown();
        self.state.phase = Phase::Stopped;
        self.state.playback_offset = total;
        log::debug!("[Transport] End of track");
        true
    }

    fn start_session(&mut self, assets: &AssetSet) -> Result<()> {
        let at = self.backend.now() + self.start_lead;
        let start = VoiceStart {
            offset: self.state.playback_offset,
            at,
            looping: self.state.looping,
            end: assets.total_duration(),
        };
        let session = ActiveSession::start(&mut self.backend, assets, start).map_err(|e| {
            log::error!("[Transport] Could not start {} tracks: {}", assets.len(), e);
            e
        })?;
        self.session = Some(session);
        self.state.origin_time = at;
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop();
        }
    }
}

/// Hardware clock that only moves when told to
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<f64>>);

impl ManualClock {
    pub fn now(&self) -> f64 {
        self.0.get()
    }

    pub fn set(&self, secs: f64) {
        self.0.set(secs);
    }

    pub fn advance(&self, secs: f64) {
        self.0.set(self.0.get() + secs);
    }
}

/// What a [`ManualBackend`] was asked to play
#[derive(Debug, Clone)]
pub struct VoiceRecord {
    pub track: TrackId,
    pub start: VoiceStart,
    pub gain: TrackGain,
    pub looping: bool,
    pub stopped: bool,
}

/// Backend without audio output, driven by a [`ManualClock`]
#[derive(Debug, Clone, Default)]
pub struct ManualBackend {
    clock: ManualClock,
    voices: Rc<RefCell<Vec<VoiceRecord>>>,
    /// Refuse voices once this many have been started
    voice_limit: Option<usize>,
}

impl ManualBackend {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            voices: Rc::default(),
            voice_limit: None,
        }
    }

    /// Fail every `start_voice` after `limit` voices, like a full output queue
    pub fn with_voice_limit(mut self, limit: usize) -> Self {
        self.voice_limit = Some(limit);
        self
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Every voice started so far, oldest first
    pub fn voices(&self) -> Vec<VoiceRecord> {
        self.voices.borrow().clone()
    }

    pub fn live_voices(&self) -> Vec<VoiceRecord> {
        self.voices
            .borrow()
            .iter()
            .filter(|v| !v.stopped)
            .cloned()
            .collect()
    }
}

pub struct ManualVoice {
    index: usize,
    voices: Rc<RefCell<Vec<VoiceRecord>>>,
}

impl Voice for ManualVoice {
    fn stop(&mut self) {
        self.voices.borrow_mut()[self.index].stopped = true;
    }

    fn set_looping(&mut self, looping: bool) {
        self.voices.borrow_mut()[self.index].looping = looping;
    }
}

impl Drop for ManualVoice {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AudioBackend for ManualBackend {
    type Voice = ManualVoice;

    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn start_voice(&mut self, track: &Track, start: VoiceStart) -> Result<ManualVoice> {
        let mut voices = self.voices.borrow_mut();
        if self.voice_limit.is_some_and(|limit| voices.len() >= limit) {
            return Err(PlayerError::Output(format!(
                "no room for a voice of track {}",
                track.id()
            )));
        }
        voices.push(VoiceRecord {
            track: track.id(),
            start,
            gain: track.gain().clone(),
            looping: start.looping,
            stopped: false,
        });
        Ok(ManualVoice {
            index: voices.len() - 1,
            voices: Rc::clone(&self.voices),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::tests::stems;
    use approx::assert_relative_eq;

    fn transport() -> (Transport<ManualBackend>, ManualClock) {
        let clock = ManualClock::default();
        clock.set(100.0);
        (Transport::new(ManualBackend::new(clock.clone()), 0.0), clock)
    }

    #[test]
    fn test_play_starts_every_track_together() {
        let assets = stems(&[18.0, 18.0, 18.0, 18.0]);
        let (mut transport, clock) = transport();

        transport.play(&assets).unwrap();
        assert_eq!(transport.phase(), Phase::Playing);

        let voices = transport.backend().live_voices();
        assert_eq!(voices.len(), 4);
        assert!(voices.iter().all(|v| v.start == voices[0].start));
        assert_eq!(voices[0].start.offset, 0.0);
        assert_eq!(voices[0].start.at, 100.0);

        clock.advance(3.5);
        assert_relative_eq!(transport.elapsed(), 3.5);
    }

    #[test]
    fn test_start_lead_schedules_in_the_future() {
        let assets = stems(&[18.0, 18.0]);
        let clock = ManualClock::default();
        let mut transport = Transport::new(ManualBackend::new(clock.clone()), 0.05);

        transport.play(&assets).unwrap();
        assert_eq!(transport.backend().live_voices()[1].start.at, 0.05);
        // Nothing is audible before the scheduled start
        assert_eq!(transport.elapsed(), 0.0);
        clock.set(1.05);
        assert_relative_eq!(transport.elapsed(), 1.0);
    }

    #[test]
    fn test_stop_releases_voices_and_rewinds() {
        let assets = stems(&[18.0, 18.0]);
        let (mut transport, clock) = transport();

        transport.play(&assets).unwrap();
        clock.advance(5.0);
        transport.stop();

        assert_eq!(transport.phase(), Phase::Stopped);
        assert_eq!(transport.elapsed(), 0.0);
        assert!(transport.backend().live_voices().is_empty());

        transport.play(&assets).unwrap();
        assert_eq!(transport.backend().live_voices()[0].start.offset, 0.0);
    }

    #[test]
    fn test_pause_then_play_resumes_at_frozen_offset() {
        let assets = stems(&[18.0, 18.0]);
        let (mut transport, clock) = transport();

        transport.play(&assets).unwrap();
        clock.advance(4.0);
        transport.pause(&assets);
        assert_eq!(transport.phase(), Phase::Paused);
        assert!(transport.backend().live_voices().is_empty());

        // Time passing while paused does not move the song
        clock.advance(30.0);
        assert_relative_eq!(transport.elapsed(), 4.0);

        transport.play(&assets).unwrap();
        let voices = transport.backend().live_voices();
        assert_eq!(voices.len(), 2);
        assert!(voices.iter().all(|v| v.start.offset == 4.0));

        clock.advance(1.0);
        transport.pause(&assets);
        transport.play(&assets).unwrap();
        assert_relative_eq!(transport.elapsed(), 5.0);
    }

    #[test]
    fn test_pause_while_looping_wraps_offset() {
        let assets = stems(&[18.0]);
        let (mut transport, clock) = transport();

        transport.toggle_loop(&assets);
        transport.play(&assets).unwrap();
        clock.advance(20.0);
        transport.pause(&assets);
        assert_relative_eq!(transport.state().playback_offset, 2.0);
    }

    #[test]
    fn test_seek_while_playing_restarts_from_new_offset() {
        let assets = stems(&[18.0, 18.0]);
        let (mut transport, clock) = transport();

        transport.play(&assets).unwrap();
        clock.advance(2.0);
        transport.seek(&assets, SeekPosition::new(0.5).unwrap()).unwrap();

        assert_eq!(transport.phase(), Phase::Playing);
        assert_relative_eq!(transport.elapsed(), 9.0);
        let live = transport.backend().live_voices();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|v| v.start.offset == 9.0 && v.start.at == 102.0));
        assert_eq!(transport.backend().voices().len(), 4);
    }

    #[test]
    fn test_seek_is_idempotent() {
        let assets = stems(&[18.0]);
        let (mut transport, _clock) = transport();

        transport.seek(&assets, SeekPosition::clamped(0.25)).unwrap();
        let first = transport.state().playback_offset;
        transport.seek(&assets, SeekPosition::clamped(0.25)).unwrap();
        assert_eq!(transport.state().playback_offset, first);
        assert_eq!(first, 4.5);
    }

    #[test]
    fn test_seek_while_paused_stays_paused() {
        let assets = stems(&[18.0]);
        let (mut transport, clock) = transport();

        transport.play(&assets).unwrap();
        clock.advance(1.0);
        transport.pause(&assets);
        transport.seek(&assets, SeekPosition::clamped(0.5)).unwrap();

        assert_eq!(transport.phase(), Phase::Paused);
        assert!(transport.backend().live_voices().is_empty());
        assert_relative_eq!(transport.elapsed(), 9.0);
    }

    #[test]
    fn test_toggle_loop_propagates_without_restart() {
        let assets = stems(&[18.0, 18.0]);
        let (mut transport, clock) = transport();

        transport.play(&assets).unwrap();
        clock.advance(6.0);
        transport.toggle_loop(&assets);

        assert!(transport.is_looping());
        let live = transport.backend().live_voices();
        assert_eq!(transport.backend().voices().len(), 2);
        assert!(live.iter().all(|v| v.looping));
        assert_relative_eq!(transport.elapsed(), 6.0);
    }

    #[test]
    fn test_loop_off_after_wrap_keeps_clock_in_step() {
        let assets = stems(&[18.0]);
        let (mut transport, clock) = transport();

        transport.toggle_loop(&assets);
        transport.play(&assets).unwrap();
        clock.advance(25.0);
        transport.toggle_loop(&assets);

        // The voice is 7s into its second pass
        assert_relative_eq!(transport.elapsed(), 7.0);
        assert!(!transport.poll_end_of_track(&assets));
    }

    #[test]
    fn test_loop_wraps_position() {
        let assets = stems(&[18.0]);
        let (mut transport, clock) = transport();

        transport.toggle_loop(&assets);
        transport.play(&assets).unwrap();
        clock.advance(19.0);

        assert_relative_eq!(transport.position(18.0), 1.0 / 18.0, epsilon = 1e-12);
        assert!(!transport.poll_end_of_track(&assets));
        assert_eq!(transport.phase(), Phase::Playing);
    }

    #[test]
    fn test_end_of_track_stops_once() {
        let assets = stems(&[18.0]);
        let (mut transport, clock) = transport();

        transport.play(&assets).unwrap();
        clock.advance(18.0);
        assert!(transport.poll_end_of_track(&assets));
        assert_eq!(transport.phase(), Phase::Stopped);
        assert!(transport.backend().live_voices().is_empty());
        assert_eq!(transport.position(18.0), 1.0);

        clock.advance(1.0);
        assert!(!transport.poll_end_of_track(&assets));

        // Playing again starts from the top
        transport.play(&assets).unwrap();
        assert_eq!(transport.elapsed(), 0.0);
    }

    #[test]
    fn test_mute_does_not_touch_the_clock() {
        let mut assets = stems(&[18.0, 18.0]);
        let (mut transport, clock) = transport();

        transport.play(&assets).unwrap();
        clock.advance(3.0);
        assets.set_muted(TrackId(1), true);

        let live = transport.backend().live_voices();
        assert_eq!(live.len(), 2);
        assert_eq!(live[1].gain.get(), 0.0);
        assert_eq!(live[0].gain.get(), 1.0);
        assert_relative_eq!(transport.elapsed(), 3.0);

        clock.advance(2.0);
        assets.set_muted(TrackId(1), false);
        assert_eq!(live[1].gain.get(), 1.0);
        assert_relative_eq!(transport.elapsed(), 5.0);
        assert_eq!(transport.backend().voices().len(), 2);
    }

    #[test]
    fn test_drop_releases_voices() {
        let assets = stems(&[18.0, 18.0]);
        let (mut transport, _clock) = transport();
        transport.play(&assets).unwrap();
        let backend = transport.backend().clone();
        drop(transport);
        assert!(backend.live_voices().is_empty());
    }

    #[test]
    fn test_failed_start_leaves_nothing_sounding() {
        let assets = stems(&[18.0, 18.0, 18.0]);
        let clock = ManualClock::default();
        let backend = ManualBackend::new(clock.clone()).with_voice_limit(2);
        let mut transport = Transport::new(backend, 0.0);

        let err = transport.play(&assets).unwrap_err();
        assert!(matches!(err, PlayerError::Output(_)));
        assert_eq!(transport.phase(), Phase::Stopped);
        assert_eq!(transport.backend().voices().len(), 2);
        assert!(transport.backend().live_voices().is_empty());
    }

    #[test]
    fn test_failed_seek_restart_pauses_at_target() {
        let assets = stems(&[18.0, 18.0]);
        let clock = ManualClock::default();
        let backend = ManualBackend::new(clock.clone()).with_voice_limit(3);
        let mut transport = Transport::new(backend, 0.0);

        transport.play(&assets).unwrap();
        clock.advance(2.0);
        assert!(transport.seek(&assets, SeekPosition::clamped(0.5)).is_err());

        assert_eq!(transport.phase(), Phase::Paused);
        assert!(transport.backend().live_voices().is_empty());
        assert_relative_eq!(transport.elapsed(), 9.0);
    }

    #[test]
    fn test_reset_rewinds_after_end_of_track() {
        let assets = stems(&[18.0]);
        let (mut transport, clock) = transport();

        transport.play(&assets).unwrap();
        clock.advance(18.0);
        assert!(transport.poll_end_of_track(&assets));
        assert_eq!(transport.state().playback_offset, 18.0);

        transport.reset();
        assert_eq!(transport.phase(), Phase::Stopped);
        assert_eq!(transport.elapsed(), 0.0);
    }

    #[test]
    fn test_seek_position_validation() {
        assert!(SeekPosition::new(1.0).is_ok());
        assert!(matches!(
            SeekPosition::new(1.5),
            Err(PlayerError::InvalidSeek(p)) if p == 1.5
        ));
        assert!(SeekPosition::new(f64::NAN).is_err());
        assert_eq!(SeekPosition::clamped(-3.0).value(), 0.0);
        assert_eq!(SeekPosition::clamped(f64::NAN).value(), 0.0);
        assert_eq!(SeekPosition::clamped(7.0).value(), 1.0);
    }
}
