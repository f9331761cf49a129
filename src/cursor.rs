// Playhead clock
// Samples the transport once per rendered frame while playing, and yields to
// the drag override while the user scrubs.

use crate::assets::AssetSet;
use crate::transport::{AudioBackend, Phase, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorSource {
    Clock,
    DragOverride,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorSample {
    /// Normalized playhead in [0, 1]
    pub position: f64,
    pub source: CursorSource,
}

/// The recurring per-frame sampling job. Dropping it cancels it.
#[derive(Debug)]
struct TickTask {
    frames: u64,
}

#[derive(Debug, Default)]
pub struct CursorClock {
    task: Option<TickTask>,
    /// Emit the frozen transport position on the next tick
    idle_pending: bool,
    /// Last drag position published, while a drag is active
    last_override: Option<f64>,
    position: f64,
}

impl CursorClock {
    pub fn new() -> Self {
        Self {
            idle_pending: true,
            ..Self::default()
        }
    }

    /// Last emitted playhead position
    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn is_scheduled(&self) -> bool {
        self.task.is_some()
    }

    /// Begin per-frame sampling. Called on entering Playing.
    pub fn start(&mut self) {
        if self.task.is_none() {
            self.task = Some(TickTask { frames: 0 });
        }
        self.idle_pending = false;
    }

    /// Stop per-frame sampling and show the frozen position once.
    /// Called on leaving Playing, in the same step as the transition.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            log::debug!("[Cursor] Tick task cancelled after {} frames", task.frames);
        }
        self.idle_pending = true;
    }

    /// One render frame. Returns a sample only when there is something new to draw.
    ///
    /// `drag` is the pending position of an active drag session; while it is
    /// set the playhead shows it instead of the transport clock. The song can
    /// still end underneath a drag, so end-of-track is checked either way.
    pub fn tick<B: AudioBackend>(
        &mut self,
        transport: &mut Transport<B>,
        assets: &AssetSet,
        drag: Option<f64>,
    ) -> Option<CursorSample> {
        if let Some(pending) = drag {
            if self.task.is_some() && transport.poll_end_of_track(assets) {
                self.task = None;
            }
            if self.last_override == Some(pending) {
                return None;
            }
            self.last_override = Some(pending);
            return Some(self.emit(pending, CursorSource::DragOverride));
        }

        if self.last_override.take().is_some() {
            // Drag released; the audio clock owns the playhead again
            self.idle_pending = true;
        }

        if let Some(task) = self.task.as_mut() {
            task.frames += 1;

            if transport.poll_end_of_track(assets) {
                self.task = None;
                self.idle_pending = false;
                return Some(self.emit(1.0, CursorSource::Clock));
            }

            if transport.phase() == Phase::Playing {
                let position = transport.position(assets.total_duration());
                return Some(self.emit(position, CursorSource::Clock));
            }

            // Transport left Playing without telling us
            self.cancel();
        }

        if self.idle_pending {
            self.idle_pending = false;
            let position = transport.position(assets.total_duration());
            return Some(self.emit(position, CursorSource::Clock));
        }

        None
    }

    fn emit(&mut self, position: f64, source: CursorSource) -> CursorSample {
        self.position = position;
        CursorSample { position, source }
    }
}
