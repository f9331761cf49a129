// Drag-to-seek gesture handling
use serde::{Deserialize, Serialize};

use crate::assets::AssetSet;
use crate::error::Result;
use crate::transport::{AudioBackend, SeekPosition, Transport};

/// Horizontal extent of the track area, in pointer coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackArea {
    pub left: f64,
    pub width: f64,
}

impl Default for TrackArea {
    fn default() -> Self {
        Self {
            left: 0.0,
            width: 100.0,
        }
    }
}

impl TrackArea {
    /// Pointer x to a normalized position, clamped to [0, 1]
    pub fn position_at(&self, pointer_x: f64) -> f64 {
        if self.width <= 0.0 || !self.width.is_finite() {
            return 0.0;
        }
        SeekPosition::clamped((pointer_x - self.left) / self.width).value()
    }
}

/// One pointer-down to pointer-up gesture.
///
/// Pointer moves are only accepted while a session exists; ending the
/// gesture consumes it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragSession {
    pending_position: f64,
}

#[derive(Debug, Default)]
pub struct SeekController {
    area: TrackArea,
    session: Option<DragSession>,
}

impl SeekController {
    pub fn new(area: TrackArea) -> Self {
        Self {
            area,
            session: None,
        }
    }

    pub fn set_track_area(&mut self, area: TrackArea) {
        self.area = area;
    }

    pub fn is_dragging(&self) -> bool {
        self.session.is_some()
    }

    /// Position to show instead of the transport clock, if dragging
    pub fn pending_position(&self) -> Option<f64> {
        self.session.map(|s| s.pending_position)
    }

    pub fn begin_drag(&mut self, pointer_x: f64) {
        if self.session.is_some() {
            log::warn!("[Seek] begin_drag while a drag is active, restarting it");
        }
        self.session = Some(DragSession {
            pending_position: self.area.position_at(pointer_x),
        });
    }

    /// Scrubbing is silent: only the pending position moves
    pub fn update_drag(&mut self, pointer_x: f64) {
        let position = self.area.position_at(pointer_x);
        match self.session.as_mut() {
            Some(session) => session.pending_position = position,
            None => log::debug!("[Seek] Pointer move without a drag, ignored"),
        }
    }

    /// Close the gesture and commit it as a seek. Never starts playback.
    pub fn end_drag<B: AudioBackend>(
        &mut self,
        transport: &mut Transport<B>,
        assets: &AssetSet,
    ) -> Result<Option<SeekPosition>> {
        let Some(session) = self.session.take() else {
            return Ok(None);
        };
        let position = SeekPosition::clamped(session.pending_position);
        transport.seek(assets, position)?;
        Ok(Some(position))
    }

    /// Drop the gesture without seeking
    pub fn cancel_drag(&mut self) {
        self.session = None;
    }
}
