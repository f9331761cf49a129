// Error types shared by the player core
use thiserror::Error;

use crate::assets::TrackId;

#[derive(Debug, Error)]
pub enum PlayerError {
    /// A source could not be fetched or decoded; the whole load attempt fails
    #[error("failed to load track {track} ({locator}): {reason}")]
    Load {
        track: TrackId,
        locator: String,
        reason: String,
    },

    /// A playback command arrived before the assets finished loading
    #[error("assets are still loading")]
    NotReady,

    #[error("seek position {0} is outside [0, 1]")]
    InvalidSeek(f64),

    #[error("audio output error: {0}")]
    Output(String),

    #[error("settings error: {0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
