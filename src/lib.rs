// Stemdeck - multi-track stem player
// Module declarations
pub mod assets;
pub mod audio;
pub mod cursor;
pub mod error;
pub mod player;
pub mod seek;
pub mod settings;
pub mod transport;

pub use assets::{AssetSet, DurationPolicy, SymphoniaDecoder, TrackId};
pub use cursor::{CursorSample, CursorSource};
pub use error::{PlayerError, Result};
pub use player::Player;
pub use settings::PlayerSettings;
pub use transport::{Phase, SeekPosition};
