// Settings module
// Player configuration loaded from a JSON file next to the stems

pub mod settings;

pub use settings::PlayerSettings;
