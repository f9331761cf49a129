// Audio module
// Symphonia for decoding stems, cpal for mixing them to the output device

pub mod decoder;
pub mod output;

pub use decoder::DecodedBuffer;
pub use output::AudioOutput;
