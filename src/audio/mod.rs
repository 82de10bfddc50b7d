//! Audio input stream, rolling buffer, and WAV framing.

pub mod buffer;
pub mod input;
pub mod wav;

pub use buffer::RollingBuffer;
pub use input::AudioInputStream;
