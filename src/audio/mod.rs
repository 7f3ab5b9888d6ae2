//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod engine;
pub mod playback;

pub use buffer::{AudioFrame, PlaybackQueue, SampleRing};
pub use capture::{AudioCapture, ChannelSink, FrameSink};
pub use device::{list_devices, AudioDeviceInfo};
pub use engine::{AudioEngine, EngineStats};
pub use playback::AudioPlayback;
