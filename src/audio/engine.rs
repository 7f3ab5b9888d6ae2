//! Audio I/O engine
//!
//! Owns the capture and render sessions. Captured frames go to a
//! [`FrameSink`]; by default that is an internal channel read with
//! [`AudioEngine::next_captured_frame`].

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::audio::buffer::AudioFrame;
use crate::audio::capture::{AudioCapture, ChannelSink, FrameSink};
use crate::audio::playback::AudioPlayback;
use crate::config::AudioConfig;
use crate::error::AudioError;

/// Frames buffered for a pulling consumer
const CAPTURE_CHANNEL_CAPACITY: usize = 256;

/// Point-in-time engine counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngineStats {
    pub capturing: bool,
    pub playing: bool,
    pub frames_captured: u64,
    pub capture_chunks_dropped: u64,
    pub frames_rendered: u64,
    pub frames_queued: usize,
    pub underrun_samples: usize,
    pub overflow_samples: usize,
}

pub struct AudioEngine {
    capture: Mutex<AudioCapture>,
    playback: Mutex<AudioPlayback>,
    captured_rx: Receiver<AudioFrame>,
}

impl AudioEngine {
    pub fn new(config: &AudioConfig) -> Self {
        let (sink, captured_rx) = ChannelSink::new(CAPTURE_CHANNEL_CAPACITY);
        Self {
            capture: Mutex::new(AudioCapture::new(
                config.input_device.clone(),
                config.buffer_frames,
                Arc::new(sink),
            )),
            playback: Mutex::new(AudioPlayback::new(
                config.output_device.clone(),
                config.buffer_frames,
                config.render_ring_samples,
            )),
            captured_rx,
        }
    }

    /// Deliver captured frames to `sink` instead of the internal channel.
    /// Applies from the next `start_capture`.
    pub fn set_frame_sink(&self, sink: Arc<dyn FrameSink>) {
        self.capture.lock().set_sink(sink);
    }

    pub fn start_capture(&self) -> Result<(), AudioError> {
        self.capture.lock().start()
    }

    pub fn stop_capture(&self) {
        self.capture.lock().stop();
    }

    pub fn start_playback(&self) -> Result<(), AudioError> {
        self.playback.lock().start()
    }

    pub fn stop_playback(&self) {
        self.playback.lock().stop();
    }

    /// Pull the oldest captured frame, if any (default sink only)
    pub fn next_captured_frame(&self) -> Option<AudioFrame> {
        self.captured_rx.try_recv().ok()
    }

    /// Append a frame to the render FIFO
    pub fn queue_playback_frame(&self, frame: AudioFrame) {
        self.playback.lock().push_frame(frame);
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.lock().is_running()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.lock().is_running()
    }

    pub fn stats(&self) -> EngineStats {
        let capture = self.capture.lock();
        let playback = self.playback.lock();
        EngineStats {
            capturing: capture.is_running(),
            playing: playback.is_running(),
            frames_captured: capture.stats().frames_captured.load(Ordering::Relaxed),
            capture_chunks_dropped: capture.stats().chunks_dropped.load(Ordering::Relaxed),
            frames_rendered: playback.stats().frames_rendered.load(Ordering::Relaxed),
            frames_queued: playback.queued_frames(),
            underrun_samples: playback.underrun_samples(),
            overflow_samples: playback.overflow_samples(),
        }
    }

    /// Stop both loops; each stop joins its thread before returning
    pub fn shutdown(&self) {
        tracing::info!("Shutting down audio engine");
        self.stop_capture();
        self.stop_playback();
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_devices() -> AudioConfig {
        AudioConfig {
            input_device: Some("input:__no_such_device__".into()),
            output_device: Some("output:__no_such_device__".into()),
            ..AudioConfig::default()
        }
    }

    #[test]
    fn test_start_failure_leaves_engine_stopped() {
        let engine = AudioEngine::new(&missing_devices());
        assert!(engine.start_capture().is_err());
        assert!(engine.start_playback().is_err());
        assert!(!engine.is_capturing());
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let engine = AudioEngine::new(&missing_devices());
        engine.stop_capture();
        engine.stop_capture();
        engine.stop_playback();
        engine.shutdown();
    }

    #[test]
    fn test_queue_without_running_playback() {
        let engine = AudioEngine::new(&missing_devices());
        engine.queue_playback_frame(AudioFrame::silence());
        engine.queue_playback_frame(AudioFrame::silence());
        let stats = engine.stats();
        assert_eq!(stats.frames_queued, 2);
        assert_eq!(stats.overflow_samples, 0);
        assert_eq!(stats.underrun_samples, 0);
        assert!(engine.next_captured_frame().is_none());
    }
}
