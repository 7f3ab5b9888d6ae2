//! Audio playback to the output device
//!
//! The render thread parks on the [`PlaybackQueue`] and moves one frame at a
//! time into a [`SampleRing`] that the cpal output callback drains. The
//! callback fills with silence when the ring runs dry.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, StreamConfig};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{AudioFrame, PlaybackQueue, SampleRing, SharedSampleRing};
use crate::audio::capture::voice_stream_config;
use crate::audio::device::{resolve_device, Direction};
use crate::error::AudioError;

/// Sleep while waiting for the device to free ring space
const RING_BACKOFF: Duration = Duration::from_millis(1);

/// Render counters
#[derive(Debug, Default)]
pub struct PlaybackStats {
    pub frames_rendered: AtomicU64,
    pub samples_rendered: AtomicU64,
}

/// Body of the render thread. Returns when the queue closes or `running` drops.
pub(crate) fn run_render_loop(
    queue: &PlaybackQueue,
    ring: &SampleRing,
    running: &AtomicBool,
    stats: &PlaybackStats,
) {
    while running.load(Ordering::Acquire) {
        let Some(frame) = queue.pop_blocking() else {
            break;
        };
        if !running.load(Ordering::Acquire) {
            break;
        }

        // Oversized frames go in as far as they fit
        let needed = frame.len().min(ring.capacity());
        while ring.available() < needed {
            if !running.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(RING_BACKOFF);
        }

        let written = ring.push_slice(&frame.samples);
        stats.frames_rendered.fetch_add(1, Ordering::Relaxed);
        stats
            .samples_rendered
            .fetch_add(written as u64, Ordering::Relaxed);
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    ring: SharedSampleRing,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<i16>,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for slot in data.iter_mut() {
                *slot = ring.pop().unwrap_or(0).to_sample::<T>();
            }
        },
        |err| tracing::error!("Playback stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

fn open_output(
    device_id: Option<&str>,
    buffer_frames: Option<u32>,
    ring: SharedSampleRing,
) -> Result<cpal::Stream, AudioError> {
    let device = resolve_device(device_id, Direction::Output)?;
    let sample_format = device.default_output_config()?.sample_format();
    let config = voice_stream_config(buffer_frames);

    let stream = match sample_format {
        cpal::SampleFormat::I16 => build_output_stream::<i16>(&device, &config, ring)?,
        cpal::SampleFormat::U16 => build_output_stream::<u16>(&device, &config, ring)?,
        cpal::SampleFormat::F32 => build_output_stream::<f32>(&device, &config, ring)?,
        other => {
            return Err(AudioError::UnsupportedFormat(format!(
                "output sample format {:?}",
                other
            )))
        }
    };
    stream.play()?;
    Ok(stream)
}

/// Audio playback to a single output device
pub struct AudioPlayback {
    device_id: Option<String>,
    buffer_frames: Option<u32>,
    running: Arc<AtomicBool>,
    queue: Arc<PlaybackQueue>,
    ring: SharedSampleRing,
    thread_handle: Option<JoinHandle<()>>,
    stats: Arc<PlaybackStats>,
}

impl AudioPlayback {
    pub fn new(
        device_id: Option<String>,
        buffer_frames: Option<u32>,
        ring_capacity: usize,
    ) -> Self {
        Self {
            device_id,
            buffer_frames,
            running: Arc::new(AtomicBool::new(false)),
            queue: Arc::new(PlaybackQueue::new()),
            ring: Arc::new(SampleRing::new(ring_capacity)),
            thread_handle: None,
            stats: Arc::new(PlaybackStats::default()),
        }
    }

    /// Start rendering. A no-op when already running.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = self.running.clone();
        let queue = self.queue.clone();
        let ring = self.ring.clone();
        let stats = self.stats.clone();
        let device_id = self.device_id.clone();
        let buffer_frames = self.buffer_frames;

        self.queue.reopen();
        self.ring.clear();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-render".to_string())
            .spawn(move || {
                let stream = match open_output(device_id.as_deref(), buffer_frames, ring.clone()) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                run_render_loop(&queue, &ring, &running, &stats);
                drop(stream);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::ThreadSpawn("render", e.to_string())
            })?;

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("render thread exited".into())));

        if let Err(e) = opened {
            tracing::error!("Failed to start playback: {}", e);
            self.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        self.thread_handle = Some(handle);
        tracing::info!("Playback started");
        Ok(())
    }

    /// Stop rendering and wait for the render thread to release the device.
    /// Frames still queued are discarded.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.close();

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            self.queue.clear();
            tracing::info!("Playback stopped");
        }
    }

    /// Queue a frame for rendering
    pub fn push_frame(&self, frame: AudioFrame) {
        self.queue.push(frame);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Frames waiting in the queue
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// Samples of silence inserted because the ring ran dry
    pub fn underrun_samples(&self) -> usize {
        self.ring.underrun_count()
    }

    /// Samples that did not fit in the ring
    pub fn overflow_samples(&self) -> usize {
        self.ring.overflow_count()
    }

    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}
