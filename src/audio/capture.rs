//! Audio capture from the input device
//!
//! The cpal callback only converts samples and signals the capture thread.
//! The capture thread slices what arrived into fixed 480-sample frames and
//! hands each one to a [`FrameSink`].

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::AudioFrame;
use crate::audio::device::{resolve_device, Direction};
use crate::constants::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::AudioError;

/// Device chunks buffered between the callback and the capture thread
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Upper bound on how long the loop sleeps before re-checking the stop flag
const WAKE_TIMEOUT: Duration = Duration::from_millis(50);

/// Consumer of captured frames. Called on the capture thread.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: AudioFrame);
}

impl<F> FrameSink for F
where
    F: Fn(AudioFrame) + Send + Sync,
{
    fn on_frame(&self, frame: AudioFrame) {
        self(frame)
    }
}

/// Sink that parks frames in a bounded channel for a pulling consumer
pub struct ChannelSink {
    tx: Sender<AudioFrame>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<AudioFrame>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Frames discarded because the consumer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSink for ChannelSink {
    fn on_frame(&self, frame: AudioFrame) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(frame) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Capture counters
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames_captured: AtomicU64,
    pub samples_captured: AtomicU64,
    /// Device chunks lost because the capture thread fell behind
    pub chunks_dropped: AtomicU64,
}

/// Splits an arbitrary stream of samples into fixed-size frames
pub(crate) struct FrameAssembler {
    pending: Vec<i16>,
    frame_len: usize,
}

impl FrameAssembler {
    pub(crate) fn new(frame_len: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_len * 2),
            frame_len,
        }
    }

    pub(crate) fn push(&mut self, samples: &[i16]) {
        self.pending.extend_from_slice(samples);
    }

    /// Take the next complete frame, if any
    pub(crate) fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.pending.len() < self.frame_len {
            return None;
        }
        let rest = self.pending.split_off(self.frame_len);
        Some(AudioFrame::new(std::mem::replace(&mut self.pending, rest)))
    }
}

/// Body of the capture thread: wait for the device, drain, slice, deliver.
pub(crate) fn run_capture_loop(
    chunks: &Receiver<Vec<i16>>,
    running: &AtomicBool,
    sink: &dyn FrameSink,
    stats: &CaptureStats,
) {
    let mut assembler = FrameAssembler::new(FRAME_SAMPLES * CHANNELS as usize);

    while running.load(Ordering::Acquire) {
        match chunks.recv_timeout(WAKE_TIMEOUT) {
            Ok(chunk) => {
                stats
                    .samples_captured
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                assembler.push(&chunk);

                // More than one buffer may be pending after a scheduling hiccup
                for chunk in chunks.try_iter() {
                    stats
                        .samples_captured
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    assembler.push(&chunk);
                }

                while let Some(frame) = assembler.next_frame() {
                    if !running.load(Ordering::Acquire) {
                        return;
                    }
                    stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                    sink.on_frame(frame);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Stream config for the fixed voice format
pub(crate) fn voice_stream_config(buffer_frames: Option<u32>) -> StreamConfig {
    StreamConfig {
        channels: CHANNELS,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: match buffer_frames {
            Some(size) => cpal::BufferSize::Fixed(size),
            None => cpal::BufferSize::Default,
        },
    }
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: Sender<Vec<i16>>,
    stats: Arc<CaptureStats>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let chunk: Vec<i16> = data.iter().map(|&s| s.to_sample::<i16>()).collect();
            if tx.try_send(chunk).is_err() {
                stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            }
        },
        |err| tracing::error!("Capture stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

/// Open the input device for mono 48 kHz in whatever sample type it speaks
fn open_input(
    device_id: Option<&str>,
    buffer_frames: Option<u32>,
    tx: Sender<Vec<i16>>,
    stats: Arc<CaptureStats>,
) -> Result<cpal::Stream, AudioError> {
    let device = resolve_device(device_id, Direction::Input)?;
    let sample_format = device.default_input_config()?.sample_format();
    let config = voice_stream_config(buffer_frames);

    let stream = match sample_format {
        cpal::SampleFormat::I16 => build_input_stream::<i16>(&device, &config, tx, stats)?,
        cpal::SampleFormat::U16 => build_input_stream::<u16>(&device, &config, tx, stats)?,
        cpal::SampleFormat::F32 => build_input_stream::<f32>(&device, &config, tx, stats)?,
        other => {
            return Err(AudioError::UnsupportedFormat(format!(
                "input sample format {:?}",
                other
            )))
        }
    };
    stream.play()?;
    Ok(stream)
}

/// Audio capture from a single input device
pub struct AudioCapture {
    /// Device identifier, default device when `None`
    device_id: Option<String>,

    /// Requested device buffer in sample frames
    buffer_frames: Option<u32>,

    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Consumer of assembled frames
    sink: Arc<dyn FrameSink>,

    /// Capture thread handle
    thread_handle: Option<JoinHandle<()>>,

    stats: Arc<CaptureStats>,
}

impl AudioCapture {
    pub fn new(
        device_id: Option<String>,
        buffer_frames: Option<u32>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            device_id,
            buffer_frames,
            running: Arc::new(AtomicBool::new(false)),
            sink,
            thread_handle: None,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    /// Replace the frame consumer. Takes effect on the next `start`.
    pub fn set_sink(&mut self, sink: Arc<dyn FrameSink>) {
        self.sink = sink;
    }

    /// Start capturing audio. A no-op when already running.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (chunk_tx, chunk_rx) = bounded::<Vec<i16>>(CHUNK_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = self.running.clone();
        let sink = self.sink.clone();
        let stats = self.stats.clone();
        let device_id = self.device_id.clone();
        let buffer_frames = self.buffer_frames;

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                // cpal streams are not Send; the stream lives and dies on this thread
                let opened =
                    open_input(device_id.as_deref(), buffer_frames, chunk_tx, stats.clone());
                let stream = match opened {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                run_capture_loop(&chunk_rx, &running, sink.as_ref(), &stats);
                drop(stream);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::ThreadSpawn("capture", e.to_string())
            })?;

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("capture thread exited".into())));

        if let Err(e) = opened {
            tracing::error!("Failed to start capture: {}", e);
            self.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        self.thread_handle = Some(handle);
        tracing::info!("Capture started");
        Ok(())
    }

    /// Stop capturing and wait for the capture thread to release the device
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Capture stopped");
        }
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_assembler_slices_fixed_frames() {
        let mut assembler = FrameAssembler::new(4);
        assembler.push(&[1, 2, 3]);
        assert!(assembler.next_frame().is_none());

        assembler.push(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(assembler.next_frame().unwrap().samples, vec![1, 2, 3, 4]);
        assert_eq!(assembler.next_frame().unwrap().samples, vec![5, 6, 7, 8]);
        assert!(assembler.next_frame().is_none());
    }

    #[test]
    fn test_capture_loop_drains_backlog() {
        let (tx, rx) = bounded::<Vec<i16>>(16);
        let running = AtomicBool::new(true);
        let stats = CaptureStats::default();
        let collected = Mutex::new(Vec::new());
        let sink = |frame: AudioFrame| collected.lock().push(frame);

        // Two and a half frames queued before the loop wakes up
        tx.send(vec![1; 480]).unwrap();
        tx.send(vec![2; 720]).unwrap();
        tx.send(vec![3; 0]).unwrap();
        drop(tx);

        run_capture_loop(&rx, &running, &sink, &stats);

        let frames = collected.lock();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].samples.iter().all(|&s| s == 1));
        assert!(frames[1].samples.iter().all(|&s| s == 2));
        assert_eq!(stats.frames_captured.load(Ordering::Relaxed), 2);
        assert_eq!(stats.samples_captured.load(Ordering::Relaxed), 1200);
    }

    #[test]
    fn test_capture_loop_honours_stop_flag() {
        let (_tx, rx) = bounded::<Vec<i16>>(1);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(CaptureStats::default());

        let handle = {
            let running = running.clone();
            let stats = stats.clone();
            thread::spawn(move || {
                let sink = |_frame: AudioFrame| {};
                run_capture_loop(&rx, &running, &sink, &stats)
            })
        };

        thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::SeqCst);
        // Returns within one wake timeout even with no device signal
        handle.join().unwrap();
    }

    #[test]
    fn test_channel_sink_counts_drops() {
        let (sink, rx) = ChannelSink::new(1);
        sink.on_frame(AudioFrame::silence());
        sink.on_frame(AudioFrame::silence());
        assert_eq!(sink.dropped(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_capture_start_without_device_reports_error() {
        let (sink, _rx) = ChannelSink::new(4);
        let mut capture = AudioCapture::new(
            Some("input:__no_such_device__".to_string()),
            None,
            Arc::new(sink),
        );

        assert!(capture.start().is_err());
        assert!(!capture.is_running());
    }
}
