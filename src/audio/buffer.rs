//! Frame type and the queues between the loops and the device
//!
//! `PlaybackQueue` is the FIFO the call loop fills and the render loop
//! drains. `SampleRing` is the lock-free hand-off between a loop thread and
//! the device callback.

use bytes::{Buf, BufMut};
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::constants::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};

/// One block of mono 16-bit PCM at 48 kHz
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioFrame {
    /// Interleaved samples (one channel)
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// A nominal-length frame of zeros
    pub fn silence() -> Self {
        Self::new(vec![0; FRAME_SAMPLES * CHANNELS as usize])
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Get number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / CHANNELS as usize
    }

    /// Get frame duration in microseconds
    pub fn duration_us(&self) -> u64 {
        (self.samples_per_channel() as u64 * 1_000_000) / SAMPLE_RATE as u64
    }

    /// Size of the sample data on the wire
    pub fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }

    /// Append samples as little-endian bytes
    pub fn write_le<B: BufMut>(&self, buf: &mut B) {
        for &sample in &self.samples {
            buf.put_i16_le(sample);
        }
    }

    /// Add `other` sample by sample, saturating at the i16 range. The
    /// result is as long as the longer of the two.
    pub fn mix(&mut self, other: &AudioFrame) {
        if other.samples.len() > self.samples.len() {
            self.samples.resize(other.samples.len(), 0);
        }
        for (mixed, &sample) in self.samples.iter_mut().zip(&other.samples) {
            *mixed = mixed.saturating_add(sample);
        }
    }

    /// Rebuild a frame from little-endian sample bytes.
    /// Returns `None` when the bytes do not hold a whole number of samples.
    pub fn from_le_bytes(mut bytes: &[u8]) -> Option<Self> {
        if bytes.len() % (2 * CHANNELS as usize) != 0 {
            return None;
        }
        let mut samples = Vec::with_capacity(bytes.len() / 2);
        while bytes.has_remaining() {
            samples.push(bytes.get_i16_le());
        }
        Some(Self::new(samples))
    }
}

struct QueueState {
    frames: VecDeque<AudioFrame>,
    closed: bool,
}

/// FIFO of frames waiting to be rendered.
///
/// `pop_blocking` parks until a frame arrives or the queue is closed.
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Append a frame and wake the render loop
    pub fn push(&self, frame: AudioFrame) {
        let mut state = self.state.lock();
        state.frames.push_back(frame);
        drop(state);
        self.ready.notify_one();
    }

    /// Block until a frame is available. Returns `None` once closed.
    pub fn pop_blocking(&self) -> Option<AudioFrame> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(frame) = state.frames.pop_front() {
                return Some(frame);
            }
            // Spurious wakeups land back here
            self.ready.wait(&mut state);
        }
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.state.lock().frames.pop_front()
    }

    /// Wake every waiter and make `pop_blocking` return `None`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    /// Allow blocking pops again after `close`
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    pub fn clear(&self) {
        self.state.lock().frames.clear();
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free sample ring shared with a device callback
pub struct SampleRing {
    queue: ArrayQueue<i16>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl SampleRing {
    /// Create a new ring with room for `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push samples, returning how many fit. The rest are counted as overflow.
    pub fn push_slice(&self, samples: &[i16]) -> usize {
        for (written, &sample) in samples.iter().enumerate() {
            if self.queue.push(sample).is_err() {
                self.overflow_count
                    .fetch_add(samples.len() - written, Ordering::Relaxed);
                return written;
            }
        }
        samples.len()
    }

    /// Pop one sample, counting an underrun when empty
    pub fn pop(&self) -> Option<i16> {
        match self.queue.pop() {
            Some(sample) => Some(sample),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Pop without counting underrun
    pub fn try_pop(&self) -> Option<i16> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

/// Thread-safe handle to a sample ring
pub type SharedSampleRing = Arc<SampleRing>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_frame_bytes() {
        let frame = AudioFrame::new(vec![1, -1, i16::MAX, i16::MIN]);
        let mut bytes = Vec::new();
        frame.write_le(&mut bytes);

        assert_eq!(bytes, vec![0x01, 0x00, 0xFF, 0xFF, 0xFF, 0x7F, 0x00, 0x80]);
        assert_eq!(AudioFrame::from_le_bytes(&bytes), Some(frame));
    }

    #[test]
    fn test_frame_rejects_partial_sample() {
        assert!(AudioFrame::from_le_bytes(&[0x01, 0x02, 0x03]).is_none());
    }

    #[test]
    fn test_silence_is_ten_ms() {
        let frame = AudioFrame::silence();
        assert_eq!(frame.len(), 480);
        assert_eq!(frame.duration_us(), 10_000);
    }

    #[test]
    fn test_mix_saturates_and_extends() {
        let mut frame = AudioFrame::new(vec![100, i16::MAX - 1, i16::MIN + 1]);
        frame.mix(&AudioFrame::new(vec![-50, 10, -10, 7]));
        assert_eq!(frame.samples, vec![50, i16::MAX, i16::MIN, 7]);
    }

    #[test]
    fn test_playback_queue_fifo() {
        let queue = PlaybackQueue::new();
        for i in 0..5 {
            queue.push(AudioFrame::new(vec![i; 4]));
        }

        for i in 0..5 {
            assert_eq!(queue.pop_blocking().unwrap().samples[0], i);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_playback_queue_wakes_waiter() {
        let queue = Arc::new(PlaybackQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_blocking())
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(AudioFrame::new(vec![7; 3]));

        let frame = consumer.join().unwrap().unwrap();
        assert_eq!(frame.samples, vec![7; 3]);
    }

    #[test]
    fn test_playback_queue_close_releases_waiter() {
        let queue = Arc::new(PlaybackQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_blocking())
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(consumer.join().unwrap().is_none());

        queue.reopen();
        queue.push(AudioFrame::silence());
        queue.push(AudioFrame::silence());
        assert!(queue.pop_blocking().is_some());
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_sample_ring_overflow() {
        let ring = SampleRing::new(4);
        assert_eq!(ring.push_slice(&[1, 2, 3]), 3);
        assert_eq!(ring.push_slice(&[4, 5, 6]), 1);
        assert_eq!(ring.overflow_count(), 2);

        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.available(), 1);
        ring.clear();
        assert_eq!(ring.pop(), None);
        assert_eq!(ring.underrun_count(), 1);
    }
}
