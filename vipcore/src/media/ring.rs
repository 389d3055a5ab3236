//! Fixed-capacity sample rings shared between an audio thread and the engine.

use ringbuf::traits::{Consumer, Observer, Producer, RingBuffer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::packet::{AUDIO_FRAME_SAMPLES, AUDIO_SAMPLE_RATE};

/// One second of audio.
pub const AUDIO_RING_CAPACITY: usize = AUDIO_SAMPLE_RATE as usize;

/// Overwriting ring buffer. When full, a write drops the oldest unread
/// elements so the buffer always holds the most recent `capacity` items.
pub struct CircularBuffer<T> {
    inner: Mutex<HeapRb<T>>,
}

impl<T: Copy> CircularBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HeapRb::new(capacity.max(1))),
        }
    }

    /// Appends `data`, returning how many old elements were overwritten.
    pub fn write(&self, data: &[T]) -> usize {
        let mut rb = self.inner.lock().expect("Mutex should not be poisoned");
        data.iter()
            .filter(|&&item| rb.push_overwrite(item).is_some())
            .count()
    }

    /// Pops up to `out.len()` elements into `out`, returning the count.
    /// Positions past the returned count are left untouched.
    pub fn read(&self, out: &mut [T]) -> usize {
        self.inner
            .lock()
            .expect("Mutex should not be poisoned")
            .pop_slice(out)
    }

    /// Pops exactly `out.len()` elements, or nothing when fewer are buffered.
    pub fn read_exact(&self, out: &mut [T]) -> bool {
        let mut rb = self.inner.lock().expect("Mutex should not be poisoned");
        if rb.occupied_len() < out.len() {
            return false;
        }
        rb.pop_slice(out);
        true
    }

    /// Copies the buffered elements, oldest first, without consuming them.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner
            .lock()
            .expect("Mutex should not be poisoned")
            .iter()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("Mutex should not be poisoned")
            .occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner
            .lock()
            .expect("Mutex should not be poisoned")
            .capacity()
            .get()
    }

    pub fn clear(&self) {
        self.inner.lock().expect("Mutex should not be poisoned").clear();
    }
}

impl<T> std::fmt::Debug for CircularBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircularBuffer").finish_non_exhaustive()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("audio chunk of {0} samples is not a multiple of {AUDIO_FRAME_SAMPLES}")]
pub struct UnalignedChunk(pub usize);

/// Result of pulling one frame from a [`SampleReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRead {
    Frame,
    /// Not enough samples buffered; the output was filled with silence.
    NoData,
}

/// Audio ring that only carries whole 40 ms frames.
///
/// The ring is split into a [`SampleWriter`] and a [`SampleReader`], each
/// owned by exactly one thread, so neither side takes a lock. A writer
/// cannot reclaim unread slots, so on overrun it drops the incoming frame
/// and flags the overrun; the reader then discards the oldest frames down
/// to half the capacity. Playback thus resumes on recent audio.
pub struct SampleRing {
    rb: HeapRb<i16>,
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new(AUDIO_RING_CAPACITY)
    }
}

impl SampleRing {
    /// `capacity` is rounded down to whole frames, at least one.
    pub fn new(capacity: usize) -> Self {
        let frames = (capacity / AUDIO_FRAME_SAMPLES).max(1);
        Self {
            rb: HeapRb::new(frames * AUDIO_FRAME_SAMPLES),
        }
    }

    pub fn split(self) -> (SampleWriter, SampleReader) {
        let (prod, cons) = self.rb.split();
        let overrun = Arc::new(AtomicBool::new(false));
        (
            SampleWriter {
                prod,
                overrun: overrun.clone(),
            },
            SampleReader {
                cons,
                overrun,
                skipped: 0,
            },
        )
    }
}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRing")
            .field("capacity", &self.rb.capacity())
            .finish()
    }
}

/// Producer half of a [`SampleRing`].
pub struct SampleWriter {
    prod: HeapProd<i16>,
    overrun: Arc<AtomicBool>,
}

impl SampleWriter {
    /// Queues whole frames and returns how many samples did not fit.
    pub fn add_samples(&mut self, samples: &[i16]) -> Result<usize, UnalignedChunk> {
        if samples.len() % AUDIO_FRAME_SAMPLES != 0 {
            return Err(UnalignedChunk(samples.len()));
        }
        let mut dropped = 0;
        for frame in samples.chunks_exact(AUDIO_FRAME_SAMPLES) {
            if self.prod.vacant_len() < AUDIO_FRAME_SAMPLES {
                dropped += AUDIO_FRAME_SAMPLES;
                continue;
            }
            self.prod.push_slice(frame);
        }
        if dropped > 0 {
            self.overrun.store(true, Ordering::Release);
        }
        Ok(dropped)
    }

    pub fn frames_free(&self) -> usize {
        self.prod.vacant_len() / AUDIO_FRAME_SAMPLES
    }
}

impl std::fmt::Debug for SampleWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleWriter")
            .field("frames_free", &self.frames_free())
            .finish()
    }
}

/// Consumer half of a [`SampleRing`].
pub struct SampleReader {
    cons: HeapCons<i16>,
    overrun: Arc<AtomicBool>,
    skipped: u64,
}

impl SampleReader {
    /// Fills `out` with the next frame, or with silence on underrun.
    pub fn get_samples(&mut self, out: &mut [i16; AUDIO_FRAME_SAMPLES]) -> FrameRead {
        if self.overrun.swap(false, Ordering::Acquire) {
            let keep = (self.cons.capacity().get() / 2).max(AUDIO_FRAME_SAMPLES);
            let stale = self.cons.occupied_len().saturating_sub(keep);
            self.skipped += self.cons.skip(stale) as u64;
        }
        if self.cons.occupied_len() < AUDIO_FRAME_SAMPLES {
            out.fill(0);
            return FrameRead::NoData;
        }
        self.cons.pop_slice(out);
        FrameRead::Frame
    }

    pub fn frames_available(&self) -> usize {
        self.cons.occupied_len() / AUDIO_FRAME_SAMPLES
    }

    /// Samples discarded to recover from overruns.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn clear(&mut self) {
        self.cons.clear();
    }
}

impl std::fmt::Debug for SampleReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleReader")
            .field("frames_available", &self.frames_available())
            .field("skipped", &self.skipped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_keeps_most_recent() {
        let ring = CircularBuffer::<u32>::new(4);
        let data: Vec<u32> = (0..10).collect();
        assert_eq!(ring.write(&data), 6);
        assert_eq!(ring.snapshot(), vec![6, 7, 8, 9]);
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn empty_read_is_defined() {
        let ring = CircularBuffer::<i16>::new(8);
        let mut out = [7i16; 4];
        assert_eq!(ring.read(&mut out), 0);
        assert_eq!(out, [7; 4]);
        assert!(!ring.read_exact(&mut out));
    }

    #[test]
    fn partial_read() {
        let ring = CircularBuffer::<i16>::new(8);
        ring.write(&[1, 2, 3]);
        let mut out = [0i16; 5];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert!(ring.is_empty());
    }

    #[test]
    fn sample_ring_requires_aligned_chunks() {
        let (mut writer, reader) = SampleRing::default().split();
        assert_eq!(writer.add_samples(&[0; 100]), Err(UnalignedChunk(100)));
        assert_eq!(writer.add_samples(&[1; AUDIO_FRAME_SAMPLES * 2]), Ok(0));
        assert_eq!(reader.frames_available(), 2);
    }

    #[test]
    fn sample_ring_underrun_is_silence() {
        let (mut writer, mut reader) = SampleRing::default().split();
        let mut frame = [5i16; AUDIO_FRAME_SAMPLES];
        assert_eq!(reader.get_samples(&mut frame), FrameRead::NoData);
        assert!(frame.iter().all(|&s| s == 0));

        writer.add_samples(&[3; AUDIO_FRAME_SAMPLES]).unwrap();
        assert_eq!(reader.get_samples(&mut frame), FrameRead::Frame);
        assert!(frame.iter().all(|&s| s == 3));
    }

    #[test]
    fn full_ring_resumes_on_recent_frames() {
        let (mut writer, mut reader) = SampleRing::new(AUDIO_FRAME_SAMPLES * 4).split();
        for value in 1..=4i16 {
            writer.add_samples(&[value; AUDIO_FRAME_SAMPLES]).unwrap();
        }
        assert_eq!(writer.add_samples(&[5; AUDIO_FRAME_SAMPLES]), Ok(AUDIO_FRAME_SAMPLES));

        let mut frame = [0i16; AUDIO_FRAME_SAMPLES];
        assert_eq!(reader.get_samples(&mut frame), FrameRead::Frame);
        assert!(frame.iter().all(|&s| s == 3));
        assert_eq!(reader.skipped(), 2 * AUDIO_FRAME_SAMPLES as u64);
        assert_eq!(reader.frames_available(), 1);
    }

    #[test]
    fn full_ring_without_overrun_is_not_trimmed() {
        let (mut writer, mut reader) = SampleRing::new(AUDIO_FRAME_SAMPLES * 2).split();
        writer.add_samples(&[1; AUDIO_FRAME_SAMPLES]).unwrap();
        writer.add_samples(&[2; AUDIO_FRAME_SAMPLES]).unwrap();
        assert_eq!(writer.frames_free(), 0);

        let mut frame = [0i16; AUDIO_FRAME_SAMPLES];
        assert_eq!(reader.get_samples(&mut frame), FrameRead::Frame);
        assert!(frame.iter().all(|&s| s == 1));
        assert_eq!(reader.skipped(), 0);
    }
}
