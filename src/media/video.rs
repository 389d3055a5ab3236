//! Video decode worker.
//!
//! Decoding runs on its own thread behind a one-slot queue. A frame that
//! arrives while the previous one is still decoding is dropped rather than
//! queued, so a slow decoder falls behind by frames and never by latency.

use super::FrameSink;
use crate::engine::CallEngine;
use crate::engine::call_engine::now;
use log::{debug, trace, warn};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use vipcore::media::{FrameFlags, FrameInfo, VideoDecoder, VideoPacket};
use vipcore::types::UnitKey;

/// Minimum spacing between keyframe requests while the decoder waits for one.
pub const KEYFRAME_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct WorkerState {
    last_decoded: Option<Instant>,
    last_keyframe_request: Option<Instant>,
    decoded: u64,
    dropped: u64,
}

pub struct VideoWorker {
    unit: UnitKey,
    tx: Option<SyncSender<VideoPacket>>,
    state: Arc<Mutex<WorkerState>>,
    thread: Option<JoinHandle<()>>,
}

fn frame_info(packet: &VideoPacket) -> FrameInfo {
    FrameInfo {
        width: packet.width as u32,
        height: packet.height as u32,
        timestamp: packet.timestamp as u64,
        flags: if packet.keyframe {
            FrameFlags::KEYFRAME
        } else {
            FrameFlags::default()
        },
    }
}

impl VideoWorker {
    pub fn spawn(
        engine: Arc<CallEngine>,
        unit: UnitKey,
        decoder: Box<dyn VideoDecoder>,
        sink: Arc<dyn FrameSink>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = sync_channel(1);
        let state = Arc::new(Mutex::new(WorkerState::default()));
        let thread = {
            let state = state.clone();
            std::thread::Builder::new()
                .name(format!("video-{unit}"))
                .spawn(move || decode_loop(engine, unit, decoder, sink, rx, state))?
        };
        debug!(target: "Media/Video", "{unit}: decode worker started");
        Ok(Self {
            unit,
            tx: Some(tx),
            state,
            thread: Some(thread),
        })
    }

    /// Hands a frame to the decoder. Returns `false` when the worker is
    /// busy and the frame was dropped.
    pub fn submit(&self, packet: VideoPacket) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(packet)) => {
                trace!(target: "Media/Video", "{}: decoder busy, dropping frame {}", self.unit, packet.seq);
                self.state().dropped += 1;
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, WorkerState> {
        self.state.lock().expect("Mutex should not be poisoned")
    }

    /// When the last frame was decoded successfully.
    pub fn last_decoded(&self) -> Option<Instant> {
        self.state().last_decoded
    }

    pub fn decoded_frames(&self) -> u64 {
        self.state().decoded
    }

    pub fn dropped_frames(&self) -> u64 {
        self.state().dropped
    }

    /// Closes the queue and waits for the frame in flight.
    pub fn stop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!(target: "Media/Video", "{}: decode thread panicked", self.unit);
        }
    }
}

impl Drop for VideoWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_loop(
    engine: Arc<CallEngine>,
    unit: UnitKey,
    mut decoder: Box<dyn VideoDecoder>,
    sink: Arc<dyn FrameSink>,
    rx: Receiver<VideoPacket>,
    state: Arc<Mutex<WorkerState>>,
) {
    while let Ok(packet) = rx.recv() {
        let info = frame_info(&packet);
        match decoder.decode(&packet.data, &info) {
            Some(frame) => {
                {
                    let mut state = state.lock().expect("Mutex should not be poisoned");
                    state.last_decoded = Some(now());
                    state.decoded += 1;
                }
                sink.on_frame(frame);
            }
            None => {
                let mut state = state.lock().expect("Mutex should not be poisoned");
                state.dropped += 1;
                if !decoder.needs_keyframe() {
                    continue;
                }
                let at = now();
                let due = state
                    .last_keyframe_request
                    .is_none_or(|last| at.duration_since(last) >= KEYFRAME_REQUEST_INTERVAL);
                if due {
                    state.last_keyframe_request = Some(at);
                    drop(state);
                    if let Err(e) = engine.request_keyframe(unit) {
                        debug!(target: "Media/Video", "{unit}: keyframe request failed: {e}");
                    }
                }
            }
        }
    }
    debug!(target: "Media/Video", "{unit}: decode worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallTimers;
    use crate::test_utils::{CollectingFrameSink, MockNativeEngine};
    use bytes::Bytes;
    use vipcore::CoreEventBus;
    use vipcore::media::SoftwareDecoder;
    use vipcore::types::{UnitFlags, UnitType};

    fn engine() -> (Arc<MockNativeEngine>, Arc<CallEngine>, UnitKey) {
        let native = Arc::new(MockNativeEngine::new());
        let engine = CallEngine::new(native.clone(), CoreEventBus::new(), CallTimers::default());
        engine.start().unwrap();
        let sys = engine.create_base_system().unwrap();
        let unit = engine
            .create_unit(sys, UnitType::Vip, UnitFlags::VIDEO | UnitFlags::SOFTWARE_DECODE)
            .unwrap();
        (native, engine, UnitKey::new(sys, unit))
    }

    fn frame(seq: u16, keyframe: bool) -> VideoPacket {
        // 2x2 I420: four luma bytes, one U, one V.
        VideoPacket {
            seq,
            timestamp: seq as u32 * 3600,
            keyframe,
            width: 2,
            height: 2,
            data: Bytes::from_static(&[128, 128, 128, 128, 128, 128]),
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_decodes_after_keyframe() {
        let (native, engine, unit) = engine();
        let sink = Arc::new(CollectingFrameSink::default());
        let mut worker =
            VideoWorker::spawn(engine, unit, Box::new(SoftwareDecoder::new()), sink.clone())
                .unwrap();

        assert!(worker.submit(frame(1, false)));
        wait_for(|| native.keyframe_requests() == 1);
        assert_eq!(native.keyframe_requests(), 1);
        assert!(worker.last_decoded().is_none());

        assert!(worker.submit(frame(2, true)));
        wait_for(|| sink.frames().len() == 1);
        worker.stop();

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].rgba.len(), 2 * 2 * 4);
        assert!(frames[0].info.is_keyframe());
        assert!(worker.last_decoded().is_some());
    }

    #[test]
    fn test_keyframe_requests_are_rate_limited() {
        let (native, engine, unit) = engine();
        let sink = Arc::new(CollectingFrameSink::default());
        let mut worker =
            VideoWorker::spawn(engine, unit, Box::new(SoftwareDecoder::new()), sink).unwrap();
        for seq in 0..5 {
            while !worker.submit(frame(seq, false)) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        worker.stop();
        assert_eq!(native.keyframe_requests(), 1);
    }
}
