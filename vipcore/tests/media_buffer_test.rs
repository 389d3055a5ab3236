use vipcore::media::echo::FirEchoCanceller;
use vipcore::media::packet::AUDIO_FRAME_SAMPLES;
use vipcore::media::{CircularBuffer, EchoCanceller, EchoState, FrameRead, SampleRing};

#[test]
fn test_circular_buffer_keeps_most_recent_items() {
    for capacity in [1usize, 7, 64] {
        for written in [0usize, 1, capacity, capacity + 1, capacity * 3 + 5] {
            let buffer = CircularBuffer::new(capacity);
            let data: Vec<u32> = (0..written as u32).collect();
            let overwritten = buffer.write(&data);

            assert_eq!(overwritten, written.saturating_sub(capacity));
            let kept = written.min(capacity);
            assert_eq!(buffer.len(), kept);
            assert_eq!(buffer.snapshot(), data[written - kept..].to_vec());
        }
    }
}

#[test]
fn test_empty_reads_are_well_defined() {
    let buffer = CircularBuffer::<i16>::new(16);
    let mut out = [7i16; 4];
    assert_eq!(buffer.read(&mut out), 0);
    assert_eq!(out, [7; 4]);
    assert!(!buffer.read_exact(&mut out));

    buffer.write(&[1, 2]);
    assert!(!buffer.read_exact(&mut out));
    assert_eq!(buffer.read(&mut out), 2);
    assert_eq!(&out[..2], &[1, 2]);
    assert!(buffer.is_empty());
}

#[test]
fn test_sample_ring_underrun_yields_silence() {
    let (mut writer, mut reader) = SampleRing::default().split();
    let mut frame = [5i16; AUDIO_FRAME_SAMPLES];
    assert_eq!(reader.get_samples(&mut frame), FrameRead::NoData);
    assert!(frame.iter().all(|&s| s == 0));

    assert!(writer.add_samples(&[1; AUDIO_FRAME_SAMPLES - 1]).is_err());
    writer.add_samples(&[3; AUDIO_FRAME_SAMPLES * 2]).unwrap();
    assert_eq!(reader.frames_available(), 2);
    assert_eq!(reader.get_samples(&mut frame), FrameRead::Frame);
    assert!(frame.iter().all(|&s| s == 3));
}

#[test]
fn test_sample_ring_halves_cross_threads_in_order() {
    let (mut writer, mut reader) = SampleRing::default().split();
    let producer = std::thread::spawn(move || {
        for value in 0..200i16 {
            while writer.frames_free() == 0 {
                std::thread::yield_now();
            }
            writer.add_samples(&[value; AUDIO_FRAME_SAMPLES]).unwrap();
        }
    });

    let mut frame = [0i16; AUDIO_FRAME_SAMPLES];
    let mut next = 0i16;
    while next < 200 {
        if reader.get_samples(&mut frame) == FrameRead::Frame {
            assert!(frame.iter().all(|&s| s == next));
            next += 1;
        } else {
            std::thread::yield_now();
        }
    }
    producer.join().unwrap();
    assert_eq!(reader.skipped(), 0);
}

/// Single reflection: the microphone hears `gain * played[n - delay]`.
struct Room {
    played: Vec<i16>,
    delay: usize,
    gain: f32,
}

impl Room {
    fn capture(&self, start: usize) -> Vec<i16> {
        (start..start + AUDIO_FRAME_SAMPLES)
            .map(|n| {
                n.checked_sub(self.delay)
                    .and_then(|i| self.played.get(i))
                    .map(|&s| (s as f32 * self.gain).round().clamp(-32768.0, 32767.0) as i16)
                    .unwrap_or(0)
            })
            .collect()
    }
}

fn drive(aec: &mut FirEchoCanceller, room: &mut Room, frames: usize, seed: &mut u32) {
    for _ in 0..frames {
        let mut speaker: Vec<i16> = (0..AUDIO_FRAME_SAMPLES)
            .map(|_| {
                *seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((*seed >> 16) as i16) / 4
            })
            .collect();
        aec.process_speaker(&mut speaker);
        let start = room.played.len();
        room.played.extend_from_slice(&speaker);
        let mut mic = room.capture(start);
        aec.process_mic(&mut mic);
    }
}

#[test]
fn test_calibration_order_holds_after_every_reset() {
    let mut aec = FirEchoCanceller::default();
    let mut seed = 11;

    for (round, &interrupt_after) in [3usize, 15, 40, 0, 25].iter().enumerate() {
        let mut room = Room {
            played: Vec::new(),
            delay: 8 + round * 9,
            gain: 0.4,
        };
        drive(&mut aec, &mut room, interrupt_after, &mut seed);
        aec.reset();
        assert_eq!(aec.state(), EchoState::MicStartupWait);
        assert_eq!(aec.visited_states(), &[EchoState::MicStartupWait]);
    }

    let mut room = Room {
        played: Vec::new(),
        delay: 30,
        gain: 0.4,
    };
    drive(&mut aec, &mut room, 40, &mut seed);
    assert_eq!(aec.state(), EchoState::Run);
    let visited = aec.visited_states();
    let pos = |state| visited.iter().position(|v| *v == state).unwrap();
    assert!(pos(EchoState::MicStartupWait) < pos(EchoState::PerfectSequence));
    assert!(pos(EchoState::PerfectSequence) < pos(EchoState::CrossCorrelationSavingSamples));
    assert!(pos(EchoState::CrossCorrelationSavingSamples) < pos(EchoState::FirCalculating));
    assert!(pos(EchoState::FirCalculating) < pos(EchoState::Run));
}

#[test]
fn test_speaker_is_silent_during_startup() {
    let mut aec = FirEchoCanceller::default();
    let mut frame = [1000i16; AUDIO_FRAME_SAMPLES];
    aec.process_speaker(&mut frame);
    assert_eq!(aec.state(), EchoState::MicStartupWait);
    assert!(frame.iter().all(|&s| s == 0));
}
