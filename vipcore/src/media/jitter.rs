//! Jitter pre-buffering for inbound audio.
//!
//! Packets are held until the playout delay has elapsed since the first
//! arrival, then released in sequence order. Gaps are skipped once a later
//! packet is available so a single lost packet does not stall playout.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::packet::{AUDIO_SAMPLE_RATE, AudioPacket};

#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Delay before the first packet is released.
    pub prebuffer: Duration,
    pub max_packets: usize,
    /// Packets older than this are discarded unplayed.
    pub max_age: Duration,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            prebuffer: Duration::from_millis(80), // two frames
            max_packets: 25,                      // one second of 40 ms frames
            max_age: Duration::from_millis(600),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JitterStats {
    pub received: u64,
    pub played: u64,
    pub dropped: u64,
    pub duplicates: u64,
    /// Interarrival jitter estimate (RFC 3550), in milliseconds.
    pub jitter_ms: f64,
}

#[derive(Debug)]
struct Slot {
    packet: AudioPacket,
    arrived: Instant,
}

pub struct JitterBuffer {
    config: JitterBufferConfig,
    slots: BTreeMap<u16, Slot>,
    /// Sequence of the first packet received, the reference for ordering
    /// before anything has played.
    anchor: Option<u16>,
    next_seq: Option<u16>,
    started_at: Option<Instant>,
    last_arrival: Option<(Instant, u32)>,
    jitter_us: f64,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        Self {
            config,
            slots: BTreeMap::new(),
            anchor: None,
            next_seq: None,
            started_at: None,
            last_arrival: None,
            jitter_us: 0.0,
            stats: JitterStats::default(),
        }
    }

    pub fn push(&mut self, packet: AudioPacket, now: Instant) {
        self.stats.received += 1;
        self.started_at.get_or_insert(now);
        self.track_jitter(now, packet.timestamp);

        let seq = packet.seq;
        self.anchor.get_or_insert(seq);
        if self.slots.contains_key(&seq) {
            self.stats.duplicates += 1;
            return;
        }
        if self.stats.played > 0
            && let Some(next) = self.next_seq
            && (seq.wrapping_sub(next) as i16) < 0
        {
            // Already played past this one.
            self.stats.dropped += 1;
            return;
        }
        if self.slots.len() >= self.config.max_packets
            && let Some(oldest) = self.earliest()
        {
            self.slots.remove(&oldest);
            self.stats.dropped += 1;
        }
        self.slots.insert(
            seq,
            Slot {
                packet,
                arrived: now,
            },
        );
    }

    /// Next packet due for playout, or `None` while pre-buffering or when
    /// nothing is available.
    pub fn pop(&mut self, now: Instant) -> Option<AudioPacket> {
        let started = self.started_at?;
        if now.duration_since(started) < self.config.prebuffer {
            return None;
        }

        let max_age = self.config.max_age;
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| now.duration_since(slot.arrived) < max_age);
        self.stats.dropped += (before - self.slots.len()) as u64;

        if self.stats.played == 0 {
            // Out-of-order first arrivals: start at the earliest sequence.
            self.next_seq = self.earliest().or(self.next_seq);
        }
        let expected = self.next_seq?;

        let seq = if self.slots.contains_key(&expected) {
            expected
        } else {
            // Everything buffered is at or after `expected`, so the nearest
            // one forward is the next to play, across the u16 wrap.
            let available = self
                .slots
                .keys()
                .copied()
                .min_by_key(|seq| seq.wrapping_sub(expected))?;
            let gap = available.wrapping_sub(expected);
            if gap >= 100 {
                return None;
            }
            self.stats.dropped += gap as u64;
            available
        };

        let slot = self.slots.remove(&seq)?;
        self.next_seq = Some(seq.wrapping_add(1));
        self.stats.played += 1;
        Some(slot.packet)
    }

    /// Buffered sequence that comes first in playout order, measured from
    /// the playout position or, before playout starts, the first arrival.
    fn earliest(&self) -> Option<u16> {
        let reference = self.next_seq.filter(|_| self.stats.played > 0).or(self.anchor)?;
        self.slots
            .keys()
            .copied()
            .min_by_key(|seq| seq.wrapping_sub(reference) as i16)
    }

    fn track_jitter(&mut self, now: Instant, timestamp: u32) {
        if let Some((last_at, last_ts)) = self.last_arrival {
            let arrival_us = now.duration_since(last_at).as_micros() as f64;
            let media_us =
                timestamp.wrapping_sub(last_ts) as f64 * 1_000_000.0 / AUDIO_SAMPLE_RATE as f64;
            let d = (arrival_us - media_us).abs();
            self.jitter_us += (d - self.jitter_us) / 16.0;
            self.stats.jitter_ms = self.jitter_us / 1000.0;
        }
        self.last_arrival = Some((now, timestamp));
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> JitterStats {
        self.stats.clone()
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

impl std::fmt::Debug for JitterBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitterBuffer")
            .field("depth", &self.slots.len())
            .field("next_seq", &self.next_seq)
            .field("stats", &self.stats)
            .finish()
    }
}
