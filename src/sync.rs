use crate::track::TrackMode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

/// Where a track's record synchronization pulses come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncSource {
    #[default]
    None,
    /// Follow the track-sync master track.
    Track,
    /// Follow the host transport (the internal tempo transport here).
    Host,
    /// Follow incoming MIDI clock.
    Midi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseKind {
    Beat,
    Bar,
}

/// A synchronization tick that lands inside the current audio block.
#[derive(Debug, Clone, Copy)]
pub struct Pulse {
    /// Offset from the start of the block, in (unscaled) block frames.
    pub offset: u64,
    pub kind: PulseKind,
}

/// How a follower picks its leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LeaderKind {
    #[default]
    None,
    TrackSyncMaster,
    OutSyncMaster,
    FocusedTrack,
    Track(usize),
}

/// Cross-track notification protocol. A scheduler emits these through its
/// outbox; the engine routes them to registered followers on the same
/// callback, in track order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationId {
    Reset,
    RecordStart,
    RecordEnd,
    MuteStart,
    MuteEnd,
    /// A leader reached an event a follower was waiting on.
    Follower,
    LoopSize,
}

#[derive(Debug, Clone, Copy)]
pub struct Notification {
    pub id: NotificationId,
    pub source: usize,
    /// Loop length of the source track.
    pub frames: u64,
    /// Playback frame of the source track.
    pub current_frame: u64,
    /// Specific follower this is aimed at, if any; otherwise broadcast.
    pub follower: Option<usize>,
    /// Correlation id matching a pending event in the follower.
    pub event_id: u32,
}

/// Read-only view of a peer track, rebuilt by the engine every block so a
/// scheduler can resolve leaders and check drift without reaching into
/// another track's state.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerState {
    pub frames: u64,
    pub frame: u64,
    pub cycle_frames: u64,
    pub mode: TrackMode,
    pub track_sync_master: bool,
    pub out_sync_master: bool,
    pub focused: bool,
}

/// The sync facility the scheduler consumes: block pulse queries, follow
/// registration and drift reporting.
pub trait SyncPort {
    /// The pulse falling inside the current block for this source, if any.
    fn block_pulse(&mut self, track: usize, source: SyncSource) -> Option<Pulse>;
    /// Whether the source is delivering pulses at all right now.
    fn source_active(&self, source: SyncSource) -> bool;
    fn register_follower(&mut self, follower: usize, source: SyncSource);
    fn unregister_follower(&mut self, follower: usize);
    /// Accumulated drift between this track and its pulse source, in frames.
    fn drift(&self, track: usize) -> i64;
}

/// Clock state fed from the MIDI input thread: raw 24-ppq ticks and a
/// running flag, drained by the transport once per block.
#[derive(Debug, Default)]
pub struct MidiClock {
    pub ticks: AtomicU32,
    pub running: AtomicBool,
}

impl MidiClock {
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }
}

/// Tempo-derived pulse generator. Counts samples per beat with a fractional
/// carry so long runs stay on the grid, and exposes one pulse per block at
/// its in-block offset.
pub struct Transport {
    sample_rate: f32,
    tempo: f32,
    beats_per_bar: u32,
    samples_per_beat: f32,
    /// Frames left until the next beat lands, with fractional carry.
    until_beat: f32,
    beat: u64,
    running: bool,
    midi: Arc<MidiClock>,
    midi_ticks_seen: u32,
    /// Pulse computed for the current block, consumed by followers.
    block_pulse: Option<Pulse>,
    followers: Vec<(usize, SyncSource)>,
    drift: i64,
}

impl Transport {
    pub fn new(sample_rate: f32, tempo: f32, beats_per_bar: u32, midi: Arc<MidiClock>) -> Self {
        let samples_per_beat = (60.0 / tempo) * sample_rate;
        Self {
            sample_rate,
            tempo,
            beats_per_bar,
            samples_per_beat,
            until_beat: samples_per_beat,
            beat: 0,
            running: false,
            midi,
            midi_ticks_seen: 0,
            block_pulse: None,
            followers: Vec::with_capacity(16),
            drift: 0,
        }
    }

    pub fn set_tempo(&mut self, tempo: f32) {
        self.tempo = tempo;
        self.samples_per_beat = (60.0 / tempo) * self.sample_rate;
        debug!(tempo, "transport tempo changed");
    }

    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    pub fn start(&mut self) {
        self.running = true;
        self.until_beat = 0.0;
        self.beat = 0;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.block_pulse = None;
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn beat(&self) -> u64 {
        self.beat
    }

    /// Advance the transport over one block, computing the pulse (if any)
    /// that lands inside it. Called once per callback before any track runs.
    pub fn begin_block(&mut self, block_frames: u64) {
        self.block_pulse = None;
        if !self.running {
            return;
        }
        if self.until_beat < block_frames as f32 {
            let offset = if self.until_beat <= 0.0 {
                0
            } else {
                self.until_beat as u64
            };
            let kind = if self.beat % self.beats_per_bar as u64 == 0 {
                PulseKind::Bar
            } else {
                PulseKind::Beat
            };
            self.block_pulse = Some(Pulse { offset, kind });
            self.beat += 1;
            self.until_beat += self.samples_per_beat;
        }
        self.until_beat -= block_frames as f32;
    }

    fn midi_pulse(&mut self) -> Option<Pulse> {
        let ticks = self.midi.ticks.load(Ordering::Relaxed);
        let fresh = ticks.wrapping_sub(self.midi_ticks_seen);
        if fresh == 0 {
            return None;
        }
        self.midi_ticks_seen = ticks;
        // 24 ppq: a beat pulse every 24 ticks, reported at block start.
        if ticks % 24 < fresh {
            Some(Pulse {
                offset: 0,
                kind: PulseKind::Beat,
            })
        } else {
            None
        }
    }
}

impl SyncPort for Transport {
    fn block_pulse(&mut self, track: usize, source: SyncSource) -> Option<Pulse> {
        if !self.followers.iter().any(|(f, _)| *f == track) {
            return None;
        }
        match source {
            SyncSource::None | SyncSource::Track => None,
            SyncSource::Host => self.block_pulse,
            SyncSource::Midi => self.midi_pulse(),
        }
    }

    fn source_active(&self, source: SyncSource) -> bool {
        match source {
            SyncSource::None => false,
            // Track-source activity depends on a sync master existing, which
            // the scheduler checks against its peer view.
            SyncSource::Track => true,
            SyncSource::Host => self.running,
            SyncSource::Midi => self.midi.running.load(Ordering::Relaxed),
        }
    }

    fn register_follower(&mut self, follower: usize, source: SyncSource) {
        if !self.followers.iter().any(|(f, _)| *f == follower) {
            self.followers.push((follower, source));
        }
    }

    fn unregister_follower(&mut self, follower: usize) {
        self.followers.retain(|(f, _)| *f != follower);
    }

    fn drift(&self, _track: usize) -> i64 {
        self.drift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(tempo: f32) -> Transport {
        Transport::new(48000.0, tempo, 4, Arc::new(MidiClock::default()))
    }

    #[test]
    fn beats_land_at_sample_offsets() {
        // 120 bpm at 48k: a beat every 24000 frames.
        let mut t = transport(120.0);
        t.start();
        t.register_follower(0, SyncSource::Host);

        // First block carries the downbeat at offset 0.
        t.begin_block(256);
        let p = t.block_pulse(0, SyncSource::Host).expect("downbeat");
        assert_eq!(p.offset, 0);
        assert_eq!(p.kind, PulseKind::Bar);

        // The next beat is 24000 frames later: 92 full blocks of 256 pass
        // (256 + 92*256 = 23808), then the beat lands at offset 192.
        for _ in 0..92 {
            t.begin_block(256);
            assert!(t.block_pulse(0, SyncSource::Host).is_none());
        }
        t.begin_block(256);
        let p = t.block_pulse(0, SyncSource::Host).expect("beat two");
        assert_eq!(p.offset, 192);
        assert_eq!(p.kind, PulseKind::Beat);
    }

    #[test]
    fn unregistered_tracks_see_no_pulse() {
        let mut t = transport(120.0);
        t.start();
        t.begin_block(256);
        assert!(t.block_pulse(3, SyncSource::Host).is_none());
    }

    #[test]
    fn midi_clock_pulses_every_24_ticks() {
        let midi = Arc::new(MidiClock::default());
        let mut t = Transport::new(48000.0, 120.0, 4, midi.clone());
        t.register_follower(1, SyncSource::Midi);
        midi.set_running(true);

        for _ in 0..23 {
            midi.tick();
        }
        assert!(t.block_pulse(1, SyncSource::Midi).is_none());
        midi.tick();
        assert!(t.block_pulse(1, SyncSource::Midi).is_some());
    }
}
