mod advance;
mod looper;
mod switcher;

use crate::actions::ActionPool;
use crate::events::{EventKind, EventList, EventPool, WaitHandle};
use crate::session::{QuantizeMode, TrackParams};
use crate::sync::{LeaderKind, Notification, NotificationId, PeerState, SyncPort};
use crate::track::{LooperTrack, TrackMode};
use tracing::{info, warn};

/// Events and actions a warm pool is expected to cover. Growth past this is
/// logged, not fatal.
const EVENT_POOL_CAPACITY: usize = 32;
const ACTION_POOL_CAPACITY: usize = 64;

/// Messages a scheduler leaves for the engine to route after its advance:
/// notifications to follower tracks, wait requests aimed at a leader track,
/// and user-facing alerts.
#[derive(Debug)]
pub enum SchedulerMessage {
    Notify(Notification),
    LeaderWait {
        leader: usize,
        unit: QuantizeMode,
        event_id: u32,
    },
    Alert(&'static str),
}

/// Unit a script wait resolves against.
#[derive(Debug, Clone, Copy)]
pub enum WaitUnit {
    Frame(u64),
    Subcycle,
    Cycle,
    Loop,
}

/// One-way projection of the pending event state, for display only.
#[derive(Debug, Clone, Default)]
pub struct SchedulerSnapshot {
    pub events: Vec<EventSnapshot>,
}

#[derive(Debug, Clone)]
pub struct EventSnapshot {
    pub name: &'static str,
    pub frame: u64,
    pub pending: bool,
    pub stacked: Vec<&'static str>,
}

/// Routing state derived from the track and the event list. Never stored;
/// re-derived on every inbound action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteState {
    Reset,
    Paused,
    Recording,
    Switching,
    Rounding,
    Active,
}

/// The per-track action scheduler: owns the event list and pools, translates
/// inbound actions into immediate calls or scheduled events, and advances
/// loop playback in lockstep with the event list.
///
/// One cohesive state machine, split across `advance`, `looper` and
/// `switcher` for readability; the submodules share this struct's fields
/// directly. Only the narrow action/notification surface is public.
pub struct TrackScheduler {
    pub(crate) number: usize,
    pub(crate) params: TrackParams,
    pub(crate) events: EventList,
    pub(crate) pool: EventPool,
    pub(crate) actions: ActionPool,
    /// Fractional remainder of rate-scaled block frames, carried between
    /// blocks so repeated truncation cannot drift.
    pub(crate) rate_carryover: f32,
    pub(crate) next_correlation: u32,
    pub(crate) outbox: Vec<SchedulerMessage>,
}

impl TrackScheduler {
    pub fn new(number: usize, params: TrackParams) -> Self {
        Self {
            number,
            params,
            events: EventList::with_capacity(EVENT_POOL_CAPACITY),
            pool: EventPool::with_capacity(EVENT_POOL_CAPACITY),
            actions: ActionPool::with_capacity(ACTION_POOL_CAPACITY),
            rate_carryover: 0.0,
            next_correlation: 0,
            outbox: Vec::with_capacity(16),
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn params(&self) -> &TrackParams {
        &self.params
    }

    pub fn set_params(&mut self, params: TrackParams) {
        self.params = params;
    }

    /// Drain the messages accumulated since the last drain. The engine calls
    /// this after every advance and action burst, routing in track order.
    pub fn drain_outbox(&mut self, into: &mut Vec<SchedulerMessage>) {
        into.append(&mut self.outbox);
    }

    /// Schedule a wait event for an external waiter (a script). The waiter
    /// is told when the event fires, or told of cancellation if the event is
    /// swept away by a reset.
    pub fn schedule_wait(&mut self, track: &dyn LooperTrack, unit: WaitUnit, handle: WaitHandle) {
        let frame = match unit {
            WaitUnit::Frame(frame) => frame,
            WaitUnit::Subcycle => {
                self.quantized_frame(track, QuantizeMode::Subcycle, track.frame(), true)
            }
            WaitUnit::Cycle => self.quantized_frame(track, QuantizeMode::Cycle, track.frame(), true),
            WaitUnit::Loop => self.quantized_frame(track, QuantizeMode::Loop, track.frame(), true),
        };
        let mut event = self.pool.new_event(EventKind::Wait);
        event.frame = frame;
        event.wait = Some(handle);
        if let Some(refused) = self.events.add(event, false) {
            self.pool.cancel(refused, &mut self.actions);
        }
    }

    /// Leader side of a correlated follower wait: schedule a Wait event at
    /// this track's next `unit` boundary; when it fires, a Follower
    /// notification carrying `event_id` goes back out through the engine.
    pub fn schedule_follower_wait(
        &mut self,
        track: &dyn LooperTrack,
        unit: QuantizeMode,
        event_id: u32,
    ) {
        let frame = self.quantized_frame(track, unit, track.frame(), false);
        let mut event = self.pool.new_event(EventKind::Wait);
        event.frame = frame;
        event.correlation_id = event_id;
        if let Some(refused) = self.events.add(event, false) {
            self.pool.dispose(refused, &mut self.actions);
        }
    }

    /// A notification from another track (or the engine) addressed to us.
    pub fn handle_notification(&mut self, track: &mut dyn LooperTrack, note: &Notification) {
        match note.id {
            NotificationId::Reset => track.leader_reset(),
            NotificationId::RecordStart => track.leader_record_start(),
            NotificationId::RecordEnd => track.leader_record_end(),
            NotificationId::MuteStart => track.leader_mute_start(),
            NotificationId::MuteEnd => track.leader_mute_end(),
            NotificationId::LoopSize => {
                track.leader_resized(note.frames);
                track.leader_moved(note.current_frame);
                // The rate basis just changed under us.
                self.rate_carryover = 0.0;
            }
            NotificationId::Follower => {
                if let Some(mut event) = self.events.consume_pending_leader(note.event_id) {
                    event.pending = false;
                    event.pulsed = false;
                    event.frame = track.frame();
                    if let Some(refused) = self.events.add(event, false) {
                        self.pool.cancel(refused, &mut self.actions);
                    }
                } else {
                    warn!(
                        track = self.number,
                        event_id = note.event_id,
                        "follower notification with no matching pending event"
                    );
                }
            }
        }
    }

    /// Cancel all scheduled work. Waiters are told; everything returns to
    /// the pools.
    pub fn clear_events(&mut self) {
        self.events.clear(&mut self.pool, &mut self.actions);
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            events: self
                .events
                .iter()
                .map(|e| EventSnapshot {
                    name: e.name(),
                    frame: e.frame,
                    pending: e.pending,
                    stacked: e.stacked.iter().map(|a| a.symbol.name()).collect(),
                })
                .collect(),
        }
    }

    /// Display mode, folding in the pending-sync pseudo-state.
    pub fn display_mode(&self, track: &dyn LooperTrack) -> TrackMode {
        if track.mode() == TrackMode::Reset && self.has_pending_record_start() {
            TrackMode::Synchronize
        } else {
            track.mode()
        }
    }

    // ---- shared helpers -------------------------------------------------

    pub(crate) fn correlation_id(&mut self) -> u32 {
        self.next_correlation = self.next_correlation.wrapping_add(1);
        if self.next_correlation == 0 {
            self.next_correlation = 1;
        }
        self.next_correlation
    }

    pub(crate) fn has_pending_record_start(&self) -> bool {
        self.events
            .find_where(|e| e.kind == EventKind::Record { end: false })
            .is_some()
    }

    pub(crate) fn route_state(&self, track: &dyn LooperTrack) -> RouteState {
        match track.mode() {
            TrackMode::Reset if self.has_pending_record_start() => RouteState::Recording,
            TrackMode::Reset => RouteState::Reset,
            TrackMode::Pause => RouteState::Paused,
            TrackMode::Record | TrackMode::Synchronize => RouteState::Recording,
            mode => {
                if self.events.find(EventKind::Switch).is_some() {
                    RouteState::Switching
                } else if matches!(mode, TrackMode::Multiply | TrackMode::Insert)
                    && self.events.find(EventKind::Round).is_some()
                {
                    RouteState::Rounding
                } else {
                    RouteState::Active
                }
            }
        }
    }

    /// Resolve who this track follows right now. On-demand only; there is
    /// no polling for leader changes.
    pub(crate) fn resolve_leader(&self, peers: &[PeerState]) -> Option<usize> {
        let pick = |pred: fn(&PeerState) -> bool| {
            peers
                .iter()
                .enumerate()
                .find(|(i, p)| *i != self.number && pred(p))
                .map(|(i, _)| i)
        };
        match self.params.leader {
            LeaderKind::None => None,
            LeaderKind::TrackSyncMaster => pick(|p| p.track_sync_master),
            LeaderKind::OutSyncMaster => pick(|p| p.out_sync_master),
            LeaderKind::FocusedTrack => pick(|p| p.focused),
            LeaderKind::Track(n) => {
                if n != self.number && n < peers.len() {
                    Some(n)
                } else {
                    if n >= peers.len() {
                        warn!(track = self.number, leader = n, "leader track out of range");
                    }
                    None
                }
            }
        }
    }

    fn quantize_unit_frames(&self, track: &dyn LooperTrack, unit: QuantizeMode) -> u64 {
        match unit {
            QuantizeMode::Off => 0,
            QuantizeMode::Subcycle => {
                let subcycles = track.subcycles().max(1) as u64;
                track.cycle_frames() / subcycles
            }
            QuantizeMode::Cycle => track.cycle_frames(),
            QuantizeMode::Loop => track.loop_frames(),
        }
    }

    /// Next `unit` boundary at-or-after `from` (or strictly after, with
    /// `after`). With no usable unit the reference frame comes straight
    /// back, meaning immediate execution.
    pub(crate) fn quantized_frame(
        &self,
        track: &dyn LooperTrack,
        unit: QuantizeMode,
        from: u64,
        after: bool,
    ) -> u64 {
        let q = self.quantize_unit_frames(track, unit);
        if q == 0 {
            return from;
        }
        if after {
            ((from / q) + 1) * q
        } else {
            from.div_ceil(q) * q
        }
    }

    pub(crate) fn emit(&mut self, id: NotificationId, track: &dyn LooperTrack) {
        self.outbox.push(SchedulerMessage::Notify(Notification {
            id,
            source: self.number,
            frames: track.loop_frames(),
            current_frame: track.frame(),
            follower: None,
            event_id: 0,
        }));
    }

    pub(crate) fn alert(&mut self, message: &'static str) {
        info!(track = self.number, message, "unsupported action");
        self.outbox.push(SchedulerMessage::Alert(message));
    }

    /// Record-sync gate: true when the configured source is actually able to
    /// deliver a pulse to synchronize against.
    pub(crate) fn is_record_synced(
        &self,
        sync: &dyn SyncPort,
        peers: &[PeerState],
    ) -> bool {
        match self.params.sync_source {
            crate::sync::SyncSource::None => false,
            crate::sync::SyncSource::Track => peers
                .iter()
                .enumerate()
                .any(|(i, p)| i != self.number && p.track_sync_master && p.frames > 0),
            source => sync.source_active(source),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::actions::{ActionDesc, Symbol};
    use crate::sync::{Pulse, SyncSource};
    use std::collections::VecDeque;

    /// A track fixture that records every capability call and mutates just
    /// enough state for the scheduler's queries to stay coherent.
    pub struct ScriptedTrack {
        pub mode: TrackMode,
        pub frame: u64,
        pub loops: Vec<u64>,
        pub loop_index: usize,
        pub cycle_frames: u64,
        pub subcycles: u32,
        pub rate: f32,
        pub goal: u64,
        pub mode_end: u64,
        pub overdub: bool,
        pub mute: bool,
        pub reverse: bool,
        pub calls: Vec<String>,
    }

    impl ScriptedTrack {
        pub fn reset() -> Self {
            Self {
                mode: TrackMode::Reset,
                frame: 0,
                loops: vec![0; 4],
                loop_index: 0,
                cycle_frames: 0,
                subcycles: 4,
                rate: 1.0,
                goal: 0,
                mode_end: 0,
                overdub: false,
                mute: false,
                reverse: false,
                calls: Vec::new(),
            }
        }

        /// A track playing a recorded loop: 48000 frames, 12000-frame cycles.
        pub fn playing() -> Self {
            let mut t = Self::reset();
            t.mode = TrackMode::Play;
            t.loops[0] = 48000;
            t.cycle_frames = 12000;
            t
        }

        fn call(&mut self, name: &str) {
            self.calls.push(name.to_string());
        }

        pub fn called(&self, name: &str) -> bool {
            self.calls.iter().any(|c| c == name)
        }
    }

    impl LooperTrack for ScriptedTrack {
        fn mode(&self) -> TrackMode {
            self.mode
        }
        fn frame(&self) -> u64 {
            self.frame
        }
        fn loop_frames(&self) -> u64 {
            self.loops[self.loop_index]
        }
        fn cycle_frames(&self) -> u64 {
            self.cycle_frames
        }
        fn subcycles(&self) -> u32 {
            self.subcycles
        }
        fn loop_index(&self) -> usize {
            self.loop_index
        }
        fn loop_count(&self) -> usize {
            self.loops.len()
        }
        fn rate(&self) -> f32 {
            self.rate
        }
        fn goal_frames(&self) -> u64 {
            self.goal
        }
        fn mode_end_frame(&self) -> u64 {
            self.mode_end
        }
        fn overdub_active(&self) -> bool {
            self.overdub
        }
        fn mute_active(&self) -> bool {
            self.mute
        }
        fn reverse_active(&self) -> bool {
            self.reverse
        }

        fn start_record(&mut self) {
            self.call("start_record");
            self.mode = TrackMode::Record;
            self.frame = 0;
            self.loops[self.loop_index] = 0;
        }
        fn finish_record(&mut self) {
            self.call("finish_record");
            self.loops[self.loop_index] = self.frame;
            self.cycle_frames = self.frame;
            self.mode = TrackMode::Play;
            self.frame = 0;
        }

        fn start_multiply(&mut self) {
            self.call("start_multiply");
            self.mode = TrackMode::Multiply;
        }
        fn finish_multiply(&mut self) {
            self.call("finish_multiply");
            self.mode = TrackMode::Play;
        }
        fn unrounded_multiply(&mut self) {
            self.call("unrounded_multiply");
            self.mode = TrackMode::Play;
        }

        fn start_insert(&mut self) {
            self.call("start_insert");
            self.mode = TrackMode::Insert;
            self.mode_end = self.frame + self.cycle_frames;
        }
        fn extend_insert(&mut self) {
            self.call("extend_insert");
            self.mode_end += self.cycle_frames;
        }
        fn finish_insert(&mut self) {
            self.call("finish_insert");
            self.mode = TrackMode::Play;
        }
        fn unrounded_insert(&mut self) {
            self.call("unrounded_insert");
            self.mode = TrackMode::Play;
        }

        fn toggle_overdub(&mut self) {
            self.call("toggle_overdub");
            self.overdub = !self.overdub;
        }
        fn toggle_mute(&mut self) {
            self.call("toggle_mute");
            self.mute = !self.mute;
        }
        fn toggle_replace(&mut self) {
            self.call("toggle_replace");
            self.mode = if self.mode == TrackMode::Replace {
                TrackMode::Play
            } else {
                TrackMode::Replace
            };
        }

        fn finish_switch(&mut self, target: usize) -> bool {
            self.call(&format!("finish_switch:{target}"));
            self.loop_index = target;
            self.frame = 0;
            self.mode = TrackMode::Play;
            self.loops[target] == 0
        }
        fn loop_copy(&mut self, sound: bool, timing: bool) {
            self.call(&format!("loop_copy:{sound}:{timing}"));
        }

        fn start_pause(&mut self) {
            self.call("start_pause");
            self.mode = TrackMode::Pause;
        }
        fn finish_pause(&mut self) {
            self.call("finish_pause");
            self.mode = TrackMode::Play;
        }

        fn do_undo(&mut self) {
            self.call("do_undo");
        }
        fn do_redo(&mut self) {
            self.call("do_redo");
        }
        fn do_reset(&mut self) {
            self.call("do_reset");
            self.mode = TrackMode::Reset;
            self.loops[self.loop_index] = 0;
            self.frame = 0;
        }
        fn do_track_reset(&mut self) {
            self.call("do_track_reset");
            self.mode = TrackMode::Reset;
            self.loops.iter_mut().for_each(|l| *l = 0);
            self.frame = 0;
        }
        fn do_start(&mut self) {
            self.call("do_start");
            self.frame = 0;
            self.mode = TrackMode::Play;
        }
        fn do_stop(&mut self) {
            self.call("do_stop");
            self.frame = 0;
            self.mode = TrackMode::Pause;
        }
        fn do_play(&mut self) {
            self.call("do_play");
            self.mode = TrackMode::Play;
        }

        fn instant_multiply(&mut self, multiple: u32) {
            self.call(&format!("instant_multiply:{multiple}"));
        }
        fn instant_divide(&mut self, divisor: u32) {
            self.call(&format!("instant_divide:{divisor}"));
        }

        fn leader_reset(&mut self) {
            self.call("leader_reset");
        }
        fn leader_record_start(&mut self) {
            self.call("leader_record_start");
        }
        fn leader_record_end(&mut self) {
            self.call("leader_record_end");
        }
        fn leader_mute_start(&mut self) {
            self.call("leader_mute_start");
        }
        fn leader_mute_end(&mut self) {
            self.call("leader_mute_end");
        }
        fn leader_resized(&mut self, frames: u64) {
            self.call(&format!("leader_resized:{frames}"));
        }
        fn leader_moved(&mut self, frame: u64) {
            self.call(&format!("leader_moved:{frame}"));
        }

        fn advance(&mut self, frames: u64) {
            self.frame += frames;
        }
        fn loop_wrap(&mut self) {
            self.call("loop");
            self.frame = self.frame.saturating_sub(self.loop_frames());
        }
    }

    /// Sync fixture: hand-queued pulses, settable activity.
    pub struct TestSync {
        pub pulses: VecDeque<Pulse>,
        pub host_active: bool,
        pub midi_active: bool,
        pub followers: Vec<usize>,
    }

    impl TestSync {
        pub fn idle() -> Self {
            Self {
                pulses: VecDeque::new(),
                host_active: false,
                midi_active: false,
                followers: Vec::new(),
            }
        }

        pub fn with_pulse(offset: u64) -> Self {
            let mut s = Self::idle();
            s.host_active = true;
            s.pulses.push_back(Pulse {
                offset,
                kind: crate::sync::PulseKind::Beat,
            });
            s
        }
    }

    impl SyncPort for TestSync {
        fn block_pulse(&mut self, _track: usize, source: SyncSource) -> Option<Pulse> {
            if source == SyncSource::None {
                return None;
            }
            self.pulses.pop_front()
        }
        fn source_active(&self, source: SyncSource) -> bool {
            match source {
                SyncSource::None => false,
                SyncSource::Track => true,
                SyncSource::Host => self.host_active,
                SyncSource::Midi => self.midi_active,
            }
        }
        fn register_follower(&mut self, follower: usize, _source: SyncSource) {
            if !self.followers.contains(&follower) {
                self.followers.push(follower);
            }
        }
        fn unregister_follower(&mut self, follower: usize) {
            self.followers.retain(|f| *f != follower);
        }
        fn drift(&self, _track: usize) -> i64 {
            0
        }
    }

    pub fn scheduler(params: TrackParams) -> TrackScheduler {
        TrackScheduler::new(0, params)
    }

    pub fn desc(symbol: Symbol) -> ActionDesc {
        ActionDesc::new(symbol)
    }
}
