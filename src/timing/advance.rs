use super::{SchedulerMessage, TrackScheduler};
use crate::events::{Event, EventKind};
use crate::sync::{Notification, NotificationId, PeerState, SyncPort};
use crate::track::{LooperTrack, TrackMode};
use tracing::{debug, warn};

/// What an event handler did with the event it was given. `Reused` means the
/// handler updated the event in place (a self-rescheduling extension) and it
/// goes back on the list instead of to the pool.
pub(crate) enum EventOutcome {
    Done,
    Reused,
}

impl TrackScheduler {
    /// Advance this track over one audio block. The only entry point that
    /// makes time progress; everything here is O(events-in-block) and
    /// allocation-free once the pools are warm.
    pub fn advance(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        block_frames: u64,
    ) {
        if track.mode() == TrackMode::Pause {
            self.pause_advance(track, sync, peers, block_frames);
            return;
        }

        let rate = track.rate();

        // Inject this block's sync pulse as a priority event so pulse
        // handling interleaves correctly with quantized events that landed
        // on the same frame.
        if let Some(pulse) = sync.block_pulse(self.number, self.params.sync_source) {
            let offset = if rate == 1.0 {
                pulse.offset
            } else {
                (pulse.offset as f32 * rate) as u64
            };
            let mut event = self.pool.new_event(EventKind::Sync);
            event.frame = track.frame() + offset;
            if let Some(refused) = self.events.add(event, true) {
                self.pool.dispose(refused, &mut self.actions);
            }
        }

        let mut remaining = self.scale_frames(rate, block_frames);

        // An empty or still-growing loop has no boundary to cross.
        if track.loop_frames() == 0 || track.mode().is_extending() {
            self.consume_block(track, sync, peers, remaining);
            return;
        }

        // Already sitting at or past the boundary: wrap before consuming.
        // Loop geometry is re-derived every pass since a fired event can
        // change it mid-block.
        while remaining > 0 {
            let loop_frames = track.loop_frames();
            if loop_frames == 0 || track.mode().is_extending() {
                // An event mid-block put the loop back into a growing state;
                // the rest of the block just grows with it.
                self.consume_block(track, sync, peers, remaining);
                return;
            }
            if track.frame() >= loop_frames {
                self.wrap(track, peers);
                continue;
            }
            let room = loop_frames - track.frame();
            if remaining < room {
                self.consume_block(track, sync, peers, remaining);
                return;
            }
            self.consume_block(track, sync, peers, room);
            remaining -= room;
        }
        if track.loop_frames() > 0
            && !track.mode().is_extending()
            && track.frame() >= track.loop_frames()
        {
            self.wrap(track, peers);
        }
    }

    /// Scale block frames by the playback rate, retaining the fractional
    /// remainder for the next block so repeated truncation cannot drift.
    fn scale_frames(&mut self, rate: f32, block_frames: u64) -> u64 {
        if rate == 1.0 {
            return block_frames;
        }
        let scaled = block_frames as f32 * rate + self.rate_carryover;
        let whole = scaled.floor();
        self.rate_carryover = scaled - whole;
        whole as u64
    }

    /// Reduced advance while paused: the track position holds, mode events
    /// hold, but pulses can still activate a pulsed resume and waits and
    /// deferred actions keep their deadlines so long-running scripts don't
    /// stall.
    fn pause_advance(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        block_frames: u64,
    ) {
        if sync.block_pulse(self.number, self.params.sync_source).is_some() {
            self.activate_pulsed(track);
        }

        let horizon = track.frame() + block_frames;
        loop {
            let due = self.events.consume_where(|e| {
                !e.pending
                    && e.frame <= horizon
                    && matches!(e.kind, EventKind::Wait | EventKind::Action)
            });
            match due {
                Some(event) => self.do_event(track, sync, peers, event),
                None => break,
            }
        }
    }

    /// The loop boundary was crossed: delegate the wrap to the track, pull
    /// every scheduled event back by one loop, and check drift against the
    /// leader.
    fn wrap(&mut self, track: &mut dyn LooperTrack, peers: &[PeerState]) {
        let loop_frames = track.loop_frames();
        track.loop_wrap();
        self.events.shift(loop_frames);

        if loop_frames == 0 {
            return;
        }
        if let Some(leader) = self.resolve_leader(peers) {
            let peer = &peers[leader];
            if peer.frames >= loop_frames {
                let expected = peer.frame % loop_frames;
                let delta = expected as i64 - track.frame() as i64;
                if delta != 0 {
                    // Hook point for a correction policy; observation only.
                    debug!(track = self.number, leader, delta, "drift after loop wrap");
                }
            }
        }
    }

    /// Consume `frames`, stopping at every event inside the span: advance
    /// the track up to the event's frame, fire it, re-derive the bounds and
    /// continue with whatever is left.
    fn consume_block(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        mut frames: u64,
    ) {
        while frames > 0 {
            let start = track.frame();
            let end = start + frames - 1;
            match self.events.consume(start, end) {
                Some(event) => {
                    let step = event.frame.saturating_sub(start);
                    if step > 0 {
                        track.advance(step);
                        frames -= step;
                    }
                    self.do_event(track, sync, peers, event);
                }
                None => {
                    track.advance(frames);
                    frames = 0;
                }
            }
        }
    }

    /// A pulse arrived: give the (at most one) event waiting on it a
    /// concrete frame and put it back in the list as an ordinary event.
    fn activate_pulsed(&mut self, track: &dyn LooperTrack) {
        if let Some(mut event) = self.events.consume_pulsed() {
            event.pending = false;
            event.pulsed = false;
            event.frame = track.frame();
            debug!(
                track = self.number,
                event = event.name(),
                frame = event.frame,
                "pulse activated pending event"
            );
            if let Some(refused) = self.events.add(event, false) {
                self.pool.cancel(refused, &mut self.actions);
            }
        }
    }

    /// Dispatch one fired event by type. After dispatch the waiter (if any)
    /// is told the event fired, stacked actions go back through normal
    /// routing, and the event returns to the pool — unless the handler
    /// reused it.
    pub(crate) fn do_event(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        mut event: Box<Event>,
    ) {
        let outcome = match event.kind {
            EventKind::None => {
                warn!(track = self.number, "fired an uninitialized event");
                EventOutcome::Done
            }
            EventKind::Sync => {
                self.activate_pulsed(track);
                EventOutcome::Done
            }
            EventKind::Action => {
                if let Some(action) = event.primary.take() {
                    self.execute_now(track, sync, peers, action);
                }
                EventOutcome::Done
            }
            EventKind::Wait => {
                if event.correlation_id != 0 {
                    self.outbox.push(SchedulerMessage::Notify(Notification {
                        id: NotificationId::Follower,
                        source: self.number,
                        frames: track.loop_frames(),
                        current_frame: track.frame(),
                        follower: None,
                        event_id: event.correlation_id,
                    }));
                }
                EventOutcome::Done
            }
            EventKind::Record { end } => self.record_event(track, sync, peers, &mut event, end),
            EventKind::Round => self.round_event(track, &mut event),
            EventKind::Switch => self.switch_event(track, sync, peers, &mut event),
        };

        match outcome {
            EventOutcome::Reused => {
                if let Some(refused) = self.events.add(event, false) {
                    self.pool.cancel(refused, &mut self.actions);
                }
            }
            EventOutcome::Done => {
                if let Some(wait) = event.wait.take() {
                    wait.fire(event.frame);
                }
                while !event.stacked.is_empty() {
                    let action = event.stacked.remove(0);
                    self.do_pooled_action(track, sync, peers, action);
                }
                self.pool.dispose(event, &mut self.actions);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use crate::actions::Symbol;
    use crate::events::{EventKind, WaitHandle, WaitOutcome};
    use crate::session::TrackParams;
    use crate::sync::SyncSource;
    use crate::timing::WaitUnit;
    use crate::track::TrackMode;

    #[test]
    fn events_carve_the_block() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();

        let (handle, rx) = WaitHandle::new();
        sched.schedule_wait(&track, WaitUnit::Frame(100), handle);
        let (handle2, rx2) = WaitHandle::new();
        sched.schedule_wait(&track, WaitUnit::Frame(200), handle2);

        sched.advance(&mut track, &mut sync, &[], 256);

        assert_eq!(track.frame, 256);
        assert_eq!(rx.try_recv().unwrap(), WaitOutcome::Fired { frame: 100 });
        assert_eq!(rx2.try_recv().unwrap(), WaitOutcome::Fired { frame: 200 });
        assert_eq!(sched.pool.outstanding(), 0);
    }

    #[test]
    fn event_on_block_edge_waits_for_next_block() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();

        let (handle, rx) = WaitHandle::new();
        sched.schedule_wait(&track, WaitUnit::Frame(256), handle);

        sched.advance(&mut track, &mut sync, &[], 256);
        assert!(rx.try_recv().is_err());

        sched.advance(&mut track, &mut sync, &[], 256);
        assert_eq!(rx.try_recv().unwrap(), WaitOutcome::Fired { frame: 256 });
    }

    #[test]
    fn block_splits_at_the_loop_boundary() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        track.frame = 47900;
        let mut sync = TestSync::idle();

        // An event exactly at the loop end fires at frame 0 of the next
        // pass, after the wrap.
        let (handle, rx) = WaitHandle::new();
        sched.schedule_wait(&track, WaitUnit::Loop, handle);

        sched.advance(&mut track, &mut sync, &[], 256);

        assert!(track.called("loop"));
        assert_eq!(track.frame, 156);
        assert_eq!(rx.try_recv().unwrap(), WaitOutcome::Fired { frame: 0 });
    }

    #[test]
    fn rate_carryover_accumulates() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        track.rate = 0.5;
        let mut sync = TestSync::idle();

        // 3 blocks of 333 at half rate: 166.5 each; carryover turns the
        // truncated halves into a whole frame every second block.
        for _ in 0..3 {
            sched.advance(&mut track, &mut sync, &[], 333);
        }
        assert_eq!(track.frame, 499);
    }

    #[test]
    fn pulse_activates_pending_record_start() {
        let mut params = TrackParams::default();
        params.sync_source = SyncSource::Host;
        let mut sched = scheduler(params);
        let mut track = ScriptedTrack::reset();
        let mut sync = TestSync::with_pulse(64);

        // A record start waiting on the pulse.
        let mut ev = sched.pool.new_event(EventKind::Record { end: false });
        ev.pending = true;
        ev.pulsed = true;
        sched.events.add(ev, false);

        sched.advance(&mut track, &mut sync, &[], 256);

        assert!(track.called("start_record"));
        assert_eq!(track.mode, TrackMode::Record);
    }

    #[test]
    fn paused_track_holds_position_but_services_waits() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        track.mode = TrackMode::Pause;
        track.frame = 1000;
        let mut sync = TestSync::idle();

        let (wait, wait_rx) = WaitHandle::new();
        sched.schedule_wait(&track, WaitUnit::Frame(1100), wait);

        // A Round event must not fire while paused.
        let mut round = sched.pool.new_event(EventKind::Round);
        round.frame = 1100;
        sched.events.add(round, false);

        sched.advance(&mut track, &mut sync, &[], 256);

        assert_eq!(track.frame, 1000, "paused track must not advance");
        assert_eq!(wait_rx.try_recv().unwrap(), WaitOutcome::Fired { frame: 1100 });
        assert!(sched.events.find(EventKind::Round).is_some());

        sched.clear_events();
    }

    #[test]
    fn wrap_shifts_scheduled_events() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        track.frame = 47872;
        let mut sync = TestSync::idle();

        // Quantized action sitting one cycle into the next pass.
        let mut ev = sched.pool.new_event(EventKind::Action);
        ev.frame = 48000 + 12000;
        ev.primary = Some(sched.actions.new_action(&desc(Symbol::Mute)));
        sched.events.add(ev, false);

        sched.advance(&mut track, &mut sync, &[], 256);

        let ev = sched.events.find(EventKind::Action).unwrap();
        assert_eq!(ev.frame, 12000);
        sched.clear_events();
    }
}
