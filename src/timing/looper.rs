use super::advance::EventOutcome;
use super::{RouteState, TrackScheduler};
use crate::actions::{Action, ActionDesc, Symbol};
use crate::events::{Event, EventKind};
use crate::session::QuantizeMode;
use crate::sync::{NotificationId, PeerState, SyncPort};
use crate::track::{LooperTrack, TrackMode};
use tracing::{debug, info, warn};

impl TrackScheduler {
    /// Route one inbound action: execute it, schedule it, or stack it,
    /// depending on where the track is right now.
    pub fn do_action(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        desc: &ActionDesc,
    ) {
        let action = self.actions.new_action(desc);
        self.do_pooled_action(track, sync, peers, action);
    }

    pub(crate) fn do_pooled_action(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        action: Box<Action>,
    ) {
        // Executive actions must always be possible; they never consult the
        // state table.
        if action.symbol.is_executive() {
            self.executive_action(track, sync, action);
            return;
        }
        match self.route_state(track) {
            RouteState::Reset => self.reset_action(track, sync, peers, action),
            RouteState::Paused => self.paused_action(track, sync, peers, action),
            RouteState::Recording => self.recording_action(track, sync, peers, action),
            RouteState::Switching => self.handle_switch_mode_action(track, action),
            RouteState::Rounding => self.rounding_action(track, action),
            RouteState::Active => self.active_action(track, sync, peers, action),
        }
    }

    fn executive_action(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        action: Box<Action>,
    ) {
        match action.symbol {
            Symbol::Reset => {
                self.clear_events();
                self.rate_carryover = 0.0;
                track.do_reset();
                self.emit(NotificationId::Reset, track);
            }
            Symbol::TrackReset | Symbol::GlobalReset => {
                self.clear_events();
                self.rate_carryover = 0.0;
                sync.unregister_follower(self.number);
                track.do_track_reset();
                self.emit(NotificationId::Reset, track);
            }
            Symbol::Undo => {
                // Scheduled work is undone before recorded layers.
                if let Some(event) = self.events.consume_last() {
                    debug!(track = self.number, event = event.name(), "undo canceled event");
                    self.pool.cancel(event, &mut self.actions);
                } else {
                    track.do_undo();
                }
            }
            Symbol::Redo => track.do_redo(),
            Symbol::FocusLock => {
                // Focus is an engine concern; nothing to do per track.
                info!(track = self.number, "FocusLock reached a track scheduler");
            }
            other => warn!(symbol = other.name(), "not an executive action"),
        }
        self.actions.dispose(action);
    }

    fn reset_action(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        action: Box<Action>,
    ) {
        match action.symbol {
            Symbol::Record | Symbol::AutoRecord => self.do_record(track, sync, peers, action),
            Symbol::Overdub => {
                track.toggle_overdub();
                self.actions.dispose(action);
            }
            Symbol::Mute => {
                self.toggle_mute_notified(track);
                self.actions.dispose(action);
            }
            sym if sym.is_switch() => self.schedule_switch(track, sync, peers, action),
            other => {
                info!(symbol = other.name(), "not available in Reset");
                self.actions.dispose(action);
            }
        }
    }

    fn paused_action(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        action: Box<Action>,
    ) {
        match action.symbol {
            Symbol::Pause | Symbol::Play => {
                if self.params.follow_quantize && self.resolve_leader(peers).is_some() {
                    // Align the resume with the next leader pulse.
                    let mut event = self.pool.new_event(EventKind::Action);
                    event.pending = true;
                    event.pulsed = true;
                    event.primary = Some(action);
                    if let Some(refused) = self.events.add(event, false) {
                        self.pool.cancel(refused, &mut self.actions);
                    }
                } else {
                    track.finish_pause();
                    self.actions.dispose(action);
                }
            }
            Symbol::Stop => {
                track.do_stop();
                self.actions.dispose(action);
            }
            Symbol::Start | Symbol::Restart => {
                track.do_start();
                self.actions.dispose(action);
            }
            Symbol::Overdub => {
                track.toggle_overdub();
                self.actions.dispose(action);
            }
            Symbol::Mute => {
                self.toggle_mute_notified(track);
                self.actions.dispose(action);
            }
            Symbol::Resize => {
                self.do_resize(track, peers);
                self.actions.dispose(action);
            }
            sym if sym.is_switch() => self.schedule_switch(track, sync, peers, action),
            other => {
                info!(symbol = other.name(), "not available while paused");
                self.actions.dispose(action);
            }
        }
    }

    fn recording_action(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        action: Box<Action>,
    ) {
        // Pending-end phase: the ending is already on the calendar, so
        // everything rides along behind it.
        if let Some(event) = self
            .events
            .find_mut_where(|e| e.kind == EventKind::Record { end: true })
        {
            debug!(symbol = action.symbol.name(), "stacked on pending record end");
            event.stacked.push(action);
            return;
        }

        // Pending-start phase: minor modes toggle now, the rest stacks
        // behind the start.
        if self.has_pending_record_start() {
            match action.symbol {
                Symbol::Overdub => {
                    track.toggle_overdub();
                    self.actions.dispose(action);
                }
                Symbol::Mute => {
                    self.toggle_mute_notified(track);
                    self.actions.dispose(action);
                }
                Symbol::Record | Symbol::AutoRecord => {
                    info!("record already waiting on sync");
                    self.actions.dispose(action);
                }
                _ => {
                    if let Some(event) = self
                        .events
                        .find_mut_where(|e| e.kind == EventKind::Record { end: false })
                    {
                        debug!(symbol = action.symbol.name(), "stacked on pending record start");
                        event.stacked.push(action);
                    } else {
                        warn!("pending record start vanished");
                        self.actions.dispose(action);
                    }
                }
            }
            return;
        }

        // Actively recording. Record ends it; anything else ends it too and
        // then takes effect afterward.
        if matches!(action.symbol, Symbol::Record | Symbol::AutoRecord) {
            self.end_record(track, sync, peers, action);
        } else if self.is_record_synced(sync, peers) {
            let ending = self.actions.new_action(&ActionDesc::new(Symbol::Record));
            self.end_record(track, sync, peers, ending);
            if let Some(event) = self
                .events
                .find_mut_where(|e| e.kind == EventKind::Record { end: true })
            {
                event.stacked.push(action);
            } else {
                warn!("record ending was not scheduled");
                self.actions.dispose(action);
            }
        } else {
            track.finish_record();
            self.emit(NotificationId::RecordEnd, track);
            self.emit(NotificationId::LoopSize, track);
            self.do_pooled_action(track, sync, peers, action);
        }
    }

    fn rounding_action(&mut self, track: &mut dyn LooperTrack, action: Box<Action>) {
        let mode = track.mode();
        let own_function = (mode == TrackMode::Multiply && action.symbol == Symbol::Multiply)
            || (mode == TrackMode::Insert && action.symbol == Symbol::Insert);

        if own_function {
            self.extend_rounding(track);
            self.actions.dispose(action);
        } else if action.symbol == Symbol::Record {
            // Alternate ending: stop exactly here, no rounding.
            if let Some(event) = self.events.consume_where(|e| e.kind == EventKind::Round) {
                self.pool.cancel(event, &mut self.actions);
            }
            match mode {
                TrackMode::Multiply => track.unrounded_multiply(),
                TrackMode::Insert => track.unrounded_insert(),
                _ => {}
            }
            self.emit(NotificationId::LoopSize, track);
            self.actions.dispose(action);
        } else {
            let Some(event) = self.events.find_mut_where(|e| e.kind == EventKind::Round) else {
                warn!("rounding state without a round event");
                self.actions.dispose(action);
                return;
            };
            debug!(symbol = action.symbol.name(), "stacked on rounding event");
            event.stacked.push(action);
        }
    }

    /// One more press of the rounding mode's own function: another cycle.
    fn extend_rounding(&mut self, track: &mut dyn LooperTrack) {
        let cycle = track.cycle_frames();
        let Some(mut event) = self.events.consume_where(|e| e.kind == EventKind::Round) else {
            return;
        };
        event.multiples += 1;
        if !event.extension {
            // The ending moves out a cycle. Extension events hold their
            // boundary and reschedule themselves when reached.
            event.frame += cycle;
        }
        debug!(
            multiples = event.multiples,
            frame = event.frame,
            "rounding extended"
        );
        if let Some(refused) = self.events.add(event, false) {
            self.pool.cancel(refused, &mut self.actions);
        }
    }

    fn active_action(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        action: Box<Action>,
    ) {
        // Replace has no rounding event to hang a cancellation on; these
        // functions implicitly cancel it before taking effect.
        if track.mode() == TrackMode::Replace
            && matches!(action.symbol, Symbol::Multiply | Symbol::Insert | Symbol::Mute)
        {
            track.toggle_replace();
        }

        // Record during Multiply/Insert is the unrounded alternate ending.
        if action.symbol == Symbol::Record
            && matches!(track.mode(), TrackMode::Multiply | TrackMode::Insert)
        {
            match track.mode() {
                TrackMode::Multiply => track.unrounded_multiply(),
                _ => track.unrounded_insert(),
            }
            self.emit(NotificationId::LoopSize, track);
            self.actions.dispose(action);
            return;
        }

        match action.symbol {
            Symbol::Record | Symbol::AutoRecord => self.do_record(track, sync, peers, action),
            sym if sym.is_switch() => self.schedule_switch(track, sync, peers, action),
            Symbol::Confirm => {
                info!("nothing to confirm");
                self.actions.dispose(action);
            }
            Symbol::Pause => {
                track.start_pause();
                self.actions.dispose(action);
            }
            Symbol::Play => {
                track.do_play();
                self.actions.dispose(action);
            }
            Symbol::Stop => {
                track.do_stop();
                self.actions.dispose(action);
            }
            Symbol::Start | Symbol::Restart => {
                track.do_start();
                self.actions.dispose(action);
            }
            Symbol::Resize => {
                self.do_resize(track, peers);
                self.actions.dispose(action);
            }
            sym if sym.is_quantized() && self.params.quantize != QuantizeMode::Off => {
                self.schedule_quantized(track, action);
            }
            _ => self.execute_now(track, sync, peers, action),
        }
    }

    /// Function-specific immediate execution, used both for unquantized
    /// actions and when a deferred Action event fires.
    pub(crate) fn execute_now(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        action: Box<Action>,
    ) {
        match action.symbol {
            Symbol::Record | Symbol::AutoRecord => {
                self.do_record(track, sync, peers, action);
                return;
            }
            Symbol::Overdub => track.toggle_overdub(),
            Symbol::Mute => self.toggle_mute_notified(track),
            Symbol::Replace => track.toggle_replace(),
            Symbol::Multiply => self.multiply_now(track),
            Symbol::Insert => self.insert_now(track),
            Symbol::InstantMultiply => track.instant_multiply(action.value.max(2) as u32),
            Symbol::InstantDivide => track.instant_divide(action.value.max(2) as u32),
            Symbol::Pause => {
                if track.mode() == TrackMode::Pause {
                    track.finish_pause();
                } else {
                    track.start_pause();
                }
            }
            Symbol::Play => {
                if track.mode() == TrackMode::Pause {
                    track.finish_pause();
                } else {
                    track.do_play();
                }
            }
            Symbol::Stop => track.do_stop(),
            Symbol::Start | Symbol::Restart => track.do_start(),
            other => info!(symbol = other.name(), "no immediate handler"),
        }
        self.actions.dispose(action);
    }

    fn multiply_now(&mut self, track: &mut dyn LooperTrack) {
        if track.mode() == TrackMode::Multiply {
            // Second press: schedule the rounded ending at the next cycle
            // boundary from the current frame. The boundary must actually
            // be crossed before a cycle is added.
            let frame = self.quantized_frame(track, QuantizeMode::Cycle, track.frame(), true);
            let mut event = self.pool.new_event(EventKind::Round);
            event.frame = frame;
            event.multiples = 1;
            debug!(frame, "multiply rounding scheduled");
            if let Some(refused) = self.events.add(event, false) {
                self.pool.cancel(refused, &mut self.actions);
            }
        } else {
            track.start_multiply();
        }
    }

    fn insert_now(&mut self, track: &mut dyn LooperTrack) {
        if track.mode() == TrackMode::Insert {
            // Handled by the rounding state; getting here means the round
            // event is gone.
            warn!("insert press in Insert mode without a round event");
            return;
        }
        track.start_insert();
        // Insert's natural extension point is not the next loop boundary, so
        // the rounding event is pre-scheduled where the track says the mode
        // ends, and reschedules itself when extended.
        let mut event = self.pool.new_event(EventKind::Round);
        event.extension = true;
        event.multiples = 1;
        event.frame = track.mode_end_frame();
        debug!(frame = event.frame, "insert extension scheduled");
        if let Some(refused) = self.events.add(event, false) {
            self.pool.cancel(refused, &mut self.actions);
        }
    }

    /// Quantized scheduling, relative to an already-scheduled event of the
    /// same function when one exists so repeated presses queue successive
    /// boundaries. A pending prior event has no frame to quantize against;
    /// scheduling behind it is refused.
    fn schedule_quantized(&mut self, track: &dyn LooperTrack, action: Box<Action>) {
        let unit = self.params.quantize;
        if let Some(prior) = self.events.last_for_symbol(action.symbol) {
            if prior.pending {
                warn!(
                    symbol = action.symbol.name(),
                    "refusing to quantize behind a pending event"
                );
                self.actions.dispose(action);
                return;
            }
            let frame = self.quantized_frame(track, unit, prior.frame, true);
            self.push_action_event(action, frame);
            return;
        }
        let frame = self.quantized_frame(track, unit, track.frame(), false);
        self.push_action_event(action, frame);
    }

    fn push_action_event(&mut self, action: Box<Action>, frame: u64) {
        let mut event = self.pool.new_event(EventKind::Action);
        event.frame = frame;
        event.primary = Some(action);
        if let Some(refused) = self.events.add(event, false) {
            self.pool.cancel(refused, &mut self.actions);
        }
    }

    pub(crate) fn toggle_mute_notified(&mut self, track: &mut dyn LooperTrack) {
        let was_muted = track.mute_active();
        track.toggle_mute();
        self.emit(
            if was_muted {
                NotificationId::MuteEnd
            } else {
                NotificationId::MuteStart
            },
            track,
        );
    }

    pub(crate) fn do_resize(&mut self, track: &mut dyn LooperTrack, peers: &[PeerState]) {
        if let Some(leader) = self.resolve_leader(peers) {
            track.leader_resized(peers[leader].frames);
            self.rate_carryover = 0.0;
        } else {
            info!(track = self.number, "resize with no leader");
        }
    }

    /// Start (or schedule) a recording. Synced recordings wait for the next
    /// pulse as a pending, pulsed event; unsynced ones start on the spot.
    pub(crate) fn do_record(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        action: Box<Action>,
    ) {
        if self.is_record_synced(sync, peers) {
            sync.register_follower(self.number, self.params.sync_source);
            let mut event = self.pool.new_event(EventKind::Record { end: false });
            event.pending = true;
            event.pulsed = true;
            event.primary = Some(action);
            debug!(track = self.number, "record waiting on sync pulse");
            if let Some(refused) = self.events.add(event, false) {
                self.pool.cancel(refused, &mut self.actions);
            }
        } else {
            let auto = action.symbol == Symbol::AutoRecord;
            self.actions.dispose(action);
            track.start_record();
            self.emit(NotificationId::RecordStart, track);
            if auto {
                self.schedule_auto_record_end(track);
            }
        }
    }

    fn end_record(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        action: Box<Action>,
    ) {
        if self.is_record_synced(sync, peers) {
            self.actions.dispose(action);
            let mut event = self.pool.new_event(EventKind::Record { end: true });
            event.pending = true;
            event.pulsed = true;
            debug!(track = self.number, "record end waiting on sync pulse");
            if let Some(refused) = self.events.add(event, false) {
                self.pool.cancel(refused, &mut self.actions);
            }
        } else {
            self.actions.dispose(action);
            track.finish_record();
            self.emit(NotificationId::RecordEnd, track);
            self.emit(NotificationId::LoopSize, track);
        }
    }

    fn schedule_auto_record_end(&mut self, track: &dyn LooperTrack) {
        let goal = track.goal_frames();
        if goal == 0 {
            warn!("auto record without a goal length");
            return;
        }
        let mut event = self.pool.new_event(EventKind::Record { end: true });
        event.frame = goal;
        if let Some(refused) = self.events.add(event, false) {
            self.pool.cancel(refused, &mut self.actions);
        }
    }

    /// A Record event fired.
    pub(crate) fn record_event(
        &mut self,
        track: &mut dyn LooperTrack,
        _sync: &mut dyn SyncPort,
        _peers: &[PeerState],
        event: &mut Event,
        end: bool,
    ) -> EventOutcome {
        if end {
            track.finish_record();
            self.emit(NotificationId::RecordEnd, track);
            self.emit(NotificationId::LoopSize, track);
        } else {
            let auto = event
                .primary
                .as_ref()
                .is_some_and(|a| a.symbol == Symbol::AutoRecord);
            if let Some(primary) = event.primary.take() {
                self.actions.dispose(primary);
            }
            track.start_record();
            self.emit(NotificationId::RecordStart, track);
            if auto {
                self.schedule_auto_record_end(track);
            }
        }
        EventOutcome::Done
    }

    /// A Round event fired: finish the rounding mode, or — for an Insert
    /// extension with presses banked — push the boundary out a cycle and
    /// keep the same event.
    pub(crate) fn round_event(
        &mut self,
        track: &mut dyn LooperTrack,
        event: &mut Event,
    ) -> EventOutcome {
        match track.mode() {
            TrackMode::Multiply => {
                track.finish_multiply();
                self.emit(NotificationId::LoopSize, track);
                EventOutcome::Done
            }
            TrackMode::Insert => {
                if event.extension && event.multiples > 1 {
                    event.multiples -= 1;
                    event.frame += track.cycle_frames();
                    track.extend_insert();
                    debug!(frame = event.frame, "insert extension rescheduled");
                    EventOutcome::Reused
                } else {
                    track.finish_insert();
                    self.emit(NotificationId::LoopSize, track);
                    EventOutcome::Done
                }
            }
            mode => {
                warn!(mode = mode.name(), "round event outside a rounding mode");
                EventOutcome::Done
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::session::TrackParams;
    use crate::sync::SyncSource;

    fn no_peers() -> Vec<PeerState> {
        vec![PeerState::default(); 2]
    }

    #[test]
    fn multiply_rounds_to_next_cycle_boundary() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();
        let peers = no_peers();

        // Enter multiply, then press again at frame 3000 to end it.
        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Multiply));
        assert!(track.called("start_multiply"));
        track.frame = 3000;
        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Multiply));

        let round = sched.events.find(EventKind::Round).expect("round event");
        assert_eq!(round.frame, 12000, "end of the current cycle, not 3000+12000");
        assert!(!round.extension);
        sched.clear_events();
    }

    #[test]
    fn rounding_extension_is_monotonic() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();
        let peers = no_peers();

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Multiply));
        track.frame = 3000;
        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Multiply));

        for (presses, expected_frame) in [(1u32, 24000u64), (2, 36000)] {
            sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Multiply));
            let round = sched.events.find(EventKind::Round).unwrap();
            assert_eq!(round.multiples, presses + 1);
            assert_eq!(round.frame, expected_frame);
        }
        sched.clear_events();
    }

    #[test]
    fn insert_schedules_extension_at_mode_end() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();
        let peers = no_peers();

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Insert));
        assert!(track.called("start_insert"));

        let round = sched.events.find(EventKind::Round).expect("extension event");
        assert!(round.extension);
        assert_eq!(round.frame, 12000, "mode end as reported by the track");

        // Reached without further input: insert finishes, event disposed.
        sched.advance(&mut track, &mut sync, &peers, 256 + 12000);
        assert!(track.called("finish_insert"));
        assert!(sched.events.find(EventKind::Round).is_none());
        assert_eq!(sched.pool.outstanding(), 0);
    }

    #[test]
    fn insert_extension_reschedules_when_pressed_again() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();
        let peers = no_peers();

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Insert));
        // Another press before the boundary banks an extension.
        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Insert));
        let round = sched.events.find(EventKind::Round).unwrap();
        assert_eq!(round.multiples, 2);
        assert_eq!(round.frame, 12000, "extension event holds its boundary");

        // Reaching it extends one cycle further and reuses the event.
        sched.advance(&mut track, &mut sync, &peers, 12100);
        assert!(track.called("extend_insert"));
        assert!(!track.called("finish_insert"));
        let round = sched.events.find(EventKind::Round).expect("event reused");
        assert_eq!(round.frame, 24000);
        assert_eq!(round.multiples, 1);
        sched.clear_events();
    }

    #[test]
    fn unsynced_record_starts_immediately() {
        let mut params = TrackParams::default();
        params.sync_source = SyncSource::Track;
        let mut sched = scheduler(params);
        let mut track = ScriptedTrack::reset();
        let mut sync = TestSync::idle();
        // No track-sync master anywhere.
        let peers = no_peers();

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Record));

        assert!(track.called("start_record"));
        assert!(
            sched.events.is_empty(),
            "no record event when sync is unavailable"
        );
    }

    #[test]
    fn synced_record_waits_for_a_pulse() {
        let mut params = TrackParams::default();
        params.sync_source = SyncSource::Host;
        let mut sched = scheduler(params);
        let mut track = ScriptedTrack::reset();
        let mut sync = TestSync::idle();
        sync.host_active = true;
        let peers = no_peers();

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Record));
        assert!(!track.called("start_record"));
        let ev = sched
            .events
            .find(EventKind::Record { end: false })
            .expect("pending record start");
        assert!(ev.pending && ev.pulsed);
        assert!(sync.followers.contains(&0));

        // The pulse lands and recording starts at its offset.
        sync.pulses.push_back(crate::sync::Pulse {
            offset: 100,
            kind: crate::sync::PulseKind::Beat,
        });
        sched.advance(&mut track, &mut sync, &peers, 256);
        assert!(track.called("start_record"));
        sched.clear_events();
    }

    #[test]
    fn action_during_recording_ends_it_then_applies() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::reset();
        let mut sync = TestSync::idle();
        let peers = no_peers();

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Record));
        track.frame = 24000;
        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Overdub));

        assert!(track.called("finish_record"));
        assert!(track.called("toggle_overdub"));
        assert_eq!(track.loops[0], 24000);
    }

    #[test]
    fn actions_stack_on_pending_record_end() {
        let mut params = TrackParams::default();
        params.sync_source = SyncSource::Host;
        let mut sched = scheduler(params);
        let mut track = ScriptedTrack::reset();
        let mut sync = TestSync::idle();
        sync.host_active = true;
        let peers = no_peers();

        // Start waiting, pulse in, recording runs.
        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Record));
        sync.pulses.push_back(crate::sync::Pulse {
            offset: 0,
            kind: crate::sync::PulseKind::Beat,
        });
        sched.advance(&mut track, &mut sync, &peers, 256);
        assert!(track.called("start_record"));

        // Request the ending; it waits on a pulse, and a Mute stacks on it.
        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Record));
        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Mute));
        let ev = sched.events.find(EventKind::Record { end: true }).unwrap();
        assert_eq!(ev.stacked.len(), 1);

        // Ending pulse: recording finishes, then the stacked mute runs.
        sync.pulses.push_back(crate::sync::Pulse {
            offset: 0,
            kind: crate::sync::PulseKind::Beat,
        });
        sched.advance(&mut track, &mut sync, &peers, 256);
        assert!(track.called("finish_record"));
        assert!(track.called("toggle_mute"));
        assert_eq!(sched.actions.outstanding(), 0);
    }

    #[test]
    fn quantize_off_executes_immediately() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();
        let peers = no_peers();
        track.frame = 3000;

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Overdub));
        assert!(track.called("toggle_overdub"));
        assert!(sched.events.is_empty(), "no event with quantize off");
    }

    #[test]
    fn quantized_actions_queue_successive_boundaries() {
        let mut params = TrackParams::default();
        params.quantize = QuantizeMode::Cycle;
        let mut sched = scheduler(params);
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();
        let peers = no_peers();
        track.frame = 3000;

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Mute));
        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Mute));

        let frames: Vec<u64> = sched.events.iter().map(|e| e.frame).collect();
        assert_eq!(frames, vec![12000, 24000]);
        sched.clear_events();
    }

    #[test]
    fn quantizing_behind_a_pending_event_is_refused() {
        let mut params = TrackParams::default();
        params.quantize = QuantizeMode::Cycle;
        let mut sched = scheduler(params);
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();
        let peers = no_peers();

        // A pending event for the same function, frame unknown.
        let mut ev = sched.pool.new_event(EventKind::Action);
        ev.pending = true;
        ev.primary = Some(sched.actions.new_action(&desc(Symbol::Mute)));
        sched.events.add(ev, false);

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Mute));
        assert_eq!(sched.events.len(), 1, "second event refused");
        sched.clear_events();
        assert_eq!(sched.actions.outstanding(), 0);
    }

    #[test]
    fn replace_is_canceled_by_whitelisted_functions() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();
        let peers = no_peers();

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Replace));
        assert_eq!(track.mode, TrackMode::Replace);

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Mute));
        assert_eq!(track.mode, TrackMode::Play, "replace canceled first");
        assert!(track.called("toggle_mute"));
    }

    #[test]
    fn executive_reset_cancels_everything() {
        let mut params = TrackParams::default();
        params.quantize = QuantizeMode::Cycle;
        let mut sched = scheduler(params);
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();
        let peers = no_peers();

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Mute));
        assert_eq!(sched.events.len(), 1);

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Reset));
        assert!(sched.events.is_empty());
        assert!(track.called("do_reset"));
        assert_eq!(sched.pool.outstanding(), 0);
        assert_eq!(sched.actions.outstanding(), 0);
    }

    #[test]
    fn undo_cancels_scheduled_events_before_layers() {
        let mut params = TrackParams::default();
        params.quantize = QuantizeMode::Loop;
        let mut sched = scheduler(params);
        let mut track = ScriptedTrack::playing();
        let mut sync = TestSync::idle();
        let peers = no_peers();

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Mute));
        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Undo));
        assert!(sched.events.is_empty());
        assert!(!track.called("do_undo"));

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::Undo));
        assert!(track.called("do_undo"));
    }

    #[test]
    fn auto_record_schedules_its_own_ending() {
        let mut sched = scheduler(TrackParams::default());
        let mut track = ScriptedTrack::reset();
        track.goal = 48000;
        let mut sync = TestSync::idle();
        let peers = no_peers();

        sched.do_action(&mut track, &mut sync, &peers, &desc(Symbol::AutoRecord));
        assert!(track.called("start_record"));
        let ev = sched.events.find(EventKind::Record { end: true }).unwrap();
        assert_eq!(ev.frame, 48000);

        sched.advance(&mut track, &mut sync, &peers, 48100);
        assert!(track.called("finish_record"));
        assert_eq!(track.loops[0], 48000);
    }
}
