use super::advance::EventOutcome;
use super::{SchedulerMessage, TrackScheduler};
use crate::actions::{Action, ActionDesc, Symbol};
use crate::events::{Event, EventKind};
use crate::session::{EmptyLoopAction, SwitchDuration, SwitchQuantize};
use crate::sync::{NotificationId, PeerState, SyncPort};
use crate::track::LooperTrack;
use tracing::{debug, info, warn};

impl TrackScheduler {
    /// Begin a loop switch. Timing comes from the leader when a
    /// leader-relative switch location is configured, otherwise from the
    /// local SwitchQuantize parameter.
    pub(crate) fn schedule_switch(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        action: Box<Action>,
    ) {
        // A switch already underway re-routes through the switching state.
        if self.events.find(EventKind::Switch).is_some() {
            self.handle_switch_mode_action(track, action);
            return;
        }
        let count = track.loop_count();
        if count <= 1 {
            info!(track = self.number, "switch with a single loop");
            self.actions.dispose(action);
            return;
        }
        let current = track.loop_index();
        let target = match action.symbol {
            Symbol::NextLoop => (current + 1) % count,
            Symbol::PrevLoop => (current + count - 1) % count,
            Symbol::SelectLoop => {
                let value = action.value;
                if value < 0 || value as usize >= count {
                    warn!(value, count, "loop selection out of range");
                    self.actions.dispose(action);
                    return;
                }
                value as usize
            }
            other => {
                warn!(symbol = other.name(), "not a switch function");
                self.actions.dispose(action);
                return;
            }
        };
        self.actions.dispose(action);

        if let (Some(unit), Some(leader)) =
            (self.params.leader_switch_location, self.resolve_leader(peers))
        {
            // The leader decides when: a correlated wait is scheduled over
            // there, and our switch stays pending until its notification
            // comes back.
            let event_id = self.correlation_id();
            let mut event = self.pool.new_event(EventKind::Switch);
            event.pending = true;
            event.correlation_id = event_id;
            event.switch_target = target;
            if let Some(refused) = self.events.add(event, false) {
                self.pool.cancel(refused, &mut self.actions);
                return;
            }
            debug!(leader, event_id, "switch timing delegated to leader");
            self.outbox.push(SchedulerMessage::LeaderWait {
                leader,
                unit,
                event_id,
            });
            return;
        }

        match self.params.switch_quantize {
            SwitchQuantize::Off => {
                let mut event = self.pool.new_event(EventKind::Switch);
                event.switch_target = target;
                event.frame = track.frame();
                self.do_event(track, sync, peers, event);
            }
            quant if quant.is_confirm() => {
                let mut event = self.pool.new_event(EventKind::Switch);
                event.pending = true;
                event.switch_target = target;
                debug!(target, "switch waiting for confirmation");
                if let Some(refused) = self.events.add(event, false) {
                    self.pool.cancel(refused, &mut self.actions);
                }
            }
            quant => {
                let frame = self.quantized_frame(track, quant.unit(), track.frame(), false);
                let mut event = self.pool.new_event(EventKind::Switch);
                event.switch_target = target;
                event.frame = frame;
                debug!(target, frame, "switch quantized");
                if let Some(refused) = self.events.add(event, false) {
                    self.pool.cancel(refused, &mut self.actions);
                }
            }
        }
    }

    /// While a switch is outstanding, switch functions re-target it and
    /// everything else rides along on its stack. Return switches always go
    /// back to their fixed origin and refuse re-targeting.
    pub(crate) fn handle_switch_mode_action(
        &mut self,
        track: &mut dyn LooperTrack,
        action: Box<Action>,
    ) {
        let count = track.loop_count();
        let is_return = self
            .events
            .find(EventKind::Switch)
            .map(|e| e.is_return)
            .unwrap_or(false);

        match action.symbol {
            sym if sym.is_switch() && is_return => {
                info!("a return switch keeps its origin");
                self.actions.dispose(action);
            }
            Symbol::NextLoop => {
                self.retarget_switch(|target| (target + 1) % count);
                self.actions.dispose(action);
            }
            Symbol::PrevLoop => {
                self.retarget_switch(|target| (target + count - 1) % count);
                self.actions.dispose(action);
            }
            Symbol::SelectLoop => {
                let value = action.value;
                if value < 0 || value as usize >= count {
                    warn!(value, count, "loop selection out of range");
                } else {
                    self.retarget_switch(|_| value as usize);
                }
                self.actions.dispose(action);
            }
            Symbol::Confirm => self.confirm_switch(track, action),
            _ => {
                if let Some(event) = self.events.find_mut(EventKind::Switch) {
                    debug!(symbol = action.symbol.name(), "stacked on switch event");
                    event.stacked.push(action);
                } else {
                    warn!("switching state without a switch event");
                    self.actions.dispose(action);
                }
            }
        }
    }

    fn retarget_switch(&mut self, next: impl Fn(usize) -> usize) {
        if let Some(event) = self.events.find_mut(EventKind::Switch) {
            event.switch_target = next(event.switch_target);
            debug!(target = event.switch_target, "switch re-targeted");
        }
    }

    /// Confirm a pending switch scheduled with one of the confirm variants.
    /// The confirm variant's quantize unit decides whether it happens now or
    /// at the next boundary.
    fn confirm_switch(&mut self, track: &dyn LooperTrack, action: Box<Action>) {
        self.actions.dispose(action);
        let pending = self
            .events
            .consume_where(|e| e.kind == EventKind::Switch && e.pending && e.correlation_id == 0);
        match pending {
            Some(mut event) => {
                event.pending = false;
                event.frame =
                    self.quantized_frame(track, self.params.switch_quantize.unit(), track.frame(), false);
                debug!(frame = event.frame, "switch confirmed");
                if let Some(refused) = self.events.add(event, false) {
                    self.pool.cancel(refused, &mut self.actions);
                }
            }
            None => info!("confirm with nothing pending"),
        }
    }

    /// The switch event fired: change loops, deal with an empty destination,
    /// then apply the switch duration.
    pub(crate) fn switch_event(
        &mut self,
        track: &mut dyn LooperTrack,
        sync: &mut dyn SyncPort,
        peers: &[PeerState],
        event: &mut Event,
    ) -> EventOutcome {
        let origin = track.loop_index();
        let target = event.switch_target;
        if target >= track.loop_count() {
            warn!(target, "switch target out of range");
            return EventOutcome::Done;
        }

        let empty = track.finish_switch(target);
        self.emit(NotificationId::LoopSize, track);

        let mut started_record = false;
        if empty {
            match self.params.empty_loop_action {
                EmptyLoopAction::None => {}
                EmptyLoopAction::Record => {
                    let record = self.actions.new_action(&ActionDesc::new(Symbol::Record));
                    self.do_record(track, sync, peers, record);
                    started_record = true;
                }
                EmptyLoopAction::Copy => track.loop_copy(true, false),
                EmptyLoopAction::CopyTiming => track.loop_copy(false, true),
            }
        }

        if !event.is_return {
            match self.params.switch_duration {
                SwitchDuration::Permanent => {}
                SwitchDuration::Once => {
                    if track.loop_frames() > 0 {
                        let mute = self.actions.new_action(&ActionDesc::new(Symbol::Mute));
                        let mut mute_event = self.pool.new_event(EventKind::Action);
                        mute_event.frame = track.loop_frames();
                        mute_event.primary = Some(mute);
                        if let Some(refused) = self.events.add(mute_event, false) {
                            self.pool.cancel(refused, &mut self.actions);
                        }
                    } else {
                        debug!("once duration on an empty loop, nothing to schedule");
                    }
                }
                SwitchDuration::OnceReturn => {
                    if track.loop_frames() > 0 {
                        let mut ret = self.pool.new_event(EventKind::Switch);
                        ret.frame = track.loop_frames();
                        ret.switch_target = origin;
                        ret.is_return = true;
                        debug!(origin, frame = ret.frame, "return switch scheduled");
                        if let Some(refused) = self.events.add(ret, false) {
                            self.pool.cancel(refused, &mut self.actions);
                        }
                    } else {
                        debug!("once-return on an empty loop, nothing to schedule");
                    }
                }
                SwitchDuration::Sustain | SwitchDuration::SustainReturn => {
                    warn!("sustain switch durations are not implemented");
                    self.alert("Sustain switch durations are not implemented");
                }
            }
        }

        // Stacked actions run through normal routing unless a recording just
        // started in the destination; there is nowhere safe to re-queue them
        // behind that, so they are dropped.
        if started_record && !event.stacked.is_empty() {
            warn!(
                count = event.stacked.len(),
                "dropping actions stacked on a switch that started a recording"
            );
            while let Some(stacked) = event.stacked.pop() {
                self.actions.dispose(stacked);
            }
        }

        EventOutcome::Done
    }
}
