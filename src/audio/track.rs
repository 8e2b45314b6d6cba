use super::{LoopLayer, LoopSlot};
use crate::session::TrackParams;
use crate::track::{LooperTrack, TrackMode};
use tracing::{debug, info};

/// A looping audio track: several loops of stacked layers, fed one audio
/// block at a time by the engine. The scheduler owns *when*; this type owns
/// the samples and the mode.
///
/// Layer storage grows when modes start; the block path itself writes into
/// buffers that already exist.
pub struct LoopTrack {
    number: usize,
    mode: TrackMode,
    overdub: bool,
    mute: bool,
    reverse: bool,
    loops: Vec<LoopSlot>,
    loop_index: usize,
    previous_loop: usize,
    frame: u64,
    rate: f32,
    subcycles: u32,
    input_level: f32,
    feedback: f32,
    goal_frames: u64,

    /// Mode bookkeeping.
    resume_mode: TrackMode,
    multiply_start: u64,
    insert_start: u64,
    insert_end: u64,
    /// Input captured while a growing mode runs (record, multiply, insert).
    capture: Vec<f32>,

    /// Current block plumbing.
    input: Vec<f32>,
    output: Vec<f32>,
    cursor: usize,
}

impl LoopTrack {
    pub fn new(number: usize, params: &TrackParams, block_frames: usize) -> Self {
        let mut loops = Vec::with_capacity(params.loop_count.max(1));
        for _ in 0..params.loop_count.max(1) {
            loops.push(LoopSlot::default());
        }
        Self {
            number,
            mode: TrackMode::Reset,
            overdub: false,
            mute: false,
            reverse: false,
            loops,
            loop_index: 0,
            previous_loop: 0,
            frame: 0,
            rate: 1.0,
            subcycles: params.subcycles.max(1),
            input_level: params.input_level,
            feedback: params.feedback,
            goal_frames: 0,
            resume_mode: TrackMode::Play,
            multiply_start: 0,
            insert_start: 0,
            insert_end: 0,
            capture: Vec::new(),
            input: vec![0.0; block_frames],
            output: vec![0.0; block_frames],
            cursor: 0,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn apply_params(&mut self, params: &TrackParams) {
        self.subcycles = params.subcycles.max(1);
        self.input_level = params.input_level;
        self.feedback = params.feedback;
        while self.loops.len() < params.loop_count.max(1) {
            self.loops.push(LoopSlot::default());
        }
    }

    /// Stage the block's input and clear the output accumulator. Called by
    /// the engine before the scheduler advances this track.
    pub fn begin_block(&mut self, input: &[f32]) {
        self.input.resize(input.len().max(self.output.len()), 0.0);
        self.input[..input.len()].copy_from_slice(input);
        self.input[input.len()..].fill(0.0);
        if self.output.len() < self.input.len() {
            self.output.resize(self.input.len(), 0.0);
        }
        self.output.fill(0.0);
        self.cursor = 0;
    }

    pub fn output(&self) -> &[f32] {
        &self.output
    }

    /// Target length for synchronized/auto recordings, derived by the engine
    /// from the transport.
    pub fn set_goal_frames(&mut self, frames: u64) {
        self.goal_frames = frames;
    }

    pub fn set_rate(&mut self, rate: f32) {
        if rate > 0.0 {
            self.rate = rate;
        }
    }

    fn slot(&self) -> &LoopSlot {
        &self.loops[self.loop_index]
    }

    fn slot_mut(&mut self) -> &mut LoopSlot {
        &mut self.loops[self.loop_index]
    }

    fn input_sample(&self, offset: usize) -> f32 {
        self.input
            .get(self.cursor + offset)
            .copied()
            .unwrap_or(0.0)
            * self.input_level
    }

    fn playback_frame(&self, frame: u64) -> u64 {
        let frames = self.slot().frames;
        if self.reverse && frames > 0 {
            frames - 1 - (frame % frames)
        } else {
            frame
        }
    }

    /// Commit the input captured during a growing mode as a layer of
    /// `frames` length, placed at `offset` within the new loop region.
    fn commit_capture(&mut self, frames: u64, offset: u64) {
        let feedback = self.feedback;
        let capture = std::mem::take(&mut self.capture);
        let mut layer = LoopLayer::zeroed(frames as usize);
        for (i, sample) in capture.iter().enumerate() {
            let at = offset as usize + i;
            if at < layer.samples.len() {
                layer.samples[at] = sample * feedback;
            }
        }
        self.slot_mut().layers.push(layer);
    }
}

impl LooperTrack for LoopTrack {
    fn mode(&self) -> TrackMode {
        self.mode
    }
    fn frame(&self) -> u64 {
        self.frame
    }
    fn loop_frames(&self) -> u64 {
        self.slot().frames
    }
    fn cycle_frames(&self) -> u64 {
        self.slot().cycle_frames
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
        self.goal_frames
    }
    fn mode_end_frame(&self) -> u64 {
        self.insert_end
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
        debug!(track = self.number, "record start");
        self.slot_mut().clear();
        self.capture.clear();
        self.frame = 0;
        self.overdub = false;
        self.mode = TrackMode::Record;
    }

    fn finish_record(&mut self) {
        let frames = self.frame;
        debug!(track = self.number, frames, "record end");
        self.commit_capture(frames, 0);
        let slot = self.slot_mut();
        slot.frames = frames;
        slot.cycle_frames = frames;
        self.frame = 0;
        self.mode = TrackMode::Play;
    }

    fn start_multiply(&mut self) {
        self.multiply_start = self.frame;
        self.capture.clear();
        self.mode = TrackMode::Multiply;
    }

    fn finish_multiply(&mut self) {
        let cycle = self.slot().cycle_frames.max(1);
        let start_cycle = self.multiply_start / cycle;
        let end_cycle = (self.frame / cycle).max(start_cycle + 1);
        let region_start = start_cycle * cycle;
        let frames = (end_cycle - start_cycle) * cycle;
        debug!(
            track = self.number,
            cycles = end_cycle - start_cycle,
            "multiply end"
        );
        // Existing layers tile by modulo read; only the new material needs a
        // layer of the new length.
        self.commit_capture(frames, self.multiply_start - region_start);
        let slot = self.slot_mut();
        slot.frames = frames;
        self.frame = (self.frame - region_start) % frames.max(1);
        self.mode = TrackMode::Play;
    }

    fn unrounded_multiply(&mut self) {
        let frames = (self.frame - self.multiply_start).max(1);
        debug!(track = self.number, frames, "unrounded multiply");
        self.commit_capture(frames, 0);
        let slot = self.slot_mut();
        slot.frames = frames;
        // An unrounded multiply redefines the cycle.
        slot.cycle_frames = frames;
        self.frame = 0;
        self.mode = TrackMode::Play;
    }

    fn start_insert(&mut self) {
        self.insert_start = self.frame;
        self.insert_end = self.frame + self.slot().cycle_frames;
        self.capture.clear();
        self.mode = TrackMode::Insert;
    }

    fn extend_insert(&mut self) {
        self.insert_end += self.slot().cycle_frames;
    }

    fn finish_insert(&mut self) {
        let inserted = self.capture.len() as u64;
        debug!(track = self.number, inserted, "insert end");
        let feedback = self.feedback;
        let capture = std::mem::take(&mut self.capture);
        let insert_start = self.insert_start;
        let slot = self.slot_mut();
        // Splicing rewrites the timeline, so the stack is committed first.
        slot.flatten();
        if let Some(base) = slot.layers.first_mut() {
            let at = insert_start.min(base.samples.len() as u64) as usize;
            let spliced: Vec<f32> = capture.iter().map(|s| s * feedback).collect();
            base.samples.splice(at..at, spliced);
        }
        slot.frames += inserted;
        self.frame = self.insert_start + inserted;
        self.mode = TrackMode::Play;
    }

    fn unrounded_insert(&mut self) {
        // Same splice, just cut short at the current frame.
        self.insert_end = self.frame;
        self.finish_insert();
    }

    fn toggle_overdub(&mut self) {
        self.overdub = !self.overdub;
        if self.overdub && !self.slot().is_empty() {
            // New material lands on its own layer so it can be undone.
            let frames = self.slot().frames as usize;
            self.slot_mut().layers.push(LoopLayer::zeroed(frames));
        }
    }

    fn toggle_mute(&mut self) {
        self.mute = !self.mute;
    }

    fn toggle_replace(&mut self) {
        if self.mode == TrackMode::Replace {
            self.mode = TrackMode::Play;
        } else if !self.slot().is_empty() {
            // Replacing overwrites the mix in place.
            self.slot_mut().flatten();
            self.mode = TrackMode::Replace;
        } else {
            info!(track = self.number, "replace with no loop");
        }
    }

    fn finish_switch(&mut self, target: usize) -> bool {
        self.previous_loop = self.loop_index;
        self.loop_index = target;
        self.frame = 0;
        let empty = self.slot().is_empty();
        self.mode = if empty { TrackMode::Reset } else { TrackMode::Play };
        debug!(track = self.number, target, empty, "switched loop");
        empty
    }

    fn loop_copy(&mut self, sound: bool, timing: bool) {
        let (frames, cycle_frames) = {
            let from = &self.loops[self.previous_loop];
            (from.frames, from.cycle_frames)
        };
        if frames == 0 {
            info!(track = self.number, "loop copy from an empty loop");
            return;
        }
        if sound {
            let mut flat = LoopLayer::zeroed(frames as usize);
            for i in 0..frames {
                flat.samples[i as usize] = self.loops[self.previous_loop].sample(i);
            }
            let slot = self.slot_mut();
            slot.clear();
            slot.layers.push(flat);
        } else if timing {
            self.slot_mut().clear();
        }
        let slot = self.slot_mut();
        slot.frames = frames;
        slot.cycle_frames = cycle_frames;
        self.frame = 0;
        self.mode = TrackMode::Play;
    }

    fn start_pause(&mut self) {
        self.resume_mode = match self.mode {
            TrackMode::Pause => TrackMode::Play,
            mode => mode,
        };
        self.mode = TrackMode::Pause;
    }

    fn finish_pause(&mut self) {
        self.mode = self.resume_mode;
    }

    fn do_undo(&mut self) {
        if !self.slot_mut().undo_layer() {
            info!(track = self.number, "nothing to undo");
        }
    }

    fn do_redo(&mut self) {
        if !self.slot_mut().redo_layer() {
            info!(track = self.number, "nothing to redo");
        }
    }

    fn do_reset(&mut self) {
        self.slot_mut().clear();
        self.frame = 0;
        self.overdub = false;
        self.mute = false;
        self.reverse = false;
        self.mode = TrackMode::Reset;
    }

    fn do_track_reset(&mut self) {
        for slot in &mut self.loops {
            slot.clear();
        }
        self.loop_index = 0;
        self.previous_loop = 0;
        self.frame = 0;
        self.overdub = false;
        self.mute = false;
        self.reverse = false;
        self.mode = TrackMode::Reset;
    }

    fn do_start(&mut self) {
        self.frame = 0;
        if !self.slot().is_empty() {
            self.mode = TrackMode::Play;
        }
    }

    fn do_stop(&mut self) {
        self.frame = 0;
        if self.mode != TrackMode::Reset {
            self.resume_mode = TrackMode::Play;
            self.mode = TrackMode::Pause;
        }
    }

    fn do_play(&mut self) {
        self.overdub = false;
        self.mute = false;
        if self.mode == TrackMode::Pause {
            self.finish_pause();
        } else if !self.slot().is_empty() {
            self.mode = TrackMode::Play;
        }
    }

    fn instant_multiply(&mut self, multiple: u32) {
        let number = self.number;
        let slot = self.slot_mut();
        if slot.frames == 0 {
            return;
        }
        // Layers tile, so doubling the length is just bookkeeping.
        slot.frames *= multiple.max(2) as u64;
        debug!(track = number, frames = slot.frames, "instant multiply");
    }

    fn instant_divide(&mut self, divisor: u32) {
        let divisor = divisor.max(2) as u64;
        let cycle = self.slot().cycle_frames;
        let slot = self.slot_mut();
        if slot.frames == 0 {
            return;
        }
        let next = slot.frames / divisor;
        if next < cycle.max(1) {
            info!(track = self.number, "instant divide below one cycle");
            return;
        }
        slot.frames = next;
        self.frame %= next;
        debug!(track = self.number, frames = next, "instant divide");
    }

    fn leader_reset(&mut self) {
        debug!(track = self.number, "leader reset");
        self.do_stop();
    }

    fn leader_record_start(&mut self) {
        // The leader's loop is being replaced; stay quiet until it settles.
        debug!(track = self.number, "leader record start");
    }

    fn leader_record_end(&mut self) {
        debug!(track = self.number, "leader record end");
    }

    fn leader_mute_start(&mut self) {
        debug!(track = self.number, "leader mute start");
    }

    fn leader_mute_end(&mut self) {
        debug!(track = self.number, "leader mute end");
    }

    fn leader_resized(&mut self, frames: u64) {
        // Resize target only; the audio is not stretched.
        debug!(track = self.number, frames, "leader resized");
        self.goal_frames = frames;
    }

    fn leader_moved(&mut self, frame: u64) {
        if self.slot().frames > 0 {
            self.frame = frame % self.slot().frames;
        }
    }

    fn advance(&mut self, frames: u64) {
        let n = frames as usize;
        match self.mode {
            TrackMode::Reset | TrackMode::Synchronize | TrackMode::Pause => {}
            TrackMode::Record | TrackMode::Multiply | TrackMode::Insert => {
                for i in 0..n {
                    let sample = self.input_sample(i);
                    self.capture.push(sample);
                    // Growing modes keep playing existing material, except a
                    // fresh recording which has nothing yet.
                    if self.mode != TrackMode::Record && !self.mute {
                        let at = self.playback_frame(self.frame + i as u64);
                        let out = self.slot().sample(at);
                        if let Some(o) = self.output.get_mut(self.cursor + i) {
                            *o = out;
                        }
                    }
                }
                self.frame += frames;
            }
            _ => {
                let loop_frames = self.slot().frames;
                let replacing = self.mode == TrackMode::Replace;
                let writing = self.overdub || replacing;
                for i in 0..n {
                    let at = self.playback_frame(self.frame + i as u64);
                    let mixed = if self.mute { 0.0 } else { self.slot().sample(at) };
                    if let Some(o) = self.output.get_mut(self.cursor + i) {
                        *o = mixed;
                    }
                    if loop_frames > 0 && writing {
                        let sample = self.input_sample(i);
                        let idx = (at % loop_frames) as usize;
                        if let Some(layer) = self.slot_mut().layers.last_mut() {
                            if idx < layer.samples.len() {
                                if replacing {
                                    layer.samples[idx] = sample;
                                } else {
                                    layer.samples[idx] += sample;
                                }
                            }
                        }
                    }
                }
                self.frame += frames;
            }
        }
        self.cursor += n;
    }

    fn loop_wrap(&mut self) {
        let frames = self.slot().frames;
        if frames > 0 {
            self.frame = self.frame.saturating_sub(frames);
        } else {
            self.frame = 0;
        }
    }
}
