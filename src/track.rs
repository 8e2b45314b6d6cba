use serde::{Deserialize, Serialize};

/// Major operating mode of a track. Mutually exclusive; the minor overdub,
/// mute and reverse flags combine with it orthogonally.
///
/// Mode is owned and mutated only by the track itself in response to
/// scheduler-issued calls. The scheduler infers state through queries and
/// drives transitions through the `LooperTrack` calls below; it never writes
/// the mode directly. `Synchronize` is the display value for a track whose
/// record start is pending on a sync pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrackMode {
    #[default]
    Reset,
    Synchronize,
    Record,
    Play,
    Overdub,
    Mute,
    Multiply,
    Insert,
    Replace,
    Switch,
    Pause,
    Rounding,
}

impl TrackMode {
    pub fn name(&self) -> &'static str {
        match self {
            TrackMode::Reset => "Reset",
            TrackMode::Synchronize => "Synchronize",
            TrackMode::Record => "Record",
            TrackMode::Play => "Play",
            TrackMode::Overdub => "Overdub",
            TrackMode::Mute => "Mute",
            TrackMode::Multiply => "Multiply",
            TrackMode::Insert => "Insert",
            TrackMode::Replace => "Replace",
            TrackMode::Switch => "Switch",
            TrackMode::Pause => "Pause",
            TrackMode::Rounding => "Rounding",
        }
    }

    /// Modes in which the loop is still growing and boundary math is skipped.
    pub fn is_extending(&self) -> bool {
        matches!(
            self,
            TrackMode::Record | TrackMode::Multiply | TrackMode::Insert
        )
    }
}

/// The capability interface the scheduler consumes. The scheduler decides
/// *when*; the track does the actual recording, playing and layer surgery.
///
/// Everything here is a narrow, synchronous, same-thread call. Nothing
/// returns errors: a track asked to do something impossible logs and keeps
/// itself consistent.
pub trait LooperTrack {
    fn mode(&self) -> TrackMode;
    fn frame(&self) -> u64;
    fn loop_frames(&self) -> u64;
    fn cycle_frames(&self) -> u64;
    fn subcycles(&self) -> u32;
    fn loop_index(&self) -> usize;
    fn loop_count(&self) -> usize;
    fn rate(&self) -> f32;
    /// Frame count a synchronized or auto record is aiming for; 0 if none.
    fn goal_frames(&self) -> u64;
    /// Where the current rounding mode naturally ends (Insert scheduling).
    fn mode_end_frame(&self) -> u64;
    fn overdub_active(&self) -> bool;
    fn mute_active(&self) -> bool;
    fn reverse_active(&self) -> bool;

    fn start_record(&mut self);
    fn finish_record(&mut self);

    fn start_multiply(&mut self);
    fn finish_multiply(&mut self);
    fn unrounded_multiply(&mut self);

    fn start_insert(&mut self);
    fn extend_insert(&mut self);
    fn finish_insert(&mut self);
    fn unrounded_insert(&mut self);

    fn toggle_overdub(&mut self);
    fn toggle_mute(&mut self);
    fn toggle_replace(&mut self);

    /// Change the playing loop. Returns true when the destination loop is
    /// empty, so the scheduler can apply the configured empty-loop action.
    fn finish_switch(&mut self, target: usize) -> bool;
    /// Fill the current loop from the previously playing one.
    fn loop_copy(&mut self, sound: bool, timing: bool);

    fn start_pause(&mut self);
    fn finish_pause(&mut self);

    fn do_undo(&mut self);
    fn do_redo(&mut self);
    /// Reset the current loop.
    fn do_reset(&mut self);
    /// Reset every loop in the track.
    fn do_track_reset(&mut self);
    fn do_start(&mut self);
    fn do_stop(&mut self);
    fn do_play(&mut self);

    fn instant_multiply(&mut self, multiple: u32);
    fn instant_divide(&mut self, divisor: u32);

    // Leader notifications, forwarded by the scheduler when this track
    // follows another.
    fn leader_reset(&mut self);
    fn leader_record_start(&mut self);
    fn leader_record_end(&mut self);
    fn leader_mute_start(&mut self);
    fn leader_mute_end(&mut self);
    fn leader_resized(&mut self, frames: u64);
    fn leader_moved(&mut self, frame: u64);

    /// Advance playback/record position by `frames`. Never crosses the loop
    /// boundary; the scheduler splits blocks and calls `loop_wrap` between
    /// the pieces.
    fn advance(&mut self, frames: u64);
    /// The loop boundary was reached: rewind the playback frame.
    fn loop_wrap(&mut self);
}
