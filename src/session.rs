use crate::sync::{LeaderKind, SyncSource};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Quantize unit for deferred functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuantizeMode {
    #[default]
    Off,
    Subcycle,
    Cycle,
    Loop,
}

/// When a loop switch takes effect. The confirm variants leave the switch
/// pending until an explicit Confirm action arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SwitchQuantize {
    #[default]
    Off,
    Subcycle,
    Cycle,
    Loop,
    Confirm,
    ConfirmCycle,
    ConfirmLoop,
}

impl SwitchQuantize {
    pub fn is_confirm(&self) -> bool {
        matches!(
            self,
            SwitchQuantize::Confirm | SwitchQuantize::ConfirmCycle | SwitchQuantize::ConfirmLoop
        )
    }

    /// Quantize unit applied once a confirm variant is confirmed, or for the
    /// plain quantized variants.
    pub fn unit(&self) -> QuantizeMode {
        match self {
            SwitchQuantize::Off | SwitchQuantize::Confirm => QuantizeMode::Off,
            SwitchQuantize::Subcycle => QuantizeMode::Subcycle,
            SwitchQuantize::Cycle | SwitchQuantize::ConfirmCycle => QuantizeMode::Cycle,
            SwitchQuantize::Loop | SwitchQuantize::ConfirmLoop => QuantizeMode::Loop,
        }
    }
}

/// How long a loop switch lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SwitchDuration {
    #[default]
    Permanent,
    /// Play the destination once, then mute.
    Once,
    /// Play the destination once, then return to the origin loop.
    OnceReturn,
    Sustain,
    SustainReturn,
}

/// What to do when a switch lands on an empty loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EmptyLoopAction {
    #[default]
    None,
    /// Start a synchronized recording in the new loop.
    Record,
    /// Copy audio from the previous loop.
    Copy,
    /// Copy only the length of the previous loop.
    CopyTiming,
}

/// Per-track scheduling parameters, persisted with the session and
/// hot-swapped into the engine on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackParams {
    pub name: String,
    pub loop_count: usize,
    pub subcycles: u32,
    pub quantize: QuantizeMode,
    pub switch_quantize: SwitchQuantize,
    pub switch_duration: SwitchDuration,
    pub empty_loop_action: EmptyLoopAction,
    pub sync_source: SyncSource,
    pub leader: LeaderKind,
    /// Quantize unit delegated to the leader for loop switches; None keeps
    /// switch timing local.
    pub leader_switch_location: Option<QuantizeMode>,
    /// Quantize unpause to the next leader pulse.
    pub follow_quantize: bool,
    pub track_sync_master: bool,
    pub out_sync_master: bool,
    /// Cycles an AutoRecord records before stopping itself.
    pub auto_record_cycles: u32,
    pub input_level: f32,
    pub feedback: f32,
}

impl Default for TrackParams {
    fn default() -> Self {
        Self {
            name: String::new(),
            loop_count: 4,
            subcycles: 4,
            quantize: QuantizeMode::Off,
            switch_quantize: SwitchQuantize::Off,
            switch_duration: SwitchDuration::Permanent,
            empty_loop_action: EmptyLoopAction::None,
            sync_source: SyncSource::None,
            leader: LeaderKind::None,
            leader_switch_location: None,
            follow_quantize: false,
            track_sync_master: false,
            out_sync_master: false,
            auto_record_cycles: 1,
            input_level: 1.0,
            feedback: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub version: String,
    pub sample_rate: u32,
    pub tempo: f32,
    pub beats_per_bar: u32,
    pub tracks: Vec<TrackParams>,
}

impl Default for Session {
    fn default() -> Self {
        let mut tracks = Vec::new();
        for i in 0..4 {
            tracks.push(TrackParams {
                name: format!("Track {}", i + 1),
                ..TrackParams::default()
            });
        }
        Self {
            name: "untitled".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            sample_rate: 48000,
            tempo: 120.0,
            beats_per_bar: 4,
            tracks,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed session: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("serialize error: {0}")]
    Serialize(#[from] ron::Error),
}

impl Session {
    pub fn save(&self, session_path: &Path) -> Result<(), SessionError> {
        fs::create_dir_all(session_path)?;

        let ron_path = session_path.join("session.ron");
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(ron_path, ron_string)?;

        Ok(())
    }

    pub fn load(session_path: &Path) -> Result<Self, SessionError> {
        let ron_path = session_path.join("session.ron");
        let ron_string = fs::read_to_string(ron_path)?;
        let session: Session = ron::from_str(&ron_string)?;

        Ok(session)
    }
}
