use serde::{Deserialize, Serialize};
use tracing::warn;

/// Looper functions a control surface, script or UI can invoke.
///
/// Each symbol carries a handful of static properties the scheduler consults
/// when routing: whether it is subject to quantization, whether it targets
/// every track, whether it is one of the loop-switch family, and whether it
/// bypasses the mode state machine entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Symbol {
    Record,
    AutoRecord,
    Overdub,
    Multiply,
    InstantMultiply,
    InstantDivide,
    Insert,
    Replace,
    Mute,
    Pause,
    Play,
    Stop,
    Start,
    Restart,
    Undo,
    Redo,
    Reset,
    TrackReset,
    GlobalReset,
    FocusLock,
    NextLoop,
    PrevLoop,
    SelectLoop,
    Confirm,
    Resize,
}

impl Symbol {
    pub fn name(&self) -> &'static str {
        match self {
            Symbol::Record => "Record",
            Symbol::AutoRecord => "AutoRecord",
            Symbol::Overdub => "Overdub",
            Symbol::Multiply => "Multiply",
            Symbol::InstantMultiply => "InstantMultiply",
            Symbol::InstantDivide => "InstantDivide",
            Symbol::Insert => "Insert",
            Symbol::Replace => "Replace",
            Symbol::Mute => "Mute",
            Symbol::Pause => "Pause",
            Symbol::Play => "Play",
            Symbol::Stop => "Stop",
            Symbol::Start => "Start",
            Symbol::Restart => "Restart",
            Symbol::Undo => "Undo",
            Symbol::Redo => "Redo",
            Symbol::Reset => "Reset",
            Symbol::TrackReset => "TrackReset",
            Symbol::GlobalReset => "GlobalReset",
            Symbol::FocusLock => "FocusLock",
            Symbol::NextLoop => "NextLoop",
            Symbol::PrevLoop => "PrevLoop",
            Symbol::SelectLoop => "SelectLoop",
            Symbol::Confirm => "Confirm",
            Symbol::Resize => "Resize",
        }
    }

    /// Lookup by display name, for scripts and config.
    pub fn from_name(name: &str) -> Option<Symbol> {
        const ALL: &[Symbol] = &[
            Symbol::Record,
            Symbol::AutoRecord,
            Symbol::Overdub,
            Symbol::Multiply,
            Symbol::InstantMultiply,
            Symbol::InstantDivide,
            Symbol::Insert,
            Symbol::Replace,
            Symbol::Mute,
            Symbol::Pause,
            Symbol::Play,
            Symbol::Stop,
            Symbol::Start,
            Symbol::Restart,
            Symbol::Undo,
            Symbol::Redo,
            Symbol::Reset,
            Symbol::TrackReset,
            Symbol::GlobalReset,
            Symbol::FocusLock,
            Symbol::NextLoop,
            Symbol::PrevLoop,
            Symbol::SelectLoop,
            Symbol::Confirm,
            Symbol::Resize,
        ];
        ALL.iter().copied().find(|s| s.name() == name)
    }

    /// Functions whose effect is deferred to the track's quantize boundary
    /// when quantization is enabled.
    pub fn is_quantized(&self) -> bool {
        matches!(
            self,
            Symbol::Overdub
                | Symbol::Multiply
                | Symbol::InstantMultiply
                | Symbol::InstantDivide
                | Symbol::Insert
                | Symbol::Replace
                | Symbol::Mute
        )
    }

    /// Functions that apply to every track, not just the focused one.
    pub fn is_global(&self) -> bool {
        matches!(self, Symbol::GlobalReset)
    }

    pub fn is_switch(&self) -> bool {
        matches!(self, Symbol::NextLoop | Symbol::PrevLoop | Symbol::SelectLoop)
    }

    /// Executive functions are handled before the mode state machine and are
    /// valid in every mode.
    pub fn is_executive(&self) -> bool {
        matches!(
            self,
            Symbol::Reset
                | Symbol::TrackReset
                | Symbol::GlobalReset
                | Symbol::Undo
                | Symbol::Redo
                | Symbol::FocusLock
        )
    }
}

/// A plain, copyable description of an inbound command, as it travels over
/// rings and channels from MIDI, scripts and the UI.
#[derive(Debug, Clone, Copy)]
pub struct ActionDesc {
    pub symbol: Symbol,
    pub value: i64,
    pub track: Option<usize>,
    pub sustain: bool,
    pub long_press: bool,
}

impl ActionDesc {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            value: 0,
            track: None,
            sustain: false,
            long_press: false,
        }
    }

    pub fn with_value(symbol: Symbol, value: i64) -> Self {
        Self {
            value,
            ..Self::new(symbol)
        }
    }
}

/// A pooled action owned by the scheduler. Stacked actions hang off events
/// until the event fires, then come back here.
#[derive(Debug)]
pub struct Action {
    pub symbol: Symbol,
    pub value: i64,
    pub sustain: bool,
    pub long_press: bool,
}

impl Action {
    fn pool_init(&mut self) {
        self.symbol = Symbol::Play;
        self.value = 0;
        self.sustain = false;
        self.long_press = false;
    }
}

/// Free-list allocator for actions. Pre-warmed at construction so the audio
/// thread never allocates while stacking or dispatching.
pub struct ActionPool {
    free: Vec<Box<Action>>,
    outstanding: usize,
}

impl ActionPool {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity * 2);
        for _ in 0..capacity {
            free.push(Box::new(Action {
                symbol: Symbol::Play,
                value: 0,
                sustain: false,
                long_press: false,
            }));
        }
        Self {
            free,
            outstanding: 0,
        }
    }

    pub fn new_action(&mut self, desc: &ActionDesc) -> Box<Action> {
        self.outstanding += 1;
        let mut action = match self.free.pop() {
            Some(a) => a,
            None => {
                warn!("action pool exhausted, growing");
                Box::new(Action {
                    symbol: Symbol::Play,
                    value: 0,
                    sustain: false,
                    long_press: false,
                })
            }
        };
        action.symbol = desc.symbol;
        action.value = desc.value;
        action.sustain = desc.sustain;
        action.long_press = desc.long_press;
        action
    }

    pub fn dispose(&mut self, mut action: Box<Action>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        action.pool_init();
        self.free.push(action);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_properties() {
        assert!(Symbol::Multiply.is_quantized());
        assert!(!Symbol::Record.is_quantized());
        assert!(Symbol::GlobalReset.is_global());
        assert!(Symbol::GlobalReset.is_executive());
        assert!(Symbol::NextLoop.is_switch());
        assert!(!Symbol::NextLoop.is_executive());
    }

    #[test]
    fn pool_reuses_actions() {
        let mut pool = ActionPool::with_capacity(2);
        let a = pool.new_action(&ActionDesc::new(Symbol::Record));
        assert_eq!(pool.outstanding(), 1);
        pool.dispose(a);
        assert_eq!(pool.outstanding(), 0);

        let b = pool.new_action(&ActionDesc::with_value(Symbol::SelectLoop, 3));
        assert_eq!(b.symbol, Symbol::SelectLoop);
        assert_eq!(b.value, 3);
        pool.dispose(b);
    }
}
