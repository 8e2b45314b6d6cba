use crate::actions::{ActionDesc, Symbol};
use crate::engine::EngineCommand;
use crate::sync::MidiClock;
use crossbeam::channel::Sender;
use midir::{MidiInput, MidiInputConnection};
use tracing::{debug, info, warn};

/// Note layout of the default pad mapping: eight tracks per function row.
const TRACKS_PER_ROW: u8 = 8;
const NOTE_RECORD: u8 = 36;
const NOTE_OVERDUB: u8 = 44;
const NOTE_MUTE: u8 = 52;
const NOTE_MULTIPLY: u8 = 60;
const NOTE_NEXT_LOOP: u8 = 68;
const NOTE_UNDO: u8 = 76;

/// Map a pad note to a looper action. Rows of eight: record, overdub,
/// mute, multiply, next-loop, undo.
pub fn map_note(note: u8) -> Option<ActionDesc> {
    let (base, symbol) = match note {
        NOTE_RECORD..NOTE_OVERDUB => (NOTE_RECORD, Symbol::Record),
        NOTE_OVERDUB..NOTE_MUTE => (NOTE_OVERDUB, Symbol::Overdub),
        NOTE_MUTE..NOTE_MULTIPLY => (NOTE_MUTE, Symbol::Mute),
        NOTE_MULTIPLY..NOTE_NEXT_LOOP => (NOTE_MULTIPLY, Symbol::Multiply),
        NOTE_NEXT_LOOP..NOTE_UNDO => (NOTE_NEXT_LOOP, Symbol::NextLoop),
        NOTE_UNDO..=83 => (NOTE_UNDO, Symbol::Undo),
        _ => return None,
    };
    let mut desc = ActionDesc::new(symbol);
    desc.track = Some(((note - base) % TRACKS_PER_ROW) as usize);
    Some(desc)
}

/// Open the first available MIDI input and forward pad presses as engine
/// actions and clock bytes into the shared clock state. The connection must
/// be kept alive by the caller.
pub fn spawn_midi_input(
    command_tx: Sender<EngineCommand>,
    clock: std::sync::Arc<MidiClock>,
) -> Option<MidiInputConnection<()>> {
    let midi_in = match MidiInput::new("ostinato") {
        Ok(m) => m,
        Err(e) => {
            warn!("midi input unavailable: {}", e);
            return None;
        }
    };
    let ports = midi_in.ports();
    let port = ports.first()?;
    let port_name = midi_in.port_name(port).unwrap_or_default();
    info!(port = %port_name, "midi input connected");

    midi_in
        .connect(
            port,
            "ostinato-in",
            move |_timestamp, message, _| match message {
                [0xF8, ..] => clock.tick(),
                [0xFA, ..] | [0xFB, ..] => clock.set_running(true),
                [0xFC, ..] => clock.set_running(false),
                [status, note, velocity, ..]
                    if status & 0xF0 == 0x90 && *velocity > 0 =>
                {
                    if let Some(desc) = map_note(*note) {
                        debug!(note, symbol = desc.symbol.name(), "pad action");
                        let _ = command_tx.send(EngineCommand::Do(desc));
                    }
                }
                _ => {}
            },
            (),
        )
        .map_err(|e| warn!("midi connect failed: {}", e))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_rows_map_to_functions_and_tracks() {
        let desc = map_note(36).unwrap();
        assert_eq!(desc.symbol, Symbol::Record);
        assert_eq!(desc.track, Some(0));

        let desc = map_note(39).unwrap();
        assert_eq!(desc.symbol, Symbol::Record);
        assert_eq!(desc.track, Some(3));

        let desc = map_note(44).unwrap();
        assert_eq!(desc.symbol, Symbol::Overdub);
        assert_eq!(desc.track, Some(0));

        let desc = map_note(71).unwrap();
        assert_eq!(desc.symbol, Symbol::NextLoop);
        assert_eq!(desc.track, Some(3));

        assert!(map_note(10).is_none());
        assert!(map_note(90).is_none());
    }
}
