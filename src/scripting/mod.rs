use crate::actions::{ActionDesc, Symbol};
use crate::engine::EngineCommand;
use crate::events::{WaitHandle, WaitOutcome};
use crate::timing::WaitUnit;
use crossbeam::channel::Sender;
use mlua::Lua;
use tracing::info;

/// Lua front end. Scripts run on their own thread; every command goes
/// through the engine, and waits block the script thread on an event wait
/// handle until the scheduler fires (or cancels) it.
///
/// Exposed globals:
/// - `action(track, name [, value])` — perform a looper function
/// - `wait(track, unit)` — block until the next "subcycle" | "cycle" |
///   "loop" boundary on that track; returns the frame the wait fired at
/// - `wait_frame(track, frame)` — block until an absolute loop frame
pub struct LuaRuntime {
    pub lua: Lua,
}

fn parse_unit(unit: Option<String>) -> WaitUnit {
    match unit.as_deref() {
        Some("subcycle") => WaitUnit::Subcycle,
        Some("loop") => WaitUnit::Loop,
        _ => WaitUnit::Cycle,
    }
}

impl LuaRuntime {
    pub fn new(command_tx: Sender<EngineCommand>) -> Result<Self, mlua::Error> {
        let lua = Lua::new();

        let tx = command_tx.clone();
        let action = lua.create_function(
            move |_, (track, name, value): (usize, String, Option<i64>)| {
                let symbol = Symbol::from_name(&name).ok_or_else(|| {
                    mlua::Error::RuntimeError(format!("unknown function: {}", name))
                })?;
                let mut desc = ActionDesc::with_value(symbol, value.unwrap_or(0));
                desc.track = Some(track);
                tx.send(EngineCommand::Do(desc))
                    .map_err(|_| mlua::Error::RuntimeError("engine is gone".into()))?;
                Ok(())
            },
        )?;
        lua.globals().set("action", action)?;

        let tx = command_tx.clone();
        let wait = lua.create_function(move |_, (track, unit): (usize, Option<String>)| {
            let (handle, rx) = WaitHandle::new();
            tx.send(EngineCommand::ScheduleWait {
                track,
                unit: parse_unit(unit),
                handle,
            })
            .map_err(|_| mlua::Error::RuntimeError("engine is gone".into()))?;
            match rx.recv() {
                Ok(WaitOutcome::Fired { frame }) => Ok(frame),
                Ok(WaitOutcome::Canceled) => {
                    Err(mlua::Error::RuntimeError("wait canceled".into()))
                }
                Err(_) => Err(mlua::Error::RuntimeError("engine is gone".into())),
            }
        })?;
        lua.globals().set("wait", wait)?;

        let tx = command_tx;
        let wait_frame = lua.create_function(move |_, (track, frame): (usize, u64)| {
            let (handle, rx) = WaitHandle::new();
            tx.send(EngineCommand::ScheduleWait {
                track,
                unit: WaitUnit::Frame(frame),
                handle,
            })
            .map_err(|_| mlua::Error::RuntimeError("engine is gone".into()))?;
            match rx.recv() {
                Ok(WaitOutcome::Fired { frame }) => Ok(frame),
                Ok(WaitOutcome::Canceled) => {
                    Err(mlua::Error::RuntimeError("wait canceled".into()))
                }
                Err(_) => Err(mlua::Error::RuntimeError("engine is gone".into())),
            }
        })?;
        lua.globals().set("wait_frame", wait_frame)?;

        Ok(Self { lua })
    }

    pub fn execute(&self, code: &str) -> Result<(), mlua::Error> {
        self.lua.load(code).exec()
    }

    /// Run a script on its own thread so waits can block freely.
    pub fn spawn(self, code: String) {
        std::thread::spawn(move || {
            if let Err(e) = self.execute(&code) {
                info!("script ended: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_reach_the_engine_channel() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let runtime = LuaRuntime::new(tx).unwrap();

        runtime
            .execute("action(2, \"Record\")\naction(2, \"SelectLoop\", 1)")
            .unwrap();

        match rx.try_recv().unwrap() {
            EngineCommand::Do(desc) => {
                assert_eq!(desc.symbol, Symbol::Record);
                assert_eq!(desc.track, Some(2));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        match rx.try_recv().unwrap() {
            EngineCommand::Do(desc) => {
                assert_eq!(desc.symbol, Symbol::SelectLoop);
                assert_eq!(desc.value, 1);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn unknown_functions_raise_a_script_error() {
        let (tx, _rx) = crossbeam::channel::unbounded();
        let runtime = LuaRuntime::new(tx).unwrap();
        assert!(runtime.execute("action(0, \"Teleport\")").is_err());
    }

    #[test]
    fn canceled_waits_unblock_with_an_error() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let runtime = LuaRuntime::new(tx).unwrap();

        // Cancel the wait from another thread, the way a reset would.
        std::thread::spawn(move || {
            if let Ok(EngineCommand::ScheduleWait { handle, .. }) = rx.recv() {
                handle.cancel();
            }
        });

        assert!(runtime.execute("wait(0, \"cycle\")").is_err());
    }
}
