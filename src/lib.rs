pub mod actions;
pub mod audio;
pub mod engine;
pub mod events;
pub mod midi;
pub mod scripting;
pub mod session;
pub mod sync;
pub mod timing;
pub mod track;
pub mod ui;

pub use engine::{EngineCommand, EngineHandle, EngineUpdate, spawn_engine};
pub use session::Session;
pub use ui::OstinatoApp;
