mod layer;
mod track;

pub use layer::{LoopLayer, LoopSlot};
pub use track::LoopTrack;
