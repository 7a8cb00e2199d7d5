pub mod actions;
pub mod autoinstall;
pub mod guided;

pub use actions::Action;
pub use autoinstall::{DiskMatch, LayoutMode, LayoutSpec, MatchSize, StorageAutoinstall};
pub use guided::{GapRef, GuidedChoice, GuidedTarget, LayoutName};
