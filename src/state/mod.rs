pub mod document;
pub mod manager;

pub use document::{checksum, StateDocument};
pub use manager::StateManager;
