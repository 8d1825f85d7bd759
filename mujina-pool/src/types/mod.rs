//! Core types shared across the pool.

mod difficulty;
mod share_rate;

pub use difficulty::{DifficultyMath, DisplayDifficulty};
pub use share_rate::ShareRate;
