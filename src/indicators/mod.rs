// Technical indicators used by the entry decision engine

pub mod high_low;
pub mod moving_average;
pub mod rsi;
pub mod volume;

pub use high_low::{calculate_high_low, high_low_signal};
pub use moving_average::calculate_sma;
pub use rsi::calculate_rsi;
pub use volume::{calculate_average_volume, volume_signal};
