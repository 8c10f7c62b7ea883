// Risk management module
pub mod trailing_stop;

pub use trailing_stop::{
    calculate_stop_loss, check_stop_price, ratchet_trigger, update_max_pnl, CloseReason, ExitKind,
    StopPriceHit, TrailTier, TrailingMode, TrailingStopConfig,
};
