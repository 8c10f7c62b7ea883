// Position risk tracking, entry monitoring and order execution
pub mod executor;
pub mod position_tracker;
pub mod price_feed;
pub mod signal_monitor;

pub use executor::{AutoCloseReport, CloseOutcome, Executor, OpenOutcome};
pub use position_tracker::{
    Evaluation, PositionTracker, ReconcileReport, RiskContext, RiskDecision, TrackerBook,
};
pub use price_feed::{FeedVenue, PriceAlerts, PriceFeed};
pub use signal_monitor::{EntryMonitor, MonitorAction, MonitorState};
