use tokio::time::{Duration, Instant};

use crate::config::EntrySettings;
use crate::models::{Side, Signal, TradeDirection};

/// Where the entry monitor is in its Idle → Watching → Confirming cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorState {
    Idle,
    Watching,
    Confirming {
        signal: Signal,
        snapshot_price: f64,
        deadline: Instant,
    },
}

/// What the caller should do after feeding the monitor an observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorAction {
    None,
    /// Book was flat long enough, now watching signals
    Started,
    /// Flat book ended (a position appeared) while monitoring
    Cancelled,
    Confirming { signal: Signal, snapshot_price: f64 },
    /// Price confirmed the signal: open this side now
    Open(Side),
    /// Price did not follow through, back to idle without trading
    Discarded { signal: Signal },
}

/// Debounced, confirmation-gated entry logic.
///
/// Holds no I/O: the control loop feeds it polls and ticks and acts on the
/// returned [`MonitorAction`]. Only one monitoring cycle is ever active.
#[derive(Debug, Clone)]
pub struct EntryMonitor {
    state: MonitorState,
    empty_polls: u32,
}

impl Default for EntryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryMonitor {
    pub fn new() -> Self {
        Self {
            state: MonitorState::Idle,
            empty_polls: 0,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != MonitorState::Idle
    }

    pub fn empty_polls(&self) -> u32 {
        self.empty_polls
    }

    /// Begin watching; a no-op returning false when already active
    pub fn start(&mut self) -> bool {
        if self.is_active() {
            return false;
        }
        self.state = MonitorState::Watching;
        self.empty_polls = 0;
        true
    }

    pub fn cancel(&mut self) -> bool {
        let was_active = self.is_active();
        self.state = MonitorState::Idle;
        was_active
    }

    /// Feed the outcome of a positions poll
    pub fn observe_book(&mut self, book_empty: bool, auto_open: bool, cfg: &EntrySettings) -> MonitorAction {
        if !book_empty {
            self.empty_polls = 0;
            return if self.cancel() {
                MonitorAction::Cancelled
            } else {
                MonitorAction::None
            };
        }

        if self.is_active() {
            return MonitorAction::None;
        }
        self.empty_polls = self.empty_polls.saturating_add(1);
        if auto_open && self.empty_polls > cfg.empty_count_threshold && self.start() {
            return MonitorAction::Started;
        }
        MonitorAction::None
    }

    /// Feed one signal-check tick
    pub fn on_tick(
        &mut self,
        now: Instant,
        decision: Signal,
        price: Option<f64>,
        direction: TradeDirection,
        cfg: &EntrySettings,
    ) -> MonitorAction {
        match self.state {
            MonitorState::Idle => MonitorAction::None,
            MonitorState::Watching => {
                let Some(price) = price else {
                    return MonitorAction::None;
                };
                if !direction.allows(decision) {
                    return MonitorAction::None;
                }
                self.state = MonitorState::Confirming {
                    signal: decision,
                    snapshot_price: price,
                    deadline: now + Duration::from_secs(cfg.confirmation_secs),
                };
                MonitorAction::Confirming {
                    signal: decision,
                    snapshot_price: price,
                }
            }
            MonitorState::Confirming {
                signal,
                snapshot_price,
                deadline,
            } => {
                if now < deadline {
                    return MonitorAction::None;
                }
                let Some(price) = price else {
                    return MonitorAction::None;
                };
                self.state = MonitorState::Idle;
                let confirmed = match signal {
                    Signal::Buy => price > snapshot_price,
                    Signal::Sell => price < snapshot_price,
                    Signal::Wait => false,
                };
                match (confirmed, signal.side()) {
                    (true, Some(side)) => MonitorAction::Open(side),
                    _ => MonitorAction::Discarded { signal },
                }
            }
        }
    }
}
