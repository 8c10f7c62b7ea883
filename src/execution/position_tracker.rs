use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::api::normalize_symbol;
use crate::config::TradingSettings;
use crate::error::BotError;
use crate::models::{Position, PositionDetails};
use crate::risk::{
    calculate_stop_loss, check_stop_price, ratchet_trigger, update_max_pnl, CloseReason, ExitKind,
    TrailingStopConfig,
};
use crate::Result;

/// PnL% at or above which a first-seen position keeps its PnL as high-water mark
const FIRST_SEEN_MAX_PNL_FLOOR: f64 = 10.0;

/// Trailing-stop state for one open symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionTracker {
    pub position: Position,
    pub max_pnl_percent: f64,
    pub trigger_stop_loss_percent: f64,
    #[serde(default)]
    pub used_margin_calls: u32,
    /// A close was sent but its outcome is unknown; cleared by the next reconcile
    #[serde(skip)]
    pub close_pending: bool,
}

impl PositionTracker {
    /// Fresh tracker for a position this process just opened
    pub fn new(position: Position, default_stop_loss: f64) -> Self {
        Self {
            position,
            max_pnl_percent: 0.0,
            trigger_stop_loss_percent: default_stop_loss,
            used_margin_calls: 0,
            close_pending: false,
        }
    }

    /// Tracker for a position first noticed in a positions poll
    pub fn first_seen(position: Position, default_stop_loss: f64, fee_rate_per_side: f64) -> Self {
        let max_pnl_percent = match position.pnl_percent(fee_rate_per_side) {
            Some(pnl) if pnl >= FIRST_SEEN_MAX_PNL_FLOOR => pnl,
            _ => 0.0,
        };
        Self {
            max_pnl_percent,
            ..Self::new(position, default_stop_loss)
        }
    }

    pub fn symbol(&self) -> &str {
        &self.position.symbol
    }

    /// Same underlying position: the symbol alone survives a flip or a re-open
    fn same_position(&self, other: &Position) -> bool {
        self.position.side == other.side && self.position.entry_price == other.entry_price
    }

    /// Run one trailing-stop tick against the latest snapshot.
    ///
    /// Pure: the caller decides whether `next` is committed.
    pub fn evaluate(&self, ctx: &RiskContext<'_>) -> Evaluation {
        let trading = ctx.trading;
        if self.close_pending {
            return Evaluation {
                next: self.clone(),
                decision: RiskDecision::AwaitingPoll,
                pnl_percent: None,
            };
        }
        let Some(pnl_percent) = self.position.pnl_percent(trading.fee_rate_per_side) else {
            return Evaluation {
                next: self.clone(),
                decision: RiskDecision::Skip,
                pnl_percent: None,
            };
        };

        let mut next = self.clone();
        let calculated = calculate_stop_loss(
            pnl_percent,
            self.position.leverage,
            trading.default_stop_loss,
            ctx.trailing,
        );
        if let Some(trigger) =
            ratchet_trigger(next.trigger_stop_loss_percent, calculated, pnl_percent)
        {
            tracing::debug!(
                symbol = %self.position.symbol,
                pnl_pct = pnl_percent,
                "Trigger updated {:.2}% -> {:.2}%",
                next.trigger_stop_loss_percent,
                trigger
            );
            next.trigger_stop_loss_percent = trigger;
        }
        next.max_pnl_percent = update_max_pnl(next.max_pnl_percent, pnl_percent);

        let kind = ExitKind::from_pnl(pnl_percent);
        let ignored = match kind {
            ExitKind::Profit => trading.ignores_take_profit(&self.position.symbol),
            ExitKind::Loss => trading.ignores_stop_loss(&self.position.symbol),
        };

        // The price stream and the stop price both belong to the traded symbol
        let stop_price = trading
            .stop_loss_price
            .filter(|_| normalize_symbol(&self.position.symbol) == normalize_symbol(&trading.symbol));
        let mut reason = None;
        if let (Some(target), Some(price)) = (stop_price, ctx.last_price) {
            if let Some(hit) = check_stop_price(self.position.side, self.position.entry_price, target, price) {
                reason = Some(CloseReason::StopPrice(hit));
            }
        }
        if reason.is_none() && pnl_percent <= next.trigger_stop_loss_percent {
            reason = Some(CloseReason::TrailingStop);
        }

        let decision = match reason {
            None => RiskDecision::Hold,
            Some(reason) if !trading.auto_close => {
                tracing::debug!(
                    symbol = %self.position.symbol,
                    pnl_pct = pnl_percent,
                    "{} hit but auto-close is disabled",
                    reason
                );
                RiskDecision::Hold
            }
            Some(reason) if ignored => {
                tracing::debug!(
                    symbol = %self.position.symbol,
                    pnl_pct = pnl_percent,
                    "{} hit but symbol is on the {:?} ignore list",
                    reason,
                    kind
                );
                RiskDecision::Suppressed { reason, kind }
            }
            Some(reason) => RiskDecision::Close { reason, kind },
        };

        Evaluation {
            next,
            decision,
            pnl_percent: Some(pnl_percent),
        }
    }
}

/// Read-only inputs for one risk tick
#[derive(Debug, Clone, Copy)]
pub struct RiskContext<'a> {
    pub trading: &'a TradingSettings,
    pub trailing: &'a TrailingStopConfig,
    pub last_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskDecision {
    /// PnL% undefined (zero margin), nothing evaluated
    Skip,
    /// An earlier close has an unknown outcome; wait for a positions poll
    AwaitingPoll,
    Hold,
    /// Exit condition met but an ignore list vetoed it
    Suppressed { reason: CloseReason, kind: ExitKind },
    Close { reason: CloseReason, kind: ExitKind },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub next: PositionTracker,
    pub decision: RiskDecision,
    pub pnl_percent: Option<f64>,
}

/// Symbols added and removed by a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Owned map of symbol to tracker.
///
/// Ordered so serialized snapshots are stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackerBook {
    trackers: BTreeMap<String, PositionTracker>,
}

impl TrackerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(trackers: BTreeMap<String, PositionTracker>) -> Self {
        Self { trackers }
    }

    pub fn into_map(self) -> BTreeMap<String, PositionTracker> {
        self.trackers
    }

    pub fn get(&self, symbol: &str) -> Option<&PositionTracker> {
        self.trackers.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.trackers.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PositionTracker> {
        self.trackers.values()
    }

    /// Bring the tracker set in line with the exchange's open positions.
    ///
    /// New symbols get a tracker, vanished symbols lose theirs, and the rest
    /// take the fresh position snapshot. Running it twice on the same list
    /// leaves the book unchanged.
    pub fn reconcile(
        &mut self,
        positions: &[Position],
        default_stop_loss: f64,
        fee_rate_per_side: f64,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for position in positions {
            match self.trackers.get_mut(&position.symbol) {
                // Entry may move (averaging, re-derived after restart); risk state carries over
                Some(tracker) if tracker.position.side == position.side || tracker.position.margin == 0.0 => {
                    tracker.position = position.clone();
                    tracker.close_pending = false;
                }
                Some(tracker) => {
                    tracing::info!(
                        symbol = %position.symbol,
                        "Position changed side, tracking it afresh"
                    );
                    *tracker = PositionTracker::first_seen(
                        position.clone(),
                        default_stop_loss,
                        fee_rate_per_side,
                    );
                    report.added.push(position.symbol.clone());
                }
                None => {
                    tracing::info!(symbol = %position.symbol, "Tracking new position");
                    self.trackers.insert(
                        position.symbol.clone(),
                        PositionTracker::first_seen(
                            position.clone(),
                            default_stop_loss,
                            fee_rate_per_side,
                        ),
                    );
                    report.added.push(position.symbol.clone());
                }
            }
        }

        let vanished: Vec<String> = self
            .trackers
            .keys()
            .filter(|symbol| !positions.iter().any(|p| &p.symbol == *symbol))
            .cloned()
            .collect();
        for symbol in vanished {
            tracing::info!(symbol = %symbol, "Position no longer open, dropping tracker");
            self.trackers.remove(&symbol);
            report.removed.push(symbol);
        }

        report
    }

    /// Seed a tracker right after a successful open
    pub fn insert_opened(&mut self, details: &PositionDetails, default_stop_loss: f64) -> Result<()> {
        if self.trackers.contains_key(&details.symbol) {
            return Err(BotError::InvariantViolation(format!(
                "tracker for {} already exists",
                details.symbol
            )));
        }
        self.trackers.insert(
            details.symbol.clone(),
            PositionTracker::new(details.provisional_position(), default_stop_loss),
        );
        Ok(())
    }

    /// Merge the risk state of a tracker evaluated from an earlier snapshot.
    ///
    /// Only trigger, water mark and margin calls are taken from `next`; the
    /// stored position snapshot may be fresher and is kept. Nothing is merged
    /// when the tracker was removed or now follows a different position.
    /// Returns true if anything persisted changed.
    pub fn commit(&mut self, next: PositionTracker) -> bool {
        let Some(current) = self.trackers.get_mut(&next.position.symbol) else {
            return false;
        };
        if !current.same_position(&next.position) {
            return false;
        }
        let changed = current.trigger_stop_loss_percent != next.trigger_stop_loss_percent
            || current.max_pnl_percent != next.max_pnl_percent
            || current.used_margin_calls != next.used_margin_calls;
        current.trigger_stop_loss_percent = next.trigger_stop_loss_percent;
        current.max_pnl_percent = next.max_pnl_percent;
        current.used_margin_calls = next.used_margin_calls;
        changed
    }

    /// Hold off further closes for `symbol` until a reconcile has seen the exchange
    pub fn mark_close_pending(&mut self, symbol: &str) {
        if let Some(tracker) = self.trackers.get_mut(symbol) {
            tracker.close_pending = true;
        }
    }

    pub fn remove(&mut self, symbol: &str) -> Option<PositionTracker> {
        self.trackers.remove(symbol)
    }
}
