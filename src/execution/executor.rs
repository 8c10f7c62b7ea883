use std::sync::Arc;
use tokio::sync::Mutex;

use crate::api::ExchangeGateway;
use crate::error::BotError;
use crate::execution::position_tracker::{RiskContext, RiskDecision, TrackerBook};
use crate::models::{OpenRequest, Position, PositionDetails};
use crate::notify::{Notifier, TradeKind};
use crate::risk::{CloseReason, ExitKind};

/// Result of one close attempt; `closed == false` means the tracker was left as is
#[derive(Debug, Clone, PartialEq)]
pub struct CloseOutcome {
    pub symbol: String,
    pub closed: bool,
    pub reason: CloseReason,
    pub kind: Option<ExitKind>,
    pub pnl_percent: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOutcome {
    pub opened: bool,
    pub details: Option<PositionDetails>,
    pub error: Option<String>,
}

/// Everything one auto-close pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoCloseReport {
    pub closes: Vec<CloseOutcome>,
    pub suppressed: Vec<String>,
    /// A trigger, water mark or membership changed and should be persisted
    pub book_changed: bool,
}

fn log_action_error(action: &str, symbol: &str, err: &BotError) {
    if err.is_auth() {
        tracing::error!(symbol = %symbol, "{} failed, check credentials: {}", action, err);
    } else {
        tracing::warn!(symbol = %symbol, "{} failed, will re-check next tick: {}", action, err);
    }
}

/// Turns risk and entry decisions into gateway calls
#[derive(Clone)]
pub struct Executor {
    gateway: Arc<dyn ExchangeGateway>,
    notifier: Notifier,
}

impl Executor {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, notifier: Notifier) -> Self {
        Self { gateway, notifier }
    }

    pub fn gateway(&self) -> &Arc<dyn ExchangeGateway> {
        &self.gateway
    }

    /// Evaluate every tracker and close the ones whose exit fired.
    ///
    /// Works on a snapshot so no lock is held across gateway calls. Held
    /// trackers get their new risk state merged in. A failed close leaves
    /// the risk state untouched but marks the tracker pending: the order may
    /// have filled, so nothing is resent until a positions poll has seen it.
    pub async fn auto_close(&self, book: &Mutex<TrackerBook>, ctx: RiskContext<'_>) -> AutoCloseReport {
        let snapshot: Vec<_> = book.lock().await.iter().cloned().collect();
        let mut report = AutoCloseReport::default();

        for tracker in snapshot {
            let evaluation = tracker.evaluate(&ctx);
            match evaluation.decision {
                RiskDecision::Skip => {}
                RiskDecision::AwaitingPoll => {
                    tracing::debug!(symbol = %tracker.symbol(), "Close outcome unknown, waiting for positions poll");
                }
                RiskDecision::Hold => {
                    report.book_changed |= book.lock().await.commit(evaluation.next);
                }
                RiskDecision::Suppressed { .. } => {
                    report.suppressed.push(tracker.symbol().to_string());
                    report.book_changed |= book.lock().await.commit(evaluation.next);
                }
                RiskDecision::Close { reason, kind } => {
                    tracing::info!(
                        symbol = %tracker.symbol(),
                        pnl_pct = ?evaluation.pnl_percent,
                        trigger = evaluation.next.trigger_stop_loss_percent,
                        "{} hit, closing ({:?})",
                        reason,
                        kind
                    );
                    let outcome = self
                        .close(&evaluation.next.position, reason, Some(kind), evaluation.pnl_percent)
                        .await;
                    if outcome.closed {
                        book.lock().await.remove(&outcome.symbol);
                        report.book_changed = true;
                    } else {
                        book.lock().await.mark_close_pending(&outcome.symbol);
                    }
                    report.closes.push(outcome);
                }
            }
        }

        report
    }

    /// Close one position through the gateway and announce it
    pub async fn close(
        &self,
        position: &Position,
        reason: CloseReason,
        kind: Option<ExitKind>,
        pnl_percent: Option<f64>,
    ) -> CloseOutcome {
        let mut outcome = CloseOutcome {
            symbol: position.symbol.clone(),
            closed: false,
            reason,
            kind,
            pnl_percent,
            error: None,
        };

        match self.gateway.close_market_position(position).await {
            Ok(ack) => {
                tracing::info!(
                    symbol = %position.symbol,
                    order_id = ?ack.order_id,
                    "✅ Closed {} position ({})",
                    position.side,
                    reason
                );
                self.notifier
                    .trade(TradeKind::Closed, &position.symbol, position.side, pnl_percent, reason.to_string());
                outcome.closed = true;
            }
            Err(e) => {
                log_action_error("Close", &position.symbol, &e);
                outcome.error = Some(e.to_string());
            }
        }
        outcome
    }

    /// Open a market position and seed its tracker
    pub async fn open(
        &self,
        book: &Mutex<TrackerBook>,
        request: &OpenRequest,
        default_stop_loss: f64,
        reason: &str,
    ) -> OpenOutcome {
        if book.lock().await.contains(&request.symbol) {
            let err = BotError::InvariantViolation(format!("{} is already tracked", request.symbol));
            tracing::warn!(symbol = %request.symbol, "Open skipped: {}", err);
            return OpenOutcome {
                opened: false,
                details: None,
                error: Some(err.to_string()),
            };
        }

        match self.gateway.open_market_position(request).await {
            Ok(details) => {
                tracing::info!(
                    symbol = %details.symbol,
                    entry = ?details.entry_price,
                    "✅ Opened {} {} x{} ({})",
                    details.side,
                    details.size,
                    details.leverage,
                    reason
                );
                if let Err(e) = book.lock().await.insert_opened(&details, default_stop_loss) {
                    // A poll reconciled the new position first; its tracker stands
                    tracing::warn!(symbol = %details.symbol, "{}", e);
                }
                self.notifier
                    .trade(TradeKind::Opened, &details.symbol, details.side, None, reason);
                OpenOutcome {
                    opened: true,
                    details: Some(details),
                    error: None,
                }
            }
            Err(e) => {
                log_action_error("Open", &request.symbol, &e);
                OpenOutcome {
                    opened: false,
                    details: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
