//! Events handed to whatever presents trades and alerts to the operator.
//!
//! The engine never formats output itself; it emits [`BotEvent`]s and
//! a consumer decides what to do with them (the binary just logs them).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Opened,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub kind: TradeKind,
    pub symbol: String,
    pub side: Side,
    pub pnl_percent: Option<f64>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertDirection {
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceAlert {
    pub symbol: String,
    pub direction: AlertDirection,
    pub threshold: f64,
    pub price: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotEvent {
    Trade(TradeEvent),
    PriceAlert(PriceAlert),
}

/// Cheap cloneable handle for emitting events
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<BotEvent>>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BotEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Notifier that drops every event
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: BotEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).is_err() {
            tracing::debug!("Event receiver dropped, event discarded");
        }
    }

    pub fn trade(
        &self,
        kind: TradeKind,
        symbol: &str,
        side: Side,
        pnl_percent: Option<f64>,
        reason: impl Into<String>,
    ) {
        self.emit(BotEvent::Trade(TradeEvent {
            kind,
            symbol: symbol.to_string(),
            side,
            pnl_percent,
            reason: reason.into(),
            at: Utc::now(),
        }));
    }
}

/// Drain events into the log until every sender is gone
pub async fn log_events(mut rx: mpsc::UnboundedReceiver<BotEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            BotEvent::Trade(trade) => tracing::info!(
                symbol = %trade.symbol,
                side = %trade.side,
                pnl_pct = ?trade.pnl_percent,
                "📣 {:?}: {}",
                trade.kind,
                trade.reason
            ),
            BotEvent::PriceAlert(alert) => tracing::info!(
                symbol = %alert.symbol,
                "🔔 Price {:.4} crossed {:?} {:.4}",
                alert.price,
                alert.direction,
                alert.threshold
            ),
        }
    }
}
