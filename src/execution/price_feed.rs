use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::config::{AlertSettings, ExchangeKind};
use crate::notify::{AlertDirection, BotEvent, Notifier, PriceAlert};
use crate::Result;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Bybit drops idle public connections after ~30s without a ping
const BYBIT_PING_INTERVAL: Duration = Duration::from_secs(20);
/// Default alert band around the first observed price
const DEFAULT_ALERT_BAND: f64 = 0.01;

/// Public ticker stream flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedVenue {
    Bybit,
    Binance,
}

impl From<ExchangeKind> for FeedVenue {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Bybit => FeedVenue::Bybit,
            ExchangeKind::BinanceMargin => FeedVenue::Binance,
        }
    }
}

impl FeedVenue {
    pub fn url(&self, symbol: &str, testnet: bool) -> String {
        match (self, testnet) {
            (FeedVenue::Bybit, false) => "wss://stream.bybit.com/v5/public/linear".to_string(),
            (FeedVenue::Bybit, true) => "wss://stream-testnet.bybit.com/v5/public/linear".to_string(),
            (FeedVenue::Binance, false) => format!(
                "wss://stream.binance.com:9443/ws/{}@ticker",
                symbol.to_lowercase()
            ),
            (FeedVenue::Binance, true) => format!(
                "wss://testnet.binance.vision/ws/{}@ticker",
                symbol.to_lowercase()
            ),
        }
    }

    /// Subscription frame; Binance subscribes through the URL
    fn subscribe(&self, symbol: &str) -> Option<String> {
        match self {
            FeedVenue::Bybit => Some(
                json!({"op": "subscribe", "args": [format!("tickers.{}", symbol.to_uppercase())]})
                    .to_string(),
            ),
            FeedVenue::Binance => None,
        }
    }

    fn unsubscribe(&self, symbol: &str) -> String {
        match self {
            FeedVenue::Bybit => {
                json!({"op": "unsubscribe", "args": [format!("tickers.{}", symbol.to_uppercase())]})
                    .to_string()
            }
            FeedVenue::Binance => json!({
                "method": "UNSUBSCRIBE",
                "params": [format!("{}@ticker", symbol.to_lowercase())],
                "id": 1
            })
            .to_string(),
        }
    }

    /// Last traded price from one text frame, if it carries one
    pub fn parse_price(&self, text: &str) -> Option<f64> {
        let value: Value = serde_json::from_str(text).ok()?;
        let raw = match self {
            FeedVenue::Bybit => {
                if !value["topic"].as_str()?.starts_with("tickers.") {
                    return None;
                }
                // Deltas omit unchanged fields
                value["data"]["lastPrice"].as_str()?
            }
            FeedVenue::Binance => {
                if value["e"] != "24hrTicker" {
                    return None;
                }
                value["c"].as_str()?
            }
        };
        raw.parse::<f64>().ok().filter(|p| *p > 0.0)
    }
}

/// Edge-triggered above/below price alerts
#[derive(Debug, Clone, PartialEq)]
pub struct PriceAlerts {
    above: Option<f64>,
    below: Option<f64>,
    above_fired: bool,
    below_fired: bool,
    seeded: bool,
}

impl PriceAlerts {
    /// Zero thresholds are unset and get seeded from the first price
    pub fn new(settings: &AlertSettings) -> Self {
        Self {
            above: (settings.price_above > 0.0).then_some(settings.price_above),
            below: (settings.price_below > 0.0).then_some(settings.price_below),
            above_fired: false,
            below_fired: false,
            seeded: false,
        }
    }

    pub fn thresholds(&self) -> (Option<f64>, Option<f64>) {
        (self.above, self.below)
    }

    /// Alerts crossed by this price; each fires once until price comes back
    pub fn check(&mut self, price: f64) -> Vec<(AlertDirection, f64)> {
        if !self.seeded {
            self.above.get_or_insert(price * (1.0 + DEFAULT_ALERT_BAND));
            self.below.get_or_insert(price * (1.0 - DEFAULT_ALERT_BAND));
            self.seeded = true;
        }

        let mut fired = Vec::new();
        if let Some(above) = self.above {
            if price >= above {
                if !self.above_fired {
                    self.above_fired = true;
                    fired.push((AlertDirection::Above, above));
                }
            } else {
                self.above_fired = false;
            }
        }
        if let Some(below) = self.below {
            if price <= below {
                if !self.below_fired {
                    self.below_fired = true;
                    fired.push((AlertDirection::Below, below));
                }
            } else {
                self.below_fired = false;
            }
        }
        fired
    }
}

enum StreamEnd {
    Shutdown,
}

/// One background stream per symbol publishing the last price into a watch cell
pub struct PriceFeed {
    venue: FeedVenue,
    symbol: String,
    url: String,
    price_tx: watch::Sender<Option<f64>>,
    alerts: PriceAlerts,
    notifier: Notifier,
}

impl PriceFeed {
    pub fn new(
        venue: FeedVenue,
        symbol: &str,
        testnet: bool,
        alerts: &AlertSettings,
        notifier: Notifier,
    ) -> (Self, watch::Receiver<Option<f64>>) {
        let (price_tx, price_rx) = watch::channel(None);
        let feed = Self {
            venue,
            symbol: symbol.to_uppercase(),
            url: venue.url(symbol, testnet),
            price_tx,
            alerts: PriceAlerts::new(alerts),
            notifier,
        };
        (feed, price_rx)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Stream until `shutdown` flips to true, reconnecting on any failure
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.connect_and_stream(&mut shutdown).await {
                Ok(StreamEnd::Shutdown) => break,
                Err(e) => {
                    tracing::warn!(
                        symbol = %self.symbol,
                        "Price stream error: {}, reconnecting in {:?}",
                        e,
                        RECONNECT_DELAY
                    );
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(symbol = %self.symbol, "Price stream stopped");
    }

    async fn connect_and_stream(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<StreamEnd> {
        tracing::info!(symbol = %self.symbol, "Connecting price stream: {}", self.url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        if let Some(subscribe) = self.venue.subscribe(&self.symbol) {
            write.send(Message::Text(subscribe)).await?;
        }

        let mut ping = interval(BYBIT_PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        return Err(crate::error::BotError::UpstreamUnavailable(format!(
                            "stream closed: {}",
                            reason
                        )));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(crate::error::BotError::UpstreamUnavailable(
                            "stream ended".to_string(),
                        ))
                    }
                },
                _ = ping.tick(), if self.venue == FeedVenue::Bybit => {
                    write.send(Message::Text(json!({"op": "ping"}).to_string())).await?;
                }
                _ = shutdown.changed() => {
                    if let Err(e) = write.send(Message::Text(self.venue.unsubscribe(&self.symbol))).await {
                        tracing::debug!("Unsubscribe failed: {}", e);
                    }
                    if let Err(e) = write.send(Message::Close(None)).await {
                        tracing::debug!("Close frame failed: {}", e);
                    }
                    return Ok(StreamEnd::Shutdown);
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        let Some(price) = self.venue.parse_price(text) else {
            return;
        };
        self.price_tx.send_replace(Some(price));

        for (direction, threshold) in self.alerts.check(price) {
            tracing::info!(symbol = %self.symbol, "Price {} crossed {:?} alert {}", price, direction, threshold);
            self.notifier.emit(BotEvent::PriceAlert(PriceAlert {
                symbol: self.symbol.clone(),
                direction,
                threshold,
                price,
                at: Utc::now(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BYBIT_SNAPSHOT: &str = r#"{"topic":"tickers.BTCUSDT","type":"snapshot","data":{"symbol":"BTCUSDT","lastPrice":"65000.50","markPrice":"65001.00"},"ts":1}"#;
    const BYBIT_DELTA_NO_PRICE: &str = r#"{"topic":"tickers.BTCUSDT","type":"delta","data":{"symbol":"BTCUSDT","markPrice":"65002.00"},"ts":2}"#;
    const BINANCE_TICKER: &str = r#"{"e":"24hrTicker","E":1,"s":"BTCUSDT","c":"64999.99","o":"64000.00"}"#;

    fn alerts(above: f64, below: f64) -> PriceAlerts {
        PriceAlerts::new(&AlertSettings {
            price_above: above,
            price_below: below,
        })
    }

    #[test]
    fn test_parse_bybit_ticker() {
        assert_eq!(FeedVenue::Bybit.parse_price(BYBIT_SNAPSHOT), Some(65000.50));
        assert_eq!(FeedVenue::Bybit.parse_price(BYBIT_DELTA_NO_PRICE), None);
        assert_eq!(FeedVenue::Bybit.parse_price(r#"{"op":"pong","success":true}"#), None);
    }

    #[test]
    fn test_parse_binance_ticker() {
        assert_eq!(FeedVenue::Binance.parse_price(BINANCE_TICKER), Some(64999.99));
        assert_eq!(FeedVenue::Binance.parse_price("not json"), None);
    }

    #[test]
    fn test_urls() {
        assert!(FeedVenue::Binance.url("BTCUSDT", false).ends_with("/ws/btcusdt@ticker"));
        assert!(FeedVenue::Bybit.url("BTCUSDT", true).contains("stream-testnet.bybit.com"));
    }

    #[test]
    fn test_alerts_default_to_one_percent_band() {
        let mut alerts = alerts(0.0, 0.0);
        assert!(alerts.check(100.0).is_empty());
        let (above, below) = alerts.thresholds();
        assert!((above.unwrap() - 101.0).abs() < 1e-9);
        assert!((below.unwrap() - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_alerts_are_edge_triggered() {
        let mut alerts = alerts(110.0, 90.0);
        assert_eq!(alerts.check(111.0), vec![(AlertDirection::Above, 110.0)]);
        assert!(alerts.check(112.0).is_empty());
        // Back under re-arms
        assert!(alerts.check(105.0).is_empty());
        assert_eq!(alerts.check(110.0), vec![(AlertDirection::Above, 110.0)]);
        assert_eq!(alerts.check(89.0), vec![(AlertDirection::Below, 90.0)]);
    }

    #[tokio::test]
    async fn test_handle_text_publishes_and_alerts() {
        let (notifier, mut events) = Notifier::channel();
        let (mut feed, price_rx) = PriceFeed::new(
            FeedVenue::Bybit,
            "BTCUSDT",
            false,
            &AlertSettings {
                price_above: 65000.0,
                price_below: 0.0,
            },
            notifier,
        );

        feed.handle_text(BYBIT_SNAPSHOT);
        assert_eq!(*price_rx.borrow(), Some(65000.50));

        match events.try_recv() {
            Ok(BotEvent::PriceAlert(alert)) => {
                assert_eq!(alert.direction, AlertDirection::Above);
                assert_eq!(alert.threshold, 65000.0);
            }
            other => panic!("expected price alert, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_while_unreachable() {
        let (feed, _rx) = PriceFeed::new(
            FeedVenue::Binance,
            "BTCUSDT",
            false,
            &AlertSettings::default(),
            Notifier::disabled(),
        );
        let feed = feed.with_url("ws://127.0.0.1:1/ws");
        let (tx, shutdown) = watch::channel(false);

        let handle = tokio::spawn(feed.run(shutdown));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("feed did not stop")
            .unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires live network
    async fn test_live_bybit_stream() {
        let (feed, mut rx) = PriceFeed::new(
            FeedVenue::Bybit,
            "BTCUSDT",
            false,
            &AlertSettings::default(),
            Notifier::disabled(),
        );
        let (_tx, shutdown) = watch::channel(false);
        tokio::spawn(feed.run(shutdown));
        tokio::time::timeout(Duration::from_secs(15), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(rx.borrow().unwrap() > 0.0);
    }
}
