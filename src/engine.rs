//! Control loop: independent periodic tasks over shared, lock-guarded state.
//!
//! Each task reads the current `Arc<Settings>` snapshot at the start of its
//! tick. A failed tick is logged and the next one runs on schedule.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use crate::api::{CandleSource, ExchangeGateway};
use crate::config::Settings;
use crate::error::BotError;
use crate::execution::{
    AutoCloseReport, CloseOutcome, EntryMonitor, Executor, MonitorAction, OpenOutcome,
    ReconcileReport, RiskContext, TrackerBook,
};
use crate::models::{HighLow, IndicatorReading, OpenRequest, Side};
use crate::notify::Notifier;
use crate::persistence::TrackerStore;
use crate::risk::{CloseReason, ExitKind};
use crate::strategy::{reading_or_sentinel, IndicatorStrategy, Strategy};
use crate::Result;

/// State shared between the periodic tasks
#[derive(Debug, Default)]
pub struct EngineState {
    pub book: Mutex<TrackerBook>,
    pub monitor: Mutex<EntryMonitor>,
    pub reading: RwLock<IndicatorReading>,
    pub high_low: RwLock<Option<HighLow>>,
    pub balance: RwLock<Option<f64>>,
}

pub struct ControlLoop {
    executor: Executor,
    candles: Arc<dyn CandleSource>,
    store: Arc<dyn TrackerStore>,
    settings: watch::Receiver<Arc<Settings>>,
    price: watch::Receiver<Option<f64>>,
    state: EngineState,
}

fn log_tick_error(task: &str, err: &BotError) {
    if err.is_auth() {
        tracing::error!("{} tick failed, credentials rejected: {}", task, err);
    } else if err.is_transient() {
        tracing::warn!("{} tick failed, retrying next tick: {}", task, err);
    } else {
        tracing::warn!("{} tick failed: {}", task, err);
    }
}

impl ControlLoop {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        candles: Arc<dyn CandleSource>,
        store: Arc<dyn TrackerStore>,
        settings: watch::Receiver<Arc<Settings>>,
        price: watch::Receiver<Option<f64>>,
        notifier: Notifier,
    ) -> Self {
        Self {
            executor: Executor::new(gateway, notifier),
            candles,
            store,
            settings,
            price,
            state: EngineState::default(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.borrow().clone()
    }

    pub fn last_price(&self) -> Option<f64> {
        *self.price.borrow()
    }

    fn gateway(&self) -> &Arc<dyn ExchangeGateway> {
        self.executor.gateway()
    }

    /// Load persisted trackers; returns how many were restored
    pub async fn restore(&self) -> Result<usize> {
        let book = self.store.load().await?;
        let count = book.len();
        *self.state.book.lock().await = book;
        Ok(count)
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = self.state.book.lock().await.clone();
        self.store.save(&snapshot).await
    }

    /// Positions poll: normalize, reconcile, then drive the empty-book debounce
    pub async fn poll_positions(&self) -> Result<ReconcileReport> {
        let settings = self.settings();
        let positions = self.gateway().list_open_positions().await?;

        let report = self.state.book.lock().await.reconcile(
            &positions,
            settings.trading.default_stop_loss,
            settings.trading.fee_rate_per_side,
        );
        if report.changed() {
            self.persist().await?;
        }

        let action = self.state.monitor.lock().await.observe_book(
            positions.is_empty(),
            settings.trading.auto_open,
            &settings.entry,
        );
        match action {
            MonitorAction::Started => tracing::info!("👀 Book flat, watching for an entry signal"),
            MonitorAction::Cancelled => tracing::info!("Position appeared, entry monitoring cancelled"),
            _ => {}
        }

        Ok(report)
    }

    /// One risk pass over the current tracker set
    pub async fn auto_close_tick(&self) -> Result<AutoCloseReport> {
        let settings = self.settings();
        let ctx = RiskContext {
            trading: &settings.trading,
            trailing: &settings.trailing,
            last_price: self.last_price(),
        };
        let report = self.executor.auto_close(&self.state.book, ctx).await;
        if report.book_changed {
            self.persist().await?;
        }
        Ok(report)
    }

    /// Recompute the indicator reading; failures become sentinel readings
    pub async fn indicators_tick(&self) -> IndicatorReading {
        let settings = self.settings();
        let strategy = IndicatorStrategy::new(settings.indicators.clone());
        let candles = self
            .candles
            .get_candles(
                &settings.trading.candle_symbol,
                settings.indicators.granularity,
                settings.indicators.fetch_limit(),
            )
            .await;
        let reading = reading_or_sentinel(candles, &strategy);
        tracing::debug!(
            strategy = strategy.name(),
            "SMA {} | RSI {} | Volume {} | HL {} -> {}",
            reading.labels.sma,
            reading.labels.rsi,
            reading.labels.volume,
            reading.labels.high_low,
            reading.decision
        );
        *self.state.reading.write().await = reading.clone();
        reading
    }

    pub async fn high_low_tick(&self) -> Result<HighLow> {
        let settings = self.settings();
        let range = self
            .gateway()
            .get_high_low(&settings.trading.symbol, settings.schedule.high_low_window_minutes)
            .await?;
        *self.state.high_low.write().await = Some(range);
        Ok(range)
    }

    pub async fn balance_tick(&self) -> Result<f64> {
        let balance = self.gateway().get_balance().await?;
        *self.state.balance.write().await = Some(balance);
        tracing::debug!("Balance {:.2}", balance);
        Ok(balance)
    }

    /// Feed the entry monitor and open a position when it confirms
    pub async fn signal_check_tick(&self, now: Instant) -> Result<MonitorAction> {
        let settings = self.settings();
        let decision = self.state.reading.read().await.decision;
        let action = self.state.monitor.lock().await.on_tick(
            now,
            decision,
            self.last_price(),
            settings.trading.trade_direction,
            &settings.entry,
        );

        match action {
            MonitorAction::Confirming {
                signal,
                snapshot_price,
            } => tracing::info!(
                "Signal {} at {:.4}, confirming for {}s",
                signal,
                snapshot_price,
                settings.entry.confirmation_secs
            ),
            MonitorAction::Discarded { signal } => {
                tracing::info!("Price did not confirm {} signal, back to idle", signal)
            }
            MonitorAction::Open(side) => {
                let outcome = self.open(&settings, side, None, "confirmed entry signal").await;
                if outcome.opened {
                    self.persist().await?;
                }
            }
            _ => {}
        }
        Ok(action)
    }

    async fn open(&self, settings: &Settings, side: Side, size: Option<f64>, reason: &str) -> OpenOutcome {
        let request = OpenRequest {
            symbol: settings.trading.symbol.clone(),
            side,
            size: size.unwrap_or(settings.trading.order_size),
            leverage: settings.trading.leverage,
        };
        self.executor
            .open(&self.state.book, &request, settings.trading.default_stop_loss, reason)
            .await
    }

    /// Operator-initiated open; cancels any entry monitoring in progress
    pub async fn manual_open(&self, side: Side, size: Option<f64>) -> Result<OpenOutcome> {
        let settings = self.settings();
        if self.state.monitor.lock().await.cancel() {
            tracing::info!("Entry monitoring cancelled by manual order");
        }
        let outcome = self.open(&settings, side, size, "manual").await;
        if outcome.opened {
            self.persist().await?;
        }
        Ok(outcome)
    }

    /// Operator-initiated close of one symbol
    pub async fn manual_close(&self, symbol: &str) -> Result<CloseOutcome> {
        let settings = self.settings();
        let positions = self.gateway().list_open_positions().await?;
        let position = positions
            .iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol))
            .ok_or_else(|| BotError::InvariantViolation(format!("no open position for {}", symbol)))?;

        let pnl = position.pnl_percent(settings.trading.fee_rate_per_side);
        let outcome = self
            .executor
            .close(position, CloseReason::Manual, pnl.map(ExitKind::from_pnl), pnl)
            .await;
        if outcome.closed {
            self.state.book.lock().await.remove(&position.symbol);
            self.persist().await?;
        } else {
            self.state.book.lock().await.mark_close_pending(&position.symbol);
        }
        Ok(outcome)
    }

    fn spawn_periodic<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        task: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let engine = Arc::clone(self);
        let period = period.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now(), period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task(Arc::clone(&engine)).await {
                            log_tick_error(name, &e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("{} loop stopped", name);
        })
    }

    /// Spawn every periodic task and wait for shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let settings = self.settings();
        let schedule = &settings.schedule;
        let secs = Duration::from_secs;

        tracing::info!("🔄 Spawning control loop tasks");
        let tasks = vec![
            self.spawn_periodic("positions", secs(schedule.positions_secs), shutdown.clone(), |e| async move {
                e.poll_positions().await.map(|_| ())
            }),
            self.spawn_periodic("auto_close", secs(schedule.auto_close_secs), shutdown.clone(), |e| async move {
                e.auto_close_tick().await.map(|_| ())
            }),
            self.spawn_periodic("indicators", secs(schedule.indicators_secs), shutdown.clone(), |e| async move {
                e.indicators_tick().await;
                Ok(())
            }),
            self.spawn_periodic("signal_check", secs(settings.entry.signal_check_secs), shutdown.clone(), |e| async move {
                e.signal_check_tick(Instant::now()).await.map(|_| ())
            }),
            self.spawn_periodic("high_low", secs(schedule.high_low_secs), shutdown.clone(), |e| async move {
                e.high_low_tick().await.map(|_| ())
            }),
            self.spawn_periodic("balance", secs(schedule.balance_secs), shutdown.clone(), |e| async move {
                e.balance_tick().await.map(|_| ())
            }),
        ];

        if !*shutdown.borrow() {
            let _ = shutdown.changed().await;
        }
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Control loop task panicked: {}", e);
            }
        }
        if let Err(e) = self.persist().await {
            tracing::warn!("Final tracker save failed: {}", e);
        }
        tracing::info!("Control loop stopped");
    }
}
