//! Metrics sink consumed by the ledger, sweeper and webhook reconciler.
//!
//! Counters: `webhook_received{type}`, `webhook_ok{type}`, `webhook_failed{type}`,
//! `webhook_duplicate{type}`, `tokens_released`, `reservation_released`.
//! Gauges: `balance_available{user_id}`, `balance_reserved{user_id}`, `sweeper_backlog`.

use anyhow::Result;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Destination for ledger and webhook metrics.
pub trait MetricsSink: Send + Sync {
    fn webhook_received(&self, event_type: &str);
    fn webhook_ok(&self, event_type: &str);
    fn webhook_failed(&self, event_type: &str);
    fn webhook_duplicate(&self, event_type: &str);
    fn tokens_released(&self, tokens: i64);
    fn reservation_released(&self);
    fn balance(&self, user_id: &str, available: i64, reserved: i64);
    fn sweeper_backlog(&self, expired: usize);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn webhook_received(&self, _event_type: &str) {}
    fn webhook_ok(&self, _event_type: &str) {}
    fn webhook_failed(&self, _event_type: &str) {}
    fn webhook_duplicate(&self, _event_type: &str) {}
    fn tokens_released(&self, _tokens: i64) {}
    fn reservation_released(&self) {}
    fn balance(&self, _user_id: &str, _available: i64, _reserved: i64) {}
    fn sweeper_backlog(&self, _expired: usize) {}
}

/// Prometheus-backed sink with its own registry.
pub struct PrometheusMetrics {
    registry: Registry,
    pub webhook_received: IntCounterVec,
    pub webhook_ok: IntCounterVec,
    pub webhook_failed: IntCounterVec,
    pub webhook_duplicate: IntCounterVec,
    pub tokens_released: IntCounter,
    pub reservation_released: IntCounter,
    pub balance_available: IntGaugeVec,
    pub balance_reserved: IntGaugeVec,
    pub sweeper_backlog: IntGauge,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let webhook_counter = |name: &str, help: &str| -> Result<IntCounterVec> {
            let counter = IntCounterVec::new(Opts::new(name, help), &["type"])?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let webhook_received = webhook_counter("webhook_received", "Verified webhook deliveries")?;
        let webhook_ok = webhook_counter("webhook_ok", "Webhook events processed successfully")?;
        let webhook_failed = webhook_counter("webhook_failed", "Webhook events whose handler failed")?;
        let webhook_duplicate =
            webhook_counter("webhook_duplicate", "Webhook events already processed")?;

        let tokens_released =
            IntCounter::new("tokens_released", "Tokens returned by the expiry sweeper")?;
        registry.register(Box::new(tokens_released.clone()))?;
        let reservation_released =
            IntCounter::new("reservation_released", "Reservations released by the expiry sweeper")?;
        registry.register(Box::new(reservation_released.clone()))?;

        let balance_available = IntGaugeVec::new(
            Opts::new("balance_available", "Available tokens after the last sweep update"),
            &["user_id"],
        )?;
        registry.register(Box::new(balance_available.clone()))?;
        let balance_reserved = IntGaugeVec::new(
            Opts::new("balance_reserved", "Reserved tokens after the last sweep update"),
            &["user_id"],
        )?;
        registry.register(Box::new(balance_reserved.clone()))?;

        let sweeper_backlog =
            IntGauge::new("sweeper_backlog", "Expired reservations found by the last sweep")?;
        registry.register(Box::new(sweeper_backlog.clone()))?;

        Ok(Self {
            registry,
            webhook_received,
            webhook_ok,
            webhook_failed,
            webhook_duplicate,
            tokens_released,
            reservation_released,
            balance_available,
            balance_reserved,
            sweeper_backlog,
        })
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let families = self.registry.gather();
        Ok(TextEncoder::new().encode_to_string(&families)?)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn webhook_received(&self, event_type: &str) {
        self.webhook_received.with_label_values(&[event_type]).inc();
    }

    fn webhook_ok(&self, event_type: &str) {
        self.webhook_ok.with_label_values(&[event_type]).inc();
    }

    fn webhook_failed(&self, event_type: &str) {
        self.webhook_failed.with_label_values(&[event_type]).inc();
    }

    fn webhook_duplicate(&self, event_type: &str) {
        self.webhook_duplicate.with_label_values(&[event_type]).inc();
    }

    fn tokens_released(&self, tokens: i64) {
        self.tokens_released.inc_by(u64::try_from(tokens).unwrap_or(0));
    }

    fn reservation_released(&self) {
        self.reservation_released.inc();
    }

    fn balance(&self, user_id: &str, available: i64, reserved: i64) {
        self.balance_available
            .with_label_values(&[user_id])
            .set(available);
        self.balance_reserved.with_label_values(&[user_id]).set(reserved);
    }

    fn sweeper_backlog(&self, expired: usize) {
        self.sweeper_backlog
            .set(i64::try_from(expired).unwrap_or(i64::MAX));
    }
}
