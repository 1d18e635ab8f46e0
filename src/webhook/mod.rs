//! Payment-provider webhook reconciliation.
//!
//! Turns signed, at-least-once, possibly out-of-order provider events into
//! idempotent ledger mutations:
//! 1. Verify the signature over the byte-exact body (no metrics on rejection)
//! 2. Skip events already recorded in `processed_payment_events`
//! 3. Route by event type and run the family handler
//! 4. Record the event as processed once its handler succeeds

pub mod event;
pub mod extract;
pub mod handlers;
pub mod provider;
pub mod signature;
pub mod subscription;

pub use event::{EventKind, WebhookEvent};
pub use provider::{PaymentProvider, ProviderError};
pub use subscription::{
    CreditOutcome, LedgerSubscriptionCredits, SubscriptionCredits, SubscriptionInvoice,
};

use chrono::Utc;
use std::sync::Arc;

use crate::billing::{LedgerError, PaymentEventStore, TokenLedger};
use crate::config::Config;
use crate::observability::MetricsSink;
use extract::Payload;

/// Result reported back to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Handled (or a failure notification whose error was swallowed).
    Ok,
    /// Event type not handled here.
    Ignored,
    /// Event id already processed; nothing was done.
    Duplicate,
}

pub struct WebhookReconciler {
    config: Config,
    ledger: Arc<TokenLedger>,
    payments: Arc<PaymentEventStore>,
    provider: Arc<dyn PaymentProvider>,
    subscriptions: Arc<dyn SubscriptionCredits>,
    metrics: Arc<dyn MetricsSink>,
}

impl WebhookReconciler {
    pub fn new(
        config: &Config,
        ledger: Arc<TokenLedger>,
        payments: Arc<PaymentEventStore>,
        provider: Arc<dyn PaymentProvider>,
        subscriptions: Arc<dyn SubscriptionCredits>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config: config.clone(),
            ledger,
            payments,
            provider,
            subscriptions,
            metrics,
        }
    }

    /// Verify and apply one delivery.
    pub fn process(&self, raw: &[u8], signature_header: &str) -> Result<WebhookOutcome, LedgerError> {
        let secret = self
            .config
            .webhook
            .signing_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(LedgerError::InvalidSignature("secret not configured"))?;

        if let Err(e) = signature::verify(
            secret,
            raw,
            signature_header,
            self.config.webhook.tolerance_secs,
            Utc::now().timestamp(),
        ) {
            tracing::warn!("Webhook signature verification failed: {e}");
            return Err(e);
        }

        let event = WebhookEvent::parse(raw)?;
        let event_type = event.event_type.as_str();
        self.metrics.webhook_received(event_type);

        if self.payments.is_processed(&event.id)? {
            tracing::debug!(event_id = %event.id, event_type, "Duplicate webhook delivery");
            self.metrics.webhook_duplicate(event_type);
            return Ok(WebhookOutcome::Duplicate);
        }

        let kind = event.kind();
        if kind == EventKind::Unknown {
            tracing::debug!(event_id = %event.id, event_type, "Ignoring unhandled event type");
            self.metrics.webhook_ok(event_type);
            return Ok(WebhookOutcome::Ignored);
        }

        let payload = Payload::new(&event, raw);
        match self.dispatch(kind, &payload) {
            Ok(()) => {
                self.payments.mark_processed(&event.id)?;
                self.metrics.webhook_ok(event_type);
                Ok(WebhookOutcome::Ok)
            }
            Err(e) if kind.swallows_failures() => {
                self.metrics.webhook_failed(event_type);
                tracing::warn!(event_id = %event.id, event_type, "Webhook handler failed, not retrying: {e}");
                Ok(WebhookOutcome::Ok)
            }
            Err(e) => {
                self.metrics.webhook_failed(event_type);
                if matches!(e, LedgerError::InvariantViolation(_)) {
                    tracing::error!(event_id = %event.id, event_type, "Webhook handler hit invariant violation: {e}");
                } else {
                    tracing::warn!(event_id = %event.id, event_type, "Webhook handler failed: {e}");
                }
                Err(e)
            }
        }
    }

    fn dispatch(&self, kind: EventKind, payload: &Payload<'_>) -> Result<(), LedgerError> {
        match kind {
            EventKind::CheckoutCompleted => self.handle_checkout_success(payload, false),
            EventKind::AsyncPaymentSucceeded => self.handle_checkout_success(payload, true),
            EventKind::AsyncPaymentFailed => self.handle_async_payment_failed(payload),
            EventKind::PaymentIntentSucceeded => self.handle_intent_succeeded(payload),
            EventKind::PaymentIntentFailed => self.handle_intent_failed(payload),
            EventKind::RefundCreated => self.handle_refund_created(payload),
            EventKind::RefundUpdated => self.handle_refund_updated(payload),
            EventKind::DisputeCreated => self.handle_dispute_created(payload),
            EventKind::DisputeFundsWithdrawn => self.handle_dispute_funds_withdrawn(payload),
            EventKind::DisputeClosed => self.handle_dispute_closed(payload),
            EventKind::InvoicePaymentSucceeded => self.handle_invoice(payload, true),
            EventKind::InvoicePaymentFailed => self.handle_invoice(payload, false),
            EventKind::Unknown => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;
