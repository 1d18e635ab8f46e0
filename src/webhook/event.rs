//! Webhook event envelope and routing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::provider::{Charge, Expandable, List, PaymentIntent, Price, Subscription};
use crate::billing::LedgerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub livemode: bool,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    /// The object the event is about; shape depends on event type and API version.
    pub object: serde_json::Value,
    #[serde(default)]
    pub previous_attributes: Option<serde_json::Value>,
}

impl WebhookEvent {
    pub fn parse(raw: &[u8]) -> Result<Self, LedgerError> {
        let event: Self = serde_json::from_slice(raw)
            .map_err(|e| LedgerError::MalformedEvent(format!("invalid event JSON: {e}")))?;
        if event.id.trim().is_empty() {
            return Err(LedgerError::MalformedEvent("event id is empty".into()));
        }
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// `data.object` decoded as `T`, or `None` when its shape does not match.
    pub fn object<T: DeserializeOwned>(&self) -> Option<T> {
        match serde_json::from_value(self.data.object.clone()) {
            Ok(object) => Some(object),
            Err(e) => {
                tracing::debug!(
                    event_id = %self.id,
                    event_type = %self.event_type,
                    "Typed decode of event object failed: {e}"
                );
                None
            }
        }
    }
}

/// Event families the reconciler handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    AsyncPaymentSucceeded,
    AsyncPaymentFailed,
    PaymentIntentSucceeded,
    PaymentIntentFailed,
    RefundCreated,
    RefundUpdated,
    DisputeCreated,
    DisputeFundsWithdrawn,
    DisputeClosed,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Unknown,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutCompleted,
            "checkout.session.async_payment_succeeded" => Self::AsyncPaymentSucceeded,
            "checkout.session.async_payment_failed" => Self::AsyncPaymentFailed,
            "payment_intent.succeeded" => Self::PaymentIntentSucceeded,
            "payment_intent.payment_failed" => Self::PaymentIntentFailed,
            "refund.created" | "charge.refund.created" => Self::RefundCreated,
            "refund.updated" | "charge.refund.updated" => Self::RefundUpdated,
            "charge.dispute.created" => Self::DisputeCreated,
            "charge.dispute.funds_withdrawn" => Self::DisputeFundsWithdrawn,
            "charge.dispute.closed" => Self::DisputeClosed,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            _ => Self::Unknown,
        }
    }

    /// Failure notifications where a provider retry cannot help.
    pub fn swallows_failures(self) -> bool {
        matches!(
            self,
            Self::AsyncPaymentFailed | Self::PaymentIntentFailed | Self::DisputeCreated
        )
    }
}

// ── Event-only objects ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    #[serde(default)]
    pub amount: Option<i64>,
    /// `pending`, `succeeded`, `failed` or `canceled`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub charge: Option<Expandable<Charge>>,
    #[serde(default)]
    pub payment_intent: Option<Expandable<PaymentIntent>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    #[serde(default)]
    pub amount: Option<i64>,
    /// `won`, `lost`, `needs_response`, ...
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub charge: Option<Expandable<Charge>>,
    #[serde(default)]
    pub payment_intent: Option<Expandable<PaymentIntent>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub price: Option<Price>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<Expandable<Subscription>>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub lines: Option<List<InvoiceLine>>,
}
