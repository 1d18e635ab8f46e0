//! Per-family event handlers.
//!
//! Every handler checks current state before acting and treats state that
//! already moved past the event as a no-op. Ledger credits carry idempotency
//! keys derived from the provider object they answer, so a replayed handler
//! never credits twice.

use serde_json::json;

use super::event::{Dispute, Invoice, Refund};
use super::extract::{JsonPath, Payload};
use super::provider::{CheckoutSession, Expandable, Subscription};
use super::subscription::{credit_key, CreditOutcome, SubscriptionInvoice};
use super::WebhookReconciler;
use crate::billing::{Credit, LedgerError, Payment, PaymentStatus, TransactionSource};
use crate::config::TokenPack;

const OBJECT_ID: &[JsonPath<'static>] = &[&["data", "object", "id"]];
const OBJECT_STATUS: &[JsonPath<'static>] = &[&["data", "object", "status"]];
const OBJECT_AMOUNT: &[JsonPath<'static>] = &[&["data", "object", "amount"]];
const OBJECT_CHARGE: &[JsonPath<'static>] = &[&["data", "object", "charge"]];
const OBJECT_PAYMENT_INTENT: &[JsonPath<'static>] = &[&["data", "object", "payment_intent"]];
const INVOICE_SUBSCRIPTION: &[JsonPath<'static>] = &[
    &["data", "object", "subscription"],
    &["data", "object", "parent", "subscription_details", "subscription"],
];
const INVOICE_PRICE: &[JsonPath<'static>] = &[
    &["data", "object", "lines", "data", "0", "price", "id"],
    &["data", "object", "lines", "data", "0", "pricing", "price_details", "price"],
];
const INVOICE_AMOUNT_PAID: &[JsonPath<'static>] = &[&["data", "object", "amount_paid"]];

/// Session fields inlined when retrieving a checkout session.
const SESSION_EXPAND: &[&str] = &["line_items", "payment_intent"];

/// Metadata key naming the user on sessions, subscriptions and customers.
const USER_ID_KEY: &str = "userId";
/// Metadata key naming the token pack on checkout sessions.
const PACK_ID_KEY: &str = "packId";

impl WebhookReconciler {
    // ── Checkout ─────────────────────────────────────────────────

    /// Record the payment and credit the pack's tokens once funds are captured.
    pub(super) fn handle_checkout_success(
        &self,
        payload: &Payload<'_>,
        async_success: bool,
    ) -> Result<(), LedgerError> {
        let event = payload.event();
        let typed: Option<CheckoutSession> = event.object();
        let session_id = payload
            .id("session id", typed.map(|s| s.id), OBJECT_ID)
            .ok_or_else(|| LedgerError::MalformedEvent("checkout session id missing".into()))?;

        let session = self.provider.retrieve_session(&session_id, SESSION_EXPAND)?;
        let user_id = resolve_checkout_user(&session)?;
        let pack = self.resolve_pack(&session)?;
        let intent_id = payload.id(
            "payment intent",
            session.payment_intent.as_ref().map(|pi| pi.id().to_string()),
            OBJECT_PAYMENT_INTENT,
        );

        let status = if async_success || session.is_paid() {
            PaymentStatus::Succeeded
        } else {
            PaymentStatus::Pending
        };
        let mut payment = Payment::for_session(
            &user_id,
            &session.id,
            pack.amount_cents,
            pack.tokens,
            status,
        );
        payment.pack_id = Some(pack.id.clone());
        payment.provider_payment_intent_id = intent_id.clone();

        let stored = self.payments.upsert_checkout(&payment)?;
        if let (Some(intent_id), None) = (intent_id.as_deref(), &stored.provider_payment_intent_id) {
            self.payments.set_intent(&stored.id, intent_id)?;
        }

        match stored.status {
            PaymentStatus::Succeeded => self.credit_payment(&stored, &event.id),
            PaymentStatus::Pending => {
                tracing::info!(
                    payment_id = %stored.id,
                    session_id = %stored.provider_session_id,
                    "Checkout completed, awaiting asynchronous payment"
                );
                Ok(())
            }
            PaymentStatus::Failed => Err(LedgerError::InvariantViolation(format!(
                "payment {} is FAILED after checkout success",
                stored.id
            ))),
        }
    }

    pub(super) fn handle_async_payment_failed(&self, payload: &Payload<'_>) -> Result<(), LedgerError> {
        let typed: Option<CheckoutSession> = payload.event().object();
        let session_id = payload
            .id("session id", typed.map(|s| s.id), OBJECT_ID)
            .ok_or_else(|| LedgerError::MalformedEvent("checkout session id missing".into()))?;

        match self.payments.find_by_session(&session_id)? {
            Some(payment) => self.fail_payment(&payment),
            None => {
                tracing::info!(%session_id, "Async payment failed for unrecorded session");
                Ok(())
            }
        }
    }

    // ── Payment intents ──────────────────────────────────────────

    pub(super) fn handle_intent_succeeded(&self, payload: &Payload<'_>) -> Result<(), LedgerError> {
        let intent_id = payload
            .id("payment intent id", None, OBJECT_ID)
            .ok_or_else(|| LedgerError::MalformedEvent("payment intent id missing".into()))?;

        let Some(payment) = self.payments.find_by_intent(&intent_id)? else {
            tracing::debug!(%intent_id, "No payment recorded for intent yet");
            return Ok(());
        };

        match payment.status {
            PaymentStatus::Pending => {
                self.payments.mark_status(&payment.id, PaymentStatus::Succeeded)?;
                let current = self.payments.get(&payment.id)?.ok_or_else(|| {
                    LedgerError::InvariantViolation(format!("payment {} vanished", payment.id))
                })?;
                if current.status == PaymentStatus::Succeeded {
                    self.credit_payment(&current, &payload.event().id)?;
                }
                Ok(())
            }
            // Already credited under the payment's key; replays are no-ops.
            PaymentStatus::Succeeded => self.credit_payment(&payment, &payload.event().id),
            PaymentStatus::Failed => {
                tracing::warn!(
                    payment_id = %payment.id,
                    %intent_id,
                    "Intent succeeded for a payment already marked FAILED, ignoring"
                );
                Ok(())
            }
        }
    }

    pub(super) fn handle_intent_failed(&self, payload: &Payload<'_>) -> Result<(), LedgerError> {
        let intent_id = payload
            .id("payment intent id", None, OBJECT_ID)
            .ok_or_else(|| LedgerError::MalformedEvent("payment intent id missing".into()))?;

        match self.payments.find_by_intent(&intent_id)? {
            Some(payment) => self.fail_payment(&payment),
            None => {
                tracing::info!(%intent_id, "Payment intent failed for unrecorded payment");
                Ok(())
            }
        }
    }

    // ── Refunds ──────────────────────────────────────────────────

    /// Observation only; the balance is untouched.
    pub(super) fn handle_refund_created(&self, payload: &Payload<'_>) -> Result<(), LedgerError> {
        let refund: Option<Refund> = payload.event().object();
        let refund_id = payload.id("refund id", refund.as_ref().map(|r| r.id.clone()), OBJECT_ID);
        let amount = payload.int("refund amount", refund.as_ref().and_then(|r| r.amount), OBJECT_AMOUNT);
        let status = payload.text(
            "refund status",
            refund.as_ref().and_then(|r| r.status.clone()),
            OBJECT_STATUS,
        );

        match self.payment_for_charge(payload, refund.as_ref().map(ChargeRef::from))? {
            Some(payment) => tracing::info!(
                payment_id = %payment.id,
                user_id = %payment.user_id,
                refund_id = ?refund_id,
                amount = ?amount,
                status = ?status,
                "Refund observed"
            ),
            None => tracing::debug!(refund_id = ?refund_id, "Refund observed for unrecorded payment"),
        }
        Ok(())
    }

    /// A canceled refund gives back the tokens proportional to its amount.
    pub(super) fn handle_refund_updated(&self, payload: &Payload<'_>) -> Result<(), LedgerError> {
        let refund: Option<Refund> = payload.event().object();
        let status = payload.text(
            "refund status",
            refund.as_ref().and_then(|r| r.status.clone()),
            OBJECT_STATUS,
        );
        if status.as_deref() != Some("canceled") {
            tracing::debug!(status = ?status, "Refund update is not a cancellation");
            return Ok(());
        }

        let refund_id = payload
            .id("refund id", refund.as_ref().map(|r| r.id.clone()), OBJECT_ID)
            .ok_or_else(|| LedgerError::MalformedEvent("refund id missing".into()))?;
        let amount = payload
            .int("refund amount", refund.as_ref().and_then(|r| r.amount), OBJECT_AMOUNT)
            .unwrap_or(0);

        let Some(payment) = self.payment_for_charge(payload, refund.as_ref().map(ChargeRef::from))? else {
            tracing::warn!(%refund_id, "Canceled refund for unrecorded payment, nothing restored");
            return Ok(());
        };

        self.restore_tokens(
            &payment,
            amount,
            format!("refund:{refund_id}:canceled"),
            &json!({
                "eventId": payload.event().id,
                "refundId": refund_id,
                "refundAmountCents": amount,
                "reason": "refund_canceled",
            }),
        )
    }

    // ── Disputes ─────────────────────────────────────────────────

    pub(super) fn handle_dispute_created(&self, payload: &Payload<'_>) -> Result<(), LedgerError> {
        let dispute_id = payload.id("dispute id", None, OBJECT_ID);
        tracing::info!(dispute_id = ?dispute_id, "Dispute opened, no ledger change");
        Ok(())
    }

    /// Tracked only; the purchase credit is not clawed back.
    pub(super) fn handle_dispute_funds_withdrawn(&self, payload: &Payload<'_>) -> Result<(), LedgerError> {
        let dispute: Option<Dispute> = payload.event().object();
        let dispute_id = payload.id("dispute id", dispute.as_ref().map(|d| d.id.clone()), OBJECT_ID);
        let amount = payload.int("dispute amount", dispute.as_ref().and_then(|d| d.amount), OBJECT_AMOUNT);

        match self.payment_for_charge(payload, dispute.as_ref().map(ChargeRef::from))? {
            Some(payment) => tracing::warn!(
                payment_id = %payment.id,
                user_id = %payment.user_id,
                dispute_id = ?dispute_id,
                amount = ?amount,
                "Dispute funds withdrawn"
            ),
            None => tracing::warn!(dispute_id = ?dispute_id, "Dispute funds withdrawn for unrecorded payment"),
        }
        Ok(())
    }

    /// A won dispute restores tokens proportional to the disputed amount.
    pub(super) fn handle_dispute_closed(&self, payload: &Payload<'_>) -> Result<(), LedgerError> {
        let dispute: Option<Dispute> = payload.event().object();
        let status = payload.text(
            "dispute status",
            dispute.as_ref().and_then(|d| d.status.clone()),
            OBJECT_STATUS,
        );
        let dispute_id = payload
            .id("dispute id", dispute.as_ref().map(|d| d.id.clone()), OBJECT_ID)
            .ok_or_else(|| LedgerError::MalformedEvent("dispute id missing".into()))?;

        if status.as_deref() != Some("won") {
            tracing::info!(%dispute_id, status = ?status, "Dispute closed without a win, no ledger change");
            return Ok(());
        }

        let amount = payload
            .int("dispute amount", dispute.as_ref().and_then(|d| d.amount), OBJECT_AMOUNT)
            .unwrap_or(0);
        let Some(payment) = self.payment_for_charge(payload, dispute.as_ref().map(ChargeRef::from))? else {
            tracing::warn!(%dispute_id, "Won dispute for unrecorded payment, nothing restored");
            return Ok(());
        };

        self.restore_tokens(
            &payment,
            amount,
            format!("dispute:{dispute_id}:won"),
            &json!({
                "eventId": payload.event().id,
                "disputeId": dispute_id,
                "disputeAmountCents": amount,
                "reason": "dispute_won",
            }),
        )
    }

    // ── Subscription invoices ────────────────────────────────────

    pub(super) fn handle_invoice(&self, payload: &Payload<'_>, succeeded: bool) -> Result<(), LedgerError> {
        let event = payload.event();
        let invoice: Option<Invoice> = event.object();

        let typed_subscription = invoice
            .as_ref()
            .and_then(|i| i.subscription.as_ref())
            .map(|s| s.id().to_string());
        let Some(subscription_id) = payload.id("subscription", typed_subscription, INVOICE_SUBSCRIPTION) else {
            tracing::debug!(event_id = %event.id, "Invoice is not for a subscription");
            return Ok(());
        };

        let subscription = self.provider.retrieve_subscription(&subscription_id)?;
        let Some(user_id) = self.resolve_subscriber(&subscription)? else {
            tracing::info!(%subscription_id, "Subscription has no resolvable user, skipping invoice");
            return Ok(());
        };

        let typed_price = invoice
            .as_ref()
            .and_then(|i| i.lines.as_ref())
            .and_then(|lines| lines.first())
            .and_then(|line| line.price.as_ref())
            .map(|price| price.id.clone());
        let details = SubscriptionInvoice {
            event_id: event.id.clone(),
            user_id,
            subscription_id,
            invoice_id: payload.id("invoice id", invoice.as_ref().map(|i| i.id.clone()), OBJECT_ID),
            price_id: payload.id("invoice price", typed_price, INVOICE_PRICE),
            amount_paid: payload.int(
                "amount paid",
                invoice.as_ref().and_then(|i| i.amount_paid),
                INVOICE_AMOUNT_PAID,
            ),
        };

        if !succeeded {
            return self.subscriptions.record_payment_failure(&details);
        }

        match self.subscriptions.credit_period(&details)? {
            CreditOutcome::Applied { tokens } => {
                tracing::info!(
                    user_id = %details.user_id,
                    subscription_id = %details.subscription_id,
                    tokens,
                    "Subscription period credited"
                );
                Ok(())
            }
            CreditOutcome::NotEligible => Ok(()),
            // The event was not marked processed, so only a crash between the
            // credit and the processed marker (or a bug) lands here.
            CreditOutcome::AlreadyApplied => {
                let key = credit_key(&details.event_id);
                tracing::error!(
                    event_id = %details.event_id,
                    subscription_id = %details.subscription_id,
                    idempotency_key = %key,
                    "Subscription credit already applied on first delivery; \
                     inspect the ledger transaction under this key"
                );
                Err(LedgerError::InvariantViolation(format!(
                    "subscription credit for event {} already applied on first delivery (key {key})",
                    details.event_id
                )))
            }
        }
    }

    // ── Shared helpers ───────────────────────────────────────────

    fn resolve_pack(&self, session: &CheckoutSession) -> Result<&TokenPack, LedgerError> {
        let price_id = session.first_price_id();
        let pack = match session.metadata.get(PACK_ID_KEY) {
            Some(pack_id) => self.config.find_pack(pack_id),
            None => price_id.and_then(|price| self.config.find_pack_by_price(price)),
        }
        .ok_or_else(|| {
            LedgerError::InvalidCheckoutSession(format!(
                "session {} does not name a known token pack",
                session.id
            ))
        })?;

        if let Some(price_id) = price_id {
            if price_id != pack.price_id {
                return Err(LedgerError::InvalidCheckoutSession(format!(
                    "session {} price {price_id} does not match pack {}",
                    session.id, pack.id
                )));
            }
        }
        match session.amount_total {
            Some(total) if total == pack.amount_cents => Ok(pack),
            Some(total) => Err(LedgerError::InvalidCheckoutSession(format!(
                "session {} total {total} does not match pack {} price {}",
                session.id, pack.id, pack.amount_cents
            ))),
            None => Err(LedgerError::InvalidCheckoutSession(format!(
                "session {} has no total",
                session.id
            ))),
        }
    }

    /// Subscription metadata first, then the customer's.
    fn resolve_subscriber(&self, subscription: &Subscription) -> Result<Option<String>, LedgerError> {
        if let Some(user_id) = subscription.metadata.get(USER_ID_KEY).and_then(|u| parse_user_id(u)) {
            return Ok(Some(user_id));
        }
        let Some(customer_ref) = subscription.customer.as_ref() else {
            return Ok(None);
        };
        let metadata = match customer_ref {
            Expandable::Object(customer) => customer.metadata.clone(),
            Expandable::Id(customer_id) => self.provider.retrieve_customer(customer_id)?.metadata,
        };
        Ok(metadata.get(USER_ID_KEY).and_then(|u| parse_user_id(u)))
    }

    /// Resolve the payment behind a refund or dispute: its own payment intent
    /// when present, otherwise the charge's (one provider lookup).
    fn payment_for_charge(
        &self,
        payload: &Payload<'_>,
        typed: Option<ChargeRef>,
    ) -> Result<Option<Payment>, LedgerError> {
        let typed = typed.unwrap_or_default();
        let mut intent_id = payload.id("payment intent", typed.payment_intent, OBJECT_PAYMENT_INTENT);

        if intent_id.is_none() {
            if let Some(charge_id) = payload.id("charge", typed.charge, OBJECT_CHARGE) {
                let charge = self.provider.retrieve_charge(&charge_id)?;
                intent_id = charge.payment_intent.as_ref().map(|pi| pi.id().to_string());
            }
        }

        match intent_id {
            Some(intent_id) => self.payments.find_by_intent(&intent_id),
            None => Ok(None),
        }
    }

    fn fail_payment(&self, payment: &Payment) -> Result<(), LedgerError> {
        if payment.status.is_terminal() {
            tracing::debug!(payment_id = %payment.id, status = %payment.status, "Payment already terminal");
            return Ok(());
        }
        if self.payments.mark_status(&payment.id, PaymentStatus::Failed)? {
            tracing::info!(payment_id = %payment.id, user_id = %payment.user_id, "Payment marked FAILED");
        }
        Ok(())
    }

    fn credit_payment(&self, payment: &Payment, event_id: &str) -> Result<(), LedgerError> {
        let receipt = self.ledger.credit_purchase(
            Credit::new(&payment.user_id, payment.credited_tokens, &payment.id)
                .idempotency_key(payment.credit_key())
                .source(TransactionSource::PaymentWebhook)
                .metadata(&json!({
                    "eventId": event_id,
                    "sessionId": payment.provider_session_id,
                    "paymentIntentId": payment.provider_payment_intent_id,
                    "packId": payment.pack_id,
                    "amountCents": payment.amount_cents,
                })),
        )?;
        if receipt.replayed {
            tracing::debug!(payment_id = %payment.id, "Purchase already credited");
        }
        Ok(())
    }

    fn restore_tokens(
        &self,
        payment: &Payment,
        amount_cents: i64,
        idempotency_key: String,
        metadata: &serde_json::Value,
    ) -> Result<(), LedgerError> {
        if payment.amount_cents == 0 {
            tracing::warn!(
                payment_id = %payment.id,
                "Original payment amount is zero, skipping token restore"
            );
            return Ok(());
        }

        let tokens = proportional_tokens(payment.credited_tokens, amount_cents, payment.amount_cents);
        if tokens <= 0 {
            tracing::debug!(payment_id = %payment.id, amount_cents, "Nothing to restore");
            return Ok(());
        }

        let receipt = self.ledger.credit_refund(
            Credit::new(&payment.user_id, tokens, &payment.id)
                .idempotency_key(idempotency_key)
                .source(TransactionSource::PaymentWebhook)
                .metadata(metadata),
        )?;
        if !receipt.replayed {
            tracing::info!(
                payment_id = %payment.id,
                user_id = %payment.user_id,
                tokens,
                "Tokens restored"
            );
        }
        Ok(())
    }
}

/// Charge references shared by refunds and disputes.
#[derive(Debug, Default)]
struct ChargeRef {
    charge: Option<String>,
    payment_intent: Option<String>,
}

impl From<&Refund> for ChargeRef {
    fn from(refund: &Refund) -> Self {
        Self {
            charge: refund.charge.as_ref().map(|c| c.id().to_string()),
            payment_intent: refund.payment_intent.as_ref().map(|pi| pi.id().to_string()),
        }
    }
}

impl From<&Dispute> for ChargeRef {
    fn from(dispute: &Dispute) -> Self {
        Self {
            charge: dispute.charge.as_ref().map(|c| c.id().to_string()),
            payment_intent: dispute.payment_intent.as_ref().map(|pi| pi.id().to_string()),
        }
    }
}

/// `credited * amount / original`, floored, with `amount` clamped to `[0, original]`.
/// `original` must be positive.
pub fn proportional_tokens(credited_tokens: i64, amount_cents: i64, original_cents: i64) -> i64 {
    if original_cents <= 0 {
        return 0;
    }
    let amount = i128::from(amount_cents.clamp(0, original_cents));
    let tokens = i128::from(credited_tokens) * amount / i128::from(original_cents);
    i64::try_from(tokens).unwrap_or(credited_tokens)
}

/// Client reference first, then session metadata.
fn resolve_checkout_user(session: &CheckoutSession) -> Result<String, LedgerError> {
    let reference = session
        .client_reference_id
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .or_else(|| {
            session
                .metadata
                .get(USER_ID_KEY)
                .map(String::as_str)
                .filter(|r| !r.trim().is_empty())
        })
        .ok_or_else(|| {
            LedgerError::InvalidCheckoutSession(format!("session {} has no user reference", session.id))
        })?;

    parse_user_id(reference).ok_or_else(|| {
        LedgerError::InvalidCheckoutSession(format!(
            "session {} user reference {reference:?} is not a valid id",
            session.id
        ))
    })
}

/// Canonical form of a user id, or `None` if it is not a UUID.
fn parse_user_id(raw: &str) -> Option<String> {
    uuid::Uuid::parse_str(raw.trim()).ok().map(|u| u.to_string())
}
