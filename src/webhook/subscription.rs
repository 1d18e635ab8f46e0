//! Subscription invoice crediting.

use std::sync::Arc;

use crate::billing::{Credit, LedgerError, TokenLedger, TransactionSource};
use crate::config::SubscriptionPlan;

/// A paid or failed subscription invoice resolved to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInvoice {
    /// Provider event id; the idempotency anchor for the credit.
    pub event_id: String,
    pub user_id: String,
    pub subscription_id: String,
    pub invoice_id: Option<String>,
    pub price_id: Option<String>,
    pub amount_paid: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Applied { tokens: i64 },
    /// The idempotency guard found this invoice event already credited.
    AlreadyApplied,
    /// No plan grants tokens for this invoice.
    NotEligible,
}

/// Handler for subscription invoice outcomes.
pub trait SubscriptionCredits: Send + Sync {
    fn credit_period(&self, invoice: &SubscriptionInvoice) -> Result<CreditOutcome, LedgerError>;

    fn record_payment_failure(&self, invoice: &SubscriptionInvoice) -> Result<(), LedgerError>;
}

/// Ledger idempotency key of the credit for one invoice event.
pub fn credit_key(event_id: &str) -> String {
    format!("subscription:{event_id}")
}

/// Grants each plan's `tokens_per_period` through the ledger.
pub struct LedgerSubscriptionCredits {
    ledger: Arc<TokenLedger>,
    plans: Vec<SubscriptionPlan>,
}

impl LedgerSubscriptionCredits {
    pub fn new(ledger: Arc<TokenLedger>, plans: Vec<SubscriptionPlan>) -> Self {
        Self { ledger, plans }
    }

    fn plan_for(&self, price_id: Option<&str>) -> Option<&SubscriptionPlan> {
        let price_id = price_id?;
        self.plans.iter().find(|p| p.price_id == price_id)
    }
}

impl SubscriptionCredits for LedgerSubscriptionCredits {
    fn credit_period(&self, invoice: &SubscriptionInvoice) -> Result<CreditOutcome, LedgerError> {
        let Some(plan) = self.plan_for(invoice.price_id.as_deref()) else {
            tracing::warn!(
                subscription_id = %invoice.subscription_id,
                price_id = ?invoice.price_id,
                "No subscription plan for invoice price, nothing credited"
            );
            return Ok(CreditOutcome::NotEligible);
        };

        let credit = Credit::new(
            &invoice.user_id,
            plan.tokens_per_period,
            invoice
                .invoice_id
                .as_deref()
                .unwrap_or(&invoice.subscription_id),
        )
        .idempotency_key(credit_key(&invoice.event_id))
        .source(TransactionSource::Subscription)
        .metadata(&serde_json::json!({
            "eventId": invoice.event_id,
            "subscriptionId": invoice.subscription_id,
            "invoiceId": invoice.invoice_id,
            "priceId": plan.price_id,
            "amountPaid": invoice.amount_paid,
        }));

        let receipt = self.ledger.credit_purchase(credit)?;
        if receipt.replayed {
            return Ok(CreditOutcome::AlreadyApplied);
        }
        Ok(CreditOutcome::Applied {
            tokens: plan.tokens_per_period,
        })
    }

    fn record_payment_failure(&self, invoice: &SubscriptionInvoice) -> Result<(), LedgerError> {
        tracing::warn!(
            user_id = %invoice.user_id,
            subscription_id = %invoice.subscription_id,
            invoice_id = ?invoice.invoice_id,
            "Subscription invoice payment failed, no tokens granted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{BalanceStore, Database};
    use crate::config::LedgerConfig;
    use tempfile::TempDir;

    fn make_credits() -> (TempDir, Arc<TokenLedger>, LedgerSubscriptionCredits) {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&tmp.path().join("ledger.db")).unwrap());
        let balances = Arc::new(BalanceStore::new(Arc::clone(&db)));
        let ledger = Arc::new(TokenLedger::new(db, balances, &LedgerConfig::default()));
        let credits = LedgerSubscriptionCredits::new(
            Arc::clone(&ledger),
            vec![SubscriptionPlan {
                price_id: "price_monthly".into(),
                tokens_per_period: 50_000,
            }],
        );
        (tmp, ledger, credits)
    }

    fn invoice(event_id: &str, price_id: Option<&str>) -> SubscriptionInvoice {
        SubscriptionInvoice {
            event_id: event_id.into(),
            user_id: "user-1".into(),
            subscription_id: "sub_1".into(),
            invoice_id: Some("in_1".into()),
            price_id: price_id.map(str::to_string),
            amount_paid: Some(1_900),
        }
    }

    #[test]
    fn credits_plan_tokens_once_per_event() {
        let (_tmp, ledger, credits) = make_credits();
        let inv = invoice("evt_1", Some("price_monthly"));

        assert_eq!(
            credits.credit_period(&inv).unwrap(),
            CreditOutcome::Applied { tokens: 50_000 }
        );
        assert_eq!(credits.credit_period(&inv).unwrap(), CreditOutcome::AlreadyApplied);

        let balance = ledger.get_balance("user-1").unwrap();
        assert_eq!(balance.available_tokens, 50_000);
        let txs = ledger.list_transactions("user-1", 10).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].source, TransactionSource::Subscription);
        assert_eq!(txs[0].ref_id, "in_1");
        assert_eq!(txs[0].idempotency_key.as_deref(), Some(credit_key("evt_1").as_str()));
    }

    #[test]
    fn unknown_price_is_not_eligible() {
        let (_tmp, ledger, credits) = make_credits();
        assert_eq!(
            credits.credit_period(&invoice("evt_1", Some("price_other"))).unwrap(),
            CreditOutcome::NotEligible
        );
        assert_eq!(
            credits.credit_period(&invoice("evt_2", None)).unwrap(),
            CreditOutcome::NotEligible
        );
        assert_eq!(ledger.get_balance("user-1").unwrap().available_tokens, 0);
    }

    #[test]
    fn failure_is_recorded_without_ledger_change() {
        let (_tmp, ledger, credits) = make_credits();
        credits
            .record_payment_failure(&invoice("evt_1", Some("price_monthly")))
            .unwrap();
        assert!(ledger.list_transactions("user-1", 10).unwrap().is_empty());
    }
}
