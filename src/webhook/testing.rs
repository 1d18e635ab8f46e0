//! Test doubles for the reconciler: an in-memory provider and a wired harness.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use super::provider::{
    Charge, CheckoutSession, Customer, Expandable, PaymentIntent, PaymentProvider, ProviderError,
    Subscription,
};
use super::subscription::{
    CreditOutcome, LedgerSubscriptionCredits, SubscriptionCredits, SubscriptionInvoice,
};
use super::{signature, WebhookOutcome, WebhookReconciler};
use crate::billing::{BalanceStore, Database, LedgerError, PaymentEventStore, TokenLedger};
use crate::config::{Config, SubscriptionPlan, TokenPack};
use crate::observability::PrometheusMetrics;

pub const SECRET: &str = "whsec_test_secret";
pub const USER: &str = "3f2b8c1e-9d4a-4e6b-a1c7-5d8e2f9a0b13";
pub const OTHER_USER: &str = "a7c4e2d9-1b3f-4a8e-9c6d-2e5f7a1b3c8d";

/// Serialized event envelope as the provider would send it.
pub fn event_json(id: &str, event_type: &str, object: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "type": event_type,
        "created": Utc::now().timestamp(),
        "livemode": false,
        "data": {"object": object},
    }))
    .unwrap()
}

#[derive(Default)]
pub struct FakeProvider {
    sessions: Mutex<HashMap<String, CheckoutSession>>,
    charges: Mutex<HashMap<String, Charge>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    customers: Mutex<HashMap<String, Customer>>,
    session_calls: AtomicUsize,
    charge_calls: AtomicUsize,
    subscription_calls: AtomicUsize,
    customer_calls: AtomicUsize,
    offline: AtomicBool,
}

impl FakeProvider {
    /// Paid session for `pack_id` costing `amount_cents`, intent `pi_{session_id}`.
    pub fn paid_session(
        &self,
        session_id: &str,
        user_id: &str,
        pack_id: &str,
        amount_cents: i64,
    ) -> CheckoutSession {
        CheckoutSession {
            id: session_id.into(),
            client_reference_id: Some(user_id.into()),
            metadata: HashMap::from([("packId".to_string(), pack_id.to_string())]),
            amount_total: Some(amount_cents),
            payment_status: Some("paid".into()),
            payment_intent: Some(Expandable::Id(format!("pi_{session_id}"))),
            line_items: None,
            customer: None,
        }
    }

    pub fn add_session(&self, session: CheckoutSession) {
        self.sessions.lock().insert(session.id.clone(), session);
    }

    pub fn add_paid_session(&self, session_id: &str, user_id: &str, pack_id: &str, amount_cents: i64) {
        self.add_session(self.paid_session(session_id, user_id, pack_id, amount_cents));
    }

    pub fn add_charge(&self, charge_id: &str, amount: i64, payment_intent_id: &str) {
        self.charges.lock().insert(
            charge_id.into(),
            Charge {
                id: charge_id.into(),
                amount,
                amount_refunded: 0,
                payment_intent: Some(Expandable::Object(Box::new(PaymentIntent {
                    id: payment_intent_id.into(),
                    status: Some("succeeded".into()),
                    amount: Some(amount),
                }))),
            },
        );
    }

    pub fn add_subscription(&self, subscription_id: &str, customer_id: &str) {
        self.subscriptions.lock().insert(
            subscription_id.into(),
            Subscription {
                id: subscription_id.into(),
                customer: Some(Expandable::Id(customer_id.into())),
                status: Some("active".into()),
                metadata: HashMap::new(),
            },
        );
    }

    pub fn add_customer(&self, customer_id: &str, user_id: &str) {
        self.add_customer_metadata(customer_id, &[("userId", user_id)]);
    }

    pub fn add_customer_metadata(&self, customer_id: &str, metadata: &[(&str, &str)]) {
        self.customers.lock().insert(
            customer_id.into(),
            Customer {
                id: customer_id.into(),
                email: None,
                metadata: metadata
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            },
        );
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn session_calls(&self) -> usize {
        self.session_calls.load(Ordering::SeqCst)
    }

    pub fn charge_calls(&self) -> usize {
        self.charge_calls.load(Ordering::SeqCst)
    }

    pub fn customer_calls(&self) -> usize {
        self.customer_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.session_calls()
            + self.charge_calls()
            + self.subscription_calls.load(Ordering::SeqCst)
            + self.customer_calls()
    }

    fn lookup<T: Clone>(
        &self,
        calls: &AtomicUsize,
        objects: &Mutex<HashMap<String, T>>,
        kind: &'static str,
        id: &str,
    ) -> Result<T, ProviderError> {
        calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("connection refused".into()));
        }
        objects.lock().get(id).cloned().ok_or_else(|| ProviderError::NotFound {
            kind,
            id: id.to_string(),
        })
    }
}

impl PaymentProvider for FakeProvider {
    fn retrieve_session(&self, id: &str, _expand: &[&str]) -> Result<CheckoutSession, ProviderError> {
        self.lookup(&self.session_calls, &self.sessions, "checkout session", id)
    }

    fn retrieve_charge(&self, id: &str) -> Result<Charge, ProviderError> {
        self.lookup(&self.charge_calls, &self.charges, "charge", id)
    }

    fn retrieve_subscription(&self, id: &str) -> Result<Subscription, ProviderError> {
        self.lookup(&self.subscription_calls, &self.subscriptions, "subscription", id)
    }

    fn retrieve_customer(&self, id: &str) -> Result<Customer, ProviderError> {
        self.lookup(&self.customer_calls, &self.customers, "customer", id)
    }
}

/// Reports every invoice as already credited.
pub struct AlreadyAppliedCredits;

impl SubscriptionCredits for AlreadyAppliedCredits {
    fn credit_period(&self, _invoice: &SubscriptionInvoice) -> Result<CreditOutcome, LedgerError> {
        Ok(CreditOutcome::AlreadyApplied)
    }

    fn record_payment_failure(&self, _invoice: &SubscriptionInvoice) -> Result<(), LedgerError> {
        Ok(())
    }
}

pub struct Harness {
    _tmp: TempDir,
    pub db: Arc<Database>,
    pub ledger: Arc<TokenLedger>,
    pub payments: Arc<PaymentEventStore>,
    pub provider: Arc<FakeProvider>,
    pub metrics: Arc<PrometheusMetrics>,
    pub reconciler: WebhookReconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_secret(Some(SECRET))
    }

    pub fn with_secret(secret: Option<&str>) -> Self {
        Self::build(secret, None)
    }

    pub fn with_subscription_credits(credits: Arc<dyn SubscriptionCredits>) -> Self {
        Self::build(Some(SECRET), Some(credits))
    }

    fn build(secret: Option<&str>, credits: Option<Arc<dyn SubscriptionCredits>>) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.database_path = tmp.path().join("ledger.db");
        config.webhook.signing_secret = secret.map(str::to_string);
        config.packs = vec![
            TokenPack {
                id: "starter".into(),
                price_id: "price_starter".into(),
                amount_cents: 500,
                tokens: 10_000,
            },
            TokenPack {
                id: "pro".into(),
                price_id: "price_pro".into(),
                amount_cents: 2_000,
                tokens: 50_000,
            },
            TokenPack {
                id: "promo".into(),
                price_id: "price_promo".into(),
                amount_cents: 0,
                tokens: 1_000,
            },
        ];
        config.subscription_plans = vec![SubscriptionPlan {
            price_id: "price_monthly".into(),
            tokens_per_period: 30_000,
        }];

        let db = Arc::new(Database::open(&config.database_path).unwrap());
        let balances = Arc::new(BalanceStore::new(Arc::clone(&db)));
        let ledger = Arc::new(TokenLedger::new(Arc::clone(&db), balances, &config.ledger));
        let payments = Arc::new(PaymentEventStore::new(Arc::clone(&db)));
        let provider = Arc::new(FakeProvider::default());
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let credits = credits.unwrap_or_else(|| {
            Arc::new(LedgerSubscriptionCredits::new(
                Arc::clone(&ledger),
                config.subscription_plans.clone(),
            ))
        });

        let reconciler = WebhookReconciler::new(
            &config,
            Arc::clone(&ledger),
            Arc::clone(&payments),
            Arc::clone(&provider) as Arc<dyn PaymentProvider>,
            credits,
            Arc::clone(&metrics) as Arc<dyn crate::observability::MetricsSink>,
        );

        Self {
            _tmp: tmp,
            db,
            ledger,
            payments,
            provider,
            metrics,
            reconciler,
        }
    }

    /// Signature header for `body` stamped now.
    pub fn sign(&self, body: &[u8]) -> String {
        signature::header_for(SECRET, body, Utc::now().timestamp()).unwrap()
    }

    /// Sign and process `body`.
    pub fn deliver(&self, body: &[u8]) -> Result<WebhookOutcome, LedgerError> {
        self.reconciler.process(body, &self.sign(body))
    }

    pub fn balance(&self, user_id: &str) -> i64 {
        self.ledger.get_balance(user_id).unwrap().available_tokens
    }

    /// Make every payment lookup fail with a storage error.
    pub fn payments_fail_on_lookup(&self) {
        self.db
            .write(|tx| {
                tx.execute_batch("DROP TABLE payments")?;
                Ok(())
            })
            .unwrap();
    }
}
