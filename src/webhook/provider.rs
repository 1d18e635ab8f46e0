//! Payment-provider client contract and the objects it returns.
//!
//! Only the fields reconciliation reads are modelled; everything else in the
//! provider's payload is ignored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("provider API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("provider transport error: {0}")]
    Transport(String),
}

/// Read-only access to provider objects.
pub trait PaymentProvider: Send + Sync {
    /// `expand` names nested objects to inline (e.g. `"line_items"`).
    fn retrieve_session(&self, id: &str, expand: &[&str]) -> Result<CheckoutSession, ProviderError>;

    fn retrieve_charge(&self, id: &str) -> Result<Charge, ProviderError>;

    fn retrieve_subscription(&self, id: &str) -> Result<Subscription, ProviderError>;

    fn retrieve_customer(&self, id: &str) -> Result<Customer, ProviderError>;
}

/// Objects addressable by id.
pub trait HasId {
    fn id(&self) -> &str;
}

/// A reference the provider returns either as a bare id or, when expanded,
/// as the full object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

impl<T: HasId> Expandable<T> {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object(object) => object.id(),
        }
    }

    pub fn as_object(&self) -> Option<&T> {
        match self {
            Self::Id(_) => None,
            Self::Object(object) => Some(object),
        }
    }
}

/// Provider list envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> List<T> {
    pub fn first(&self) -> Option<&T> {
        self.data.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub quantity: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
}

impl HasId for PaymentIntent {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    /// Caller-supplied reference; holds the user id when set.
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Total in the smallest currency unit.
    #[serde(default)]
    pub amount_total: Option<i64>,
    /// `paid`, `unpaid` or `no_payment_required`.
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<Expandable<PaymentIntent>>,
    #[serde(default)]
    pub line_items: Option<List<LineItem>>,
    #[serde(default)]
    pub customer: Option<String>,
}

impl CheckoutSession {
    /// Funds are captured (or none were needed).
    pub fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            Some("paid" | "no_payment_required")
        )
    }

    pub fn first_price_id(&self) -> Option<&str> {
        self.line_items
            .as_ref()
            .and_then(List::first)
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }
}

impl HasId for CheckoutSession {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    #[serde(default)]
    pub payment_intent: Option<Expandable<PaymentIntent>>,
}

impl HasId for Charge {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl HasId for Customer {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Expandable<Customer>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl HasId for Subscription {
    fn id(&self) -> &str {
        &self.id
    }
}
