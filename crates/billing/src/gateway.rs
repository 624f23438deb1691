//! Payment gateway capability.
//!
//! Every remote call the lifecycle controller, webhook dispatcher, and
//! balance job make goes through [`BillingGateway`]. The production
//! implementation lives in [`crate::client`]; tests use the scripted
//! recording double below. No method retries: a failed call surfaces
//! immediately and the caller decides what state to keep.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::tax::{TaxExemption, TaxIdType};

/// Customer billing profile as pushed to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerProfile {
    pub email: String,
    pub name: String,
    pub country: String,
    pub address_line_1: String,
    pub address_line_2: String,
    pub postal_code: String,
    pub city: String,
    pub phone: String,
    pub tax_exempt: TaxExemption,
    /// Tax registration number and its gateway type, if one was supplied.
    pub tax_id: Option<TaxIdRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxIdRequest {
    pub value: String,
    pub id_type: TaxIdType,
}

/// Customer as read back from the gateway.
#[derive(Debug, Clone, Default)]
pub struct CustomerDetails {
    pub id: String,
    pub email: String,
    pub name: String,
    pub country: String,
    pub address_line_1: String,
    pub address_line_2: String,
    pub postal_code: String,
    pub city: String,
    pub phone: String,
    /// First tax registration number on file, empty if none.
    pub tax_number: String,
    /// Running account balance in the smallest currency unit. Negative
    /// means credit owed to the customer.
    pub balance: i64,
}

/// Outcome of the first charge attempt on a new subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Paid,
    /// The charge needs user authentication (3-D Secure); the client secret
    /// is handed to the frontend to complete it.
    RequiresAction { client_secret: String },
}

#[derive(Debug, Clone)]
pub struct CreatedSubscription {
    pub id: String,
    pub outcome: PaymentOutcome,
}

/// Subscription as read back from the gateway. Single-item by
/// construction; the one item carries the per-seat price and quantity.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionDetails {
    pub id: String,
    pub item_id: String,
    pub price_id: String,
    pub quantity: u64,
    /// Per-seat price in the smallest currency unit.
    pub unit_amount: i64,
    pub currency: String,
    pub cancel_at_period_end: bool,
    pub tax_rate_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CardDetails {
    pub brand: String,
    pub last4: String,
    pub exp_month: i64,
    pub exp_year: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PaymentMethodDetails {
    pub id: String,
    pub card: Option<CardDetails>,
}

#[derive(Debug, Clone, Default)]
pub struct PaymentIntentDetails {
    pub id: String,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Invoice {
    pub id: String,
    pub number: Option<String>,
    pub total: i64,
    pub currency: String,
    pub created: OffsetDateTime,
    pub invoice_pdf: Option<String>,
    pub status: Option<String>,
}

impl Default for Invoice {
    fn default() -> Self {
        Self {
            id: String::new(),
            number: None,
            total: 0,
            currency: String::new(),
            created: OffsetDateTime::UNIX_EPOCH,
            invoice_pdf: None,
            status: None,
        }
    }
}

/// Remote payment processor operations.
#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Create a customer and return its id.
    async fn create_customer(&self, profile: &CustomerProfile) -> BillingResult<String>;

    async fn get_customer(&self, customer_id: &str) -> BillingResult<CustomerDetails>;

    async fn update_customer(
        &self,
        customer_id: &str,
        profile: &CustomerProfile,
    ) -> BillingResult<()>;

    async fn delete_customer(&self, customer_id: &str) -> BillingResult<()>;

    /// Create a single-item subscription and report the outcome of the
    /// first charge attempt.
    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: u64,
        tax_rate_id: Option<&str>,
    ) -> BillingResult<CreatedSubscription>;

    async fn get_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionDetails>;

    async fn update_subscription_quantity(
        &self,
        subscription_id: &str,
        item_id: &str,
        quantity: u64,
    ) -> BillingResult<()>;

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
    ) -> BillingResult<()>;

    async fn update_subscription_tax_rate(
        &self,
        subscription_id: &str,
        item_id: &str,
        tax_rate_id: Option<&str>,
    ) -> BillingResult<()>;

    /// Set or clear cancel-at-period-end.
    async fn set_subscription_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<()>;

    /// Delete the subscription immediately, without waiting for the period
    /// to elapse.
    async fn cancel_subscription_now(&self, subscription_id: &str) -> BillingResult<()>;

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> BillingResult<()>;

    async fn detach_payment_method(&self, payment_method_id: &str) -> BillingResult<()>;

    /// Make the payment method the customer's invoice default.
    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    async fn get_payment_method(
        &self,
        payment_method_id: &str,
    ) -> BillingResult<PaymentMethodDetails>;

    async fn get_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<PaymentIntentDetails>;

    /// One page of invoices for a subscription, newest first.
    async fn list_invoices(
        &self,
        subscription_id: &str,
        starting_after: Option<&str>,
        limit: u64,
    ) -> BillingResult<Vec<Invoice>>;

    /// Apply a balance transaction to the customer account. Negative
    /// amounts are credits.
    async fn add_balance(
        &self,
        customer_id: &str,
        amount: i64,
        currency: &str,
        description: &str,
    ) -> BillingResult<()>;
}
