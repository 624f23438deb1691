// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quill Billing Module
//!
//! Stripe-backed subscription billing for organizations.
//!
//! ## Features
//!
//! - **Subscription Management**: Subscribe, change plan, cancel, resume
//! - **EU Tax Handling**: Domestic VAT, reverse charge, tax id sync
//! - **Payment Methods**: Attach, replace, and default payment methods
//! - **Webhooks**: Typed decoding and dispatch of Stripe events
//! - **Balance Reconciliation**: Monthly credit for inactive seats
//! - **Email Notifications**: Admin mails on lifecycle transitions

pub mod balance;
pub mod client;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod order;
pub mod subscriptions;
pub mod tax;
pub mod webhooks;


use std::sync::Arc;

use sqlx::PgPool;

use quill_shared::{PgAccessControl, PgOrganizationStore, StripeConfig};

// Balance
pub use balance::BalanceService;

// Client
pub use client::StripeClient;

// Error
pub use error::{BillingError, BillingResult, FieldError};

// Gateway
pub use gateway::{
    BillingGateway, CardDetails, CreatedSubscription, CustomerDetails, CustomerProfile, Invoice,
    PaymentIntentDetails, PaymentMethodDetails, PaymentOutcome, SubscriptionDetails,
};

// Notifications
pub use notify::{LogMailer, MailError, Mailer, Notification, Notifier};

// Order
pub use order::Order;

// Subscriptions
pub use subscriptions::{SubscriptionOverview, SubscriptionService};

// Webhooks
pub use webhooks::{WebhookDispatcher, WebhookEvent};

/// All billing services, wired against Postgres and Stripe.
pub struct Billing {
    pub subscriptions: Arc<SubscriptionService>,
    pub balance: BalanceService,
    pub webhooks: WebhookDispatcher,
}

impl Billing {
    /// Create the billing services with configuration from the environment.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env().map_err(BillingError::Config)?;
        Ok(Self::new(config, pool, Arc::new(LogMailer)))
    }

    /// Create the billing services with explicit config.
    pub fn new(config: StripeConfig, pool: PgPool, mailer: Arc<dyn Mailer>) -> Self {
        let gateway = Arc::new(StripeClient::new(config.clone()));
        let store = Arc::new(PgOrganizationStore::new(pool.clone()));
        let access = Arc::new(PgAccessControl::new(pool));
        let notifier = Notifier::spawn(mailer);

        let subscriptions = Arc::new(SubscriptionService::new(
            gateway.clone(),
            store.clone(),
            access,
            notifier,
            config,
        ));

        Self {
            balance: BalanceService::new(gateway, store),
            webhooks: WebhookDispatcher::new(subscriptions.clone()),
            subscriptions,
        }
    }
}
