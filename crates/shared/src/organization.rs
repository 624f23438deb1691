//! Organization billing record and subscription state machine types.
//!
//! The subscription state is carried as an explicit tag next to the data
//! fields instead of being inferred from which optional fields happen to be
//! set. Lifecycle code matches on [`SubscriptionState`] exhaustively; the tag
//! is only ever changed through the mutators on [`Organization`], which keep
//! the tag and the fields consistent.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::constants::{DEFAULT_MAX_STORAGE_GB, STORAGE_GB_PER_SEAT};

/// Billing interval of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPlan {
    Monthly,
    Yearly,
}

impl SubscriptionPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::Monthly => "monthly",
            SubscriptionPlan::Yearly => "yearly",
        }
    }

    /// Parse a plan from user input. Input is trimmed and lowercased first.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "monthly" => Some(SubscriptionPlan::Monthly),
            "yearly" => Some(SubscriptionPlan::Yearly),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Explicit subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// No subscription exists on the gateway.
    NoSubscription,
    /// A subscription was created but the first charge still requires user
    /// authentication; the organization is not upgraded yet.
    PendingAuthentication,
    /// Paid tier, subscription running.
    Active,
    /// Paid tier, cancel-at-period-end requested; entitlements persist until
    /// the billing period elapses.
    Cancelling,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::NoSubscription => "no_subscription",
            SubscriptionState::PendingAuthentication => "pending_authentication",
            SubscriptionState::Active => "active",
            SubscriptionState::Cancelling => "cancelling",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "no_subscription" => Some(SubscriptionState::NoSubscription),
            "pending_authentication" => Some(SubscriptionState::PendingAuthentication),
            "active" => Some(SubscriptionState::Active),
            "cancelling" => Some(SubscriptionState::Cancelling),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Organization billing record.
///
/// Created together with the organization and alive for its entire lifetime.
/// The billing fields are mutated only by the subscription lifecycle
/// controller and the webhook dispatcher, through the mutators below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,

    /// True iff the organization currently has paid-tier entitlements.
    pub expert: bool,
    /// Derived entitlement: per-seat storage times billable member count
    /// while expert, a fixed default otherwise.
    pub max_storage_gb: i64,

    /// Billing profile on the payment processor. Once set it is never
    /// cleared except by explicit customer deletion, so the profile can be
    /// reused on re-subscription.
    pub stripe_customer_id: Option<String>,
    /// Present iff a subscription object exists on the processor
    /// (cancelled-but-not-yet-expired counts as present).
    pub stripe_subscription_id: Option<String>,
    /// Mirror of the default payment method.
    pub stripe_payment_method_id: Option<String>,
    /// Set only while a charge attempt awaits user authentication.
    pub stripe_payment_intent_client_secret: Option<String>,

    pub subscription_plan: Option<SubscriptionPlan>,
    /// True iff cancellation was requested but the billing period has not
    /// yet elapsed.
    pub subscription_cancelled: bool,
    /// Anchor date for monthly proration; set on first upgrade, advanced by
    /// the balance reconciliation job.
    pub subscription_cycle: Option<OffsetDateTime>,

    /// Explicit state tag, kept consistent with the fields above by the
    /// mutators on this type.
    pub state: SubscriptionState,
}

impl Organization {
    /// New organization on the free tier.
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            expert: false,
            max_storage_gb: DEFAULT_MAX_STORAGE_GB,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            stripe_payment_method_id: None,
            stripe_payment_intent_client_secret: None,
            subscription_plan: None,
            subscription_cancelled: false,
            subscription_cycle: None,
            state: SubscriptionState::NoSubscription,
        }
    }

    /// Record a freshly created gateway subscription. The organization stays
    /// non-expert until the first invoice is confirmed paid.
    pub fn attach_subscription(
        &mut self,
        customer_id: String,
        subscription_id: String,
        payment_method_id: String,
        plan: SubscriptionPlan,
    ) {
        self.stripe_customer_id = Some(customer_id);
        self.stripe_subscription_id = Some(subscription_id);
        self.stripe_payment_method_id = Some(payment_method_id);
        self.subscription_plan = Some(plan);
        self.subscription_cancelled = false;
        self.state = SubscriptionState::PendingAuthentication;
    }

    /// Grant paid-tier entitlements for the given billable seat count.
    /// Idempotent; the cycle anchor is only set if absent.
    pub fn upgrade(&mut self, billable_members: i64, cycle_anchor: OffsetDateTime) {
        self.expert = true;
        self.max_storage_gb = STORAGE_GB_PER_SEAT * billable_members;

        if self.subscription_cycle.is_none() {
            self.subscription_cycle = Some(cycle_anchor);
        }

        if self.state != SubscriptionState::Cancelling {
            self.state = SubscriptionState::Active;
        }
    }

    /// Mark cancel-at-period-end. Entitlements are untouched.
    pub fn mark_cancelled(&mut self) {
        self.subscription_cancelled = true;
        self.state = SubscriptionState::Cancelling;
    }

    /// Clear a previously requested cancellation.
    pub fn resume(&mut self) {
        self.subscription_cancelled = false;
        self.state = SubscriptionState::Active;
    }

    /// Drop all subscription state, keeping the customer profile. Used both
    /// for the webhook-driven downgrade and for resetting a half-completed
    /// upgrade.
    pub fn clear_subscription(&mut self) {
        self.stripe_subscription_id = None;
        self.stripe_payment_method_id = None;
        self.stripe_payment_intent_client_secret = None;
        self.subscription_plan = None;
        self.subscription_cancelled = false;
        self.state = SubscriptionState::NoSubscription;
    }

    /// Downgrade to the free tier. The customer id survives so the billing
    /// profile can be reused on re-subscription.
    pub fn downgrade(&mut self) {
        self.expert = false;
        self.max_storage_gb = DEFAULT_MAX_STORAGE_GB;
        self.subscription_cycle = None;
        self.clear_subscription();
    }
}

/// Organization membership, as far as billing is concerned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub active: bool,
    pub read_only: bool,
    pub is_admin: bool,
    pub last_seen_at: Option<OffsetDateTime>,
}

impl Member {
    /// Billable seats are active, non-read-only members.
    pub fn is_billable(&self) -> bool {
        self.active && !self.read_only
    }
}

/// Minimal user representation for admin notification fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
}
