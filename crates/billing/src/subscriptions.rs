//! Subscription lifecycle controller.
//!
//! Single writer for the billing fields on [`Organization`]: every
//! transition goes gateway first, then persists the new local state, then
//! enqueues admin notifications. A failed gateway call leaves the local
//! record untouched; a failed save after a successful gateway call is
//! reported as [`BillingError::Saving`] and leaves the remote state in
//! place for the next reconciliation.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use quill_shared::{
    AccessControl, Organization, OrganizationStore, StripeConfig, SubscriptionPlan,
    STORAGE_GB_PER_SEAT,
};

use crate::error::{invalid, BillingError, BillingResult};
use crate::gateway::{
    BillingGateway, CardDetails, CustomerDetails, CustomerProfile, Invoice, PaymentOutcome,
    TaxIdRequest,
};
use crate::notify::{Notification, Notifier};
use crate::order::Order;
use crate::tax;

/// Invoices per page in [`SubscriptionService::get_invoices`].
const INVOICE_PAGE_SIZE: u64 = 10;

/// Billing overview returned to organization admins.
#[derive(Debug, Clone)]
pub struct SubscriptionOverview {
    pub plan: Option<SubscriptionPlan>,
    pub cancelled: bool,
    /// Customer profile with the balance sign flipped: a positive number
    /// means credit in favor of the customer.
    pub customer: CustomerDetails,
    pub card: Option<CardDetails>,
    /// Present while a charge awaits user authentication.
    pub payment_intent_client_secret: Option<String>,
}

/// Subscription lifecycle operations.
pub struct SubscriptionService {
    gateway: Arc<dyn BillingGateway>,
    store: Arc<dyn OrganizationStore>,
    access: Arc<dyn AccessControl>,
    notifier: Notifier,
    config: StripeConfig,
}

impl SubscriptionService {
    pub fn new(
        gateway: Arc<dyn BillingGateway>,
        store: Arc<dyn OrganizationStore>,
        access: Arc<dyn AccessControl>,
        notifier: Notifier,
        config: StripeConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            access,
            notifier,
            config,
        }
    }

    /// Subscribe an organization to the paid plan.
    ///
    /// Returns the payment intent client secret if the first charge needs
    /// user authentication; the organization stays on the free tier until
    /// the paid invoice is confirmed through the webhook in that case.
    pub async fn subscribe(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        mut order: Order,
    ) -> BillingResult<Option<String>> {
        let plan = order.validate()?;
        self.ensure_admin(organization_id, user_id).await?;

        let mut orga = self.store.get_organization(organization_id).await?;

        if orga.expert && orga.stripe_subscription_id.is_some() {
            return Err(BillingError::ActiveSubscriptionExists);
        }

        // A subscription id without entitlements is a half-completed
        // upgrade, e.g. an abandoned authentication. Start over, but keep
        // track of the default payment method it left behind.
        let previous_pm = orga.stripe_payment_method_id.clone();
        if orga.stripe_subscription_id.is_some() {
            self.reset_subscription_state(&mut orga)
                .await
                .map_err(processing)?;
        }

        let billable = self.store.count_billable_members(organization_id).await?;
        if billable <= 0 {
            tracing::warn!(org_id = %organization_id, "no billable members, refusing to subscribe");
            return Err(BillingError::ProcessingPayment);
        }

        let profile = customer_profile(&order);
        let customer_id = match orga.stripe_customer_id.clone() {
            Some(customer_id) => {
                self.gateway
                    .update_customer(&customer_id, &profile)
                    .await
                    .map_err(processing)?;
                customer_id
            }
            None => self
                .gateway
                .create_customer(&profile)
                .await
                .map_err(processing)?,
        };

        // Swap out a previous default payment method before attaching the
        // new one, so the customer never carries two.
        if let Some(old_pm) = previous_pm {
            if old_pm != order.payment_method_id {
                self.gateway
                    .detach_payment_method(&old_pm)
                    .await
                    .map_err(processing)?;
            }
        }
        self.gateway
            .attach_payment_method(&order.payment_method_id, &customer_id)
            .await
            .map_err(processing)?;
        self.gateway
            .set_default_payment_method(&customer_id, &order.payment_method_id)
            .await
            .map_err(processing)?;

        let tax_rate =
            tax::tax_rate_id(&order.country, &order.tax_number, &self.config.domestic_tax_rate_id);
        let price_id = self.price_id(plan);

        let created = self
            .gateway
            .create_subscription(&customer_id, price_id, billable as u64, tax_rate)
            .await
            .map_err(processing)?;

        orga.attach_subscription(
            customer_id.clone(),
            created.id.clone(),
            order.payment_method_id.clone(),
            plan,
        );

        tracing::info!(
            org_id = %organization_id,
            customer_id = %customer_id,
            subscription_id = %created.id,
            plan = %plan,
            seats = billable,
            "created subscription"
        );

        let client_secret = match created.outcome {
            PaymentOutcome::Paid => {
                self.complete_upgrade(&mut orga).await?;
                None
            }
            PaymentOutcome::RequiresAction { client_secret } => {
                orga.stripe_payment_intent_client_secret = Some(client_secret.clone());
                self.save(&orga).await?;
                tracing::info!(
                    org_id = %orga.id,
                    "first charge requires authentication, waiting for webhook"
                );
                Some(client_secret)
            }
        };

        // One confirmation mail per subscribe, whatever the charge outcome;
        // the webhook-driven upgrade does not mail again.
        self.notify_admins(
            &orga,
            Notification::Subscribed {
                organization_name: orga.name.clone(),
            },
        )
        .await;

        Ok(client_secret)
    }

    /// Switch the billing interval. A no-op (without any gateway call) when
    /// the organization already is on the requested plan.
    pub async fn change_plan(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        interval: &str,
    ) -> BillingResult<()> {
        let plan = SubscriptionPlan::parse(interval)
            .ok_or_else(|| invalid("interval", "interval invalid"))?;
        self.ensure_admin(organization_id, user_id).await?;

        let mut orga = self.store.get_organization(organization_id).await?;
        let subscription_id = orga
            .stripe_subscription_id
            .clone()
            .ok_or(BillingError::SubscriptionNotFound)?;

        if orga.subscription_plan == Some(plan) {
            return Ok(());
        }

        let subscription = self.gateway.get_subscription(&subscription_id).await?;
        self.gateway
            .update_subscription_price(&subscription_id, &subscription.item_id, self.price_id(plan))
            .await?;

        orga.subscription_plan = Some(plan);
        self.save(&orga).await?;

        tracing::info!(
            org_id = %organization_id,
            subscription_id = %subscription_id,
            plan = %plan,
            "changed billing interval"
        );
        Ok(())
    }

    /// Request cancellation at the end of the billing period. Entitlements
    /// stay in place until the subscription actually ends.
    pub async fn cancel_subscription(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> BillingResult<()> {
        self.ensure_admin(organization_id, user_id).await?;

        let mut orga = self.store.get_organization(organization_id).await?;
        let subscription_id = orga
            .stripe_subscription_id
            .clone()
            .ok_or(BillingError::SubscriptionNotFound)?;

        if orga.subscription_cancelled {
            return Err(BillingError::SubscriptionAlreadyCancelled);
        }

        self.gateway
            .set_subscription_cancel_at_period_end(&subscription_id, true)
            .await?;

        orga.mark_cancelled();
        self.save(&orga).await?;
        self.notify_admins(
            &orga,
            Notification::Cancelled {
                organization_name: orga.name.clone(),
            },
        )
        .await;

        tracing::info!(
            org_id = %organization_id,
            subscription_id = %subscription_id,
            "cancelled subscription at period end"
        );
        Ok(())
    }

    /// Revoke a pending cancellation.
    pub async fn resume_subscription(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> BillingResult<()> {
        self.ensure_admin(organization_id, user_id).await?;

        let mut orga = self.store.get_organization(organization_id).await?;
        let subscription_id = orga
            .stripe_subscription_id
            .clone()
            .ok_or(BillingError::SubscriptionNotFound)?;

        if !orga.subscription_cancelled {
            return Err(BillingError::SubscriptionNotCancelled);
        }

        self.gateway
            .set_subscription_cancel_at_period_end(&subscription_id, false)
            .await?;

        orga.resume();
        self.save(&orga).await?;
        self.notify_admins(
            &orga,
            Notification::Resumed {
                organization_name: orga.name.clone(),
            },
        )
        .await;

        tracing::info!(
            org_id = %organization_id,
            subscription_id = %subscription_id,
            "resumed subscription"
        );
        Ok(())
    }

    /// Tear down subscription and customer on the gateway, e.g. when the
    /// organization itself is deleted. Admins are notified when
    /// `send_mails` is set.
    pub async fn delete_subscription_and_customer(
        &self,
        organization_id: Uuid,
        send_mails: bool,
    ) -> BillingResult<()> {
        let mut orga = self.store.get_organization(organization_id).await?;

        if let Some(subscription_id) = orga.stripe_subscription_id.clone() {
            self.gateway.cancel_subscription_now(&subscription_id).await?;
        }
        if let Some(customer_id) = orga.stripe_customer_id.clone() {
            self.gateway.delete_customer(&customer_id).await?;
        }

        if send_mails {
            self.notify_admins(
                &orga,
                Notification::SubscriptionEnded {
                    organization_name: orga.name.clone(),
                },
            )
            .await;
        }

        orga.downgrade();
        orga.stripe_customer_id = None;
        self.save(&orga).await?;

        tracing::info!(org_id = %organization_id, "deleted subscription and customer");
        Ok(())
    }

    /// Throw away a half-completed upgrade so the admin can start over.
    /// No-op for organizations that hold paid entitlements.
    pub async fn reset_subscription(&self, organization_id: Uuid) -> BillingResult<()> {
        let mut orga = self.store.get_organization(organization_id).await?;

        if orga.expert {
            return Ok(());
        }

        self.reset_subscription_state(&mut orga).await
    }

    /// Handle a paid invoice reported by the gateway: grant entitlements
    /// for the current billable seat count.
    pub async fn invoice_paid(&self, subscription_id: &str) -> BillingResult<()> {
        let mut orga = self
            .store
            .get_organization_by_subscription_id(subscription_id)
            .await?
            .ok_or(BillingError::OrganizationNotFound)?;

        self.complete_upgrade(&mut orga).await?;

        tracing::info!(
            org_id = %orga.id,
            subscription_id = %subscription_id,
            "invoice paid, organization upgraded"
        );
        Ok(())
    }

    /// Handle subscription deletion reported by the gateway: drop back to
    /// the free tier. Unknown subscriptions are ignored, the record was
    /// already cleaned up.
    pub async fn downgrade(&self, subscription_id: &str) -> BillingResult<()> {
        let Some(mut orga) = self
            .store
            .get_organization_by_subscription_id(subscription_id)
            .await?
        else {
            tracing::debug!(
                subscription_id = %subscription_id,
                "subscription deleted for unknown organization, ignoring"
            );
            return Ok(());
        };

        orga.downgrade();
        self.save(&orga).await?;
        self.notify_admins(
            &orga,
            Notification::SubscriptionEnded {
                organization_name: orga.name.clone(),
            },
        )
        .await;

        tracing::info!(
            org_id = %orga.id,
            subscription_id = %subscription_id,
            "organization downgraded to free tier"
        );
        Ok(())
    }

    /// Handle a recurring charge that needs user authentication: persist
    /// the client secret and point the admins at it.
    pub async fn payment_action_required(
        &self,
        customer_id: &str,
        payment_intent_id: &str,
    ) -> BillingResult<()> {
        let mut orga = self
            .store
            .get_organization_by_customer_id(customer_id)
            .await?
            .ok_or(BillingError::OrganizationNotFound)?;

        // Initial charges report their secret synchronously; only
        // subscribed organizations get the out-of-band flow.
        if !orga.expert {
            return Ok(());
        }

        let intent = self.gateway.get_payment_intent(payment_intent_id).await?;
        orga.stripe_payment_intent_client_secret = intent.client_secret;
        self.save(&orga).await?;
        self.notify_admins(
            &orga,
            Notification::PaymentActionRequired {
                organization_name: orga.name.clone(),
            },
        )
        .await;

        tracing::info!(
            org_id = %orga.id,
            customer_id = %customer_id,
            "payment requires user action"
        );
        Ok(())
    }

    /// Push the current billable seat count to the gateway after membership
    /// changed. No-op without a subscription.
    pub async fn update_subscription(&self, organization_id: Uuid) -> BillingResult<()> {
        let mut orga = self.store.get_organization(organization_id).await?;
        let Some(subscription_id) = orga.stripe_subscription_id.clone() else {
            return Ok(());
        };

        let billable = self.store.count_billable_members(organization_id).await?;
        let subscription = self.gateway.get_subscription(&subscription_id).await?;
        self.gateway
            .update_subscription_quantity(&subscription_id, &subscription.item_id, billable as u64)
            .await?;

        if orga.expert {
            orga.max_storage_gb = STORAGE_GB_PER_SEAT * billable;
            self.save(&orga).await?;
        }

        tracing::info!(
            org_id = %organization_id,
            subscription_id = %subscription_id,
            seats = billable,
            "updated subscription seat count"
        );
        Ok(())
    }

    /// Update the customer billing profile. The subscription tax rate is
    /// only touched when the country or tax number actually changed.
    pub async fn update_customer(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        mut order: Order,
    ) -> BillingResult<()> {
        order.validate_profile()?;
        self.ensure_admin(organization_id, user_id).await?;

        let orga = self.store.get_organization(organization_id).await?;
        let customer_id = orga
            .stripe_customer_id
            .clone()
            .ok_or(BillingError::CustomerNotFound)?;

        let existing = self.gateway.get_customer(&customer_id).await?;
        let tax_changed =
            existing.country != order.country || existing.tax_number != order.tax_number;

        self.gateway
            .update_customer(&customer_id, &customer_profile(&order))
            .await?;

        if tax_changed {
            if let Some(subscription_id) = orga.stripe_subscription_id.clone() {
                let tax_rate = tax::tax_rate_id(
                    &order.country,
                    &order.tax_number,
                    &self.config.domestic_tax_rate_id,
                );
                let subscription = self.gateway.get_subscription(&subscription_id).await?;
                self.gateway
                    .update_subscription_tax_rate(
                        &subscription_id,
                        &subscription.item_id,
                        tax_rate,
                    )
                    .await?;

                tracing::info!(
                    org_id = %organization_id,
                    subscription_id = %subscription_id,
                    country = %order.country,
                    "updated subscription tax rate"
                );
            }
        }

        Ok(())
    }

    /// Replace the default payment method.
    pub async fn update_payment_method(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        if payment_method_id.trim().is_empty() {
            return Err(invalid("payment_method", "payment method required"));
        }
        self.ensure_admin(organization_id, user_id).await?;

        let mut orga = self.store.get_organization(organization_id).await?;
        let customer_id = orga
            .stripe_customer_id
            .clone()
            .ok_or(BillingError::CustomerNotFound)?;

        self.gateway
            .attach_payment_method(payment_method_id, &customer_id)
            .await?;
        self.gateway
            .set_default_payment_method(&customer_id, payment_method_id)
            .await?;

        if let Some(old_pm) = orga.stripe_payment_method_id.clone() {
            if old_pm != payment_method_id {
                self.gateway.detach_payment_method(&old_pm).await?;
            }
        }

        orga.stripe_payment_method_id = Some(payment_method_id.to_owned());
        self.save(&orga).await?;

        tracing::info!(
            org_id = %organization_id,
            customer_id = %customer_id,
            "updated payment method"
        );
        Ok(())
    }

    /// Billing overview for the organization admins.
    pub async fn get_subscription(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> BillingResult<SubscriptionOverview> {
        self.ensure_admin(organization_id, user_id).await?;

        let orga = self.store.get_organization(organization_id).await?;
        let customer_id = orga
            .stripe_customer_id
            .clone()
            .ok_or(BillingError::CustomerNotFound)?;

        let mut customer = self.gateway.get_customer(&customer_id).await?;
        // Stripe reports credit as a negative balance; admins read it the
        // other way around.
        customer.balance = -customer.balance;

        let card = match orga.stripe_payment_method_id.as_deref() {
            Some(pm_id) => self.gateway.get_payment_method(pm_id).await?.card,
            None => None,
        };

        Ok(SubscriptionOverview {
            plan: orga.subscription_plan,
            cancelled: orga.subscription_cancelled,
            customer,
            card,
            payment_intent_client_secret: orga.stripe_payment_intent_client_secret.clone(),
        })
    }

    /// One page of invoices, newest first. Empty without a subscription.
    pub async fn get_invoices(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        starting_after: Option<&str>,
    ) -> BillingResult<Vec<Invoice>> {
        self.ensure_admin(organization_id, user_id).await?;

        let orga = self.store.get_organization(organization_id).await?;
        let Some(subscription_id) = orga.stripe_subscription_id.clone() else {
            return Ok(Vec::new());
        };

        self.gateway
            .list_invoices(&subscription_id, starting_after, INVOICE_PAGE_SIZE)
            .await
    }

    /// Grant entitlements after a confirmed payment. Idempotent.
    async fn complete_upgrade(&self, orga: &mut Organization) -> BillingResult<()> {
        let billable = self.store.count_billable_members(orga.id).await?;

        // Anchor the cycle just before now so the first reconciliation
        // window starts with this payment.
        orga.upgrade(billable, OffsetDateTime::now_utc() - Duration::days(1));
        orga.stripe_payment_intent_client_secret = None;
        self.save(orga).await
    }

    async fn reset_subscription_state(&self, orga: &mut Organization) -> BillingResult<()> {
        if let Some(subscription_id) = orga.stripe_subscription_id.clone() {
            self.gateway.cancel_subscription_now(&subscription_id).await?;
            tracing::info!(
                org_id = %orga.id,
                subscription_id = %subscription_id,
                "reset half-completed subscription"
            );
        }

        orga.clear_subscription();
        self.save(orga).await
    }

    fn price_id(&self, plan: SubscriptionPlan) -> &str {
        match plan {
            SubscriptionPlan::Monthly => &self.config.monthly_price_id,
            SubscriptionPlan::Yearly => &self.config.yearly_price_id,
        }
    }

    async fn ensure_admin(&self, organization_id: Uuid, user_id: Uuid) -> BillingResult<()> {
        let is_admin = self
            .access
            .is_organization_admin(organization_id, user_id)
            .await?;
        if is_admin {
            Ok(())
        } else {
            Err(BillingError::PermissionDenied)
        }
    }

    async fn save(&self, orga: &Organization) -> BillingResult<()> {
        self.store.save_organization(orga).await.map_err(|e| {
            tracing::error!(org_id = %orga.id, error = %e, "failed to save organization");
            BillingError::Saving
        })
    }

    /// Fan a notification out to the organization admins. Lookup failures
    /// are logged, never propagated.
    async fn notify_admins(&self, orga: &Organization, notification: Notification) {
        match self.store.find_admins(orga.id).await {
            Ok(admins) => self.notifier.notify(admins, notification),
            Err(e) => {
                tracing::error!(org_id = %orga.id, error = %e, "failed to load admins for notification");
            }
        }
    }
}

/// Gateway failures during the subscribe flow surface as a generic payment
/// processing error; the detail stays in the log.
fn processing(e: BillingError) -> BillingError {
    match e {
        BillingError::Gateway(detail) => {
            tracing::error!(error = %detail, "gateway call failed while subscribing");
            BillingError::ProcessingPayment
        }
        other => other,
    }
}

fn customer_profile(order: &Order) -> CustomerProfile {
    CustomerProfile {
        email: order.email.clone(),
        name: order.name.clone(),
        country: order.country.clone(),
        address_line_1: order.address_line_1.clone(),
        address_line_2: order.address_line_2.clone(),
        postal_code: order.postal_code.clone(),
        city: order.city.clone(),
        phone: order.phone.clone(),
        tax_exempt: tax::tax_exemption(&order.country),
        tax_id: if order.tax_number.is_empty() {
            None
        } else {
            Some(TaxIdRequest {
                value: order.tax_number.clone(),
                id_type: tax::tax_id_type(&order.country),
            })
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::scripted::{GatewayCall, ScriptedGateway};
    use crate::gateway::{CreatedSubscription, PaymentMethodDetails, SubscriptionDetails};
    use crate::notify::recording::RecordingMailer;
    use quill_shared::{
        Member, MemoryAccessControl, MemoryStore, SubscriptionState, DEFAULT_MAX_STORAGE_GB,
    };

    struct Harness {
        service: SubscriptionService,
        gateway: Arc<ScriptedGateway>,
        store: Arc<MemoryStore>,
        mailer: Arc<RecordingMailer>,
        org_id: Uuid,
        admin_id: Uuid,
    }

    fn member(org_id: Uuid, admin: bool) -> Member {
        Member {
            user_id: Uuid::new_v4(),
            organization_id: org_id,
            active: true,
            read_only: false,
            is_admin: admin,
            last_seen_at: None,
        }
    }

    fn harness() -> Harness {
        let gateway = Arc::new(ScriptedGateway::new());
        let store = Arc::new(MemoryStore::new());
        let access = Arc::new(MemoryAccessControl::new());
        let mailer = Arc::new(RecordingMailer::new());
        let notifier = Notifier::spawn(mailer.clone());

        let org_id = Uuid::new_v4();
        let orga = Organization::new(org_id, "acme");
        store.insert_organization(orga);

        let admin = member(org_id, true);
        let admin_id = admin.user_id;
        store.insert_member(admin, "admin@acme.test");
        access.grant_admin(org_id, admin_id);

        let service = SubscriptionService::new(
            gateway.clone(),
            store.clone(),
            access.clone(),
            notifier,
            StripeConfig::test(),
        );

        Harness {
            service,
            gateway,
            store,
            mailer,
            org_id,
            admin_id,
        }
    }

    fn order() -> Order {
        Order {
            email: "billing@acme.test".into(),
            name: "ACME Inc.".into(),
            country: "DE".into(),
            address_line_1: "Musterstr. 1".into(),
            address_line_2: String::new(),
            postal_code: "10115".into(),
            city: "Berlin".into(),
            phone: String::new(),
            tax_number: String::new(),
            interval: "monthly".into(),
            payment_method_id: "pm_new".into(),
        }
    }

    fn script_paid_subscription(gateway: &ScriptedGateway) {
        if let Ok(mut next) = gateway.next_subscription.lock() {
            *next = Some(CreatedSubscription {
                id: "sub_1".into(),
                outcome: PaymentOutcome::Paid,
            });
        }
    }

    async fn org(h: &Harness) -> Organization {
        h.store.get_organization(h.org_id).await.unwrap()
    }

    async fn wait_for_mails(mailer: &RecordingMailer, count: usize) {
        for _ in 0..100 {
            if mailer.sent().len() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn subscribe_upgrades_on_paid_charge() {
        let h = harness();
        script_paid_subscription(&h.gateway);

        let secret = h.service.subscribe(h.org_id, h.admin_id, order()).await.unwrap();
        assert!(secret.is_none());

        let orga = org(&h).await;
        assert!(orga.expert);
        assert_eq!(orga.state, SubscriptionState::Active);
        assert_eq!(orga.max_storage_gb, STORAGE_GB_PER_SEAT);
        assert_eq!(orga.stripe_subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(orga.stripe_payment_method_id.as_deref(), Some("pm_new"));
        assert!(orga.subscription_cycle.is_some());

        let calls = h.gateway.calls();
        assert!(matches!(calls[0], GatewayCall::CreateCustomer(_)));
        assert!(calls.iter().any(|c| matches!(
            c,
            GatewayCall::AttachPaymentMethod(pm, _) if pm == "pm_new"
        )));
        assert!(calls.iter().any(|c| matches!(
            c,
            GatewayCall::SetDefaultPaymentMethod(_, pm) if pm == "pm_new"
        )));
        // Domestic order, so the domestic tax rate goes on the item.
        assert!(calls.iter().any(|c| matches!(
            c,
            GatewayCall::CreateSubscription { quantity: 1, tax_rate_id: Some(rate), .. }
                if rate == "txr_de_test"
        )));
    }

    #[tokio::test]
    async fn subscribe_with_pending_authentication_defers_upgrade() {
        let h = harness();
        if let Ok(mut next) = h.gateway.next_subscription.lock() {
            *next = Some(CreatedSubscription {
                id: "sub_1".into(),
                outcome: PaymentOutcome::RequiresAction {
                    client_secret: "pi_secret".into(),
                },
            });
        }

        let secret = h.service.subscribe(h.org_id, h.admin_id, order()).await.unwrap();
        assert_eq!(secret.as_deref(), Some("pi_secret"));

        let orga = org(&h).await;
        assert!(!orga.expert);
        assert_eq!(orga.state, SubscriptionState::PendingAuthentication);
        assert_eq!(
            orga.stripe_payment_intent_client_secret.as_deref(),
            Some("pi_secret")
        );

        // The confirmation mail goes out right away, not on the webhook.
        wait_for_mails(&h.mailer, 1).await;
        assert_eq!(h.mailer.sent().len(), 1);

        // The paid webhook completes the upgrade and clears the secret,
        // without mailing a second time.
        h.service.invoice_paid("sub_1").await.unwrap();
        let orga = org(&h).await;
        assert!(orga.expert);
        assert_eq!(orga.state, SubscriptionState::Active);
        assert!(orga.stripe_payment_intent_client_secret.is_none());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(h.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_requires_admin() {
        let h = harness();
        let err = h
            .service
            .subscribe(h.org_id, Uuid::new_v4(), order())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PermissionDenied));
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_rejects_active_subscription() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        orga.upgrade(1, OffsetDateTime::now_utc());
        h.store.insert_organization(orga);

        let err = h
            .service
            .subscribe(h.org_id, h.admin_id, order())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ActiveSubscriptionExists));
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_resets_half_completed_upgrade() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_stale".into(),
            "pm_old".into(),
            SubscriptionPlan::Monthly,
        );
        h.store.insert_organization(orga);
        script_paid_subscription(&h.gateway);

        h.service.subscribe(h.org_id, h.admin_id, order()).await.unwrap();

        let calls = h.gateway.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            GatewayCall::CancelNow(id) if id == "sub_stale"
        )));
        // The stale default payment method is swapped for the new one.
        assert!(calls.contains(&GatewayCall::DetachPaymentMethod("pm_old".into())));
        // Existing customer profile is reused and updated, not recreated.
        assert!(calls.iter().any(|c| matches!(
            c,
            GatewayCall::UpdateCustomer(id, _) if id == "cus_1"
        )));
        assert!(!calls.iter().any(|c| matches!(c, GatewayCall::CreateCustomer(_))));

        let orga = org(&h).await;
        assert_eq!(orga.stripe_subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(orga.stripe_customer_id.as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn subscribe_without_billable_members_fails() {
        let gateway = Arc::new(ScriptedGateway::new());
        let store = Arc::new(MemoryStore::new());
        let access = Arc::new(MemoryAccessControl::new());
        let mailer = Arc::new(RecordingMailer::new());
        let org_id = Uuid::new_v4();
        store.insert_organization(Organization::new(org_id, "empty"));
        let admin_id = Uuid::new_v4();
        access.grant_admin(org_id, admin_id);

        let service = SubscriptionService::new(
            gateway.clone(),
            store,
            access,
            Notifier::spawn(mailer),
            StripeConfig::test(),
        );

        let err = service.subscribe(org_id, admin_id, order()).await.unwrap_err();
        assert!(matches!(err, BillingError::ProcessingPayment));
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_maps_gateway_failures_to_processing_payment() {
        let h = harness();
        h.gateway.fail("create_subscription");

        let err = h
            .service
            .subscribe(h.org_id, h.admin_id, order())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ProcessingPayment));

        h.gateway.fail("attach_payment_method");
        let err = h
            .service
            .subscribe(h.org_id, h.admin_id, order())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ProcessingPayment));
    }

    #[tokio::test]
    async fn save_failure_after_gateway_success_keeps_remote_state() {
        let h = harness();
        script_paid_subscription(&h.gateway);
        h.store.set_fail_saves(true);

        let err = h
            .service
            .subscribe(h.org_id, h.admin_id, order())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Saving));

        // The subscription was created on the gateway and is not rolled back.
        assert!(h
            .gateway
            .calls()
            .iter()
            .any(|c| matches!(c, GatewayCall::CreateSubscription { .. })));
    }

    #[tokio::test]
    async fn change_plan_to_same_plan_touches_nothing() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        h.store.insert_organization(orga);

        h.service
            .change_plan(h.org_id, h.admin_id, "monthly")
            .await
            .unwrap();
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn change_plan_switches_price() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        h.store.insert_organization(orga);
        if let Ok(mut sub) = h.gateway.subscription.lock() {
            *sub = Some(SubscriptionDetails {
                id: "sub_1".into(),
                item_id: "si_1".into(),
                ..Default::default()
            });
        }

        h.service
            .change_plan(h.org_id, h.admin_id, "yearly")
            .await
            .unwrap();

        assert!(h.gateway.calls().iter().any(|c| matches!(
            c,
            GatewayCall::UpdatePrice(sub, item, price)
                if sub == "sub_1" && item == "si_1" && price == "price_yearly_test"
        )));
        assert_eq!(org(&h).await.subscription_plan, Some(SubscriptionPlan::Yearly));
    }

    #[tokio::test]
    async fn change_plan_rejects_unknown_interval() {
        let h = harness();
        let err = h
            .service
            .change_plan(h.org_id, h.admin_id, "weekly")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn cancel_and_resume_round_trip() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        orga.upgrade(1, OffsetDateTime::now_utc());
        h.store.insert_organization(orga);

        h.service.cancel_subscription(h.org_id, h.admin_id).await.unwrap();
        let orga = org(&h).await;
        assert!(orga.subscription_cancelled);
        assert_eq!(orga.state, SubscriptionState::Cancelling);

        let err = h
            .service
            .cancel_subscription(h.org_id, h.admin_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionAlreadyCancelled));

        h.service.resume_subscription(h.org_id, h.admin_id).await.unwrap();
        let orga = org(&h).await;
        assert!(!orga.subscription_cancelled);
        assert_eq!(orga.state, SubscriptionState::Active);

        let calls = h.gateway.calls();
        assert!(calls.contains(&GatewayCall::SetCancelAtPeriodEnd("sub_1".into(), true)));
        assert!(calls.contains(&GatewayCall::SetCancelAtPeriodEnd("sub_1".into(), false)));
    }

    #[tokio::test]
    async fn resume_without_cancellation_fails() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        h.store.insert_organization(orga);

        let err = h
            .service
            .resume_subscription(h.org_id, h.admin_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionNotCancelled));
    }

    #[tokio::test]
    async fn reset_is_noop_for_paid_organizations() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        orga.upgrade(1, OffsetDateTime::now_utc());
        h.store.insert_organization(orga);

        h.service.reset_subscription(h.org_id).await.unwrap();
        assert_eq!(h.gateway.call_count(), 0);
        assert!(org(&h).await.stripe_subscription_id.is_some());
    }

    #[tokio::test]
    async fn downgrade_ignores_unknown_subscription() {
        let h = harness();
        h.service.downgrade("sub_unknown").await.unwrap();
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn downgrade_moves_organization_to_free_tier() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        orga.upgrade(3, OffsetDateTime::now_utc());
        h.store.insert_organization(orga);

        h.service.downgrade("sub_1").await.unwrap();

        let orga = org(&h).await;
        assert!(!orga.expert);
        assert_eq!(orga.max_storage_gb, DEFAULT_MAX_STORAGE_GB);
        assert_eq!(orga.stripe_customer_id.as_deref(), Some("cus_1"));
        assert!(orga.stripe_subscription_id.is_none());
    }

    #[tokio::test]
    async fn payment_action_required_persists_client_secret() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        orga.upgrade(1, OffsetDateTime::now_utc());
        h.store.insert_organization(orga);
        if let Ok(mut intent) = h.gateway.payment_intent.lock() {
            *intent = Some(crate::gateway::PaymentIntentDetails {
                id: "pi_1".into(),
                client_secret: Some("pi_secret_2".into()),
            });
        }

        h.service
            .payment_action_required("cus_1", "pi_1")
            .await
            .unwrap();

        assert_eq!(
            org(&h).await.stripe_payment_intent_client_secret.as_deref(),
            Some("pi_secret_2")
        );
    }

    #[tokio::test]
    async fn payment_action_required_for_unknown_customer_is_an_error() {
        let h = harness();
        let err = h
            .service
            .payment_action_required("cus_unknown", "pi_1")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::OrganizationNotFound));
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn payment_action_required_ignores_free_tier() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.stripe_customer_id = Some("cus_1".into());
        h.store.insert_organization(orga);

        h.service
            .payment_action_required("cus_1", "pi_1")
            .await
            .unwrap();
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn update_subscription_pushes_seat_count_and_storage() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        orga.upgrade(1, OffsetDateTime::now_utc());
        h.store.insert_organization(orga);
        h.store.insert_member(member(h.org_id, false), "second@acme.test");
        if let Ok(mut sub) = h.gateway.subscription.lock() {
            *sub = Some(SubscriptionDetails {
                id: "sub_1".into(),
                item_id: "si_1".into(),
                ..Default::default()
            });
        }

        h.service.update_subscription(h.org_id).await.unwrap();

        assert!(h.gateway.calls().iter().any(|c| matches!(
            c,
            GatewayCall::UpdateQuantity(sub, item, 2) if sub == "sub_1" && item == "si_1"
        )));
        assert_eq!(org(&h).await.max_storage_gb, STORAGE_GB_PER_SEAT * 2);
    }

    #[tokio::test]
    async fn update_subscription_without_subscription_is_noop() {
        let h = harness();
        h.service.update_subscription(h.org_id).await.unwrap();
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn update_customer_pushes_tax_rate_only_on_change() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        orga.upgrade(1, OffsetDateTime::now_utc());
        h.store.insert_organization(orga);

        if let Ok(mut customer) = h.gateway.customer.lock() {
            *customer = Some(CustomerDetails {
                id: "cus_1".into(),
                country: "DE".into(),
                tax_number: String::new(),
                ..Default::default()
            });
        }
        if let Ok(mut sub) = h.gateway.subscription.lock() {
            *sub = Some(SubscriptionDetails {
                id: "sub_1".into(),
                item_id: "si_1".into(),
                ..Default::default()
            });
        }

        // Same country and tax number: no tax rate call.
        h.service
            .update_customer(h.org_id, h.admin_id, order())
            .await
            .unwrap();
        assert!(!h
            .gateway
            .calls()
            .iter()
            .any(|c| matches!(c, GatewayCall::UpdateTaxRate(..))));

        // Move to France with a VAT id: reverse charge clears the rate.
        let mut fr_order = order();
        fr_order.country = "FR".into();
        fr_order.tax_number = "FR123456789".into();
        h.service
            .update_customer(h.org_id, h.admin_id, fr_order)
            .await
            .unwrap();
        assert!(h.gateway.calls().iter().any(|c| matches!(
            c,
            GatewayCall::UpdateTaxRate(_, _, None)
        )));
    }

    #[tokio::test]
    async fn update_payment_method_swaps_default() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_old".into(),
            SubscriptionPlan::Monthly,
        );
        h.store.insert_organization(orga);

        h.service
            .update_payment_method(h.org_id, h.admin_id, "pm_new")
            .await
            .unwrap();

        let calls = h.gateway.calls();
        assert!(calls.contains(&GatewayCall::AttachPaymentMethod(
            "pm_new".into(),
            "cus_1".into()
        )));
        assert!(calls.contains(&GatewayCall::SetDefaultPaymentMethod(
            "cus_1".into(),
            "pm_new".into()
        )));
        assert!(calls.contains(&GatewayCall::DetachPaymentMethod("pm_old".into())));
        assert_eq!(
            org(&h).await.stripe_payment_method_id.as_deref(),
            Some("pm_new")
        );
    }

    #[tokio::test]
    async fn get_subscription_flips_balance_sign() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        h.store.insert_organization(orga);

        if let Ok(mut customer) = h.gateway.customer.lock() {
            *customer = Some(CustomerDetails {
                id: "cus_1".into(),
                balance: -1500,
                ..Default::default()
            });
        }
        if let Ok(mut pm) = h.gateway.payment_method.lock() {
            *pm = Some(PaymentMethodDetails {
                id: "pm_1".into(),
                card: Some(CardDetails {
                    brand: "visa".into(),
                    last4: "4242".into(),
                    exp_month: 12,
                    exp_year: 2030,
                }),
            });
        }

        let overview = h
            .service
            .get_subscription(h.org_id, h.admin_id)
            .await
            .unwrap();
        assert_eq!(overview.customer.balance, 1500);
        assert_eq!(overview.plan, Some(SubscriptionPlan::Monthly));
        assert_eq!(overview.card.map(|c| c.last4), Some("4242".into()));
    }

    #[tokio::test]
    async fn get_invoices_without_subscription_is_empty() {
        let h = harness();
        let invoices = h
            .service
            .get_invoices(h.org_id, h.admin_id, None)
            .await
            .unwrap();
        assert!(invoices.is_empty());
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn get_invoices_requests_one_page() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        h.store.insert_organization(orga);

        h.service
            .get_invoices(h.org_id, h.admin_id, Some("in_5"))
            .await
            .unwrap();

        assert!(h.gateway.calls().iter().any(|c| matches!(
            c,
            GatewayCall::ListInvoices { subscription_id, starting_after: Some(after), limit: 10 }
                if subscription_id == "sub_1" && after == "in_5"
        )));
    }

    #[tokio::test]
    async fn delete_tears_down_gateway_state() {
        let h = harness();
        let mut orga = org(&h).await;
        orga.attach_subscription(
            "cus_1".into(),
            "sub_1".into(),
            "pm_1".into(),
            SubscriptionPlan::Monthly,
        );
        orga.upgrade(1, OffsetDateTime::now_utc());
        h.store.insert_organization(orga);

        h.service
            .delete_subscription_and_customer(h.org_id, false)
            .await
            .unwrap();

        let calls = h.gateway.calls();
        assert!(calls.contains(&GatewayCall::CancelNow("sub_1".into())));
        assert!(calls.contains(&GatewayCall::DeleteCustomer("cus_1".into())));

        let orga = org(&h).await;
        assert!(orga.stripe_customer_id.is_none());
        assert!(!orga.expert);
        assert!(h.mailer.sent().is_empty());
    }
}
