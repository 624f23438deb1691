//! Monthly balance reconciliation.
//!
//! Seat charges are billed up front for every billable member; members who
//! never showed up during the billing month are credited back on the
//! customer balance, so the next invoice settles against it. The job runs
//! daily, picks every organization whose cycle anchor lies at least one
//! month in the past, credits the inactive seats, and advances the anchor
//! by one calendar month. An organization whose seats were all active gets
//! no adjustment and keeps its anchor untouched.
//!
//! Organizations are processed by a small pool of consumers fed through a
//! rendezvous channel; one failing organization is logged and skipped, it
//! never stops the run.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};

use quill_shared::{Organization, OrganizationStore};

use crate::error::{BillingError, BillingResult};
use crate::gateway::BillingGateway;

const CONSUMERS: usize = 10;
const CREDIT_CURRENCY: &str = "usd";

/// Balance reconciliation over all organizations with an elapsed cycle.
#[derive(Clone)]
pub struct BalanceService {
    gateway: Arc<dyn BillingGateway>,
    store: Arc<dyn OrganizationStore>,
}

impl BalanceService {
    pub fn new(gateway: Arc<dyn BillingGateway>, store: Arc<dyn OrganizationStore>) -> Self {
        Self { gateway, store }
    }

    /// One reconciliation run.
    pub async fn update_balances(&self) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let organizations = self.store.find_subscription_cycle_elapsed(now).await?;

        tracing::info!(
            count = organizations.len(),
            "reconciling subscription balances"
        );

        let (tx, rx) = mpsc::channel::<Organization>(1);
        let rx = Arc::new(Mutex::new(rx));

        let mut consumers = Vec::with_capacity(CONSUMERS);
        for _ in 0..CONSUMERS {
            let rx = rx.clone();
            let service = self.clone();
            consumers.push(tokio::spawn(async move {
                loop {
                    let orga = { rx.lock().await.recv().await };
                    let Some(orga) = orga else { break };

                    let org_id = orga.id;
                    if let Err(e) = service.reconcile(orga).await {
                        tracing::error!(org_id = %org_id, error = %e, "balance reconciliation failed");
                    }
                }
            }));
        }

        for orga in organizations {
            if tx.send(orga).await.is_err() {
                break;
            }
        }
        drop(tx);

        for consumer in consumers {
            if let Err(e) = consumer.await {
                tracing::error!(error = %e, "balance consumer panicked");
            }
        }

        Ok(())
    }

    /// Credit inactive seats for one organization and advance its cycle.
    /// Leaves the record untouched when every seat was active.
    async fn reconcile(&self, mut orga: Organization) -> BillingResult<()> {
        let Some(cycle) = orga.subscription_cycle else {
            tracing::warn!(org_id = %orga.id, "organization selected without cycle anchor, skipping");
            return Ok(());
        };
        let Some(customer_id) = orga.stripe_customer_id.clone() else {
            tracing::warn!(org_id = %orga.id, "organization has no customer, skipping");
            return Ok(());
        };
        let Some(subscription_id) = orga.stripe_subscription_id.clone() else {
            tracing::warn!(org_id = %orga.id, "organization has no subscription, skipping");
            return Ok(());
        };

        let subscription = self.gateway.get_subscription(&subscription_id).await?;
        let price = subscription.unit_amount;

        let billable = self.store.count_billable_members(orga.id).await?;
        let seen = self.store.count_members_seen_since(orga.id, cycle).await?;
        let inactive = billable - seen;

        let amount = -(inactive * price);
        if amount >= 0 {
            tracing::debug!(org_id = %orga.id, "all seats active, nothing to credit");
            return Ok(());
        }

        self.gateway
            .add_balance(
                &customer_id,
                amount,
                CREDIT_CURRENCY,
                &format!("Organization ID: {}", orga.id),
            )
            .await?;

        tracing::info!(
            org_id = %orga.id,
            customer_id = %customer_id,
            inactive = inactive,
            amount = amount,
            "credited inactive seats"
        );

        orga.subscription_cycle = Some(advance_one_month(cycle));
        self.store
            .save_organization(&orga)
            .await
            .map_err(|_| BillingError::Saving)?;

        Ok(())
    }
}

/// One calendar month later, clamping the day to the target month's length
/// (Jan 31 + 1 month = Feb 28/29).
fn advance_one_month(ts: OffsetDateTime) -> OffsetDateTime {
    let date = ts.date();
    let (year, month) = match date.month() {
        time::Month::December => (date.year() + 1, time::Month::January),
        month => (date.year(), month.next()),
    };
    let day = date.day().min(time::util::days_in_year_month(year, month));

    match time::Date::from_calendar_date(year, month, day) {
        Ok(new_date) => ts.replace_date(new_date),
        Err(_) => ts,
    }
}
