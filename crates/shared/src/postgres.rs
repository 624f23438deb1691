//! Postgres implementations of the storage and access-control capabilities.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::organization::{Organization, SubscriptionPlan, SubscriptionState, User};
use crate::store::{AccessControl, OrganizationStore, StoreError};

#[derive(sqlx::FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    expert: bool,
    max_storage_gb: i64,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_payment_method_id: Option<String>,
    stripe_payment_intent_client_secret: Option<String>,
    subscription_plan: Option<String>,
    subscription_cancelled: bool,
    subscription_cycle: Option<OffsetDateTime>,
    subscription_state: String,
}

impl OrganizationRow {
    fn into_organization(self) -> Result<Organization, StoreError> {
        let plan = match self.subscription_plan.as_deref() {
            Some(s) => Some(SubscriptionPlan::parse(s).ok_or_else(|| {
                StoreError::Database(format!("unknown subscription plan '{}'", s))
            })?),
            None => None,
        };
        let state = SubscriptionState::parse(&self.subscription_state).ok_or_else(|| {
            StoreError::Database(format!(
                "unknown subscription state '{}'",
                self.subscription_state
            ))
        })?;

        Ok(Organization {
            id: self.id,
            name: self.name,
            expert: self.expert,
            max_storage_gb: self.max_storage_gb,
            stripe_customer_id: self.stripe_customer_id,
            stripe_subscription_id: self.stripe_subscription_id,
            stripe_payment_method_id: self.stripe_payment_method_id,
            stripe_payment_intent_client_secret: self.stripe_payment_intent_client_secret,
            subscription_plan: plan,
            subscription_cancelled: self.subscription_cancelled,
            subscription_cycle: self.subscription_cycle,
            state,
        })
    }
}

const ORGANIZATION_COLUMNS: &str = "id, name, expert, max_storage_gb, stripe_customer_id, \
     stripe_subscription_id, stripe_payment_method_id, \
     stripe_payment_intent_client_secret, subscription_plan, \
     subscription_cancelled, subscription_cycle, subscription_state";

/// Organization storage backed by Postgres.
pub struct PgOrganizationStore {
    pool: PgPool,
}

impl PgOrganizationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrganizationStore for PgOrganizationStore {
    async fn get_organization(&self, id: Uuid) -> Result<Organization, StoreError> {
        let row: Option<OrganizationRow> = sqlx::query_as(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StoreError::NotFound)?.into_organization()
    }

    async fn get_organization_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Organization>, StoreError> {
        let row: Option<OrganizationRow> = sqlx::query_as(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE stripe_subscription_id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OrganizationRow::into_organization).transpose()
    }

    async fn get_organization_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<Organization>, StoreError> {
        let row: Option<OrganizationRow> = sqlx::query_as(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE stripe_customer_id = $1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OrganizationRow::into_organization).transpose()
    }

    async fn save_organization(&self, orga: &Organization) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE organizations SET
                expert = $1,
                max_storage_gb = $2,
                stripe_customer_id = $3,
                stripe_subscription_id = $4,
                stripe_payment_method_id = $5,
                stripe_payment_intent_client_secret = $6,
                subscription_plan = $7,
                subscription_cancelled = $8,
                subscription_cycle = $9,
                subscription_state = $10,
                updated_at = NOW()
            WHERE id = $11
            "#,
        )
        .bind(orga.expert)
        .bind(orga.max_storage_gb)
        .bind(&orga.stripe_customer_id)
        .bind(&orga.stripe_subscription_id)
        .bind(&orga.stripe_payment_method_id)
        .bind(&orga.stripe_payment_intent_client_secret)
        .bind(orga.subscription_plan.map(|p| p.as_str()))
        .bind(orga.subscription_cancelled)
        .bind(orga.subscription_cycle)
        .bind(orga.state.as_str())
        .bind(orga.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_billable_members(&self, organization_id: Uuid) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM organization_members \
             WHERE organization_id = $1 AND active AND NOT read_only",
        )
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn count_members_seen_since(
        &self,
        organization_id: Uuid,
        since: OffsetDateTime,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM organization_members \
             WHERE organization_id = $1 AND active AND NOT read_only \
             AND last_seen_at > $2",
        )
        .bind(organization_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn find_subscription_cycle_elapsed(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<Organization>, StoreError> {
        let rows: Vec<OrganizationRow> = sqlx::query_as(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations \
             WHERE subscription_cycle IS NOT NULL \
             AND subscription_cycle <= $1 - INTERVAL '1 month'"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(OrganizationRow::into_organization)
            .collect()
    }

    async fn find_admins(&self, organization_id: Uuid) -> Result<Vec<User>, StoreError> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT u.id, u.email FROM users u \
             JOIN organization_members m ON m.user_id = u.id \
             WHERE m.organization_id = $1 AND m.active AND m.is_admin \
             ORDER BY u.email",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, email)| User { id, email })
            .collect())
    }
}

/// Admin checks backed by the membership table.
pub struct PgAccessControl {
    pool: PgPool,
}

impl PgAccessControl {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccessControl for PgAccessControl {
    async fn is_organization_admin(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StoreError> {
        let is_admin: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM organization_members \
             WHERE organization_id = $1 AND user_id = $2 AND active AND is_admin)",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(is_admin)
    }
}
