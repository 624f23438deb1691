//! Storage and access-control capabilities.
//!
//! Both are trait objects injected into the billing services so that the
//! Postgres backend can be swapped for the in-memory one in tests.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::organization::{Organization, User};

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("organization not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Persistence capability for organization billing records and the member
/// counts derived from them.
///
/// Billable member counts are recomputed on every call and never cached;
/// membership can change between any two transitions.
#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn get_organization(&self, id: Uuid) -> Result<Organization, StoreError>;

    async fn get_organization_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Organization>, StoreError>;

    async fn get_organization_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<Organization>, StoreError>;

    /// Persist the record after a gateway-confirmed state change.
    async fn save_organization(&self, orga: &Organization) -> Result<(), StoreError>;

    /// Active, non-read-only members.
    async fn count_billable_members(&self, organization_id: Uuid) -> Result<i64, StoreError>;

    /// Billable members whose last-seen timestamp is after `since`.
    async fn count_members_seen_since(
        &self,
        organization_id: Uuid,
        since: OffsetDateTime,
    ) -> Result<i64, StoreError>;

    /// Organizations whose subscription cycle anchor lies at least one full
    /// month in the past. Selection for the balance reconciliation job.
    async fn find_subscription_cycle_elapsed(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<Organization>, StoreError>;

    /// Administrators of the organization, for notification fan-out.
    async fn find_admins(&self, organization_id: Uuid) -> Result<Vec<User>, StoreError>;
}

/// Permission-check capability, consulted before any admin-triggered
/// operation touches the gateway.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn is_organization_admin(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StoreError>;
}
