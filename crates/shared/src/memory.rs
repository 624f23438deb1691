//! In-memory implementations of the storage and access-control
//! capabilities, for tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::organization::{Member, Organization, User};
use crate::store::{AccessControl, OrganizationStore, StoreError};

#[derive(Default)]
struct Inner {
    organizations: HashMap<Uuid, Organization>,
    members: Vec<Member>,
    users: HashMap<Uuid, User>,
}

/// Organization storage held in a mutex-guarded map.
///
/// `fail_saves` makes every `save_organization` call fail, for exercising
/// the persistence failure paths.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_saves: Mutex<bool>,
    saves: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_organization(&self, orga: Organization) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.organizations.insert(orga.id, orga);
        }
    }

    pub fn insert_member(&self, member: Member, email: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.users.insert(
                member.user_id,
                User {
                    id: member.user_id,
                    email: email.into(),
                },
            );
            inner.members.push(member);
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        if let Ok(mut f) = self.fail_saves.lock() {
            *f = fail;
        }
    }

    /// Number of successful `save_organization` calls.
    pub fn save_count(&self) -> u64 {
        self.saves.lock().map(|s| *s).unwrap_or(0)
    }
}

#[async_trait]
impl OrganizationStore for MemoryStore {
    async fn get_organization(&self, id: Uuid) -> Result<Organization, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        inner
            .organizations
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_organization_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Organization>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(inner
            .organizations
            .values()
            .find(|o| o.stripe_subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn get_organization_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<Organization>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(inner
            .organizations
            .values()
            .find(|o| o.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn save_organization(&self, orga: &Organization) -> Result<(), StoreError> {
        if self.fail_saves.lock().map(|f| *f).unwrap_or(false) {
            return Err(StoreError::Database("save failed (scripted)".into()));
        }

        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        inner.organizations.insert(orga.id, orga.clone());

        if let Ok(mut saves) = self.saves.lock() {
            *saves += 1;
        }
        Ok(())
    }

    async fn count_billable_members(&self, organization_id: Uuid) -> Result<i64, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(inner
            .members
            .iter()
            .filter(|m| m.organization_id == organization_id && m.is_billable())
            .count() as i64)
    }

    async fn count_members_seen_since(
        &self,
        organization_id: Uuid,
        since: OffsetDateTime,
    ) -> Result<i64, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(inner
            .members
            .iter()
            .filter(|m| {
                m.organization_id == organization_id
                    && m.is_billable()
                    && m.last_seen_at.map(|seen| seen > since).unwrap_or(false)
            })
            .count() as i64)
    }

    async fn find_subscription_cycle_elapsed(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<Organization>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        // One-month selection window approximated with 30 days; the Postgres
        // implementation uses a calendar interval.
        Ok(inner
            .organizations
            .values()
            .filter(|o| {
                o.subscription_cycle
                    .map(|cycle| cycle + Duration::days(30) <= now)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn find_admins(&self, organization_id: Uuid) -> Result<Vec<User>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let mut admins: Vec<User> = inner
            .members
            .iter()
            .filter(|m| m.organization_id == organization_id && m.active && m.is_admin)
            .filter_map(|m| inner.users.get(&m.user_id).cloned())
            .collect();
        admins.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(admins)
    }
}

/// Access control reading the in-memory membership list.
#[derive(Default)]
pub struct MemoryAccessControl {
    admins: Mutex<Vec<(Uuid, Uuid)>>,
}

impl MemoryAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_admin(&self, organization_id: Uuid, user_id: Uuid) {
        if let Ok(mut admins) = self.admins.lock() {
            admins.push((organization_id, user_id));
        }
    }
}

#[async_trait]
impl AccessControl for MemoryAccessControl {
    async fn is_organization_admin(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StoreError> {
        let admins = self
            .admins
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(admins.contains(&(organization_id, user_id)))
    }
}
