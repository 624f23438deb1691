#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quill shared domain model and capabilities
//!
//! Types and capability traits used by both the billing core and the
//! background worker:
//!
//! - **Domain model**: [`Organization`], [`Member`], [`User`] and the
//!   subscription state machine types
//! - **Storage**: the [`OrganizationStore`] capability with Postgres and
//!   in-memory implementations
//! - **Access control**: the [`AccessControl`] capability
//! - **Configuration**: [`StripeConfig`] loaded from the environment

pub mod config;
pub mod constants;
pub mod memory;
pub mod organization;
pub mod postgres;
pub mod store;

pub use config::StripeConfig;
pub use constants::{DEFAULT_MAX_STORAGE_GB, STORAGE_GB_PER_SEAT};
pub use memory::{MemoryAccessControl, MemoryStore};
pub use organization::{Member, Organization, SubscriptionPlan, SubscriptionState, User};
pub use postgres::{PgAccessControl, PgOrganizationStore};
pub use store::{AccessControl, OrganizationStore, StoreError};
