//! Entitlement constants.

/// Storage granted per billable seat on the paid tier, in gigabytes.
pub const STORAGE_GB_PER_SEAT: i64 = 10;

/// Storage available to organizations without a paid subscription.
pub const DEFAULT_MAX_STORAGE_GB: i64 = 5;
