//! Audit fields attached to every persisted row
//!
//! Creation and update timestamps plus a soft-delete marker. Updates always
//! refresh `updated_at` and never rewrite `created_at`; the store apply path
//! is the single owner of timestamp refresh so the diff engine stays pure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamps and soft-delete marker carried by every persisted row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFields {
    /// When the row was first created; never rewritten
    pub created_at: DateTime<Utc>,
    /// When the row was last written; refreshed on every update
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker for kinds that retain rows after the live object
    /// disappears
    pub deleted: bool,
}

impl AuditFields {
    /// Fields for a freshly created row
    pub fn new_at(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }

    /// Fields for a freshly created row stamped with the current time
    pub fn now() -> Self {
        Self::new_at(Utc::now())
    }

    /// Refresh the update timestamp, preserving creation time
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Mark the row soft-deleted and refresh the update timestamp
    pub fn mark_deleted(&mut self, now: DateTime<Utc>) {
        self.deleted = true;
        self.updated_at = now;
    }
}

impl Default for AuditFields {
    fn default() -> Self {
        Self::now()
    }
}

/// Access to the audit fields embedded in a persisted row
///
/// Implemented by every parent and child row type; the store apply path uses
/// it to refresh timestamps without knowing the row's shape.
pub trait Audited {
    /// The row's audit fields
    fn audit(&self) -> &AuditFields;
    /// Mutable access for the store apply path
    fn audit_mut(&mut self) -> &mut AuditFields;
}
