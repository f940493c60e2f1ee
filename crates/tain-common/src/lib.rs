//! Common types for tain: errors, object keys, audit fields, and utilities
//!
//! tain mirrors live cluster object state into a relational store. This crate
//! holds the vocabulary shared by the reconciliation core (`tain-sync`), the
//! per-kind mirrors (`tain-mirrors`), and the agent binary.

#![deny(missing_docs)]

pub mod audit;
pub mod error;
pub mod filter;
pub mod key;
pub mod telemetry;

pub use audit::{AuditFields, Audited};
pub use error::Error;
pub use filter::NamespaceFilter;
pub use key::ObjectKey;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for tain system resources (leases, agent deployment)
pub const TAIN_SYSTEM_NAMESPACE: &str = "tain-system";

/// Label stamped onto live application objects on first sync.
///
/// Set once and never rewritten; the stored record is the source of truth
/// afterwards.
pub const APP_ID_LABEL: &str = "tain.dev/app-id";

/// Prefix for per-cluster leader election lease names
pub const LEASE_NAME_PREFIX: &str = "tain-sync";
