//! Reconciliation core for tain
//!
//! The generic machinery shared by every per-kind mirror controller:
//!
//! - [`queue`] - keyed, deduplicating, rate-limited work queue
//! - [`watch`] - local watch cache, event classification, sync barrier
//! - [`adapter`] - cache events to work-queue keys (resync and tombstone rules)
//! - [`controller`] - worker pool, retry bookkeeping, retry ceiling
//! - [`diff`] - policy-free diff-merge engine over parent/child composites
//! - [`store`] - record-oriented CRUD traits and the in-memory store
//! - [`election`] - per-cluster Lease-based leader election
//! - [`supervisor`] - election-gated controller set for one cluster
//! - [`registry`] - controller name → start function table
//!
//! Ordering guarantees are strictly per-key: the queue never hands one key to
//! two workers, and nothing is guaranteed across keys or kinds. Sync handlers
//! tolerate eventual consistency with sibling kinds; convergence comes from
//! idempotent re-application, not transactions.

#![deny(missing_docs)]

pub mod adapter;
pub mod controller;
pub mod diff;
pub mod election;
pub mod queue;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod watch;

pub use adapter::EventAdapter;
pub use controller::{start_kind_controller, Controller, SyncHandler, MAX_SYNC_RETRIES};
pub use diff::{plan, Composite, CompositeKind, DeletePolicy, MergePlan};
pub use election::{LeaseElector, LeaseTimings, Leadership, LeadershipTerm};
pub use queue::{BackoffPolicy, WorkQueue};
pub use registry::{ControllerRegistry, StartFn, SupervisorContext};
pub use store::{AdvisoryLocks, CompositeStore, MemoryStore};
pub use supervisor::ClusterSupervisor;
pub use watch::{spawn_watch, CacheEvent, Removal, WatchCache, WatchedObject};
