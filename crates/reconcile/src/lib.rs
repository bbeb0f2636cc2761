//! The reconciliation engine: snapshot reader, object sync pipeline,
//! status projector and requeue policy.
//!
//! A pass is one logical unit of work: `read_cluster_state` builds a
//! fresh snapshot, `Reconciler::sync` drives every managed component
//! toward its resolved shape in a fixed order, and any failure is either
//! terminal or a bounded-delay requeue. Convergence across passes is the
//! external loop's job; nothing here polls or blocks.

#![forbid(unsafe_code)]

mod error;
mod state;
mod status;
mod store;
mod sync;

pub use error::{requeue_delay, Disposition, Error, StoreError, ValidationError};
pub use state::{read_cluster_state, ClusterState};
pub use status::{project_status, NOT_READY};
pub use store::{memory, KubeStore, Store, StoredObject};
pub use sync::{attach_owner, Component, Reconciler, SYNC_ORDER};
