//! Declarative reconciliation of load-balancer backend services.
//!
//! This crate keeps a remote *backend service* in line with a declared
//! configuration:
//!
//! - **Desired State**: what the service should look like, possibly
//!   referring to health checks and instance groups by name
//! - **Resolution**: every reference is turned into a concrete URL before
//!   anything is written
//! - **Diff**: desired vs. observed, attribute by attribute
//! - **Apply**: create, update in place, or delete, then verify
//!
//! # Key Concepts
//!
//! ## Passes
//!
//! A [`ReconcileRequest`] runs one pass: `Apply`, `Read`, `Destroy`, or
//! `Plan`. Mutating passes on the same name are serialised; every pass
//! honours a [`CancellationToken`](tokio_util::sync::CancellationToken) and
//! its own deadline.
//!
//! ## Errors
//!
//! Failures are classified ([`Error`]) and carry the last observed state
//! whenever the remote resource had been read.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use backsync_reconciler::memory::{InMemoryBackendServices, InMemoryReferenceStore};
//! use backsync_reconciler::{DesiredState, Link, ReconcileRequest, ReconcilerBuilder, Reference};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(InMemoryReferenceStore::new("my-project"));
//!     store.add_http_health_check("default").await;
//!
//!     let reconciler = ReconcilerBuilder::new()
//!         .with_client(Arc::new(InMemoryBackendServices::new("my-project")))
//!         .with_reference_store(store)
//!         .build()
//!         .expect("valid configuration");
//!
//!     let desired = DesiredState::new(
//!         "hello-world-bs",
//!         vec![Link::from(Reference::health_check("default"))],
//!     )
//!     .with_timeout_sec(10);
//!
//!     let outcome = reconciler
//!         .reconcile(
//!             ReconcileRequest::apply(desired, Duration::from_secs(60)),
//!             CancellationToken::new(),
//!         )
//!         .await;
//!     println!("{outcome:?}");
//! }
//! ```

#![forbid(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod checks;
pub mod client;
pub mod config;
pub mod context;
pub mod diff;
pub mod error;
pub mod lifecycle;
pub mod locks;
pub mod memory;
pub mod probe;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod types;

// Re-export main types
pub use client::{ApiError, BackendServiceClient, ErrorCategory, WriteOutcome};
pub use config::ReconcilerConfig;
pub use context::{CallError, Interrupt, PassContext};
pub use diff::{Attribute, AttributeChange, ChangeKind, Diff, ServicePatch, diff};
pub use error::{Error, Result, Step};
pub use lifecycle::{Lifecycle, ResourceState};
pub use probe::{ProbeConfig, ProbeError, await_convergence};
pub use reconciler::{Reconciler, ReconcilerBuilder};
pub use registry::{KindRegistry, ResourceReconciler};
pub use resolver::{ReferenceResolver, ReferenceStore, ResourceRecord, UnresolvedReason};
pub use retry::{RetryConfig, retry_transient};
pub use types::{
    Action, Backend, BalancingMode, DesiredState, Link, ObservedState, Operation, Plan, Protocol,
    ReconcileOutcome, ReconcileRequest, ReconcileResult, Reference, ResolvedState, ServiceConfig,
};
