//! Reference resolution.
//!
//! Turns a [`DesiredState`] into a [`ResolvedState`] by looking up every
//! symbolic [`Reference`] in a read-only [`ReferenceStore`]. Resolution is
//! all-or-nothing and happens before any mutating call.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::ApiError;
use crate::context::{CallError, PassContext};
use crate::error::{Error, Result, Step};
use crate::retry::{RetryConfig, retry_transient};
use crate::types::{DesiredState, Link, Reference, ResolvedState};

/// A resource another resource may point at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: String,
    pub name: String,
    /// Populated attributes. An attribute missing here is not yet known.
    pub attributes: BTreeMap<String, String>,
}

impl ResourceRecord {
    /// Create a record with no attributes.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Value of an attribute, if populated.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Read-only lookup of referenced resources by `(kind, name)`.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Every record with this kind and name.
    async fn lookup(&self, kind: &str, name: &str) -> std::result::Result<Vec<ResourceRecord>, ApiError>;
}

/// Why a reference could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// No resource with that kind and name exists.
    Absent,
    /// The resource exists but the attribute is not populated yet.
    NotYetCreated,
    /// More than one resource matched.
    Ambiguous { matches: usize },
    /// The store failed.
    Lookup(String),
}

impl UnresolvedReason {
    /// Whether the reference may resolve on a later pass.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Absent | Self::NotYetCreated | Self::Lookup(_))
    }
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "referenced resource does not exist"),
            Self::NotYetCreated => write!(f, "referenced attribute is not populated yet"),
            Self::Ambiguous { matches } => write!(f, "reference matched {matches} resources"),
            Self::Lookup(reason) => write!(f, "lookup failed: {reason}"),
        }
    }
}

/// Resolves references against a [`ReferenceStore`].
#[derive(Clone)]
pub struct ReferenceResolver {
    store: Arc<dyn ReferenceStore>,
    retry: RetryConfig,
}

impl fmt::Debug for ReferenceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceResolver")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ReferenceResolver {
    /// Create a resolver; transient lookup failures are retried per `retry`.
    pub fn new(store: Arc<dyn ReferenceStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Resolve every reference in `desired`, in declaration order.
    ///
    /// A reference used more than once is looked up once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedReference`] for the first reference that
    /// cannot be resolved, or [`Error::Cancelled`] if the pass is interrupted.
    pub async fn resolve(&self, desired: &DesiredState, ctx: &PassContext) -> Result<ResolvedState> {
        let mut resolved: HashMap<Reference, String> = HashMap::new();
        for reference in desired.references() {
            if resolved.contains_key(reference) {
                continue;
            }
            let value = self.resolve_reference(reference, ctx).await?;
            resolved.insert(reference.clone(), value);
        }

        desired.try_map_links(|link| match link {
            Link::Literal(url) => Ok(url.clone()),
            Link::Ref(reference) => resolved.get(reference).cloned().ok_or_else(|| {
                Error::UnresolvedReference {
                    reference: reference.clone(),
                    reason: UnresolvedReason::Absent,
                }
            }),
        })
    }

    /// Resolve a single reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedReference`] explaining why the reference
    /// has no value, or [`Error::Cancelled`].
    pub async fn resolve_reference(&self, reference: &Reference, ctx: &PassContext) -> Result<String> {
        let unresolved = |reason| Error::UnresolvedReference {
            reference: reference.clone(),
            reason,
        };

        let lookup = retry_transient(&self.retry, "lookup", ctx, || {
            self.store.lookup(&reference.kind, &reference.name)
        })
        .await;
        let records = match lookup {
            Ok(records) => records,
            Err(CallError::Api(e)) => return Err(unresolved(UnresolvedReason::Lookup(e.to_string()))),
            Err(e @ CallError::Interrupted(_)) => return Err(Error::from_call(Step::Resolve, e, None)),
        };

        match records.as_slice() {
            [] => Err(unresolved(UnresolvedReason::Absent)),
            [record] => {
                let value = record
                    .attribute(&reference.attribute)
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| unresolved(UnresolvedReason::NotYetCreated))?;
                debug!(reference = %reference, value = %value, "Resolved reference");
                Ok(value.to_string())
            }
            many => Err(unresolved(UnresolvedReason::Ambiguous {
                matches: many.len(),
            })),
        }
    }
}
