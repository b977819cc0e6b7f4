//! Resource kind registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::reconciler::Reconciler;
use crate::types::{BACKEND_SERVICE_KIND, ReconcileRequest, ReconcileResult};

/// Something that reconciles resources of one kind.
#[async_trait]
pub trait ResourceReconciler: Send + Sync {
    /// The kind name this reconciler handles.
    fn kind(&self) -> &str;

    /// Run one reconciliation pass.
    async fn reconcile(&self, request: ReconcileRequest, cancel: CancellationToken)
    -> ReconcileResult;
}

#[async_trait]
impl ResourceReconciler for Reconciler {
    fn kind(&self) -> &str {
        BACKEND_SERVICE_KIND
    }

    async fn reconcile(
        &self,
        request: ReconcileRequest,
        cancel: CancellationToken,
    ) -> ReconcileResult {
        Self::reconcile(self, request, cancel).await
    }
}

/// Registry mapping kind names to reconcilers.
#[derive(Default)]
pub struct KindRegistry {
    reconcilers: HashMap<String, Arc<dyn ResourceReconciler>>,
}

impl KindRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reconciler under its own kind name.
    pub fn register(&mut self, reconciler: Arc<dyn ResourceReconciler>) {
        self.reconcilers
            .insert(reconciler.kind().to_string(), reconciler);
    }

    /// Get a reconciler by kind name.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn ResourceReconciler>> {
        self.reconcilers.get(kind).cloned()
    }

    /// All registered kind names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.reconcilers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Get the number of registered kinds.
    pub fn len(&self) -> usize {
        self.reconcilers.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.reconcilers.is_empty()
    }

    /// Route a request to the reconciler for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKind`] if nothing is registered for `kind`,
    /// otherwise whatever the reconciler returns.
    pub async fn dispatch(
        &self,
        kind: &str,
        request: ReconcileRequest,
        cancel: CancellationToken,
    ) -> ReconcileResult {
        let reconciler = self.get(kind).ok_or_else(|| Error::unknown_kind(kind))?;
        reconciler.reconcile(request, cancel).await
    }
}
