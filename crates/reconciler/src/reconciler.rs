//! Reconciler implementation.

use std::fmt;
use std::sync::Arc;

use backsync_core::GenericResultExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checks::{Checks, desired_state_checks};
use crate::client::BackendServiceClient;
use crate::config::ReconcilerConfig;
use crate::context::{CallError, PassContext};
use crate::diff::{Diff, ServicePatch, diff};
use crate::error::{Error, Result, Step};
use crate::lifecycle::{Lifecycle, ResourceState};
use crate::locks::{LockTable, PassGuard};
use crate::probe::{self, await_convergence};
use crate::resolver::{ReferenceResolver, ReferenceStore};
use crate::retry::retry_transient;
use crate::types::{
    Action, DesiredState, ObservedState, Operation, Plan, ReconcileOutcome, ReconcileRequest,
    ReconcileResult, ResolvedState,
};

fn outcome(
    name: impl Into<String>,
    state: ResourceState,
    action: Action,
    observed: Option<ObservedState>,
) -> ReconcileOutcome {
    ReconcileOutcome {
        name: name.into(),
        state,
        action,
        observed,
    }
}

/// Drives one backend service toward its desired state.
pub struct Reconciler {
    /// Remote API.
    client: Arc<dyn BackendServiceClient>,
    /// Resolves references before any mutation.
    resolver: ReferenceResolver,
    /// Serialises mutating passes per name.
    locks: LockTable,
    /// Validation run before every apply and plan.
    checks: Checks<DesiredState>,
    /// Configuration.
    config: ReconcilerConfig,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("resolver", &self.resolver)
            .field("locks", &self.locks.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        client: Arc<dyn BackendServiceClient>,
        store: Arc<dyn ReferenceStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            client,
            resolver: ReferenceResolver::new(store, config.retry.clone()),
            locks: LockTable::new(),
            checks: desired_state_checks(),
            config,
        }
    }

    /// Get the configuration.
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one reconciliation pass.
    ///
    /// Mutating operations (apply, destroy) on the same target are
    /// serialised; reads and plans never wait for them.
    ///
    /// # Errors
    ///
    /// Returns the [`Error`] that stopped the pass. Failures after the
    /// remote resource was fetched carry its last observed state.
    pub async fn reconcile(
        &self,
        request: ReconcileRequest,
        cancel: CancellationToken,
    ) -> ReconcileResult {
        let ctx = PassContext::new(request.timeout, cancel)
            .with_call_timeout(self.config.call_timeout);
        let target = request.target_name().to_string();

        info!(
            name = %target,
            operation = %request.operation,
            "Starting reconciliation"
        );

        let result = match request.operation {
            Operation::Read => self.read(&target, &ctx).await,
            Operation::Plan => self.plan(&request, &ctx).await,
            Operation::Apply => self.apply(&request, &ctx).await,
            Operation::Destroy => self.destroy(&target, &ctx).await,
        };

        result
            .tap_ok(|o| {
                info!(
                    name = %o.name,
                    state = %o.state,
                    action = ?o.action,
                    "Reconciliation complete"
                );
            })
            .tap_err(|e| {
                warn!(
                    name = %target,
                    operation = %request.operation,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Reconciliation failed"
                );
            })
    }

    fn validate(&self, desired: &DesiredState) -> Result<()> {
        self.checks
            .run(desired)
            .map_err(|failures| Error::InvalidDesiredState { failures })
    }

    async fn lock(&self, name: &str, ctx: &PassContext) -> Result<PassGuard> {
        self.locks
            .acquire(name, ctx)
            .await
            .map_err(|reason| Error::Cancelled {
                step: Step::Lock,
                reason,
                last_observed: None,
            })
    }

    /// Get with retries; `None` when the resource does not exist.
    async fn fetch(
        &self,
        name: &str,
        ctx: &PassContext,
        last: Option<&ObservedState>,
    ) -> Result<Option<ObservedState>> {
        match retry_transient(&self.config.retry, "get", ctx, || self.client.get(name)).await {
            Ok(observed) => Ok(Some(observed)),
            Err(CallError::Api(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(Error::from_call(Step::Fetch, e, last)),
        }
    }

    async fn read(&self, name: &str, ctx: &PassContext) -> ReconcileResult {
        match ctx.call(self.client.get(name)).await {
            Ok(observed) => Ok(outcome(
                name,
                ResourceState::Present,
                Action::Read,
                Some(observed),
            )),
            Err(CallError::Api(e)) if e.is_not_found() => {
                Ok(outcome(name, ResourceState::Absent, Action::Read, None))
            }
            Err(e) => Err(Error::from_call(Step::Fetch, e, None)),
        }
    }

    async fn plan(&self, request: &ReconcileRequest, ctx: &PassContext) -> ReconcileResult {
        self.validate(&request.desired)?;
        let resolved = self.resolver.resolve(&request.desired, ctx).await?;
        let target = request.target_name();

        let Some(observed) = self.fetch(target, ctx, None).await? else {
            return Ok(outcome(
                resolved.name,
                ResourceState::Absent,
                Action::Planned(Plan::Create),
                None,
            ));
        };

        let d = diff(&resolved, &observed);
        let plan = if d.is_empty() {
            Plan::NoOp
        } else if d.requires_replace() {
            Plan::Replace(d)
        } else {
            Plan::Update(d)
        };
        debug!(name = %target, plan = ?plan, "Planned");
        Ok(outcome(
            target,
            ResourceState::Present,
            Action::Planned(plan),
            Some(observed),
        ))
    }

    async fn apply(&self, request: &ReconcileRequest, ctx: &PassContext) -> ReconcileResult {
        self.validate(&request.desired)?;
        let target = request.target_name();
        let _guard = self.lock(target, ctx).await?;

        // Every reference resolves before the first mutating call.
        let resolved = self.resolver.resolve(&request.desired, ctx).await?;

        match self.fetch(target, ctx, None).await? {
            None => self.create(&resolved, ctx).await,
            Some(observed) => self.update(&resolved, observed, ctx).await,
        }
    }

    async fn create(&self, resolved: &ResolvedState, ctx: &PassContext) -> ReconcileResult {
        let name = resolved.name.as_str();
        let mut lifecycle = Lifecycle::new(name, ResourceState::Absent);
        lifecycle.transition(ResourceState::Creating)?;

        let inserted = retry_transient(&self.config.retry, "insert", ctx, || {
            self.client.insert(resolved)
        })
        .await;

        let written = match inserted {
            Ok(written) => written.into_observed(),
            Err(CallError::Api(e)) if e.is_conflict() => {
                // A previous pass (or a retried call) created it already.
                info!(name = %name, error = %e, "Insert conflicted, updating existing resource");
                let existing = self
                    .fetch(name, ctx, None)
                    .await
                    .tap_err(|_| lifecycle.fail())?;
                return match existing {
                    Some(observed) => self.update(resolved, observed, ctx).await,
                    None => {
                        lifecycle.fail();
                        Err(Error::ConcurrentModification {
                            name: name.to_string(),
                            last_observed: None,
                        })
                    }
                };
            }
            Err(e) => {
                lifecycle.fail();
                return Err(Error::from_call(Step::Insert, e, None));
            }
        };

        let observed = self
            .settle(Step::Insert, resolved, written, None, ctx)
            .await
            .tap_err(|_| lifecycle.fail())?;
        lifecycle.transition(ResourceState::Present)?;

        Ok(outcome(
            name,
            lifecycle.state(),
            Action::Created,
            Some(observed),
        ))
    }

    async fn update(
        &self,
        resolved: &ResolvedState,
        observed: ObservedState,
        ctx: &PassContext,
    ) -> ReconcileResult {
        let name = observed.name.clone();
        let mut changes = diff(resolved, &observed);

        if changes.is_empty() {
            debug!(name = %name, "No drift");
            return Ok(outcome(
                name,
                ResourceState::Present,
                Action::Unchanged,
                Some(observed),
            ));
        }
        if changes.requires_replace() {
            return Err(replacement_required(name, &changes, observed));
        }

        let mut lifecycle = Lifecycle::new(&name, ResourceState::Present);
        lifecycle.transition(ResourceState::Updating)?;

        let mut current = observed;
        let mut refetched = false;
        loop {
            let patch = ServicePatch::from_diff(&changes, resolved, current.fingerprint.as_str());
            debug!(name = %name, attributes = ?patch.attributes(), "Updating in place");

            let updated = retry_transient(&self.config.retry, "update", ctx, || {
                self.client.update(&name, &patch)
            })
            .await;

            match updated {
                Ok(written) => {
                    let observed = self
                        .settle(
                            Step::Update,
                            resolved,
                            written.into_observed(),
                            Some(&current),
                            ctx,
                        )
                        .await
                        .tap_err(|_| lifecycle.fail())?;
                    lifecycle.transition(ResourceState::Present)?;
                    return Ok(outcome(
                        name,
                        lifecycle.state(),
                        Action::Updated {
                            attributes: patch.attributes(),
                        },
                        Some(observed),
                    ));
                }
                Err(CallError::Api(e)) if e.is_conflict() && !refetched => {
                    refetched = true;
                    warn!(name = %name, error = %e, "Update conflicted, re-reading");
                    let fresh = self
                        .fetch(&name, ctx, Some(&current))
                        .await
                        .tap_err(|_| lifecycle.fail())?;
                    let Some(fresh) = fresh else {
                        lifecycle.fail();
                        return Err(Error::ConcurrentModification {
                            name,
                            last_observed: None,
                        });
                    };

                    changes = diff(resolved, &fresh);
                    if changes.is_empty() {
                        lifecycle.transition(ResourceState::Present)?;
                        return Ok(outcome(
                            name,
                            lifecycle.state(),
                            Action::Unchanged,
                            Some(fresh),
                        ));
                    }
                    if changes.requires_replace() {
                        lifecycle.fail();
                        return Err(replacement_required(name, &changes, fresh));
                    }
                    current = fresh;
                }
                Err(CallError::Api(e)) if e.is_conflict() => {
                    lifecycle.fail();
                    debug!(name = %name, error = %e, "Second update conflict");
                    return Err(Error::ConcurrentModification {
                        name,
                        last_observed: Some(Box::new(current)),
                    });
                }
                Err(e) => {
                    lifecycle.fail();
                    return Err(Error::from_call(Step::Update, e, Some(&current)));
                }
            }
        }
    }

    /// Final representation after a write, verified when configured.
    ///
    /// Failures carry the freshest state known: the written representation,
    /// else `previous`.
    async fn settle(
        &self,
        step: Step,
        resolved: &ResolvedState,
        written: Option<ObservedState>,
        previous: Option<&ObservedState>,
        ctx: &PassContext,
    ) -> Result<ObservedState> {
        let name = resolved.name.as_str();
        let last_known = match written {
            Some(observed) if !self.config.verify_after_apply => return Ok(observed),
            written => written.or_else(|| previous.cloned()),
        };

        let converged = if self.config.verify_after_apply {
            await_convergence(
                self.client.as_ref(),
                name,
                probe::matches(resolved),
                self.config.convergence_timeout,
                &self.config.probe,
                ctx,
            )
            .await
        } else {
            await_convergence(
                self.client.as_ref(),
                name,
                probe::present,
                self.config.convergence_timeout,
                &self.config.probe,
                ctx,
            )
            .await
        };

        match converged {
            Ok(Some(observed)) => Ok(observed),
            Ok(None) => Err(Error::Permanent {
                step: Step::Verify,
                reason: format!("'{name}' disappeared during {step}"),
                last_observed: last_known.map(Box::new),
            }),
            Err(e) => Err(Error::from_probe(Step::Verify, e, last_known.as_ref())),
        }
    }

    async fn destroy(&self, name: &str, ctx: &PassContext) -> ReconcileResult {
        let _guard = self.lock(name, ctx).await?;

        let Some(observed) = self.fetch(name, ctx, None).await? else {
            debug!(name = %name, "Nothing to delete");
            return Ok(outcome(
                name,
                ResourceState::Absent,
                Action::AlreadyAbsent,
                None,
            ));
        };

        let mut lifecycle = Lifecycle::new(name, ResourceState::Present);
        lifecycle.transition(ResourceState::Deleting)?;

        let deleted =
            retry_transient(&self.config.retry, "delete", ctx, || self.client.delete(name)).await;
        match deleted {
            Ok(()) => {}
            Err(CallError::Api(e)) if e.is_not_found() => {
                debug!(name = %name, "Already gone");
            }
            Err(e) => {
                lifecycle.fail();
                return Err(Error::from_call(Step::Delete, e, Some(&observed)));
            }
        }

        // A delete that never becomes visible leaves the resource present.
        await_convergence(
            self.client.as_ref(),
            name,
            probe::absent,
            self.config.delete_timeout,
            &self.config.probe,
            ctx,
        )
        .await
        .map_err(|e| Error::from_probe(Step::Delete, e, Some(&observed)))?;

        lifecycle.transition(ResourceState::Absent)?;
        Ok(outcome(name, lifecycle.state(), Action::Deleted, None))
    }
}

fn replacement_required(name: String, changes: &Diff, observed: ObservedState) -> Error {
    Error::ReplacementRequired {
        name,
        attributes: changes.replacement_attributes(),
        last_observed: Some(Box::new(observed)),
    }
}

/// Builder for Reconciler.
#[derive(Default)]
pub struct ReconcilerBuilder {
    client: Option<Arc<dyn BackendServiceClient>>,
    store: Option<Arc<dyn ReferenceStore>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the remote client.
    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn BackendServiceClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the reference store.
    #[must_use]
    pub fn with_reference_store(mut self, store: Arc<dyn ReferenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable/disable post-apply verification.
    #[must_use]
    pub const fn verify_after_apply(mut self, enabled: bool) -> Self {
        self.config.verify_after_apply = enabled;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns an error if the client or reference store is missing, or the
    /// configuration is invalid.
    pub fn build(self) -> backsync_core::Result<Reconciler> {
        let client = self.client.ok_or_else(|| {
            backsync_core::Error::invalid_config("client", "a backend service client is required")
        })?;
        let store = self.store.ok_or_else(|| {
            backsync_core::Error::invalid_config("reference_store", "a reference store is required")
        })?;
        self.config.validate()?;

        Ok(Reconciler::new(client, store, self.config))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::time::Duration;

    use super::*;
    use crate::client::ApiError;
    use crate::diff::Attribute;
    use crate::memory::{ClientOp, InMemoryBackendServices, InMemoryReferenceStore};
    use crate::probe::ProbeConfig;
    use crate::retry::RetryConfig;
    use crate::types::{Link, Protocol, Reference};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn fast_config() -> ReconcilerConfig {
        ReconcilerConfig::default()
            .with_retry(
                RetryConfig::default()
                    .with_initial_delay(Duration::from_millis(1))
                    .with_max_delay(Duration::from_millis(5))
                    .with_jitter(0.0),
            )
            .with_probe(
                ProbeConfig::default()
                    .with_intervals(Duration::from_millis(1), Duration::from_millis(5)),
            )
            .with_convergence_timeout(Duration::from_secs(1))
            .with_delete_timeout(Duration::from_millis(200))
    }

    async fn setup() -> (Reconciler, Arc<InMemoryBackendServices>, Arc<InMemoryReferenceStore>) {
        let client = Arc::new(InMemoryBackendServices::new("proj"));
        let store = Arc::new(InMemoryReferenceStore::new("proj"));
        store.add_http_health_check("zero").await;
        store.add_http_health_check("one").await;
        let reconciler = ReconcilerBuilder::new()
            .with_client(client.clone())
            .with_reference_store(store.clone())
            .with_config(fast_config())
            .build()
            .unwrap();
        (reconciler, client, store)
    }

    fn desired(name: &str, health_check: &str) -> DesiredState {
        DesiredState::new(name, vec![Link::from(Reference::health_check(health_check))])
    }

    async fn run(reconciler: &Reconciler, request: ReconcileRequest) -> ReconcileResult {
        reconciler.reconcile(request, CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_apply_creates_absent_resource() {
        let (reconciler, client, _) = setup().await;

        let result = run(&reconciler, ReconcileRequest::apply(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();

        assert_eq!(result.action, Action::Created);
        assert_eq!(result.state, ResourceState::Present);
        assert_eq!(client.count(ClientOp::Insert).await, 1);
        assert!(result.observed.unwrap().health_checks[0].ends_with("/httpHealthChecks/zero"));
    }

    #[tokio::test]
    async fn test_second_apply_is_noop() {
        let (reconciler, client, _) = setup().await;
        run(&reconciler, ReconcileRequest::apply(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();
        client.clear_calls().await;

        let result = run(&reconciler, ReconcileRequest::apply(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();

        assert_eq!(result.action, Action::Unchanged);
        assert!(!result.mutated());
        assert_eq!(client.count(ClientOp::Insert).await, 0);
        assert_eq!(client.count(ClientOp::Update).await, 0);
    }

    #[tokio::test]
    async fn test_in_place_update_sends_only_changes() {
        let (reconciler, client, _) = setup().await;
        run(&reconciler, ReconcileRequest::apply(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();

        let result = run(
            &reconciler,
            ReconcileRequest::apply(desired("svc", "one").with_timeout_sec(10), TIMEOUT),
        )
        .await
        .unwrap();

        assert_eq!(
            result.action,
            Action::Updated {
                attributes: vec![Attribute::TimeoutSec, Attribute::HealthChecks],
            }
        );
        assert_eq!(client.count(ClientOp::Update).await, 1);
        assert_eq!(result.observed.unwrap().timeout_sec, 10);
    }

    #[tokio::test]
    async fn test_rename_requires_replacement() {
        let (reconciler, client, _) = setup().await;
        run(&reconciler, ReconcileRequest::apply(desired("blablah", "zero"), TIMEOUT))
            .await
            .unwrap();
        client.clear_calls().await;

        let err = run(
            &reconciler,
            ReconcileRequest::apply(desired("renamed", "zero"), TIMEOUT).with_target("blablah"),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            Error::ReplacementRequired { ref attributes, .. } if attributes == &[Attribute::Name]
        ));
        assert_eq!(err.last_observed().map(|o| o.name.as_str()), Some("blablah"));
        assert_eq!(client.count(ClientOp::Delete).await, 0);
        assert_eq!(client.count(ClientOp::Insert).await, 0);
    }

    #[tokio::test]
    async fn test_update_conflict_refetches_once() {
        let (reconciler, client, _) = setup().await;
        run(&reconciler, ReconcileRequest::apply(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();
        client
            .fail_next(ClientOp::Update, ApiError::conflict("stale fingerprint"))
            .await;

        let result = run(
            &reconciler,
            ReconcileRequest::apply(desired("svc", "zero").with_protocol(Protocol::Https), TIMEOUT),
        )
        .await
        .unwrap();

        assert!(matches!(result.action, Action::Updated { .. }));
        assert_eq!(client.count(ClientOp::Update).await, 2);
    }

    #[tokio::test]
    async fn test_repeated_conflict_is_concurrent_modification() {
        let (reconciler, client, _) = setup().await;
        run(&reconciler, ReconcileRequest::apply(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();
        for _ in 0..2 {
            client
                .fail_next(ClientOp::Update, ApiError::conflict("stale fingerprint"))
                .await;
        }

        let err = run(
            &reconciler,
            ReconcileRequest::apply(desired("svc", "zero").with_timeout_sec(5), TIMEOUT),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ConcurrentModification { .. }));
        assert!(err.last_observed().is_some());
    }

    #[tokio::test]
    async fn test_insert_conflict_falls_through_to_update() {
        let (reconciler, client, _) = setup().await;
        // The first read misses a service that already exists.
        client.fail_next(ClientOp::Get, ApiError::not_found("svc")).await;
        client
            .seed(ResolvedState::new("svc", vec!["https://stale/hc".to_string()]))
            .await;

        let result = run(&reconciler, ReconcileRequest::apply(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();

        assert!(matches!(result.action, Action::Updated { .. }));
        assert_eq!(client.count(ClientOp::Insert).await, 1);
    }

    #[tokio::test]
    async fn test_permanent_insert_failure_surfaces() {
        let (reconciler, client, _) = setup().await;
        client
            .fail_next(ClientOp::Insert, ApiError::permanent("400: invalid protocol"))
            .await;

        let err = run(&reconciler, ReconcileRequest::apply(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Permanent { step: Step::Insert, .. }));
        assert_eq!(client.count(ClientOp::Insert).await, 1);
    }

    #[tokio::test]
    async fn test_invalid_document_makes_no_calls() {
        let (reconciler, client, _) = setup().await;
        let bad = DesiredState::new("Not_Valid", vec![]);

        let err = run(&reconciler, ReconcileRequest::apply(bad, TIMEOUT))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidDesiredState { .. }));
        assert!(client.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_read_absent_and_present() {
        let (reconciler, client, _) = setup().await;
        let absent = run(&reconciler, ReconcileRequest::read(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();
        assert_eq!(absent.state, ResourceState::Absent);
        assert!(absent.observed.is_none());

        client
            .seed(ResolvedState::new("svc", vec!["hc".to_string()]))
            .await;
        let present = run(&reconciler, ReconcileRequest::read(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();
        assert_eq!(present.action, Action::Read);
        assert_eq!(present.state, ResourceState::Present);
    }

    #[tokio::test]
    async fn test_read_is_not_retried() {
        let (reconciler, client, _) = setup().await;
        client.fail_next(ClientOp::Get, ApiError::transient("503")).await;

        let err = run(&reconciler, ReconcileRequest::read(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient { step: Step::Fetch, .. }));
        assert_eq!(client.count(ClientOp::Get).await, 1);
    }

    #[tokio::test]
    async fn test_plan_reports_without_mutating() {
        let (reconciler, client, _) = setup().await;
        let plan = run(&reconciler, ReconcileRequest::plan(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();
        assert_eq!(plan.action, Action::Planned(Plan::Create));

        client
            .seed(ResolvedState::new("svc", vec!["hc".to_string()]))
            .await;
        let plan = run(&reconciler, ReconcileRequest::plan(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();
        assert!(matches!(plan.action, Action::Planned(Plan::Update(_))));
        assert_eq!(client.count(ClientOp::Insert).await, 0);
        assert_eq!(client.count(ClientOp::Update).await, 0);
    }

    #[tokio::test]
    async fn test_destroy_present_then_absent() {
        let (reconciler, client, _) = setup().await;
        run(&reconciler, ReconcileRequest::apply(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();

        let deleted = run(&reconciler, ReconcileRequest::destroy(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();
        assert_eq!(deleted.action, Action::Deleted);
        assert_eq!(deleted.state, ResourceState::Absent);

        let again = run(&reconciler, ReconcileRequest::destroy(desired("svc", "zero"), TIMEOUT))
            .await
            .unwrap();
        assert_eq!(again.action, Action::AlreadyAbsent);
        assert_eq!(client.count(ClientOp::Delete).await, 1);
    }

    #[test]
    fn test_builder_requires_client() {
        let err = ReconcilerBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("client"));
    }
}
