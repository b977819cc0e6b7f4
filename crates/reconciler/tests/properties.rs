//! Property tests for reconciliation passes.
//!
//! Properties verified:
//! - Applying the same document twice never writes on the second pass
//! - Attributes a document leaves unset are never touched by an update
//! - Identity changes are refused without any write
//! - No mutating call happens while any reference is unresolved
//! - Delete probing stops within its timeout

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use backsync_reconciler::memory::{ClientOp, InMemoryBackendServices, InMemoryReferenceStore};
use backsync_reconciler::{
    Action, Backend, DesiredState, Error, Link, ProbeConfig, Protocol, ReconcileRequest,
    Reconciler, ReconcilerBuilder, ReconcilerConfig, Reference, RetryConfig,
};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

const PROJECT: &str = "backsync-props";
const GROUPS: [&str; 3] = ["group-a", "group-b", "group-c"];

/// Test helper: build a runtime or panic with context
fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => panic!("Failed to create runtime: {e}"),
    }
}

fn config(delete_timeout: Duration) -> ReconcilerConfig {
    ReconcilerConfig::default()
        .with_retry(
            RetryConfig::default()
                .with_max_attempts(2)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(0.0),
        )
        .with_probe(
            ProbeConfig::default()
                .with_intervals(Duration::from_millis(1), Duration::from_millis(5)),
        )
        .with_convergence_timeout(Duration::from_secs(1))
        .with_delete_timeout(delete_timeout)
}

async fn setup(
    client: InMemoryBackendServices,
    delete_timeout: Duration,
) -> (Reconciler, Arc<InMemoryBackendServices>) {
    let client = Arc::new(client);
    let store = Arc::new(InMemoryReferenceStore::new(PROJECT));
    store.add_http_health_check("hc-one").await;
    store.add_http_health_check("hc-two").await;
    for group in GROUPS {
        store.add_instance_group_manager(group, "us-central1-f").await;
    }

    let reconciler = ReconcilerBuilder::new()
        .with_client(client.clone())
        .with_reference_store(store)
        .with_config(config(delete_timeout))
        .build()
        .unwrap();
    (reconciler, client)
}

async fn run(reconciler: &Reconciler, request: ReconcileRequest) -> backsync_reconciler::ReconcileResult {
    reconciler.reconcile(request, CancellationToken::new()).await
}

fn protocol() -> impl Strategy<Value = Protocol> {
    prop_oneof![
        Just(Protocol::Http),
        Just(Protocol::Https),
        Just(Protocol::Http2),
        Just(Protocol::Tcp),
    ]
}

fn backend() -> impl Strategy<Value = Backend<Link>> {
    (0..GROUPS.len(), proptest::option::of(0.0f64..=1.0)).prop_map(|(i, scaler)| {
        let group = GROUPS.get(i).copied().unwrap_or("group-a");
        let backend = Backend::new(Link::from(Reference::instance_group(group)));
        match scaler {
            Some(s) => backend.with_capacity_scaler(s),
            None => backend,
        }
    })
}

prop_compose! {
    fn desired_state()(
        name in "[a-z][a-z0-9]{0,10}",
        description in proptest::option::of("[A-Za-z ]{0,20}"),
        protocol in proptest::option::of(protocol()),
        timeout in proptest::option::of(1u32..=3600),
        cdn in proptest::option::of(any::<bool>()),
        backends in proptest::option::of(proptest::collection::vec(backend(), 0..=3)),
        two_checks in any::<bool>(),
    ) -> DesiredState {
        let mut checks = vec![Link::from(Reference::health_check("hc-one"))];
        if two_checks {
            checks.push(Link::from(Reference::health_check("hc-two")));
        }
        let mut desired = DesiredState::new(name, checks);
        desired.description = description;
        desired.protocol = protocol;
        desired.timeout_sec = timeout;
        desired.enable_cdn = cdn;
        // Groups must be unique within a service.
        desired.backends = backends.map(|list| {
            let mut seen = std::collections::BTreeSet::new();
            list.into_iter()
                .filter(|b| seen.insert(format!("{:?}", b.group)))
                .collect()
        });
        desired
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: a second apply of the same document is a no-op
    #[test]
    fn prop_apply_is_idempotent(desired in desired_state()) {
        let rt = runtime();
        rt.block_on(async {
            // GIVEN: a service created from the document
            let (reconciler, client) =
                setup(InMemoryBackendServices::new(PROJECT), Duration::from_secs(1)).await;
            let first = run(&reconciler, ReconcileRequest::apply(desired.clone(), Duration::from_secs(5)))
                .await
                .unwrap();

            // WHEN: the same document is applied again
            let second = run(&reconciler, ReconcileRequest::apply(desired, Duration::from_secs(5)))
                .await
                .unwrap();

            // THEN: nothing was written and the fingerprint is stable
            assert_eq!(second.action, Action::Unchanged);
            assert_eq!(
                first.observed.map(|o| o.fingerprint),
                second.observed.map(|o| o.fingerprint)
            );
            assert_eq!(client.count(ClientOp::Insert).await, 1);
            assert_eq!(client.count(ClientOp::Update).await, 0);
        });
    }

    /// Property: an update that only names timeout_sec leaves the rest alone
    #[test]
    fn prop_unset_attributes_are_preserved(
        original in desired_state(),
        new_timeout in 1u32..=3600,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let (reconciler, client) =
                setup(InMemoryBackendServices::new(PROJECT), Duration::from_secs(1)).await;
            let before = run(&reconciler, ReconcileRequest::apply(original.clone(), Duration::from_secs(5)))
                .await
                .unwrap()
                .observed
                .unwrap();

            let sparse = DesiredState::new(original.name.clone(), original.health_checks.clone())
                .with_timeout_sec(new_timeout);
            let after = run(&reconciler, ReconcileRequest::apply(sparse, Duration::from_secs(5)))
                .await
                .unwrap()
                .observed
                .unwrap();

            assert_eq!(after.timeout_sec, new_timeout);
            assert_eq!(after.description, before.description);
            assert_eq!(after.protocol, before.protocol);
            assert_eq!(after.port_name, before.port_name);
            assert_eq!(after.enable_cdn, before.enable_cdn);
            assert_eq!(after.backends, before.backends);
            assert_eq!(after.creation_timestamp, before.creation_timestamp);
            assert_eq!(client.count(ClientOp::Insert).await, 1);
            assert_eq!(client.count(ClientOp::Delete).await, 0);
        });
    }

    /// Property: changing identity never writes
    #[test]
    fn prop_identity_change_is_refused(
        desired in desired_state(),
        suffix in "[a-z0-9]{1,5}",
        change_region in any::<bool>(),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let (reconciler, client) =
                setup(InMemoryBackendServices::new(PROJECT), Duration::from_secs(1)).await;
            let target = desired.name.clone();
            run(&reconciler, ReconcileRequest::apply(desired.clone(), Duration::from_secs(5)))
                .await
                .unwrap();
            client.clear_calls().await;

            let changed = if change_region {
                desired.with_region("europe-west1")
            } else {
                let mut renamed = desired;
                renamed.name = format!("{target}-{suffix}");
                renamed
            };
            let err = run(
                &reconciler,
                ReconcileRequest::apply(changed, Duration::from_secs(5)).with_target(target.clone()),
            )
            .await
            .unwrap_err();

            assert!(matches!(err, Error::ReplacementRequired { .. }));
            assert_eq!(err.last_observed().map(|o| o.name.as_str()), Some(target.as_str()));
            assert_eq!(client.count(ClientOp::Insert).await, 0);
            assert_eq!(client.count(ClientOp::Update).await, 0);
            assert_eq!(client.count(ClientOp::Delete).await, 0);
        });
    }

    /// Property: unresolved references block every write, first pass or later
    #[test]
    fn prop_unresolved_reference_blocks_writes(
        desired in desired_state(),
        missing_check in any::<bool>(),
        preexisting in any::<bool>(),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let (reconciler, client) =
                setup(InMemoryBackendServices::new(PROJECT), Duration::from_secs(1)).await;
            if preexisting {
                run(&reconciler, ReconcileRequest::apply(desired.clone(), Duration::from_secs(5)))
                    .await
                    .unwrap();
            }
            client.clear_calls().await;

            let broken = if missing_check {
                desired.with_health_checks(vec![Link::from(Reference::health_check("hc-missing"))])
            } else {
                desired.with_backend(Backend::new(Link::from(Reference::instance_group("igm-missing"))))
            };
            let err = run(&reconciler, ReconcileRequest::apply(broken, Duration::from_secs(5)))
                .await
                .unwrap_err();

            assert!(matches!(err, Error::UnresolvedReference { .. }));
            assert_eq!(client.count(ClientOp::Insert).await, 0);
            assert_eq!(client.count(ClientOp::Update).await, 0);
            assert_eq!(client.count(ClientOp::Get).await, 0);
        });
    }

    /// Property: a delete that never becomes visible fails within its bound
    #[test]
    fn prop_delete_probe_is_bounded(timeout_ms in 10u64..60) {
        let rt = runtime();
        rt.block_on(async {
            let delete_timeout = Duration::from_millis(timeout_ms);
            let (reconciler, _client) = setup(
                InMemoryBackendServices::new(PROJECT).with_delete_visibility(u32::MAX),
                delete_timeout,
            )
            .await;
            let desired = DesiredState::new("svc", vec![Link::from(Reference::health_check("hc-one"))]);
            run(&reconciler, ReconcileRequest::apply(desired.clone(), Duration::from_secs(5)))
                .await
                .unwrap();

            let start = Instant::now();
            let err = run(&reconciler, ReconcileRequest::destroy(desired, Duration::from_secs(5)))
                .await
                .unwrap_err();
            let elapsed = start.elapsed();

            assert!(matches!(err, Error::DeleteTimeout { .. }));
            assert!(elapsed < delete_timeout + Duration::from_millis(250));
        });
    }
}
