//! Core types for the reconciler.
//!
//! A backend service is described by [`ServiceConfig`], generic over how
//! links to other resources are expressed:
//!
//! - [`DesiredState`] carries [`Link`]s, which may still be symbolic
//!   [`Reference`]s into other resources.
//! - [`ResolvedState`] carries concrete URLs and is the only form the
//!   remote client accepts.
//!
//! [`ObservedState`] is what the remote API reports back.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::Attribute;
use crate::lifecycle::ResourceState;

/// Kind name of the reconciled resource.
pub const BACKEND_SERVICE_KIND: &str = "google_compute_backend_service";
/// Kind name of HTTP health checks referenced by backend services.
pub const HTTP_HEALTH_CHECK_KIND: &str = "google_compute_http_health_check";
/// Kind name of instance group managers whose groups back a service.
pub const INSTANCE_GROUP_MANAGER_KIND: &str = "google_compute_instance_group_manager";

/// Attribute holding a resource's canonical URL.
pub const SELF_LINK: &str = "self_link";
/// Attribute holding the URL of the group an instance group manager owns.
pub const INSTANCE_GROUP: &str = "instance_group";

/// Symbolic pointer to an attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Kind of the owning resource.
    pub kind: String,
    /// Name of the owning resource.
    pub name: String,
    /// Attribute path on the owning resource.
    pub attribute: String,
}

impl Reference {
    /// Create a new reference.
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            attribute: attribute.into(),
        }
    }

    /// The self-link of an HTTP health check.
    pub fn health_check(name: impl Into<String>) -> Self {
        Self::new(HTTP_HEALTH_CHECK_KIND, name, SELF_LINK)
    }

    /// The instance group produced by an instance group manager.
    pub fn instance_group(manager: impl Into<String>) -> Self {
        Self::new(INSTANCE_GROUP_MANAGER_KIND, manager, INSTANCE_GROUP)
    }

    /// Parse the interpolation form `${kind.name.attribute}`.
    pub fn parse_interpolation(text: &str) -> Option<Self> {
        let inner = text.trim().strip_prefix("${")?.strip_suffix('}')?;
        let mut parts = inner.splitn(3, '.');
        let kind = parts.next().filter(|p| !p.is_empty())?;
        let name = parts.next().filter(|p| !p.is_empty())?;
        let attribute = parts.next().filter(|p| !p.is_empty())?;
        Some(Self::new(kind, name, attribute))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}.{}}}", self.kind, self.name, self.attribute)
    }
}

/// A link to another resource: either a concrete URL or a reference that
/// must be resolved first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, from = "LinkRepr")]
pub enum Link {
    /// Reference to be resolved before use.
    Ref(Reference),
    /// Already-concrete identifier or URL.
    Literal(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LinkRepr {
    Ref(Reference),
    Text(String),
}

impl From<LinkRepr> for Link {
    fn from(repr: LinkRepr) -> Self {
        match repr {
            LinkRepr::Ref(reference) => Self::Ref(reference),
            LinkRepr::Text(text) => Self::from(text),
        }
    }
}

impl From<Reference> for Link {
    fn from(reference: Reference) -> Self {
        Self::Ref(reference)
    }
}

impl From<String> for Link {
    fn from(text: String) -> Self {
        Reference::parse_interpolation(&text).map_or(Self::Literal(text), Self::Ref)
    }
}

impl From<&str> for Link {
    fn from(text: &str) -> Self {
        Self::from(text.to_string())
    }
}

impl Link {
    /// The reference, if this link is symbolic.
    pub const fn reference(&self) -> Option<&Reference> {
        match self {
            Self::Ref(reference) => Some(reference),
            Self::Literal(_) => None,
        }
    }
}

/// Application protocol spoken to the backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Http2,
    Tcp,
    Ssl,
    Udp,
    Grpc,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
            Self::Http2 => "HTTP2",
            Self::Tcp => "TCP",
            Self::Ssl => "SSL",
            Self::Udp => "UDP",
            Self::Grpc => "GRPC",
        };
        f.write_str(text)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Ok(Self::Http),
            "HTTPS" => Ok(Self::Https),
            "HTTP2" => Ok(Self::Http2),
            "TCP" => Ok(Self::Tcp),
            "SSL" => Ok(Self::Ssl),
            "UDP" => Ok(Self::Udp),
            "GRPC" => Ok(Self::Grpc),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

/// How load is spread across a backend's instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalancingMode {
    #[default]
    Utilization,
    Rate,
    Connection,
}

/// One backend entry: an instance group plus optional balancing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend<L> {
    /// The instance group serving traffic.
    pub group: L,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balancing_mode: Option<BalancingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_scaler: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rate_per_instance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_utilization: Option<f64>,
}

impl<L> Backend<L> {
    /// Create a backend for the given group with server defaults for the rest.
    pub const fn new(group: L) -> Self {
        Self {
            group,
            balancing_mode: None,
            capacity_scaler: None,
            description: None,
            max_rate: None,
            max_rate_per_instance: None,
            max_utilization: None,
        }
    }

    /// Set the balancing mode.
    #[must_use]
    pub const fn with_balancing_mode(mut self, mode: BalancingMode) -> Self {
        self.balancing_mode = Some(mode);
        self
    }

    /// Set the capacity scaler.
    #[must_use]
    pub const fn with_capacity_scaler(mut self, scaler: f64) -> Self {
        self.capacity_scaler = Some(scaler);
        self
    }

    /// Set the maximum utilization target.
    #[must_use]
    pub const fn with_max_utilization(mut self, utilization: f64) -> Self {
        self.max_utilization = Some(utilization);
        self
    }

    /// Set the maximum request rate.
    #[must_use]
    pub const fn with_max_rate(mut self, rate: u32) -> Self {
        self.max_rate = Some(rate);
        self
    }

    /// Replace the group link, keeping the balancing parameters.
    pub fn try_map_group<M, E>(
        &self,
        f: impl FnOnce(&L) -> Result<M, E>,
    ) -> Result<Backend<M>, E> {
        Ok(Backend {
            group: f(&self.group)?,
            balancing_mode: self.balancing_mode,
            capacity_scaler: self.capacity_scaler,
            description: self.description.clone(),
            max_rate: self.max_rate,
            max_rate_per_instance: self.max_rate_per_instance,
            max_utilization: self.max_utilization,
        })
    }
}

impl Backend<String> {
    /// Whether an observed backend satisfies this desired one.
    ///
    /// Parameters this backend leaves unset are not compared, so server
    /// defaults on the observed side never count as drift.
    pub fn satisfied_by(&self, observed: &Self) -> bool {
        fn unset_or_eq<T: PartialEq>(desired: Option<&T>, observed: Option<&T>) -> bool {
            desired.is_none_or(|d| observed == Some(d))
        }

        self.group == observed.group
            && unset_or_eq(self.balancing_mode.as_ref(), observed.balancing_mode.as_ref())
            && unset_or_eq(self.capacity_scaler.as_ref(), observed.capacity_scaler.as_ref())
            && unset_or_eq(self.description.as_ref(), observed.description.as_ref())
            && unset_or_eq(self.max_rate.as_ref(), observed.max_rate.as_ref())
            && unset_or_eq(
                self.max_rate_per_instance.as_ref(),
                observed.max_rate_per_instance.as_ref(),
            )
            && unset_or_eq(self.max_utilization.as_ref(), observed.max_utilization.as_ref())
    }
}

/// Declared configuration of a backend service.
///
/// Every optional attribute left as `None` is "not mentioned": reconciling
/// never changes its remote value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "L: Deserialize<'de>"))]
pub struct ServiceConfig<L> {
    /// Identity of the resource. Immutable once it exists.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_cdn: Option<bool>,
    /// Region for regional services. `None` creates a global service and
    /// leaves an existing service's region uncompared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, rename = "backend", skip_serializing_if = "Option::is_none")]
    pub backends: Option<Vec<Backend<L>>>,
    /// Health checks, in declaration order. Must not be empty.
    pub health_checks: Vec<L>,
}

/// Desired state as declared, possibly holding unresolved references.
pub type DesiredState = ServiceConfig<Link>;

/// Desired state with every reference replaced by a concrete URL.
pub type ResolvedState = ServiceConfig<String>;

impl<L> ServiceConfig<L> {
    /// Create a config with the mandatory attributes only.
    pub fn new(name: impl Into<String>, health_checks: Vec<L>) -> Self {
        Self {
            name: name.into(),
            description: None,
            port_name: None,
            protocol: None,
            timeout_sec: None,
            enable_cdn: None,
            region: None,
            backends: None,
            health_checks,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the named port the backends listen on.
    #[must_use]
    pub fn with_port_name(mut self, port_name: impl Into<String>) -> Self {
        self.port_name = Some(port_name.into());
        self
    }

    /// Set the protocol.
    #[must_use]
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Set the backend timeout in seconds.
    #[must_use]
    pub const fn with_timeout_sec(mut self, timeout_sec: u32) -> Self {
        self.timeout_sec = Some(timeout_sec);
        self
    }

    /// Enable or disable Cloud CDN.
    #[must_use]
    pub const fn with_enable_cdn(mut self, enable: bool) -> Self {
        self.enable_cdn = Some(enable);
        self
    }

    /// Make the service regional.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Append a backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Backend<L>) -> Self {
        self.backends.get_or_insert_with(Vec::new).push(backend);
        self
    }

    /// Replace the health checks.
    #[must_use]
    pub fn with_health_checks(mut self, health_checks: Vec<L>) -> Self {
        self.health_checks = health_checks;
        self
    }

    /// Map every link through a fallible function, keeping everything else.
    pub fn try_map_links<M, E>(
        &self,
        mut f: impl FnMut(&L) -> Result<M, E>,
    ) -> Result<ServiceConfig<M>, E> {
        let backends = match &self.backends {
            Some(list) => Some(
                list.iter()
                    .map(|b| b.try_map_group(&mut f))
                    .collect::<Result<Vec<_>, E>>()?,
            ),
            None => None,
        };
        let health_checks = self
            .health_checks
            .iter()
            .map(&mut f)
            .collect::<Result<Vec<_>, E>>()?;

        Ok(ServiceConfig {
            name: self.name.clone(),
            description: self.description.clone(),
            port_name: self.port_name.clone(),
            protocol: self.protocol,
            timeout_sec: self.timeout_sec,
            enable_cdn: self.enable_cdn,
            region: self.region.clone(),
            backends,
            health_checks,
        })
    }
}

impl DesiredState {
    /// All references in declaration order: backends first, then health checks.
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.backends
            .iter()
            .flatten()
            .map(|b| &b.group)
            .chain(self.health_checks.iter())
            .filter_map(Link::reference)
    }

    /// Whether the document holds no references at all.
    pub fn is_resolved(&self) -> bool {
        self.references().next().is_none()
    }
}

/// The representation of a backend service reported by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    pub name: String,
    pub description: String,
    pub port_name: String,
    pub protocol: Protocol,
    pub timeout_sec: u32,
    pub enable_cdn: bool,
    pub region: Option<String>,
    pub backends: Vec<Backend<String>>,
    pub health_checks: Vec<String>,
    /// Server-assigned creation time.
    pub creation_timestamp: DateTime<Utc>,
    /// Version token; changes on every write.
    pub fingerprint: String,
    /// Canonical URL of the resource.
    pub self_link: String,
}

/// What the caller asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create or update until the remote matches the desired state.
    Apply,
    /// Fetch the remote state without mutating it.
    Read,
    /// Delete the remote resource.
    Destroy,
    /// Compute what `Apply` would do without mutating anything.
    Plan,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Read => write!(f, "read"),
            Self::Destroy => write!(f, "destroy"),
            Self::Plan => write!(f, "plan"),
        }
    }
}

/// One reconciliation request.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    /// The declared configuration.
    pub desired: DesiredState,
    /// What to do with it.
    pub operation: Operation,
    /// Budget for the whole pass.
    pub timeout: Duration,
    /// Identity of the existing remote resource, when it differs from
    /// `desired.name` (e.g. the name was edited after creation).
    pub target: Option<String>,
}

impl ReconcileRequest {
    /// Create a request.
    pub const fn new(desired: DesiredState, operation: Operation, timeout: Duration) -> Self {
        Self {
            desired,
            operation,
            timeout,
            target: None,
        }
    }

    /// An apply request.
    pub const fn apply(desired: DesiredState, timeout: Duration) -> Self {
        Self::new(desired, Operation::Apply, timeout)
    }

    /// A read request.
    pub const fn read(desired: DesiredState, timeout: Duration) -> Self {
        Self::new(desired, Operation::Read, timeout)
    }

    /// A destroy request.
    pub const fn destroy(desired: DesiredState, timeout: Duration) -> Self {
        Self::new(desired, Operation::Destroy, timeout)
    }

    /// A plan request.
    pub const fn plan(desired: DesiredState, timeout: Duration) -> Self {
        Self::new(desired, Operation::Plan, timeout)
    }

    /// Target an existing resource under a different identity.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Identity of the remote resource this request acts on.
    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.desired.name)
    }
}

/// What `Apply` would do, as reported by `Plan`.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// The resource does not exist and would be created.
    Create,
    /// The resource would be updated in place.
    Update(crate::diff::Diff),
    /// The resource would need replacing; `Apply` refuses to do that.
    Replace(crate::diff::Diff),
    /// Nothing to do.
    NoOp,
}

/// The action a pass took.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// The resource was created.
    Created,
    /// The listed attributes were updated in place.
    Updated { attributes: Vec<Attribute> },
    /// The remote already matched.
    Unchanged,
    /// The resource was deleted.
    Deleted,
    /// Destroy found nothing to delete.
    AlreadyAbsent,
    /// Remote state was read.
    Read,
    /// Dry run.
    Planned(Plan),
}

/// Successful outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Identity the pass acted on.
    pub name: String,
    /// Lifecycle state at the end of the pass.
    pub state: ResourceState,
    /// What was done.
    pub action: Action,
    /// Final observed state; `None` when the resource is absent.
    pub observed: Option<ObservedState>,
}

impl ReconcileOutcome {
    /// Whether the pass issued a mutating call.
    pub const fn mutated(&self) -> bool {
        matches!(
            self.action,
            Action::Created | Action::Updated { .. } | Action::Deleted
        )
    }
}

/// Result of one reconciliation pass.
pub type ReconcileResult = crate::error::Result<ReconcileOutcome>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn test_parse_interpolation() {
        let reference =
            Reference::parse_interpolation("${google_compute_http_health_check.zero.self_link}");
        assert_eq!(reference, Some(Reference::health_check("zero")));
    }

    #[test]
    fn test_parse_interpolation_rejects_plain_text() {
        assert_eq!(Reference::parse_interpolation("https://example/hc"), None);
        assert_eq!(Reference::parse_interpolation("${kind.name}"), None);
        assert_eq!(Reference::parse_interpolation("${.a.b}"), None);
    }

    #[test]
    fn test_reference_display_round_trips_interpolation() {
        let reference = Reference::instance_group("foobar");
        let text = reference.to_string();
        assert_eq!(
            text,
            "${google_compute_instance_group_manager.foobar.instance_group}"
        );
        assert_eq!(Reference::parse_interpolation(&text), Some(reference));
    }

    #[test]
    fn test_link_from_string_detects_references() {
        assert!(matches!(
            Link::from("${google_compute_http_health_check.one.self_link}"),
            Link::Ref(_)
        ));
        assert!(matches!(Link::from("https://hc/one"), Link::Literal(_)));
    }

    #[test]
    fn test_desired_state_deserializes_interpolations() {
        let doc = r#"
            name = "hello-world-bs"
            description = "Hello World 1234"
            port_name = "http"
            protocol = "HTTP"
            timeout_sec = 10
            health_checks = ["${google_compute_http_health_check.default.self_link}"]

            [[backend]]
            group = "${google_compute_instance_group_manager.foobar.instance_group}"
        "#;

        let desired: DesiredState = toml::from_str(doc).unwrap();
        assert_eq!(desired.protocol, Some(Protocol::Http));
        assert_eq!(desired.timeout_sec, Some(10));
        assert_eq!(desired.backends.as_ref().map(Vec::len), Some(1));
        assert_eq!(desired.references().count(), 2);
        assert!(!desired.is_resolved());
    }

    #[test]
    fn test_references_in_declaration_order() {
        let desired = DesiredState::new(
            "svc",
            vec![
                Link::from(Reference::health_check("a")),
                Link::from("https://hc/literal"),
            ],
        )
        .with_backend(Backend::new(Link::from(Reference::instance_group("igm"))));

        let refs: Vec<_> = desired.references().cloned().collect();
        assert_eq!(
            refs,
            vec![Reference::instance_group("igm"), Reference::health_check("a")]
        );
    }

    #[test]
    fn test_backend_unset_parameters_are_not_compared() {
        let desired = Backend::new("ig".to_string());
        let observed = Backend::new("ig".to_string())
            .with_balancing_mode(BalancingMode::Utilization)
            .with_capacity_scaler(1.0);
        assert!(desired.satisfied_by(&observed));

        let stricter = desired.clone().with_capacity_scaler(0.5);
        assert!(!stricter.satisfied_by(&observed));
    }

    #[test]
    fn test_protocol_parse_and_display() {
        assert_eq!("https".parse::<Protocol>(), Ok(Protocol::Https));
        assert_eq!(Protocol::Http2.to_string(), "HTTP2");
        assert!("QUIC".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_request_target_defaults_to_desired_name() {
        let desired = DesiredState::new("blablah", vec![Link::from("hc")]);
        let request = ReconcileRequest::apply(desired, Duration::from_secs(5));
        assert_eq!(request.target_name(), "blablah");
        assert_eq!(request.with_target("old-name").target_name(), "old-name");
    }
}
