//! Composable validation checks.
//!
//! A [`Check`] is a labelled predicate; [`compose`] runs several and reports
//! every failure rather than the first. The same machinery validates
//! desired documents before a pass and asserts on observed state in tests.

use std::collections::BTreeSet;
use std::fmt;

use itertools::Itertools;

use crate::types::{DesiredState, Link, ObservedState, Protocol};

/// Longest name the API accepts.
pub const MAX_NAME_LEN: usize = 63;
/// Accepted range of `timeout_sec`.
pub const TIMEOUT_SEC_RANGE: std::ops::RangeInclusive<u32> = 1..=86_400;

const NAME_PATTERN: &str = r"^[a-z]([-a-z0-9]*[a-z0-9])?$";

type Predicate<T> = Box<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

/// A labelled predicate over `T`.
pub struct Check<T> {
    label: String,
    predicate: Predicate<T>,
}

impl<T> Check<T> {
    /// Create a check; the predicate returns the failure reason on error.
    pub fn new<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            predicate: Box::new(predicate),
        }
    }

    /// The check's label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the check.
    ///
    /// # Errors
    ///
    /// Returns the labelled failure.
    pub fn run(&self, subject: &T) -> Result<(), CheckFailure> {
        (self.predicate)(subject).map_err(|reason| CheckFailure {
            label: self.label.clone(),
            reason,
        })
    }
}

impl<T> fmt::Debug for Check<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check").field("label", &self.label).finish_non_exhaustive()
    }
}

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    pub label: String,
    pub reason: String,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.reason)
    }
}

/// Every failure of a composed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailures(Vec<CheckFailure>);

impl CheckFailures {
    /// The individual failures, in check order.
    pub fn failures(&self) -> &[CheckFailure] {
        &self.0
    }

    /// Whether a check with this label failed.
    pub fn contains(&self, label: &str) -> bool {
        self.0.iter().any(|f| f.label == label)
    }
}

impl fmt::Display for CheckFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().join("; "))
    }
}

/// An ordered set of checks run together.
#[derive(Debug)]
pub struct Checks<T> {
    checks: Vec<Check<T>>,
}

impl<T> Default for Checks<T> {
    fn default() -> Self {
        Self { checks: Vec::new() }
    }
}

impl<T> Checks<T> {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a check.
    #[must_use]
    pub fn with(mut self, check: Check<T>) -> Self {
        self.checks.push(check);
        self
    }

    /// Number of checks.
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether the set holds no checks.
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check.
    ///
    /// # Errors
    ///
    /// Returns all failures if any check failed.
    pub fn run(&self, subject: &T) -> Result<(), CheckFailures> {
        let failures: Vec<_> = self
            .checks
            .iter()
            .filter_map(|c| c.run(subject).err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CheckFailures(failures))
        }
    }
}

/// Compose checks into one set.
pub fn compose<T>(checks: impl IntoIterator<Item = Check<T>>) -> Checks<T> {
    Checks {
        checks: checks.into_iter().collect(),
    }
}

fn in_unit_range(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

/// Validation of a desired document before any remote call.
pub fn desired_state_checks() -> Checks<DesiredState> {
    compose([
        Check::new("name", |d: &DesiredState| {
            let pattern = regex::Regex::new(NAME_PATTERN)
                .map_err(|e| format!("invalid name pattern: {e}"))?;
            if d.name.len() > MAX_NAME_LEN {
                return Err(format!(
                    "'{}' exceeds {MAX_NAME_LEN} characters",
                    d.name
                ));
            }
            if !pattern.is_match(&d.name) {
                return Err(format!("'{}' must match {NAME_PATTERN}", d.name));
            }
            Ok(())
        }),
        Check::new("health_checks", |d: &DesiredState| {
            if d.health_checks.is_empty() {
                Err("at least one health check is required".to_string())
            } else {
                Ok(())
            }
        }),
        Check::new("timeout_sec", |d: &DesiredState| match d.timeout_sec {
            Some(t) if !TIMEOUT_SEC_RANGE.contains(&t) => Err(format!(
                "{t} is outside {}..={}",
                TIMEOUT_SEC_RANGE.start(),
                TIMEOUT_SEC_RANGE.end()
            )),
            _ => Ok(()),
        }),
        Check::new("backend.group", |d: &DesiredState| {
            let mut seen = BTreeSet::new();
            let duplicates: Vec<String> = d
                .backends
                .iter()
                .flatten()
                .map(|b| link_key(&b.group))
                .filter(|key| !seen.insert(key.clone()))
                .collect();
            if duplicates.is_empty() {
                Ok(())
            } else {
                Err(format!("duplicate groups: {}", duplicates.join(", ")))
            }
        }),
        Check::new("backend.capacity_scaler", |d: &DesiredState| {
            d.backends
                .iter()
                .flatten()
                .filter_map(|b| b.capacity_scaler)
                .find(|v| !in_unit_range(*v))
                .map_or(Ok(()), |v| Err(format!("{v} is outside 0.0..=1.0")))
        }),
        Check::new("backend.max_utilization", |d: &DesiredState| {
            d.backends
                .iter()
                .flatten()
                .filter_map(|b| b.max_utilization)
                .find(|v| !in_unit_range(*v))
                .map_or(Ok(()), |v| Err(format!("{v} is outside 0.0..=1.0")))
        }),
    ])
}

fn link_key(link: &Link) -> String {
    match link {
        Link::Literal(url) => url.clone(),
        Link::Ref(reference) => reference.to_string(),
    }
}

/// The resource exists under `name`.
pub fn exists(name: impl Into<String>) -> Check<Option<ObservedState>> {
    let name = name.into();
    Check::new("exists", move |observed: &Option<ObservedState>| match observed {
        Some(o) if o.name == name => Ok(()),
        Some(o) => Err(format!("found '{}' instead of '{name}'", o.name)),
        None => Err(format!("'{name}' does not exist")),
    })
}

/// The resource is gone.
pub fn destroyed() -> Check<Option<ObservedState>> {
    Check::new("destroyed", |observed: &Option<ObservedState>| match observed {
        Some(o) => Err(format!("'{}' still exists", o.name)),
        None => Ok(()),
    })
}

fn observed_field<F>(label: &str, f: F) -> Check<Option<ObservedState>>
where
    F: Fn(&ObservedState) -> Result<(), String> + Send + Sync + 'static,
{
    Check::new(label, move |observed: &Option<ObservedState>| {
        observed
            .as_ref()
            .ok_or_else(|| "resource does not exist".to_string())
            .and_then(&f)
    })
}

/// The observed protocol equals `expected`.
pub fn protocol_is(expected: Protocol) -> Check<Option<ObservedState>> {
    observed_field("protocol", move |o| {
        if o.protocol == expected {
            Ok(())
        } else {
            Err(format!("expected {expected}, got {}", o.protocol))
        }
    })
}

/// The observed timeout equals `expected` seconds.
pub fn timeout_is(expected: u32) -> Check<Option<ObservedState>> {
    observed_field("timeout_sec", move |o| {
        if o.timeout_sec == expected {
            Ok(())
        } else {
            Err(format!("expected {expected}, got {}", o.timeout_sec))
        }
    })
}

/// The resource has exactly `expected` backends.
pub fn backend_count(expected: usize) -> Check<Option<ObservedState>> {
    observed_field("backend", move |o| {
        if o.backends.len() == expected {
            Ok(())
        } else {
            Err(format!("expected {expected} backends, got {}", o.backends.len()))
        }
    })
}

/// The observed health checks are exactly `expected`, in any order.
pub fn health_checks_are(expected: Vec<String>) -> Check<Option<ObservedState>> {
    observed_field("health_checks", move |o| {
        if crate::diff::same_members(&o.health_checks, &expected) {
            Ok(())
        } else {
            Err(format!("expected {expected:?}, got {:?}", o.health_checks))
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use chrono::Utc;

    use super::*;
    use crate::types::{Backend, Reference};

    fn valid() -> DesiredState {
        DesiredState::new("hello-world-bs", vec![Link::from(Reference::health_check("zero"))])
            .with_timeout_sec(10)
    }

    fn observed(name: &str) -> ObservedState {
        ObservedState {
            name: name.to_string(),
            description: String::new(),
            port_name: "http".to_string(),
            protocol: Protocol::Http,
            timeout_sec: 30,
            enable_cdn: false,
            region: None,
            backends: vec![],
            health_checks: vec!["hc-a".to_string(), "hc-b".to_string()],
            creation_timestamp: Utc::now(),
            fingerprint: "f".to_string(),
            self_link: String::new(),
        }
    }

    #[test]
    fn test_valid_document_passes() {
        assert!(desired_state_checks().run(&valid()).is_ok());
    }

    #[test]
    fn test_every_failure_is_reported() {
        let bad = DesiredState::new("Bad_Name", vec![])
            .with_timeout_sec(0)
            .with_backend(Backend::new(Link::from("ig")).with_capacity_scaler(1.5))
            .with_backend(Backend::new(Link::from("ig")).with_max_utilization(-0.1));

        let failures = desired_state_checks().run(&bad).unwrap_err();
        for label in [
            "name",
            "health_checks",
            "timeout_sec",
            "backend.group",
            "backend.capacity_scaler",
            "backend.max_utilization",
        ] {
            assert!(failures.contains(label), "missing {label}: {failures}");
        }
        assert_eq!(failures.failures().len(), 6);
    }

    #[test]
    fn test_name_rules() {
        let checks = desired_state_checks();
        for ok in ["a", "blablah", "tf-test-0", "a1"] {
            let d = valid().with_health_checks(vec![Link::from("hc")]);
            let d = DesiredState { name: ok.to_string(), ..d };
            assert!(checks.run(&d).is_ok(), "{ok} should be valid");
        }
        let long = "a".repeat(64);
        for bad in ["", "1abc", "abc-", "ABC", long.as_str()] {
            let d = DesiredState { name: bad.to_string(), ..valid() };
            assert!(checks.run(&d).unwrap_err().contains("name"), "{bad} should be invalid");
        }
    }

    #[test]
    fn test_observed_assertions() {
        let present = Some(observed("svc"));
        let all = compose([
            exists("svc"),
            protocol_is(Protocol::Http),
            timeout_is(30),
            backend_count(0),
            health_checks_are(vec!["hc-b".to_string(), "hc-a".to_string()]),
        ]);
        assert!(all.run(&present).is_ok());
        assert!(destroyed().run(&present).is_err());

        let failures = compose([exists("svc"), timeout_is(30)]).run(&None).unwrap_err();
        assert_eq!(failures.failures().len(), 2);
        assert!(destroyed().run(&None).is_ok());
    }

    #[test]
    fn test_failures_display_joined() {
        let failures = compose([
            Check::new("a", |_: &u8| Err("first".to_string())),
            Check::new("b", |_: &u8| Ok(())),
            Check::new("c", |_: &u8| Err("second".to_string())),
        ])
        .run(&0)
        .unwrap_err();
        assert_eq!(failures.to_string(), "a: first; c: second");
    }
}
