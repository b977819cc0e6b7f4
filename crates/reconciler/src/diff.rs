//! Drift detection between desired and observed state.
//!
//! Comparison is attribute by attribute over a fixed set. Attributes the
//! desired document leaves unset never produce a change, and the backend and
//! health-check collections compare as sets.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Backend, ObservedState, Protocol, ResolvedState};

/// An attribute taking part in drift comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Name,
    Region,
    Description,
    PortName,
    Protocol,
    TimeoutSec,
    EnableCdn,
    Backends,
    HealthChecks,
}

impl Attribute {
    /// The fixed comparison set, in comparison order.
    pub const ALL: [Self; 9] = [
        Self::Name,
        Self::Region,
        Self::Description,
        Self::PortName,
        Self::Protocol,
        Self::TimeoutSec,
        Self::EnableCdn,
        Self::Backends,
        Self::HealthChecks,
    ];

    /// Identity-bearing attributes cannot be changed in place.
    pub const fn is_identity(self) -> bool {
        matches!(self, Self::Name | Self::Region)
    }

    /// How a change to this attribute must be applied.
    pub const fn change_kind(self) -> ChangeKind {
        if self.is_identity() {
            ChangeKind::RequiresReplace
        } else {
            ChangeKind::InPlaceUpdate
        }
    }

    /// Field name as used in configuration documents.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Region => "region",
            Self::Description => "description",
            Self::PortName => "port_name",
            Self::Protocol => "protocol",
            Self::TimeoutSec => "timeout_sec",
            Self::EnableCdn => "enable_cdn",
            Self::Backends => "backend",
            Self::HealthChecks => "health_checks",
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a single attribute comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Unchanged,
    InPlaceUpdate,
    RequiresReplace,
}

/// One changed attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub attribute: Attribute,
    pub desired: Value,
    pub observed: Value,
    pub kind: ChangeKind,
}

/// The minimal set of changed attributes for one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    changes: Vec<AttributeChange>,
}

impl Diff {
    /// Whether nothing needs to change.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changed attributes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// The changed attributes.
    pub fn changes(&self) -> &[AttributeChange] {
        &self.changes
    }

    /// The change recorded for an attribute, if any.
    pub fn get(&self, attribute: Attribute) -> Option<&AttributeChange> {
        self.changes.iter().find(|c| c.attribute == attribute)
    }

    /// Classification of an attribute in this diff.
    pub fn kind_of(&self, attribute: Attribute) -> ChangeKind {
        self.get(attribute).map_or(ChangeKind::Unchanged, |c| c.kind)
    }

    /// Whether any change forces replacement.
    pub fn requires_replace(&self) -> bool {
        self.changes
            .iter()
            .any(|c| c.kind == ChangeKind::RequiresReplace)
    }

    /// Attributes whose change forces replacement.
    pub fn replacement_attributes(&self) -> Vec<Attribute> {
        self.attributes_of(ChangeKind::RequiresReplace)
    }

    /// Attributes that can be updated in place.
    pub fn in_place_attributes(&self) -> Vec<Attribute> {
        self.attributes_of(ChangeKind::InPlaceUpdate)
    }

    fn attributes_of(&self, kind: ChangeKind) -> Vec<Attribute> {
        self.changes
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.attribute)
            .collect()
    }
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Compare one attribute; `None` on the desired side means "not mentioned".
fn compare<T, F>(
    attribute: Attribute,
    desired: Option<&T>,
    observed: &T,
    equal: F,
) -> Option<AttributeChange>
where
    T: Serialize + ?Sized,
    F: FnOnce(&T, &T) -> bool,
{
    let desired = desired?;
    if equal(desired, observed) {
        return None;
    }
    Some(AttributeChange {
        attribute,
        desired: to_value(desired),
        observed: to_value(observed),
        kind: attribute.change_kind(),
    })
}

/// Set equality, ignoring order and duplicates.
pub fn same_members(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Backend lists match when they cover the same groups and each desired
/// backend is satisfied by its observed counterpart.
pub fn backends_match(desired: &[Backend<String>], observed: &[Backend<String>]) -> bool {
    let observed_by_group: BTreeMap<&str, &Backend<String>> =
        observed.iter().map(|b| (b.group.as_str(), b)).collect();
    let desired_groups: BTreeSet<&str> = desired.iter().map(|b| b.group.as_str()).collect();

    desired_groups.len() == observed_by_group.len()
        && desired.iter().all(|d| {
            observed_by_group
                .get(d.group.as_str())
                .is_some_and(|o| d.satisfied_by(o))
        })
}

/// Compute the drift between desired and observed state.
pub fn diff(desired: &ResolvedState, observed: &ObservedState) -> Diff {
    let changes = Attribute::ALL
        .iter()
        .filter_map(|attribute| compare_attribute(*attribute, desired, observed))
        .collect();
    Diff { changes }
}

fn compare_attribute(
    attribute: Attribute,
    desired: &ResolvedState,
    observed: &ObservedState,
) -> Option<AttributeChange> {
    match attribute {
        Attribute::Name => compare(attribute, Some(&desired.name), &observed.name, |a, b| a == b),
        Attribute::Region => compare(
            attribute,
            desired.region.is_some().then_some(&desired.region),
            &observed.region,
            |a, b| a == b,
        ),
        Attribute::Description => compare(
            attribute,
            desired.description.as_ref(),
            &observed.description,
            |a, b| a == b,
        ),
        Attribute::PortName => compare(
            attribute,
            desired.port_name.as_ref(),
            &observed.port_name,
            |a, b| a == b,
        ),
        Attribute::Protocol => compare(
            attribute,
            desired.protocol.as_ref(),
            &observed.protocol,
            |a: &Protocol, b: &Protocol| a == b,
        ),
        Attribute::TimeoutSec => compare(
            attribute,
            desired.timeout_sec.as_ref(),
            &observed.timeout_sec,
            |a, b| a == b,
        ),
        Attribute::EnableCdn => compare(
            attribute,
            desired.enable_cdn.as_ref(),
            &observed.enable_cdn,
            |a, b| a == b,
        ),
        Attribute::Backends => compare(
            attribute,
            desired.backends.as_deref(),
            observed.backends.as_slice(),
            backends_match,
        ),
        Attribute::HealthChecks => compare(
            attribute,
            Some(desired.health_checks.as_slice()),
            observed.health_checks.as_slice(),
            same_members,
        ),
    }
}

/// The in-place subset of a diff, ready to send to the remote API.
///
/// Only attributes present in the diff are set; the fingerprint is the
/// version the patch was computed against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicePatch {
    pub fingerprint: String,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backends: Option<Vec<Backend<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_checks: Option<Vec<String>>,
}

impl ServicePatch {
    /// Build the patch for the in-place changes of `diff`.
    ///
    /// Identity changes are never part of a patch.
    pub fn from_diff(diff: &Diff, desired: &ResolvedState, fingerprint: impl Into<String>) -> Self {
        let mut patch = Self {
            fingerprint: fingerprint.into(),
            ..Self::default()
        };
        for attribute in diff.in_place_attributes() {
            match attribute {
                Attribute::Description => patch.description.clone_from(&desired.description),
                Attribute::PortName => patch.port_name.clone_from(&desired.port_name),
                Attribute::Protocol => patch.protocol = desired.protocol,
                Attribute::TimeoutSec => patch.timeout_sec = desired.timeout_sec,
                Attribute::EnableCdn => patch.enable_cdn = desired.enable_cdn,
                Attribute::Backends => patch.backends.clone_from(&desired.backends),
                Attribute::HealthChecks => {
                    patch.health_checks = Some(desired.health_checks.clone());
                }
                Attribute::Name | Attribute::Region => {}
            }
        }
        patch
    }

    /// Attributes this patch sets.
    pub fn attributes(&self) -> Vec<Attribute> {
        [
            (Attribute::Description, self.description.is_some()),
            (Attribute::PortName, self.port_name.is_some()),
            (Attribute::Protocol, self.protocol.is_some()),
            (Attribute::TimeoutSec, self.timeout_sec.is_some()),
            (Attribute::EnableCdn, self.enable_cdn.is_some()),
            (Attribute::Backends, self.backends.is_some()),
            (Attribute::HealthChecks, self.health_checks.is_some()),
        ]
        .into_iter()
        .filter_map(|(attribute, set)| set.then_some(attribute))
        .collect()
    }

    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.attributes().is_empty()
    }

    /// Apply the patch to a representation, leaving unset attributes alone.
    pub fn apply_to(&self, observed: &mut ObservedState) {
        if let Some(description) = &self.description {
            observed.description.clone_from(description);
        }
        if let Some(port_name) = &self.port_name {
            observed.port_name.clone_from(port_name);
        }
        if let Some(protocol) = self.protocol {
            observed.protocol = protocol;
        }
        if let Some(timeout_sec) = self.timeout_sec {
            observed.timeout_sec = timeout_sec;
        }
        if let Some(enable_cdn) = self.enable_cdn {
            observed.enable_cdn = enable_cdn;
        }
        if let Some(backends) = &self.backends {
            observed.backends.clone_from(backends);
        }
        if let Some(health_checks) = &self.health_checks {
            observed.health_checks.clone_from(health_checks);
        }
    }
}
