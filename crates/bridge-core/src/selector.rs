//! Bridge selection
//!
//! Selection runs a policy chain over a catalog snapshot. Hard policies
//! (health, exclusions, version pin) fail the selection when nothing
//! survives them; preference policies fall back to the incoming candidate
//! list when their preference is unsatisfiable. Whatever remains is ranked
//! by stress with ties broken by sorted service address.

use crate::bridge::Bridge;
use crate::catalog::BridgeCatalog;
use confocus_xmpp_core::Jid;
use std::sync::Arc;
use tracing::debug;

/// Inputs to one selection decision.
#[derive(Debug, Clone, Default)]
pub struct SelectionConstraints {
    /// Required bridge version, when the conference is pinned.
    pub pinned_version: Option<String>,
    /// Region of the participant being placed.
    pub participant_region: Option<String>,
    /// Bridges already hosting this conference.
    pub in_conference: Vec<Jid>,
    /// Bridges that already failed for this conference; never re-tried.
    pub excluded: Vec<Jid>,
    /// True when selecting an additional bridge for the relay mesh, which
    /// must differ from every bridge already in the conference.
    pub additional_bridge: bool,
}

/// One link of the selection chain.
pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hard policies fail the selection when they produce no candidates;
    /// preference policies fall back to the incoming list instead.
    fn required(&self) -> bool {
        false
    }

    fn narrow(&self, candidates: Vec<Bridge>, ctx: &SelectionConstraints) -> Vec<Bridge>;
}

/// Drops non-operational and draining bridges, and explicit exclusions.
pub struct HealthPolicy;

impl SelectionPolicy for HealthPolicy {
    fn name(&self) -> &'static str {
        "health"
    }

    fn required(&self) -> bool {
        true
    }

    fn narrow(&self, candidates: Vec<Bridge>, ctx: &SelectionConstraints) -> Vec<Bridge> {
        candidates
            .into_iter()
            .filter(|b| b.is_selectable() && !ctx.excluded.contains(&b.jid))
            .collect()
    }
}

/// Honours a version pin by filtering.
pub struct VersionPinPolicy;

impl SelectionPolicy for VersionPinPolicy {
    fn name(&self) -> &'static str {
        "version-pin"
    }

    fn required(&self) -> bool {
        true
    }

    fn narrow(&self, candidates: Vec<Bridge>, ctx: &SelectionConstraints) -> Vec<Bridge> {
        match &ctx.pinned_version {
            Some(pin) => candidates
                .into_iter()
                .filter(|b| b.version.as_deref() == Some(pin.as_str()))
                .collect(),
            None => candidates,
        }
    }
}

/// Keeps the conference on the bridges it already uses, or — when an
/// additional mesh bridge is wanted — insists on a bridge it does not.
pub struct ConferenceAffinityPolicy;

impl SelectionPolicy for ConferenceAffinityPolicy {
    fn name(&self) -> &'static str {
        "conference-affinity"
    }

    fn narrow(&self, candidates: Vec<Bridge>, ctx: &SelectionConstraints) -> Vec<Bridge> {
        if ctx.in_conference.is_empty() {
            return candidates;
        }
        if ctx.additional_bridge {
            // A relay peer must be a new bridge; this preference is a hard
            // requirement for mesh growth.
            return candidates
                .into_iter()
                .filter(|b| !ctx.in_conference.contains(&b.jid))
                .collect();
        }
        candidates
            .into_iter()
            .filter(|b| ctx.in_conference.contains(&b.jid))
            .collect()
    }

    fn required(&self) -> bool {
        false
    }
}

/// Prefers the participant's region when a viable bridge exists there.
pub struct RegionPolicy;

impl SelectionPolicy for RegionPolicy {
    fn name(&self) -> &'static str {
        "region"
    }

    fn narrow(&self, candidates: Vec<Bridge>, ctx: &SelectionConstraints) -> Vec<Bridge> {
        match &ctx.participant_region {
            Some(region) => candidates
                .into_iter()
                .filter(|b| b.region.as_deref() == Some(region.as_str()))
                .collect(),
            None => candidates,
        }
    }
}

/// Selects one bridge per participant from catalog snapshots.
pub struct BridgeSelector {
    catalog: Arc<BridgeCatalog>,
    policies: Vec<Box<dyn SelectionPolicy>>,
}

impl BridgeSelector {
    /// The standard chain: health → version pin → conference affinity →
    /// region, then lowest stress with address tie-break.
    pub fn new(catalog: Arc<BridgeCatalog>) -> Self {
        Self::with_policies(
            catalog,
            vec![
                Box::new(HealthPolicy),
                Box::new(VersionPinPolicy),
                Box::new(ConferenceAffinityPolicy),
                Box::new(RegionPolicy),
            ],
        )
    }

    pub fn with_policies(
        catalog: Arc<BridgeCatalog>,
        policies: Vec<Box<dyn SelectionPolicy>>,
    ) -> Self {
        Self { catalog, policies }
    }

    /// Run the chain over the current catalog snapshot.
    pub fn select(&self, constraints: &SelectionConstraints) -> Option<Bridge> {
        let mut candidates = self.catalog.operational_bridges();
        for policy in &self.policies {
            let narrowed = policy.narrow(candidates.clone(), constraints);
            if narrowed.is_empty() {
                if policy.required() {
                    debug!("selection failed at policy {}", policy.name());
                    return None;
                }
                // Preference unsatisfiable; keep the broader set.
                continue;
            }
            candidates = narrowed;
        }
        // Deterministic rank: lowest stress, then sorted service address.
        candidates.sort_by(|a, b| {
            a.effective_stress()
                .total_cmp(&b.effective_stress())
                .then_with(|| a.jid.cmp(&b.jid))
        });
        candidates.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence_ext::BridgeStatusExt;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn catalog_with(entries: &[(&str, &str, f64)]) -> Arc<BridgeCatalog> {
        let catalog = Arc::new(BridgeCatalog::new());
        for (name, region, stress) in entries {
            catalog.on_bridge_status(
                &jid(name),
                &BridgeStatusExt {
                    version: Some("2.3".to_string()),
                    region: Some(region.to_string()),
                    stress: Some(*stress),
                    ..Default::default()
                },
            );
        }
        catalog
    }

    #[test]
    fn prefers_participant_region() {
        let catalog = catalog_with(&[
            ("jvbA@ops.example", "us-east", 0.1),
            ("jvbB@ops.example", "eu-west", 0.2),
        ]);
        let selector = BridgeSelector::new(catalog);
        let picked = selector
            .select(&SelectionConstraints {
                participant_region: Some("eu-west".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(picked.jid, jid("jvbB@ops.example"));
    }

    #[test]
    fn conference_affinity_outranks_region() {
        // Single-bridge default: a second participant lands on the bridge
        // the conference already uses even if their region has one.
        let catalog = catalog_with(&[
            ("jvbA@ops.example", "us-east", 0.1),
            ("jvbB@ops.example", "eu-west", 0.2),
        ]);
        let selector = BridgeSelector::new(catalog);
        let picked = selector
            .select(&SelectionConstraints {
                participant_region: Some("eu-west".to_string()),
                in_conference: vec![jid("jvbA@ops.example")],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(picked.jid, jid("jvbA@ops.example"));
    }

    #[test]
    fn additional_bridge_must_be_new() {
        let catalog = catalog_with(&[
            ("jvbA@ops.example", "us-east", 0.1),
            ("jvbB@ops.example", "eu-west", 0.2),
        ]);
        let selector = BridgeSelector::new(catalog);
        let picked = selector
            .select(&SelectionConstraints {
                in_conference: vec![jid("jvbA@ops.example")],
                additional_bridge: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(picked.jid, jid("jvbB@ops.example"));
    }

    #[test]
    fn draining_bridges_are_skipped() {
        let catalog = catalog_with(&[
            ("jvbA@ops.example", "us-east", 0.1),
            ("jvbB@ops.example", "eu-west", 0.2),
        ]);
        catalog.on_bridge_status(
            &jid("jvbA@ops.example"),
            &BridgeStatusExt {
                graceful_shutdown: true,
                ..Default::default()
            },
        );
        let selector = BridgeSelector::new(catalog);
        let picked = selector.select(&SelectionConstraints::default()).unwrap();
        assert_eq!(picked.jid, jid("jvbB@ops.example"));
    }

    #[test]
    fn version_pin_filters_hard() {
        let catalog = catalog_with(&[("jvbA@ops.example", "us-east", 0.1)]);
        let selector = BridgeSelector::new(catalog);
        assert!(selector
            .select(&SelectionConstraints {
                pinned_version: Some("9.9".to_string()),
                ..Default::default()
            })
            .is_none());
    }

    #[test]
    fn ties_break_by_sorted_address() {
        let catalog = catalog_with(&[
            ("jvbB@ops.example", "us-east", 0.1),
            ("jvbA@ops.example", "us-east", 0.1),
        ]);
        let selector = BridgeSelector::new(catalog);
        let picked = selector.select(&SelectionConstraints::default()).unwrap();
        assert_eq!(picked.jid, jid("jvbA@ops.example"));
    }

    #[test]
    fn excluded_bridges_never_come_back() {
        let catalog = catalog_with(&[("jvbA@ops.example", "us-east", 0.1)]);
        let selector = BridgeSelector::new(catalog);
        assert!(selector
            .select(&SelectionConstraints {
                excluded: vec![jid("jvbA@ops.example")],
                ..Default::default()
            })
            .is_none());
    }
}
