//! Validating source map
//!
//! Wraps the unchecked map and enforces every invariant atomically per
//! call: a rejected edit leaves the map untouched, an accepted edit commits
//! exactly the returned subset. Checks always run against the prospective
//! combined state, not the proposal alone.
//!
//! The "stream" used for label uniqueness is the connected component a
//! source belongs to when groups are edges: a simulcast group and the
//! retransmission pairs hanging off its layers are one stream and may
//! legally share one label.

use super::endpoint_set::EndpointSourceSet;
use super::map::{SourceMap, SourceMapDiff};
use crate::errors::SourceValidationError;
use crate::types::EndpointId;
use confocus_xmpp_core::sources::{GroupSemantics, MediaType, Ssrc};
use std::collections::{HashMap, HashSet};

/// Owner → source set with invariants and per-owner budgets.
#[derive(Debug, Clone)]
pub struct ValidatingSourceMap {
    inner: SourceMap,
    max_sources_per_owner: usize,
    max_groups_per_owner: usize,
}

impl ValidatingSourceMap {
    pub fn new(max_sources_per_owner: usize, max_groups_per_owner: usize) -> Self {
        Self {
            inner: SourceMap::new(),
            max_sources_per_owner,
            max_groups_per_owner,
        }
    }

    /// Validate and commit an addition. Returns the subset actually added:
    /// empty or already-present groups are silently dropped from the
    /// proposal, everything else must pass or the whole call fails.
    pub fn try_add(
        &mut self,
        owner: &EndpointId,
        proposed: &EndpointSourceSet,
    ) -> Result<EndpointSourceSet, SourceValidationError> {
        let current = self.inner.get(owner).cloned().unwrap_or_default();

        // Silently drop empty groups and duplicates of groups the owner
        // already has.
        let accepted = EndpointSourceSet {
            sources: proposed.sources.clone(),
            groups: proposed
                .groups
                .iter()
                .filter(|g| !g.is_empty() && !current.groups.contains(g))
                .cloned()
                .collect(),
        };

        for source in &accepted.sources {
            if !source.ssrc.is_valid() {
                return Err(SourceValidationError::InvalidSsrc(source.ssrc));
            }
        }

        // Cross-owner identifier and label uniqueness; the owner's own
        // current entries count too (a re-add is a conflict, not a merge).
        let proposed_ssrcs: HashSet<Ssrc> = accepted.sources.iter().map(|s| s.ssrc).collect();
        for (existing_owner, set) in self.inner.iter() {
            for ssrc in set.ssrcs() {
                if proposed_ssrcs.contains(&ssrc) {
                    return Err(SourceValidationError::SsrcAlreadyUsed(ssrc));
                }
            }
            if existing_owner != owner {
                for msid in set.msids() {
                    if accepted.sources.iter().any(|s| s.msid.as_deref() == Some(msid)) {
                        return Err(SourceValidationError::MsidConflict(msid.to_string()));
                    }
                }
            }
        }

        // Budgets, against the prospective combined size.
        if current.source_count() + accepted.source_count() > self.max_sources_per_owner {
            return Err(SourceValidationError::SsrcLimitExceeded {
                limit: self.max_sources_per_owner,
            });
        }
        if current.group_count() + accepted.group_count() > self.max_groups_per_owner {
            return Err(SourceValidationError::SsrcGroupLimitExceeded {
                limit: self.max_groups_per_owner,
            });
        }

        let mut prospective = current;
        prospective.extend(&accepted);
        validate_endpoint_set(&prospective)?;

        self.inner.add(owner, &accepted);
        Ok(accepted)
    }

    /// Validate and commit a removal. Every referenced source and group
    /// must be present; groups referencing a removed source are removed
    /// along with it. Returns the subset actually removed.
    pub fn try_remove(
        &mut self,
        owner: &EndpointId,
        set: &EndpointSourceSet,
    ) -> Result<EndpointSourceSet, SourceValidationError> {
        let current = self
            .inner
            .get(owner)
            .ok_or_else(|| SourceValidationError::NotFound(owner.to_string()))?;
        for source in &set.sources {
            if !current.sources.contains(source) {
                return Err(SourceValidationError::NotFound(format!(
                    "source {}",
                    source.ssrc
                )));
            }
        }
        for group in &set.groups {
            if !current.groups.contains(group) {
                return Err(SourceValidationError::NotFound(format!(
                    "group {}",
                    group.semantics.as_str()
                )));
            }
        }
        Ok(self.inner.remove(owner, set))
    }

    /// Drop everything an owner has, bypassing validation (the owner left).
    pub fn remove_owner(&mut self, owner: &EndpointId) -> Option<EndpointSourceSet> {
        self.inner.remove_owner(owner)
    }

    pub fn get(&self, owner: &EndpointId) -> Option<&EndpointSourceSet> {
        self.inner.get(owner)
    }

    /// Read-only view of the underlying map.
    pub fn inner(&self) -> &SourceMap {
        &self.inner
    }

    /// Copy of the underlying map for diffing and fan-out.
    pub fn snapshot(&self) -> SourceMap {
        self.inner.clone()
    }

    pub fn diff(&self, previous: &SourceMap) -> SourceMapDiff {
        self.inner.diff(previous)
    }

    pub fn owner_count(&self) -> usize {
        self.inner.owner_count()
    }

    pub fn source_count(&self) -> usize {
        self.inner.source_count()
    }
}

/// Per-owner structural invariants over a (prospective) endpoint set.
fn validate_endpoint_set(set: &EndpointSourceSet) -> Result<(), SourceValidationError> {
    for group in &set.groups {
        if group.semantics == GroupSemantics::Fid && group.ssrcs.len() != 2 {
            return Err(SourceValidationError::InvalidFidGroup(format!(
                "{} members",
                group.ssrcs.len()
            )));
        }
        let mut group_msid: Option<&str> = None;
        for ssrc in &group.ssrcs {
            let source = set
                .source_for(*ssrc, group.media_type)
                .ok_or(SourceValidationError::GroupContainsUnknownSource(*ssrc))?;
            let msid = source.msid.as_deref().ok_or_else(|| {
                SourceValidationError::RequiredParameterMissing(format!("msid for {}", ssrc))
            })?;
            match group_msid {
                None => group_msid = Some(msid),
                Some(expected) if expected != msid => {
                    return Err(SourceValidationError::GroupMsidMismatch)
                }
                Some(_) => {}
            }
        }
    }
    validate_stream_labels(set)
}

/// Distinct streams must carry distinct labels per media type. A stream is
/// the connected component over shared group membership.
fn validate_stream_labels(set: &EndpointSourceSet) -> Result<(), SourceValidationError> {
    // Union-find over identifiers, with groups as edges.
    let mut component: HashMap<(MediaType, Ssrc), (MediaType, Ssrc)> = HashMap::new();
    for source in &set.sources {
        let key = (source.media_type, source.ssrc);
        component.insert(key, key);
    }

    fn find(
        component: &mut HashMap<(MediaType, Ssrc), (MediaType, Ssrc)>,
        key: (MediaType, Ssrc),
    ) -> (MediaType, Ssrc) {
        let parent = component[&key];
        if parent == key {
            return key;
        }
        let root = find(component, parent);
        component.insert(key, root);
        root
    }

    for group in &set.groups {
        let mut members = group
            .ssrcs
            .iter()
            .map(|ssrc| (group.media_type, *ssrc))
            .filter(|key| component.contains_key(key))
            .collect::<Vec<_>>()
            .into_iter();
        if let Some(first) = members.next() {
            let root = find(&mut component, first);
            for member in members.collect::<Vec<_>>() {
                let member_root = find(&mut component, member);
                component.insert(member_root, root);
            }
        }
    }

    // Label each component; two components with the same label conflict.
    let mut seen: HashMap<(MediaType, String), (MediaType, Ssrc)> = HashMap::new();
    let keys: Vec<(MediaType, Ssrc)> = component.keys().copied().collect();
    for key in keys {
        let source = set
            .source_for(key.1, key.0)
            .expect("component keys come from the source set");
        let Some(msid) = source.msid.clone() else {
            continue;
        };
        let root = find(&mut component, key);
        match seen.get(&(key.0, msid.clone())) {
            Some(existing) if *existing != root => {
                return Err(SourceValidationError::MsidConflict(msid));
            }
            Some(_) => {}
            None => {
                seen.insert((key.0, msid), root);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use confocus_xmpp_core::sources::{Source, SourceGroup};
    use pretty_assertions::assert_eq;

    fn owner(s: &str) -> EndpointId {
        EndpointId::new(s)
    }

    fn video(ssrc: u32, msid: &str) -> Source {
        Source::new(Ssrc(ssrc), MediaType::Video).with_msid(msid)
    }

    fn audio(ssrc: u32) -> Source {
        Source::new(Ssrc(ssrc), MediaType::Audio)
    }

    fn map() -> ValidatingSourceMap {
        ValidatingSourceMap::new(20, 10)
    }

    #[test]
    fn accepts_simulcast_with_rtx_pairs() {
        let mut map = map();
        let set = EndpointSourceSet::from_parts(
            [
                video(1, "cam"),
                video(2, "cam"),
                video(3, "cam"),
                video(11, "cam"),
            ],
            [
                SourceGroup::new(
                    GroupSemantics::Simulcast,
                    MediaType::Video,
                    vec![Ssrc(1), Ssrc(2), Ssrc(3)],
                ),
                SourceGroup::new(GroupSemantics::Fid, MediaType::Video, vec![Ssrc(1), Ssrc(11)]),
            ],
        );
        let accepted = map.try_add(&owner("alice"), &set).unwrap();
        assert_eq!(accepted.source_count(), 4);
        assert_eq!(accepted.group_count(), 2);
    }

    #[test]
    fn rejects_rtx_source_without_msid() {
        let mut map = map();
        let set = EndpointSourceSet::from_parts(
            [
                video(1, "cam"),
                video(2, "cam"),
                video(3, "cam"),
                Source::new(Ssrc(11), MediaType::Video),
            ],
            [
                SourceGroup::new(
                    GroupSemantics::Simulcast,
                    MediaType::Video,
                    vec![Ssrc(1), Ssrc(2), Ssrc(3)],
                ),
                SourceGroup::new(GroupSemantics::Fid, MediaType::Video, vec![Ssrc(1), Ssrc(11)]),
            ],
        );
        let err = map.try_add(&owner("alice"), &set).unwrap_err();
        assert_eq!(
            err,
            SourceValidationError::RequiredParameterMissing("msid for 11".to_string())
        );
        assert!(map.get(&owner("alice")).is_none(), "map unchanged on error");
    }

    #[test]
    fn rejects_cross_owner_ssrc_reuse() {
        let mut map = map();
        map.try_add(&owner("alice"), &EndpointSourceSet::from_parts([audio(1000)], []))
            .unwrap();
        let err = map
            .try_add(&owner("bob"), &EndpointSourceSet::from_parts([audio(1000)], []))
            .unwrap_err();
        assert_eq!(err, SourceValidationError::SsrcAlreadyUsed(Ssrc(1000)));
    }

    #[test]
    fn rejects_cross_owner_msid_reuse() {
        let mut map = map();
        map.try_add(
            &owner("alice"),
            &EndpointSourceSet::from_parts([video(1, "cam")], []),
        )
        .unwrap();
        let err = map
            .try_add(
                &owner("bob"),
                &EndpointSourceSet::from_parts([video(2, "cam")], []),
            )
            .unwrap_err();
        assert_eq!(err, SourceValidationError::MsidConflict("cam".to_string()));
    }

    #[test]
    fn rejects_same_owner_label_reuse_across_streams() {
        let mut map = map();
        map.try_add(
            &owner("alice"),
            &EndpointSourceSet::from_parts([video(1, "cam")], []),
        )
        .unwrap();
        // A second, unrelated stream under the same label.
        let err = map
            .try_add(
                &owner("alice"),
                &EndpointSourceSet::from_parts([video(2, "cam")], []),
            )
            .unwrap_err();
        assert_eq!(err, SourceValidationError::MsidConflict("cam".to_string()));
    }

    #[test]
    fn rejects_invalid_ssrc() {
        let mut map = map();
        let err = map
            .try_add(&owner("alice"), &EndpointSourceSet::from_parts([audio(0)], []))
            .unwrap_err();
        assert_eq!(err, SourceValidationError::InvalidSsrc(Ssrc(0)));
    }

    #[test]
    fn rejects_three_member_fid_group() {
        let mut map = map();
        let set = EndpointSourceSet::from_parts(
            [video(1, "cam"), video(2, "cam"), video(3, "cam")],
            [SourceGroup::new(
                GroupSemantics::Fid,
                MediaType::Video,
                vec![Ssrc(1), Ssrc(2), Ssrc(3)],
            )],
        );
        assert!(matches!(
            map.try_add(&owner("alice"), &set),
            Err(SourceValidationError::InvalidFidGroup(_))
        ));
    }

    #[test]
    fn rejects_group_with_unknown_member() {
        let mut map = map();
        let set = EndpointSourceSet::from_parts(
            [video(1, "cam")],
            [SourceGroup::new(GroupSemantics::Fid, MediaType::Video, vec![Ssrc(1), Ssrc(2)])],
        );
        assert_eq!(
            map.try_add(&owner("alice"), &set).unwrap_err(),
            SourceValidationError::GroupContainsUnknownSource(Ssrc(2))
        );
    }

    #[test]
    fn enforces_source_budget_prospectively() {
        let mut map = ValidatingSourceMap::new(2, 10);
        map.try_add(&owner("alice"), &EndpointSourceSet::from_parts([audio(1)], []))
            .unwrap();
        let err = map
            .try_add(
                &owner("alice"),
                &EndpointSourceSet::from_parts([audio(2), audio(3)], []),
            )
            .unwrap_err();
        assert_eq!(err, SourceValidationError::SsrcLimitExceeded { limit: 2 });
    }

    #[test]
    fn duplicate_group_is_dropped_silently() {
        let mut map = map();
        let group = SourceGroup::new(GroupSemantics::Fid, MediaType::Video, vec![Ssrc(1), Ssrc(2)]);
        map.try_add(
            &owner("alice"),
            &EndpointSourceSet::from_parts(
                [video(1, "cam"), video(2, "cam")],
                [group.clone()],
            ),
        )
        .unwrap();
        // Re-propose the same group with a fresh source; the group half is
        // dropped, the source is added.
        let accepted = map
            .try_add(
                &owner("alice"),
                &EndpointSourceSet::from_parts([audio(3)], [group]),
            )
            .unwrap();
        assert_eq!(accepted.group_count(), 0);
        assert_eq!(accepted.source_count(), 1);
    }

    #[test]
    fn remove_of_absent_source_fails() {
        let mut map = map();
        map.try_add(&owner("alice"), &EndpointSourceSet::from_parts([audio(1)], []))
            .unwrap();
        assert!(matches!(
            map.try_remove(&owner("alice"), &EndpointSourceSet::from_parts([audio(2)], [])),
            Err(SourceValidationError::NotFound(_))
        ));
        // The map is untouched.
        assert_eq!(map.get(&owner("alice")).unwrap().source_count(), 1);
    }

    #[test]
    fn remove_cascades_to_groups() {
        let mut map = map();
        map.try_add(
            &owner("alice"),
            &EndpointSourceSet::from_parts(
                [video(1, "cam"), video(2, "cam")],
                [SourceGroup::new(GroupSemantics::Fid, MediaType::Video, vec![Ssrc(1), Ssrc(2)])],
            ),
        )
        .unwrap();
        let removed = map
            .try_remove(
                &owner("alice"),
                &EndpointSourceSet::from_parts([video(1, "cam")], []),
            )
            .unwrap();
        assert_eq!(removed.source_count(), 1);
        assert_eq!(removed.group_count(), 1);
    }
}
