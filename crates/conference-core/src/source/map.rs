//! Unchecked owner → source-set mapping
//!
//! Supports add, remove, iterate, diff, and copy, plus the pure stripping
//! transforms. No invariants are enforced here; every externally supplied
//! edit goes through the validating wrapper instead.

use super::endpoint_set::EndpointSourceSet;
use crate::types::EndpointId;
use confocus_xmpp_core::sources::MediaType;
use std::collections::HashMap;

/// Owner → endpoint source set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMap {
    entries: HashMap<EndpointId, EndpointSourceSet>,
}

/// Incremental difference between two maps.
#[derive(Debug, Clone, Default)]
pub struct SourceMapDiff {
    pub to_add: SourceMap,
    pub to_remove: SourceMap,
}

impl SourceMapDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a set into an owner's entry.
    pub fn add(&mut self, owner: &EndpointId, set: &EndpointSourceSet) {
        if set.is_empty() {
            return;
        }
        self.entries.entry(owner.clone()).or_default().extend(set);
    }

    /// Remove a set from an owner's entry; groups referencing removed
    /// sources go too. Returns what was actually removed.
    pub fn remove(&mut self, owner: &EndpointId, set: &EndpointSourceSet) -> EndpointSourceSet {
        let Some(entry) = self.entries.get_mut(owner) else {
            return EndpointSourceSet::new();
        };
        let removed = entry.subtract(set);
        if entry.is_empty() {
            self.entries.remove(owner);
        }
        removed
    }

    /// Drop an owner entirely, returning what it owned.
    pub fn remove_owner(&mut self, owner: &EndpointId) -> Option<EndpointSourceSet> {
        self.entries.remove(owner)
    }

    pub fn get(&self, owner: &EndpointId) -> Option<&EndpointSourceSet> {
        self.entries.get(owner)
    }

    pub fn owners(&self) -> impl Iterator<Item = &EndpointId> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EndpointId, &EndpointSourceSet)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn owner_count(&self) -> usize {
        self.entries.len()
    }

    pub fn source_count(&self) -> usize {
        self.entries.values().map(|s| s.source_count()).sum()
    }

    /// Everything except `excluded`'s entry, as one map.
    pub fn without_owner(&self, excluded: &EndpointId) -> SourceMap {
        SourceMap {
            entries: self
                .entries
                .iter()
                .filter(|(owner, _)| *owner != excluded)
                .map(|(owner, set)| (owner.clone(), set.clone()))
                .collect(),
        }
    }

    /// The changes that turn `previous` into `self`: applying `to_remove`
    /// then `to_add` to `previous` yields `self`.
    pub fn diff(&self, previous: &SourceMap) -> SourceMapDiff {
        let mut diff = SourceMapDiff::default();
        for (owner, current) in &self.entries {
            match previous.entries.get(owner) {
                Some(old) => {
                    let added = current.difference(old);
                    let removed = old.difference(current);
                    diff.to_add.add(owner, &added);
                    if !removed.is_empty() {
                        diff.to_remove.add_raw(owner, removed);
                    }
                }
                None => diff.to_add.add(owner, current),
            }
        }
        for (owner, old) in &previous.entries {
            if !self.entries.contains_key(owner) {
                diff.to_remove.add_raw(owner, old.clone());
            }
        }
        diff
    }

    /// Apply a diff (remove then add), without validation.
    pub fn apply(&mut self, diff: &SourceMapDiff) {
        for (owner, set) in diff.to_remove.iter() {
            if let Some(entry) = self.entries.get_mut(owner) {
                for source in &set.sources {
                    entry.sources.remove(source);
                }
                for group in &set.groups {
                    entry.groups.remove(group);
                }
                if entry.is_empty() {
                    self.entries.remove(owner);
                }
            }
        }
        for (owner, set) in diff.to_add.iter() {
            self.add(owner, set);
        }
    }

    /// Keep only one media type across all owners.
    pub fn strip_by_media_type(&self, keep: MediaType) -> SourceMap {
        self.transform(|set| set.strip_by_media_type(keep))
    }

    /// Collapse simulcast groups to their primary layer across all owners.
    pub fn strip_simulcast_layers(&self) -> SourceMap {
        self.transform(|set| set.strip_simulcast_layers())
    }

    fn transform(&self, f: impl Fn(&EndpointSourceSet) -> EndpointSourceSet) -> SourceMap {
        SourceMap {
            entries: self
                .entries
                .iter()
                .map(|(owner, set)| (owner.clone(), f(set)))
                .filter(|(_, set)| !set.is_empty())
                .collect(),
        }
    }

    // Insert without the empty-set guard; diff bookkeeping needs exact sets.
    fn add_raw(&mut self, owner: &EndpointId, set: EndpointSourceSet) {
        self.entries.entry(owner.clone()).or_default().extend(&set);
    }
}
