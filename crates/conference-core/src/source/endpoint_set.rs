//! The source set of one endpoint

use confocus_xmpp_core::sources::{GroupSemantics, MediaType, Source, SourceGroup, Ssrc};
use confocus_xmpp_core::Element;
use std::collections::HashSet;

/// All sources and source groups belonging to one owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSourceSet {
    pub sources: HashSet<Source>,
    pub groups: HashSet<SourceGroup>,
}

impl EndpointSourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        sources: impl IntoIterator<Item = Source>,
        groups: impl IntoIterator<Item = SourceGroup>,
    ) -> Self {
        Self {
            sources: sources.into_iter().collect(),
            groups: groups.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.groups.is_empty()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// All identifiers present in the set.
    pub fn ssrcs(&self) -> HashSet<Ssrc> {
        self.sources.iter().map(|s| s.ssrc).collect()
    }

    /// All stream labels present in the set.
    pub fn msids(&self) -> HashSet<&str> {
        self.sources
            .iter()
            .filter_map(|s| s.msid.as_deref())
            .collect()
    }

    pub fn source_for(&self, ssrc: Ssrc, media_type: MediaType) -> Option<&Source> {
        self.sources.get(&Source::new(ssrc, media_type))
    }

    /// Merge another set into this one.
    pub fn extend(&mut self, other: &EndpointSourceSet) {
        self.sources.extend(other.sources.iter().cloned());
        self.groups.extend(other.groups.iter().cloned());
    }

    /// Remove `other`'s sources and groups, plus any group left referencing
    /// a removed source. Returns what was actually removed.
    pub fn subtract(&mut self, other: &EndpointSourceSet) -> EndpointSourceSet {
        let mut removed = EndpointSourceSet::new();
        for source in &other.sources {
            if let Some(existing) = self.sources.take(source) {
                removed.sources.insert(existing);
            }
        }
        for group in &other.groups {
            if let Some(existing) = self.groups.take(group) {
                removed.groups.insert(existing);
            }
        }
        // Groups that lost a member go with it.
        let removed_ssrcs: HashSet<Ssrc> = removed.sources.iter().map(|s| s.ssrc).collect();
        let orphaned: Vec<SourceGroup> = self
            .groups
            .iter()
            .filter(|g| g.ssrcs.iter().any(|ssrc| removed_ssrcs.contains(ssrc)))
            .cloned()
            .collect();
        for group in orphaned {
            self.groups.remove(&group);
            removed.groups.insert(group);
        }
        removed
    }

    /// Entries of `self` missing from `other`.
    pub fn difference(&self, other: &EndpointSourceSet) -> EndpointSourceSet {
        EndpointSourceSet {
            sources: self.sources.difference(&other.sources).cloned().collect(),
            groups: self.groups.difference(&other.groups).cloned().collect(),
        }
    }

    /// Only the sources of one media type, with the groups that describe them.
    pub fn strip_by_media_type(&self, keep: MediaType) -> EndpointSourceSet {
        EndpointSourceSet {
            sources: self
                .sources
                .iter()
                .filter(|s| s.media_type == keep)
                .cloned()
                .collect(),
            groups: self
                .groups
                .iter()
                .filter(|g| g.media_type == keep)
                .cloned()
                .collect(),
        }
    }

    /// Collapse simulcast: keep the primary layer of each simulcast group,
    /// its retransmission pair, and everything ungrouped; drop secondary
    /// layers and the retransmission sources tied to them.
    pub fn strip_simulcast_layers(&self) -> EndpointSourceSet {
        let mut dropped: HashSet<Ssrc> = HashSet::new();
        for group in &self.groups {
            if group.semantics == GroupSemantics::Simulcast {
                for ssrc in group.ssrcs.iter().skip(1) {
                    dropped.insert(*ssrc);
                }
            }
        }
        // Retransmission sources whose primary is a dropped layer.
        for group in &self.groups {
            if group.semantics == GroupSemantics::Fid {
                if let Some(primary) = group.primary() {
                    if dropped.contains(&primary) {
                        for ssrc in group.ssrcs.iter().skip(1) {
                            dropped.insert(*ssrc);
                        }
                    }
                }
            }
        }
        let sources: HashSet<Source> = self
            .sources
            .iter()
            .filter(|s| !dropped.contains(&s.ssrc))
            .cloned()
            .collect();
        let groups = self
            .groups
            .iter()
            .filter(|g| {
                g.semantics != GroupSemantics::Simulcast
                    && g.ssrcs.iter().all(|ssrc| !dropped.contains(ssrc))
            })
            .cloned()
            .collect();
        EndpointSourceSet { sources, groups }
    }

    /// Render as signaling payload children.
    pub fn to_elements(&self) -> Vec<Element> {
        let mut elements: Vec<Element> = Vec::new();
        let mut sources: Vec<&Source> = self.sources.iter().collect();
        sources.sort_by_key(|s| (s.media_type, s.ssrc));
        for source in sources {
            elements.push(source.to_element());
        }
        let mut groups: Vec<&SourceGroup> = self.groups.iter().collect();
        groups.sort_by_key(|g| (g.media_type, g.ssrcs.clone()));
        for group in groups {
            elements.push(group.to_element());
        }
        elements
    }

    /// Parse from signaling payload children; unrecognised children are
    /// ignored.
    pub fn from_elements<'a>(elements: impl Iterator<Item = &'a Element>) -> EndpointSourceSet {
        let mut set = EndpointSourceSet::new();
        for el in elements {
            match el.name() {
                "source" => {
                    if let Some(source) = Source::from_element(el) {
                        set.sources.insert(source);
                    }
                }
                "ssrc-group" => {
                    if let Some(group) = SourceGroup::from_element(el) {
                        set.groups.insert(group);
                    }
                }
                _ => {}
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(ssrc: u32, media: MediaType) -> Source {
        Source::new(Ssrc(ssrc), media)
    }

    #[test]
    fn subtract_removes_orphaned_groups() {
        let mut set = EndpointSourceSet::from_parts(
            [
                source(1, MediaType::Video).with_msid("cam"),
                source(2, MediaType::Video).with_msid("cam"),
            ],
            [SourceGroup::new(
                GroupSemantics::Fid,
                MediaType::Video,
                vec![Ssrc(1), Ssrc(2)],
            )],
        );
        let removed = set.subtract(&EndpointSourceSet::from_parts(
            [source(1, MediaType::Video)],
            [],
        ));
        assert_eq!(removed.sources.len(), 1);
        assert_eq!(removed.groups.len(), 1, "group follows its member out");
        assert!(set.groups.is_empty());
        assert_eq!(set.sources.len(), 1);
    }

    #[test]
    fn strip_simulcast_keeps_primary_and_its_rtx() {
        let set = EndpointSourceSet::from_parts(
            [
                source(1, MediaType::Video).with_msid("cam"),
                source(2, MediaType::Video).with_msid("cam"),
                source(3, MediaType::Video).with_msid("cam"),
                source(11, MediaType::Video).with_msid("cam"),
                source(12, MediaType::Video).with_msid("cam"),
                source(100, MediaType::Audio),
            ],
            [
                SourceGroup::new(
                    GroupSemantics::Simulcast,
                    MediaType::Video,
                    vec![Ssrc(1), Ssrc(2), Ssrc(3)],
                ),
                SourceGroup::new(GroupSemantics::Fid, MediaType::Video, vec![Ssrc(1), Ssrc(11)]),
                SourceGroup::new(GroupSemantics::Fid, MediaType::Video, vec![Ssrc(2), Ssrc(12)]),
            ],
        );
        let stripped = set.strip_simulcast_layers();
        let ssrcs = stripped.ssrcs();
        assert!(ssrcs.contains(&Ssrc(1)), "primary layer kept");
        assert!(ssrcs.contains(&Ssrc(11)), "primary's rtx kept");
        assert!(!ssrcs.contains(&Ssrc(2)) && !ssrcs.contains(&Ssrc(3)), "layers dropped");
        assert!(!ssrcs.contains(&Ssrc(12)), "secondary rtx dropped");
        assert!(ssrcs.contains(&Ssrc(100)), "audio untouched");
        assert_eq!(stripped.groups.len(), 1, "only the primary FID pair survives");
    }

    #[test]
    fn element_round_trip() {
        let set = EndpointSourceSet::from_parts(
            [source(1, MediaType::Audio).with_msid("mic")],
            [SourceGroup::new(GroupSemantics::Fid, MediaType::Video, vec![Ssrc(2), Ssrc(3)])],
        );
        let elements = set.to_elements();
        let parsed = EndpointSourceSet::from_elements(elements.iter());
        assert_eq!(parsed, set);
    }
}
