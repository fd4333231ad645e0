//! Property tests for the validating source map.
//!
//! Strategy: generate arbitrary sequences of add/remove proposals over a
//! small identifier space and a handful of owners, apply them through the
//! validating wrapper, and check the structural invariants after every
//! accepted mutation. Rejected proposals must leave the map untouched.

use confocus_conference_core::source::{EndpointSourceSet, SourceMap, ValidatingSourceMap};
use confocus_conference_core::EndpointId;
use confocus_xmpp_core::sources::{GroupSemantics, MediaType, Source, SourceGroup, Ssrc};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

const OWNERS: [&str; 3] = ["alice", "bob", "carol"];

#[derive(Debug, Clone)]
enum Op {
    Add(usize, EndpointSourceSet),
    Remove(usize, EndpointSourceSet),
    RemoveOwner(usize),
}

fn source_strategy() -> impl Strategy<Value = Source> {
    (1u32..40, prop::bool::ANY, prop::option::of(0usize..6)).prop_map(|(ssrc, audio, msid)| {
        let media = if audio { MediaType::Audio } else { MediaType::Video };
        let mut source = Source::new(Ssrc(ssrc), media);
        if let Some(label) = msid {
            source = source.with_msid(format!("stream-{}", label));
        }
        source
    })
}

fn group_strategy() -> impl Strategy<Value = SourceGroup> {
    (
        prop::bool::ANY,
        prop::collection::vec(1u32..40, 2..4),
        prop::bool::ANY,
    )
        .prop_map(|(fid, ssrcs, audio)| {
            let semantics = if fid {
                GroupSemantics::Fid
            } else {
                GroupSemantics::Simulcast
            };
            let media = if audio { MediaType::Audio } else { MediaType::Video };
            SourceGroup::new(semantics, media, ssrcs.into_iter().map(Ssrc).collect())
        })
}

fn set_strategy() -> impl Strategy<Value = EndpointSourceSet> {
    (
        prop::collection::vec(source_strategy(), 0..5),
        prop::collection::vec(group_strategy(), 0..3),
    )
        .prop_map(|(sources, groups)| EndpointSourceSet::from_parts(sources, groups))
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..OWNERS.len(), set_strategy()).prop_map(|(o, s)| Op::Add(o, s)),
        (0usize..OWNERS.len(), set_strategy()).prop_map(|(o, s)| Op::Remove(o, s)),
        (0usize..OWNERS.len()).prop_map(Op::RemoveOwner),
    ]
}

/// Structural invariants over the whole map.
fn assert_invariants(map: &SourceMap) {
    let mut seen_ssrcs: HashMap<u32, String> = HashMap::new();
    let mut seen_msids: HashMap<String, String> = HashMap::new();
    for (owner, set) in map.iter() {
        // Cross-owner identifier uniqueness.
        for source in &set.sources {
            if let Some(other) = seen_ssrcs.insert(source.ssrc.0, owner.to_string()) {
                panic!("ssrc {} owned by {} and {}", source.ssrc, other, owner);
            }
        }
        // Cross-owner label uniqueness.
        let mut own_msids: HashSet<&str> = HashSet::new();
        for source in &set.sources {
            if let Some(msid) = source.msid.as_deref() {
                own_msids.insert(msid);
            }
        }
        for msid in own_msids {
            if let Some(other) = seen_msids.insert(msid.to_string(), owner.to_string()) {
                if other != owner.to_string() {
                    panic!("msid {} owned by {} and {}", msid, other, owner);
                }
            }
        }
        // Every group member exists as a source of the group's media type,
        // and carries a label.
        for group in &set.groups {
            if group.semantics == GroupSemantics::Fid {
                assert_eq!(group.ssrcs.len(), 2, "FID group must be a pair");
            }
            for ssrc in &group.ssrcs {
                let member = set
                    .source_for(*ssrc, group.media_type)
                    .unwrap_or_else(|| panic!("group references unknown source {}", ssrc));
                assert!(member.msid.is_some(), "grouped source without a label");
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Invariants hold after every accepted mutation, and rejected
    /// mutations change nothing.
    #[test]
    fn accepted_mutations_preserve_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mut map = ValidatingSourceMap::new(10, 5);
        for op in ops {
            let before = map.snapshot();
            match op {
                Op::Add(owner, set) => {
                    let owner = EndpointId::new(OWNERS[owner]);
                    if map.try_add(&owner, &set).is_err() {
                        prop_assert_eq!(&map.snapshot(), &before, "rejected add mutated the map");
                    }
                }
                Op::Remove(owner, set) => {
                    let owner = EndpointId::new(OWNERS[owner]);
                    if map.try_remove(&owner, &set).is_err() {
                        prop_assert_eq!(&map.snapshot(), &before, "rejected remove mutated the map");
                    }
                }
                Op::RemoveOwner(owner) => {
                    map.remove_owner(&EndpointId::new(OWNERS[owner]));
                }
            }
            assert_invariants(map.inner());
        }
    }

    /// diff(before -> after) applied to `before` reproduces `after`.
    #[test]
    fn diff_round_trips(
        ops_a in prop::collection::vec(op_strategy(), 0..20),
        ops_b in prop::collection::vec(op_strategy(), 0..20),
    ) {
        let mut map = ValidatingSourceMap::new(10, 5);
        for op in ops_a {
            apply(&mut map, op);
        }
        let before = map.snapshot();
        for op in ops_b {
            apply(&mut map, op);
        }
        let after = map.snapshot();

        let diff = after.diff(&before);
        let mut rebuilt = before.clone();
        rebuilt.apply(&diff);
        prop_assert_eq!(rebuilt, after);
    }
}

fn apply(map: &mut ValidatingSourceMap, op: Op) {
    match op {
        Op::Add(owner, set) => {
            let _ = map.try_add(&EndpointId::new(OWNERS[owner]), &set);
        }
        Op::Remove(owner, set) => {
            let _ = map.try_remove(&EndpointId::new(OWNERS[owner]), &set);
        }
        Op::RemoveOwner(owner) => {
            map.remove_owner(&EndpointId::new(OWNERS[owner]));
        }
    }
}
