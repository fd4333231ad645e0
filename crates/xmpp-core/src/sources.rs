//! Media source descriptions
//!
//! The payload vocabulary for describing media sources in signaling: a
//! source is a 32-bit stream identifier with a media type and optional
//! attributes; a source group ties several identifiers into one semantic
//! unit (simulcast layers, or a primary/retransmission pair).
//!
//! Equality is deliberately narrow: sources compare by (media type,
//! identifier) and groups by (semantics, media type, sorted identifiers),
//! so attribute-only differences never make two descriptions distinct.

use crate::element::Element;
use std::fmt;
use std::hash::{Hash, Hasher};

pub const SOURCES_NS: &str = "urn:confocus:sources:1";

/// A 32-bit media stream identifier. Zero is never a valid identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ssrc(pub u32);

impl Ssrc {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Ssrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media type of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(MediaType::Audio),
            "video" => Some(MediaType::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a video source is a camera or a desktop share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoType {
    Camera,
    Desktop,
}

impl VideoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoType::Camera => "camera",
            VideoType::Desktop => "desktop",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "camera" => Some(VideoType::Camera),
            "desktop" => Some(VideoType::Desktop),
            _ => None,
        }
    }
}

/// One media source. The `msid` is the stream-group label shared by sources
/// that belong to the same stream. The `owner` attribution is carried only
/// in fan-out signaling so receivers can tell whose stream an identifier
/// belongs to; it never participates in identity.
#[derive(Debug, Clone)]
pub struct Source {
    pub ssrc: Ssrc,
    pub media_type: MediaType,
    pub msid: Option<String>,
    pub video_type: Option<VideoType>,
    pub owner: Option<String>,
}

impl Source {
    pub fn new(ssrc: Ssrc, media_type: MediaType) -> Self {
        Self {
            ssrc,
            media_type,
            msid: None,
            video_type: None,
            owner: None,
        }
    }

    pub fn with_msid(mut self, msid: impl Into<String>) -> Self {
        self.msid = Some(msid.into());
        self
    }

    pub fn with_video_type(mut self, video_type: VideoType) -> Self {
        self.video_type = Some(video_type);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("source")
            .with_namespace(SOURCES_NS)
            .attr("ssrc", self.ssrc.to_string())
            .attr("media", self.media_type.as_str());
        if let Some(msid) = &self.msid {
            el = el.attr("msid", msid.clone());
        }
        if let Some(video_type) = &self.video_type {
            el = el.attr("video-type", video_type.as_str());
        }
        if let Some(owner) = &self.owner {
            el = el.attr("owner", owner.clone());
        }
        el
    }

    pub fn from_element(el: &Element) -> Option<Self> {
        let ssrc = Ssrc(el.attribute("ssrc")?.parse().ok()?);
        let media_type = MediaType::from_str(el.attribute("media")?)?;
        Some(Self {
            ssrc,
            media_type,
            msid: el.attribute("msid").map(str::to_string),
            video_type: el.attribute("video-type").and_then(VideoType::from_str),
            owner: el.attribute("owner").map(str::to_string),
        })
    }
}

// Identity is (media type, identifier); attributes don't participate.
impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.ssrc == other.ssrc && self.media_type == other.media_type
    }
}

impl Eq for Source {}

impl Hash for Source {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ssrc.hash(state);
        self.media_type.hash(state);
    }
}

/// Group semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupSemantics {
    /// Spatial layers of one stream.
    Simulcast,
    /// A (primary, retransmission) pair. Always exactly two members.
    Fid,
    Other(String),
}

impl GroupSemantics {
    pub fn as_str(&self) -> &str {
        match self {
            GroupSemantics::Simulcast => "SIM",
            GroupSemantics::Fid => "FID",
            GroupSemantics::Other(s) => s,
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "SIM" => GroupSemantics::Simulcast,
            "FID" => GroupSemantics::Fid,
            other => GroupSemantics::Other(other.to_string()),
        }
    }
}

/// An ordered set of sources forming one semantic unit.
#[derive(Debug, Clone)]
pub struct SourceGroup {
    pub semantics: GroupSemantics,
    pub media_type: MediaType,
    pub ssrcs: Vec<Ssrc>,
}

impl SourceGroup {
    pub fn new(semantics: GroupSemantics, media_type: MediaType, ssrcs: Vec<Ssrc>) -> Self {
        Self {
            semantics,
            media_type,
            ssrcs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ssrcs.is_empty()
    }

    /// The first (primary) identifier, if any.
    pub fn primary(&self) -> Option<Ssrc> {
        self.ssrcs.first().copied()
    }

    pub fn contains(&self, ssrc: Ssrc) -> bool {
        self.ssrcs.contains(&ssrc)
    }

    fn sorted_ssrcs(&self) -> Vec<Ssrc> {
        let mut sorted = self.ssrcs.clone();
        sorted.sort();
        sorted
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("ssrc-group")
            .with_namespace(SOURCES_NS)
            .attr("semantics", self.semantics.as_str())
            .attr("media", self.media_type.as_str());
        for ssrc in &self.ssrcs {
            el = el.child(Element::new("source").attr("ssrc", ssrc.to_string()));
        }
        el
    }

    pub fn from_element(el: &Element) -> Option<Self> {
        let semantics = GroupSemantics::from_str(el.attribute("semantics")?);
        let media_type = MediaType::from_str(el.attribute("media")?)?;
        let mut ssrcs = Vec::new();
        for child in el.children() {
            if child.name() == "source" {
                ssrcs.push(Ssrc(child.attribute("ssrc")?.parse().ok()?));
            }
        }
        Some(Self {
            semantics,
            media_type,
            ssrcs,
        })
    }
}

// Identity is (semantics, media type, the identifier set); member order
// doesn't participate.
impl PartialEq for SourceGroup {
    fn eq(&self, other: &Self) -> bool {
        self.semantics == other.semantics
            && self.media_type == other.media_type
            && self.sorted_ssrcs() == other.sorted_ssrcs()
    }
}

impl Eq for SourceGroup {}

impl Hash for SourceGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.semantics.hash(state);
        self.media_type.hash(state);
        self.sorted_ssrcs().hash(state);
    }
}
