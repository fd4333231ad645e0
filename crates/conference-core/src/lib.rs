//! Conference coordination core for the confocus focus
//!
//! Everything between the signaling fabric and the bridges: the validated
//! source map, the per-participant negotiation state machine, the bridge
//! session manager with its relay mesh, the per-room coordinator, and the
//! process-wide focus manager.

pub mod bridge_session;
pub mod conference;
pub mod config;
pub mod errors;
pub mod focus;
pub mod negotiation;
pub mod participant;
pub mod rate_limit;
pub mod source;
pub mod types;

pub use bridge_session::{Allocation, AllocationParams, BridgeSessionManager};
pub use conference::{Conference, ConferenceEvent, ConferenceServices};
pub use config::{ConferenceConfig, OctoConfig, RestartLimitConfig};
pub use errors::{AllocationError, ConferenceError, Result, SourceValidationError};
pub use focus::{FocusManager, FocusStats, HealthReport, FOCUS_NS};
pub use negotiation::{JingleAction, SessionMessage, TerminateReason, JINGLE_NS};
pub use participant::{MemberInfo, Participant, ParticipantSession, CONFERENCE_NS};
pub use rate_limit::RestartRateLimiter;
pub use source::{EndpointSourceSet, SourceMap, SourceMapDiff, ValidatingSourceMap};
pub use types::{ConferenceProperties, EndpointId, MeetingId, Role, SessionState};
