//! Error types for the conference core
//!
//! Three families: source validation errors (rejected source-map edits),
//! allocation errors (bridge side), and conference-level errors. Only the
//! stanza error taxonomy ever crosses the signaling boundary; the mappings
//! live here next to the types.

use confocus_xmpp_core::{ErrorCondition, Ssrc, StanzaError};
use thiserror::Error;

/// Result type for conference operations
pub type Result<T> = std::result::Result<T, ConferenceError>;

/// Why a proposed source-map edit was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceValidationError {
    /// Zero is not a valid stream identifier
    #[error("invalid ssrc {0}")]
    InvalidSsrc(Ssrc),

    /// The identifier already belongs to another owner
    #[error("ssrc {0} is already in use")]
    SsrcAlreadyUsed(Ssrc),

    /// The stream label already belongs to another owner
    #[error("msid {0} conflicts with another endpoint")]
    MsidConflict(String),

    /// Per-owner source budget exhausted
    #[error("source limit of {limit} exceeded")]
    SsrcLimitExceeded { limit: usize },

    /// Per-owner group budget exhausted
    #[error("source group limit of {limit} exceeded")]
    SsrcGroupLimitExceeded { limit: usize },

    /// A group references an identifier with no matching source
    #[error("group references unknown source {0}")]
    GroupContainsUnknownSource(Ssrc),

    /// A retransmission group must have exactly two members
    #[error("invalid retransmission group: {0}")]
    InvalidFidGroup(String),

    /// Sources in one group carry different stream labels
    #[error("group members disagree on msid")]
    GroupMsidMismatch,

    /// A source that must carry an attribute does not
    #[error("missing required parameter: {0}")]
    RequiredParameterMissing(String),

    /// Removal referenced a source or group that is not in the map
    #[error("source or group not found: {0}")]
    NotFound(String),
}

impl SourceValidationError {
    /// Boundary mapping: limit violations wait, everything else is the
    /// sender's fault.
    pub fn to_stanza_error(&self) -> StanzaError {
        let condition = match self {
            SourceValidationError::SsrcLimitExceeded { .. }
            | SourceValidationError::SsrcGroupLimitExceeded { .. } => {
                ErrorCondition::ResourceConstraint
            }
            SourceValidationError::NotFound(_) => ErrorCondition::ItemNotFound,
            _ => ErrorCondition::BadRequest,
        };
        StanzaError::with_text(condition, self.to_string())
    }
}

/// Why a bridge allocation did not produce an endpoint.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Every candidate was tried once and none accepted the endpoint
    #[error("no bridge available")]
    NoBridgeAvailable,

    /// The bridge did not answer within the allocation timeout
    #[error("bridge allocation timed out")]
    AllocationTimeout,

    /// The bridge answered with an error
    #[error("bridge rejected the request: {0}")]
    BridgeRejected(ErrorCondition),

    /// The control message named a session this conference no longer has;
    /// the message is stale and must be ignored
    #[error("unknown bridge session {0}")]
    InvalidBridgeSession(String),

    /// A relay between this bridge pair already exists
    #[error("relay to {0} already exists")]
    RelayAlreadyExists(String),

    /// The operation was cancelled before the bridge answered
    #[error("allocation cancelled")]
    Cancelled,
}

/// Conference-level failures.
#[derive(Debug, Error)]
pub enum ConferenceError {
    #[error(transparent)]
    SourceValidation(#[from] SourceValidationError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("signaling error: {0}")]
    Signaling(#[from] confocus_xmpp_core::XmppError),

    #[error("participant {0} not found")]
    ParticipantNotFound(String),

    #[error("conference {0} not found")]
    ConferenceNotFound(String),

    #[error("conference has ended")]
    ConferenceEnded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_errors_map_to_resource_constraint() {
        let err = SourceValidationError::SsrcLimitExceeded { limit: 20 };
        assert_eq!(
            err.to_stanza_error().condition,
            ErrorCondition::ResourceConstraint
        );
    }

    #[test]
    fn shape_errors_map_to_bad_request() {
        let err = SourceValidationError::SsrcAlreadyUsed(Ssrc(1000));
        assert_eq!(err.to_stanza_error().condition, ErrorCondition::BadRequest);
        let err = SourceValidationError::RequiredParameterMissing("msid for 17".to_string());
        assert_eq!(err.to_stanza_error().condition, ErrorCondition::BadRequest);
    }
}
