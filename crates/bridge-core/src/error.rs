//! Error types for bridge discovery and control

use thiserror::Error;

/// Errors from the bridge control protocol layer.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The bridge replied with a payload the focus cannot interpret
    #[error("malformed bridge response: {0}")]
    MalformedResponse(String),
}
