//! Bridge discovery, selection, and control for the confocus focus
//!
//! Bridges advertise themselves by presence in an operator room; the
//! detector feeds a process-wide catalog, the selector runs a policy chain
//! over catalog snapshots, and the control module models the IQ protocol
//! the focus speaks to a bridge once selected.

pub mod bridge;
pub mod catalog;
pub mod control;
pub mod detector;
pub mod error;
pub mod presence_ext;
pub mod selector;

pub use bridge::Bridge;
pub use catalog::BridgeCatalog;
pub use control::{EndpointAllocation, EndpointParams, RelayEndpoint, BRIDGE_NS};
pub use detector::{BridgeDetector, Worker, WorkerDetector};
pub use error::ControlError;
pub use presence_ext::{BridgeStatusExt, BREWERY_NS};
pub use selector::{
    BridgeSelector, ConferenceAffinityPolicy, HealthPolicy, RegionPolicy, SelectionConstraints,
    SelectionPolicy, VersionPinPolicy,
};
