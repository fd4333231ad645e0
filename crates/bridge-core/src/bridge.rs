//! Bridge records
//!
//! A bridge is known to the focus only through presence it publishes in the
//! brewery room and through the outcomes of control requests. The record
//! here is the catalog's view; sessions hold the service address and look
//! the record up when they need fresh state.

use crate::presence_ext::BridgeStatusExt;
use chrono::{DateTime, Utc};
use confocus_xmpp_core::Jid;

/// Catalog entry for one media bridge.
#[derive(Debug, Clone)]
pub struct Bridge {
    /// Service address the bridge answers control IQs on.
    pub jid: Jid,
    pub version: Option<String>,
    pub region: Option<String>,
    /// Identifier used when bridges relay to each other.
    pub relay_id: Option<String>,
    /// Reported utilisation in [0, 1]; `None` until the bridge reports it.
    pub stress: Option<f64>,
    /// Cleared on unavailable presence, `mark_down`, or allocation failure.
    pub operational: bool,
    /// The bridge finishes existing conferences but takes no new endpoints.
    pub graceful_shutdown: bool,
    pub stats_id: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl Bridge {
    pub fn new(jid: Jid) -> Self {
        Self {
            jid,
            version: None,
            region: None,
            relay_id: None,
            stress: None,
            operational: true,
            graceful_shutdown: false,
            stats_id: None,
            last_seen: Utc::now(),
        }
    }

    /// Fold a brewery presence update into the record.
    pub fn apply_status(&mut self, status: &BridgeStatusExt) {
        if status.version.is_some() {
            self.version = status.version.clone();
        }
        if status.region.is_some() {
            self.region = status.region.clone();
        }
        if status.relay_id.is_some() {
            self.relay_id = status.relay_id.clone();
        }
        if status.stress.is_some() {
            self.stress = status.stress;
        }
        if status.stats_id.is_some() {
            self.stats_id = status.stats_id.clone();
        }
        self.graceful_shutdown = status.graceful_shutdown;
        self.last_seen = Utc::now();
    }

    /// Whether the selector may hand new endpoints to this bridge.
    pub fn is_selectable(&self) -> bool {
        self.operational && !self.graceful_shutdown
    }

    /// Stress with unknown treated as fully loaded, so bridges that have
    /// never reported sort last.
    pub fn effective_stress(&self) -> f64 {
        self.stress.unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(jid: &str) -> Bridge {
        Bridge::new(Jid::parse(jid).unwrap())
    }

    #[test]
    fn graceful_shutdown_makes_bridge_unselectable() {
        let mut b = bridge("jvbA@ops.example");
        assert!(b.is_selectable());
        b.apply_status(&BridgeStatusExt {
            graceful_shutdown: true,
            ..Default::default()
        });
        assert!(!b.is_selectable());
        assert!(b.operational, "draining is not down");
    }

    #[test]
    fn unknown_stress_sorts_last() {
        let b = bridge("jvbA@ops.example");
        assert_eq!(b.effective_stress(), 1.0);
    }

    #[test]
    fn status_update_is_partial() {
        let mut b = bridge("jvbA@ops.example");
        b.apply_status(&BridgeStatusExt {
            version: Some("2.3".to_string()),
            region: Some("us-east".to_string()),
            stress: Some(0.1),
            ..Default::default()
        });
        // A later update without a region keeps the known region.
        b.apply_status(&BridgeStatusExt {
            stress: Some(0.4),
            ..Default::default()
        });
        assert_eq!(b.region.as_deref(), Some("us-east"));
        assert_eq!(b.stress, Some(0.4));
    }
}
