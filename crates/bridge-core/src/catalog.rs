//! Bridge catalog
//!
//! Process-wide directory of known bridges, mutated only by brewery
//! presence (via the detector) and by explicit `mark_down`. Readers take
//! snapshots; iteration order is insertion order, and selection tie-breaks
//! sort by address, so behaviour is reproducible run to run.

use crate::bridge::Bridge;
use crate::presence_ext::BridgeStatusExt;
use confocus_xmpp_core::Jid;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Directory of all bridges the focus knows about.
#[derive(Default)]
pub struct BridgeCatalog {
    bridges: RwLock<IndexMap<Jid, Bridge>>,
}

impl BridgeCatalog {
    pub fn new() -> Self {
        Self {
            bridges: RwLock::new(IndexMap::new()),
        }
    }

    /// Fold an available-presence status into the catalog. A new address
    /// creates an operational record; a graceful-shutdown marker stops new
    /// selections without marking the bridge down.
    pub fn on_bridge_status(&self, jid: &Jid, status: &BridgeStatusExt) {
        let mut bridges = self.bridges.write();
        match bridges.get_mut(jid) {
            Some(bridge) => {
                let was_draining = bridge.graceful_shutdown;
                bridge.apply_status(status);
                bridge.operational = true;
                if status.graceful_shutdown && !was_draining {
                    info!("bridge {} entered graceful shutdown", jid);
                }
            }
            None => {
                let mut bridge = Bridge::new(jid.clone());
                bridge.apply_status(status);
                info!(
                    "discovered bridge {} (version {:?}, region {:?})",
                    jid, bridge.version, bridge.region
                );
                bridges.insert(jid.clone(), bridge);
            }
        }
    }

    /// The bridge's brewery presence went unavailable.
    pub fn on_bridge_unavailable(&self, jid: &Jid) {
        let mut bridges = self.bridges.write();
        if let Some(bridge) = bridges.get_mut(jid) {
            bridge.operational = false;
            info!("bridge {} went offline", jid);
        }
    }

    /// Operator- or failure-driven removal from service.
    pub fn mark_down(&self, jid: &Jid) {
        let mut bridges = self.bridges.write();
        match bridges.get_mut(jid) {
            Some(bridge) => {
                bridge.operational = false;
                warn!("bridge {} marked down", jid);
            }
            None => debug!("mark_down for unknown bridge {}", jid),
        }
    }

    pub fn get(&self, jid: &Jid) -> Option<Bridge> {
        self.bridges.read().get(jid).cloned()
    }

    /// Snapshot of every known bridge, in discovery order.
    pub fn snapshot(&self) -> Vec<Bridge> {
        self.bridges.read().values().cloned().collect()
    }

    /// Bridges whose last presence was available and that have not been
    /// marked down since.
    pub fn operational_bridges(&self) -> Vec<Bridge> {
        self.bridges
            .read()
            .values()
            .filter(|b| b.operational)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bridges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.read().is_empty()
    }

    pub fn draining_count(&self) -> usize {
        self.bridges
            .read()
            .values()
            .filter(|b| b.graceful_shutdown)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    #[test]
    fn presence_lifecycle_drives_operational_flag() {
        let catalog = BridgeCatalog::new();
        let a = jid("jvbA@ops.example");

        catalog.on_bridge_status(&a, &BridgeStatusExt::default());
        assert!(catalog.get(&a).unwrap().operational);

        catalog.on_bridge_unavailable(&a);
        assert!(!catalog.get(&a).unwrap().operational);

        // A fresh available presence brings it back.
        catalog.on_bridge_status(&a, &BridgeStatusExt::default());
        assert!(catalog.get(&a).unwrap().operational);
    }

    #[test]
    fn mark_down_sticks_until_next_presence() {
        let catalog = BridgeCatalog::new();
        let a = jid("jvbA@ops.example");
        catalog.on_bridge_status(&a, &BridgeStatusExt::default());
        catalog.mark_down(&a);
        assert!(catalog.operational_bridges().is_empty());
    }

    #[test]
    fn snapshot_keeps_discovery_order() {
        let catalog = BridgeCatalog::new();
        for name in ["jvbC@ops.example", "jvbA@ops.example", "jvbB@ops.example"] {
            catalog.on_bridge_status(&jid(name), &BridgeStatusExt::default());
        }
        let order: Vec<String> = catalog
            .snapshot()
            .into_iter()
            .map(|b| b.jid.to_string())
            .collect();
        assert_eq!(order, vec!["jvbC@ops.example", "jvbA@ops.example", "jvbB@ops.example"]);
    }
}
