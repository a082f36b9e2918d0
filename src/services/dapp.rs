use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What the wallet remembers about a site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DappRecord {
    pub origin: String,
    pub name: String,
    pub icon: String,
    /// Chain enum the site last selected, e.g. `ETH`.
    pub chain_id: Option<String>,
    pub is_connected: bool,
    pub added_at: Option<DateTime<Utc>>,
}

impl DappRecord {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            added_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

/// Partial update applied by [`DappRegistry::patch_dapps`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DappPatch {
    pub name: Option<String>,
    pub icon: Option<String>,
    pub chain_id: Option<String>,
    pub is_connected: Option<bool>,
}

/// Permission / dapp registry consulted by the bridge.
pub trait DappRegistry: Send + Sync {
    fn has_permission(&self, origin: &str) -> bool;

    fn get_dapp(&self, origin: &str) -> Option<DappRecord>;

    fn add_dapp(&self, record: DappRecord);

    fn patch_dapps(&self, patches: HashMap<String, DappPatch>);
}

/// In-process dapp registry.
#[derive(Default)]
pub struct MemoryDappStore {
    dapps: RwLock<HashMap<String, DappRecord>>,
}

impl MemoryDappStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `origin` as a connected site on `chain`.
    pub fn connect(&self, origin: &str, chain: Option<&str>) {
        let mut dapps = self.dapps.write();
        let record = dapps
            .entry(origin.to_string())
            .or_insert_with(|| DappRecord::new(origin));
        record.is_connected = true;
        if let Some(chain) = chain {
            record.chain_id = Some(chain.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dapps.read().is_empty()
    }
}

impl DappRegistry for MemoryDappStore {
    fn has_permission(&self, origin: &str) -> bool {
        self.dapps
            .read()
            .get(origin)
            .is_some_and(|dapp| dapp.is_connected)
    }

    fn get_dapp(&self, origin: &str) -> Option<DappRecord> {
        self.dapps.read().get(origin).cloned()
    }

    fn add_dapp(&self, record: DappRecord) {
        debug!(target: "bridge::dapp", origin = %record.origin, "adding dapp");
        self.dapps.write().insert(record.origin.clone(), record);
    }

    fn patch_dapps(&self, patches: HashMap<String, DappPatch>) {
        let mut dapps = self.dapps.write();
        for (origin, patch) in patches {
            let Some(record) = dapps.get_mut(&origin) else {
                continue;
            };
            if let Some(name) = patch.name {
                record.name = name;
            }
            if let Some(icon) = patch.icon {
                record.icon = icon;
            }
            if let Some(chain_id) = patch.chain_id {
                record.chain_id = Some(chain_id);
            }
            if let Some(is_connected) = patch.is_connected {
                record.is_connected = is_connected;
            }
        }
    }
}
