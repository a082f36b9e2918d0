use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainInfo {
    pub id: u64,
    /// Wallet-side enum name, e.g. `ETH`.
    #[serde(rename = "enum")]
    pub enum_name: String,
    pub server_id: String,
    pub name: String,
    /// `0x`-prefixed chain id.
    pub hex: String,
    /// Decimal chain id, as `net_version` reports it.
    pub network: String,
}

impl ChainInfo {
    pub fn new(id: u64, enum_name: &str, server_id: &str, name: &str) -> Self {
        Self {
            id,
            enum_name: enum_name.to_string(),
            server_id: server_id.to_string(),
            name: name.to_string(),
            hex: format!("{id:#x}"),
            network: id.to_string(),
        }
    }

    /// Params of the `chainChanged` provider event.
    pub fn changed_params(&self) -> Value {
        json!({
            "chainId": self.hex,
            "networkVersion": self.network,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainQuery {
    Enum(String),
    ServerId(String),
    Id(u64),
}

pub trait ChainRegistry: Send + Sync {
    fn find_chain(&self, query: &ChainQuery) -> Option<ChainInfo>;
}

/// Fixed chain table.
pub struct StaticChains {
    chains: Vec<ChainInfo>,
}

impl StaticChains {
    pub fn new(chains: Vec<ChainInfo>) -> Self {
        Self { chains }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            ChainInfo::new(1, "ETH", "eth", "Ethereum"),
            ChainInfo::new(56, "BSC", "bsc", "BNB Chain"),
            ChainInfo::new(137, "POLYGON", "matic", "Polygon"),
            ChainInfo::new(10, "OP", "op", "OP"),
            ChainInfo::new(42161, "ARBITRUM", "arb", "Arbitrum"),
            ChainInfo::new(8453, "BASE", "base", "Base"),
        ])
    }
}

impl ChainRegistry for StaticChains {
    fn find_chain(&self, query: &ChainQuery) -> Option<ChainInfo> {
        self.chains
            .iter()
            .find(|chain| match query {
                ChainQuery::Enum(name) => chain.enum_name.eq_ignore_ascii_case(name),
                ChainQuery::ServerId(server_id) => &chain.server_id == server_id,
                ChainQuery::Id(id) => chain.id == *id,
            })
            .cloned()
    }
}
