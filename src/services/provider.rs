use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::{
    bridge::BackgroundBridge,
    engine::{ProviderMethod, ProviderRequest},
    error::RpcError,
    session::{BroadcastEvent, SessionService},
};

use super::{ChainInfo, ChainQuery, ChainRegistry, DappPatch, DappRecord, DappRegistry};

/// Executes wallet methods once the request flow has authorized them.
#[async_trait]
pub trait ProviderController: Send + Sync {
    async fn call(
        &self,
        method: ProviderMethod,
        request: &ProviderRequest,
        bridge: Option<Arc<BackgroundBridge>>,
    ) -> Result<Value, RpcError>;

    /// Runs the unlock flow for a locked wallet.
    async fn request_unlock(&self, _request: &ProviderRequest) -> Result<(), RpcError> {
        Err(RpcError::unauthorized())
    }

    /// Runs the connect flow for an origin without permission.
    async fn request_connect(&self, _request: &ProviderRequest) -> Result<(), RpcError> {
        Err(RpcError::unauthorized())
    }
}

/// Answers account and chain queries from fixed data and refuses to sign.
pub struct ReadOnlyProvider {
    accounts: Vec<String>,
    default_chain: String,
    auto_connect: bool,
    dapps: Arc<dyn DappRegistry>,
    chains: Arc<dyn ChainRegistry>,
    sessions: Arc<SessionService>,
}

impl ReadOnlyProvider {
    pub fn new(
        accounts: Vec<String>,
        default_chain: impl Into<String>,
        auto_connect: bool,
        dapps: Arc<dyn DappRegistry>,
        chains: Arc<dyn ChainRegistry>,
        sessions: Arc<SessionService>,
    ) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|account| account.to_lowercase())
                .collect(),
            default_chain: default_chain.into(),
            auto_connect,
            dapps,
            chains,
            sessions,
        }
    }

    fn site_chain(&self, origin: &str) -> Option<ChainInfo> {
        self.dapps
            .get_dapp(origin)
            .and_then(|dapp| dapp.chain_id)
            .and_then(|chain| self.chains.find_chain(&ChainQuery::Enum(chain)))
            .or_else(|| {
                self.chains
                    .find_chain(&ChainQuery::Enum(self.default_chain.clone()))
            })
    }

    fn connected_accounts(&self, origin: &str) -> Vec<String> {
        if self.dapps.has_permission(origin) {
            self.accounts.iter().take(1).cloned().collect()
        } else {
            Vec::new()
        }
    }

    fn switch_chain(&self, origin: &str, params: &Value) -> Result<Value, RpcError> {
        let raw = params
            .get(0)
            .and_then(|param| param.get("chainId"))
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("missing chainId"))?;
        let id = u64::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|_| RpcError::invalid_params(format!("invalid chainId: {raw}")))?;
        let chain = self
            .chains
            .find_chain(&ChainQuery::Id(id))
            .ok_or_else(|| {
                RpcError::new(4902, format!("Unrecognized chain ID \"{raw}\"."))
            })?;

        self.dapps.patch_dapps(HashMap::from([(
            origin.to_string(),
            DappPatch {
                chain_id: Some(chain.enum_name.clone()),
                ..DappPatch::default()
            },
        )]));
        self.sessions.broadcast_event(
            BroadcastEvent::ChainChanged,
            chain.changed_params(),
            Some(origin),
        );
        Ok(Value::Null)
    }
}

#[async_trait]
impl ProviderController for ReadOnlyProvider {
    async fn call(
        &self,
        method: ProviderMethod,
        request: &ProviderRequest,
        _bridge: Option<Arc<BackgroundBridge>>,
    ) -> Result<Value, RpcError> {
        let origin = request.session.origin.as_str();
        match method {
            ProviderMethod::EthAccounts => Ok(json!(self.connected_accounts(origin))),
            ProviderMethod::EthRequestAccounts => {
                let accounts = self.connected_accounts(origin);
                self.sessions.broadcast_event(
                    BroadcastEvent::AccountsChanged,
                    json!(accounts),
                    Some(origin),
                );
                if let Some(chain) = self.site_chain(origin) {
                    self.sessions.broadcast_event(
                        BroadcastEvent::ChainChanged,
                        chain.changed_params(),
                        Some(origin),
                    );
                }
                Ok(json!(accounts))
            }
            ProviderMethod::EthChainId => self
                .site_chain(origin)
                .map(|chain| json!(chain.hex))
                .ok_or_else(RpcError::chain_disconnected),
            ProviderMethod::NetVersion => self
                .site_chain(origin)
                .map(|chain| json!(chain.network))
                .ok_or_else(RpcError::chain_disconnected),
            ProviderMethod::NetListening => Ok(json!(true)),
            ProviderMethod::Web3ClientVersion => {
                Ok(json!(concat!("dapp-provider-bridge/", env!("CARGO_PKG_VERSION"))))
            }
            ProviderMethod::WalletGetPermissions => {
                if self.dapps.has_permission(origin) {
                    Ok(json!([{ "parentCapability": "eth_accounts" }]))
                } else {
                    Ok(json!([]))
                }
            }
            ProviderMethod::WalletRequestPermissions => {
                Ok(json!([{ "parentCapability": "eth_accounts" }]))
            }
            ProviderMethod::WalletRevokePermissions => {
                let revokes_accounts = request
                    .params
                    .get(0)
                    .and_then(Value::as_object)
                    .is_some_and(|param| param.contains_key("eth_accounts"));
                if revokes_accounts && self.dapps.has_permission(origin) {
                    self.sessions.broadcast_event(
                        BroadcastEvent::AccountsChanged,
                        json!([]),
                        Some(origin),
                    );
                    self.dapps.patch_dapps(HashMap::from([(
                        origin.to_string(),
                        DappPatch {
                            is_connected: Some(false),
                            ..DappPatch::default()
                        },
                    )]));
                }
                Ok(Value::Null)
            }
            ProviderMethod::WalletSwitchEthereumChain => {
                self.switch_chain(origin, &request.params)
            }
            other => Err(RpcError::unsupported_method(other.as_str())),
        }
    }

    async fn request_connect(&self, request: &ProviderRequest) -> Result<(), RpcError> {
        if !self.auto_connect {
            return Err(RpcError::user_rejected());
        }

        let origin = request.session.origin.clone();
        info!(target: "bridge::provider", %origin, "auto-connecting site");
        if self.dapps.get_dapp(&origin).is_none() {
            self.dapps.add_dapp(DappRecord {
                name: request.session.name.clone(),
                icon: request.session.icon.clone(),
                chain_id: Some(self.default_chain.clone()),
                is_connected: true,
                ..DappRecord::new(origin)
            });
        } else {
            self.dapps.patch_dapps(HashMap::from([(
                origin,
                DappPatch {
                    is_connected: Some(true),
                    ..DappPatch::default()
                },
            )]));
        }
        Ok(())
    }
}
