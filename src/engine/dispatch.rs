use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{Flow, Middleware, ProviderRequest};
use crate::{
    bridge::BackgroundBridge,
    error::RpcError,
    services::{DappRegistry, KeyringState, ProviderController},
    site::SiteRefs,
};

/// What a method-handler factory gets to build the handler for one bridge.
#[derive(Clone)]
pub struct MethodHandlerContext {
    pub hostname: String,
    pub site: SiteRefs,
    pub bridge: Weak<BackgroundBridge>,
}

/// Builds the method-handler middleware of each new bridge.
pub trait MethodHandlerFactory: Send + Sync {
    fn create(&self, context: MethodHandlerContext) -> Arc<dyn Middleware>;
}

/// Every provider method the wallet answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderMethod {
    EthAccounts,
    EthRequestAccounts,
    EthChainId,
    NetVersion,
    NetListening,
    Web3ClientVersion,
    PersonalSign,
    PersonalEcRecover,
    EthSign,
    EthSignTypedData,
    EthSignTypedDataV3,
    EthSignTypedDataV4,
    EthSendTransaction,
    WalletSwitchEthereumChain,
    WalletAddEthereumChain,
    WalletWatchAsset,
    WalletGetPermissions,
    WalletRequestPermissions,
    WalletRevokePermissions,
    /// Any other `eth_*`/`net_*` call, forwarded to the node once the site
    /// is connected.
    EthRpc(String),
    Unsupported(String),
}

impl ProviderMethod {
    pub fn parse(method: &str) -> Self {
        match method {
            "eth_accounts" => Self::EthAccounts,
            "eth_requestAccounts" => Self::EthRequestAccounts,
            "eth_chainId" => Self::EthChainId,
            "net_version" => Self::NetVersion,
            "net_listening" => Self::NetListening,
            "web3_clientVersion" => Self::Web3ClientVersion,
            "personal_sign" => Self::PersonalSign,
            "personal_ecRecover" => Self::PersonalEcRecover,
            "eth_sign" => Self::EthSign,
            "eth_signTypedData" | "eth_signTypedData_v1" => Self::EthSignTypedData,
            "eth_signTypedData_v3" => Self::EthSignTypedDataV3,
            "eth_signTypedData_v4" => Self::EthSignTypedDataV4,
            "eth_sendTransaction" => Self::EthSendTransaction,
            "wallet_switchEthereumChain" => Self::WalletSwitchEthereumChain,
            "wallet_addEthereumChain" => Self::WalletAddEthereumChain,
            "wallet_watchAsset" => Self::WalletWatchAsset,
            "wallet_getPermissions" => Self::WalletGetPermissions,
            "wallet_requestPermissions" => Self::WalletRequestPermissions,
            "wallet_revokePermissions" => Self::WalletRevokePermissions,
            other if other.starts_with("eth_") || other.starts_with("net_") => {
                Self::EthRpc(other.to_string())
            }
            other => Self::Unsupported(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::EthAccounts => "eth_accounts",
            Self::EthRequestAccounts => "eth_requestAccounts",
            Self::EthChainId => "eth_chainId",
            Self::NetVersion => "net_version",
            Self::NetListening => "net_listening",
            Self::Web3ClientVersion => "web3_clientVersion",
            Self::PersonalSign => "personal_sign",
            Self::PersonalEcRecover => "personal_ecRecover",
            Self::EthSign => "eth_sign",
            Self::EthSignTypedData => "eth_signTypedData",
            Self::EthSignTypedDataV3 => "eth_signTypedData_v3",
            Self::EthSignTypedDataV4 => "eth_signTypedData_v4",
            Self::EthSendTransaction => "eth_sendTransaction",
            Self::WalletSwitchEthereumChain => "wallet_switchEthereumChain",
            Self::WalletAddEthereumChain => "wallet_addEthereumChain",
            Self::WalletWatchAsset => "wallet_watchAsset",
            Self::WalletGetPermissions => "wallet_getPermissions",
            Self::WalletRequestPermissions => "wallet_requestPermissions",
            Self::WalletRevokePermissions => "wallet_revokePermissions",
            Self::EthRpc(method) | Self::Unsupported(method) => method,
        }
    }

    /// Safe methods skip the unlock and connect checks.
    pub fn is_safe(&self) -> bool {
        matches!(
            self,
            Self::EthAccounts
                | Self::EthChainId
                | Self::NetVersion
                | Self::NetListening
                | Self::Web3ClientVersion
                | Self::WalletGetPermissions
                | Self::WalletRevokePermissions
        )
    }
}

/// Factory for [`MethodDispatch`]; the in-flight flow sets are shared by
/// every bridge it builds.
pub struct DispatchFactory {
    controller: Arc<dyn ProviderController>,
    dapps: Arc<dyn DappRegistry>,
    keyring: Arc<dyn KeyringState>,
    unlocking: Arc<Mutex<HashSet<String>>>,
    connecting: Arc<Mutex<HashSet<String>>>,
}

impl DispatchFactory {
    pub fn new(
        controller: Arc<dyn ProviderController>,
        dapps: Arc<dyn DappRegistry>,
        keyring: Arc<dyn KeyringState>,
    ) -> Self {
        Self {
            controller,
            dapps,
            keyring,
            unlocking: Arc::default(),
            connecting: Arc::default(),
        }
    }
}

impl MethodHandlerFactory for DispatchFactory {
    fn create(&self, context: MethodHandlerContext) -> Arc<dyn Middleware> {
        Arc::new(MethodDispatch {
            controller: Arc::clone(&self.controller),
            dapps: Arc::clone(&self.dapps),
            keyring: Arc::clone(&self.keyring),
            unlocking: Arc::clone(&self.unlocking),
            connecting: Arc::clone(&self.connecting),
            context,
        })
    }
}

/// Authorizes and executes provider methods for one bridge.
pub struct MethodDispatch {
    controller: Arc<dyn ProviderController>,
    dapps: Arc<dyn DappRegistry>,
    keyring: Arc<dyn KeyringState>,
    unlocking: Arc<Mutex<HashSet<String>>>,
    connecting: Arc<Mutex<HashSet<String>>>,
    context: MethodHandlerContext,
}

impl MethodDispatch {
    async fn authorize(
        &self,
        method: &ProviderMethod,
        request: &ProviderRequest,
    ) -> Result<(), RpcError> {
        if method.is_safe() {
            return Ok(());
        }

        let origin = request.session.origin.as_str();
        if !self.keyring.is_unlocked() {
            run_exclusive(
                &self.unlocking,
                origin,
                "Already processing unlock. Please wait.",
                self.controller.request_unlock(request),
            )
            .await?;
        }

        if !self.dapps.has_permission(origin) {
            run_exclusive(
                &self.connecting,
                origin,
                "Already processing connect. Please wait.",
                self.controller.request_connect(request),
            )
            .await?;
            if !self.dapps.has_permission(origin) {
                return Err(RpcError::unauthorized());
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Middleware for MethodDispatch {
    fn name(&self) -> &'static str {
        "method-dispatch"
    }

    async fn on_request(&self, request: &mut ProviderRequest) -> Flow {
        let method = ProviderMethod::parse(&request.method);
        if let ProviderMethod::Unsupported(name) = &method {
            return Flow::Done(Err(RpcError::method_not_found(name)));
        }

        if let Err(error) = self.authorize(&method, request).await {
            debug!(
                target: "bridge::dispatch",
                origin = %request.session.origin,
                method = method.as_str(),
                %error,
                "request not authorized"
            );
            return Flow::Done(Err(error));
        }

        let bridge = self.context.bridge.upgrade();
        Flow::Done(self.controller.call(method, request, bridge).await)
    }
}

/// Runs `flow` unless one is already running for `origin`.
async fn run_exclusive<F>(
    running: &Mutex<HashSet<String>>,
    origin: &str,
    busy: &'static str,
    flow: F,
) -> Result<(), RpcError>
where
    F: Future<Output = Result<(), RpcError>>,
{
    if !running.lock().insert(origin.to_string()) {
        return Err(RpcError::resource_unavailable(busy));
    }
    let _guard = RunningGuard { running, origin };
    flow.await
}

struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    origin: &'a str,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(self.origin);
    }
}
