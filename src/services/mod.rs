//! Collaborators the bridge consumes, with in-process implementations.

pub mod chain;
pub mod dapp;
pub mod keyring;
pub mod provider;

pub use chain::{ChainInfo, ChainQuery, ChainRegistry, StaticChains};
pub use dapp::{DappPatch, DappRecord, DappRegistry, MemoryDappStore};
pub use keyring::{KeyringFlag, KeyringState};
pub use provider::{ProviderController, ReadOnlyProvider};
