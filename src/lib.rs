//! Provider bridge between dapp pages in an embedded browser surface and the
//! wallet.
//!
//! Each page gets a [`BackgroundBridge`]: a [`port::Port`] that injects
//! scripts into the surface, a multiplexed stream carrying the
//! `rabby-provider` channel, and an [`engine::Engine`] whose middleware tags
//! the caller's origin, runs the wallet method and sanitizes the result.
//! [`SessionService`] tracks live bridges and scopes broadcast events to
//! permitted origins; [`WebviewLifecycle`] decides when a page needs a new
//! bridge.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod origin;
pub mod port;
pub mod rpc;
pub mod services;
pub mod session;
pub mod site;
pub mod stream;

pub use bridge::{BackgroundBridge, BridgeContext, BridgeId, BridgeOptions};
pub use config::{BridgeConfig, BridgeSettings};
pub use error::{BridgeError, RpcError};
pub use lifecycle::{LoadOutcome, MessageOutcome, NavigationEvent, SurfaceMessage, WebviewLifecycle};
pub use session::{BroadcastEvent, Session, SessionEvent, SessionService};
