//! Per-surface hook: decides when a page needs a fresh bridge and routes what
//! the page posts back.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::{
    bridge::{BackgroundBridge, BridgeContext, BridgeId, BridgeOptions},
    error::BridgeError,
    origin::{origin_of, origin_or_raw, same_host},
    port::{FrameKind, WebSurface},
    services::DappRecord,
    site::SiteRefs,
};

/// Prefix of messages the wallet's own injected scripts post.
pub const INTERNAL_MESSAGE_PREFIX: &str = "RD::";

/// The surface started loading `url`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationEvent {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub force_reload: bool,
}

/// A raw message the page posted to the host.
#[derive(Clone, Debug, Deserialize)]
pub struct SurfaceMessage {
    /// Url the host reports for the posting page.
    pub url: String,
    /// The posted string, expected to be JSON.
    pub data: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A rebuild was already running.
    Ignored,
    /// Same bridge, refreshed site refs.
    Updated,
    Rebuilt(BridgeId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    Forwarded,
    Internal,
    Rejected,
    Dropped,
}

/// Messages posted by the wallet's injected scripts.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum InternalMessage {
    #[serde(rename = "RD::NAV_CHANGE")]
    NavChange(NavChange),
    #[serde(rename = "RD::GET_HEIGHT")]
    GetHeight(Value),
    #[serde(rename = "RD::GET_WINDOW_INFO_AFTER_LOAD")]
    WindowInfo(Value),
    #[serde(rename = "RD::BROWSER_SCRIPT_ERR_CAPTURED")]
    ScriptError(Value),
}

/// In-page navigation of a single-page app.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct NavChange {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub icon: String,
}

pub struct WebviewLifecycle {
    surface: Weak<dyn WebSurface>,
    site: SiteRefs,
    frame: FrameKind,
    context: BridgeContext,
    current: Mutex<Option<Arc<BackgroundBridge>>>,
    reloading: AtomicBool,
}

impl WebviewLifecycle {
    pub fn new(
        surface: Weak<dyn WebSurface>,
        site: SiteRefs,
        frame: FrameKind,
        context: BridgeContext,
    ) -> Self {
        Self {
            surface,
            site,
            frame,
            context,
            current: Mutex::new(None),
            reloading: AtomicBool::new(false),
        }
    }

    pub fn site(&self) -> &SiteRefs {
        &self.site
    }

    pub fn current_bridge(&self) -> Option<Arc<BackgroundBridge>> {
        self.current.lock().clone()
    }

    pub fn on_load_start(&self, navigation: NavigationEvent) -> LoadOutcome {
        let Some(_reloading) = ReloadGuard::acquire(&self.reloading) else {
            trace!(target: "bridge::lifecycle", url = %navigation.url, "rebuild in progress");
            return LoadOutcome::Ignored;
        };
        self.load(navigation)
    }

    fn load(&self, navigation: NavigationEvent) -> LoadOutcome {
        self.site.set_url(navigation.url.as_str());
        if let Some(title) = navigation.title {
            self.site.set_title(title);
        }

        let current = self.current_bridge();
        let rebuild_reason = match &current {
            None => Some("no bridge"),
            Some(_) if navigation.force_reload => Some("forced reload"),
            Some(bridge) if bridge.disconnected() => Some("bridge disconnected"),
            Some(bridge) if origin_or_raw(&navigation.url) != bridge.origin() => {
                Some("origin changed")
            }
            Some(_) => None,
        };
        let Some(reason) = rebuild_reason else {
            return LoadOutcome::Updated;
        };

        if let Some(old) = current {
            self.teardown(&old);
        }

        let bridge = BackgroundBridge::new(
            BridgeOptions {
                surface: self.surface.clone(),
                site: self.site.clone(),
                frame: self.frame,
            },
            &self.context,
        );
        info!(
            target: "bridge::lifecycle",
            id = %bridge.id(),
            origin = bridge.origin(),
            reason,
            "bridge rebuilt"
        );

        if let Some(origin) = origin_of(&navigation.url) {
            if self.context.dapps.get_dapp(&origin).is_none() {
                self.context.dapps.add_dapp(DappRecord {
                    name: self.site.title(),
                    icon: self.site.icon(),
                    ..DappRecord::new(origin)
                });
            }
        }

        let id = bridge.id();
        *self.current.lock() = Some(bridge);
        LoadOutcome::Rebuilt(id)
    }

    pub fn on_message(&self, message: SurfaceMessage) -> MessageOutcome {
        let payload: Value = match serde_json::from_str(&message.data) {
            Ok(payload) => payload,
            Err(error) => {
                debug!(target: "bridge::lifecycle", %error, "unparseable page message");
                return MessageOutcome::Dropped;
            }
        };
        let Some(bridge) = self.current_bridge() else {
            trace!(target: "bridge::lifecycle", "message without bridge");
            return MessageOutcome::Dropped;
        };

        if payload.get("name").is_some() {
            let claimed = payload
                .get("origin")
                .and_then(Value::as_str)
                .unwrap_or(&message.url);
            if !same_host(claimed, bridge.origin()) {
                let error = BridgeError::OriginMismatch {
                    expected: bridge.origin().to_string(),
                    claimed: claimed.to_string(),
                };
                warn!(target: "bridge::lifecycle", id = %bridge.id(), %error, "dropping spoofed message");
                return MessageOutcome::Rejected;
            }
            bridge.on_message(payload);
            return MessageOutcome::Forwarded;
        }

        let is_internal = payload
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| kind.starts_with(INTERNAL_MESSAGE_PREFIX));
        if !is_internal {
            trace!(target: "bridge::lifecycle", "dropping unrecognized message");
            return MessageOutcome::Dropped;
        }

        match serde_json::from_value::<InternalMessage>(payload) {
            Ok(internal) => {
                self.handle_internal(&bridge, internal);
                MessageOutcome::Internal
            }
            Err(error) => {
                trace!(target: "bridge::lifecycle", %error, "unknown internal message");
                MessageOutcome::Dropped
            }
        }
    }

    fn handle_internal(&self, bridge: &BackgroundBridge, message: InternalMessage) {
        match message {
            InternalMessage::NavChange(nav) => {
                if origin_or_raw(&nav.url) != bridge.origin() {
                    warn!(
                        target: "bridge::lifecycle",
                        id = %bridge.id(),
                        url = %nav.url,
                        "ignoring cross-origin NAV_CHANGE"
                    );
                    return;
                }
                self.site.set_url(nav.url);
                if !nav.title.is_empty() {
                    self.site.set_title(nav.title);
                }
                if !nav.icon.is_empty() {
                    self.site.set_icon(nav.icon);
                }
            }
            InternalMessage::ScriptError(payload) => {
                warn!(target: "bridge::lifecycle", id = %bridge.id(), %payload, "page script error");
            }
            InternalMessage::GetHeight(payload) | InternalMessage::WindowInfo(payload) => {
                debug!(target: "bridge::lifecycle", id = %bridge.id(), %payload, "page window info");
            }
        }
    }

    /// Destroys the current bridge, if any.
    pub fn unmount(&self) {
        let current = self.current.lock().take();
        if let Some(bridge) = current {
            self.teardown(&bridge);
        }
    }

    fn teardown(&self, bridge: &BackgroundBridge) {
        bridge.on_disconnect();
        self.context.sessions.delete_session(bridge.id());
        self.current.lock().take();
    }
}

/// Holds the reloading flag; clears it on drop, unwinding included.
struct ReloadGuard<'a>(&'a AtomicBool);

impl<'a> ReloadGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        bridge::testing::Harness,
        rpc::PROVIDER_CHANNEL,
        services::DappRegistry,
    };

    fn lifecycle(harness: &Harness, surface: &Arc<dyn WebSurface>) -> WebviewLifecycle {
        WebviewLifecycle::new(
            Arc::downgrade(surface),
            SiteRefs::new("tab-1"),
            FrameKind::Top,
            harness.context.clone(),
        )
    }

    fn load(url: &str) -> NavigationEvent {
        NavigationEvent {
            url: url.to_string(),
            title: Some("Dapp".to_string()),
            force_reload: false,
        }
    }

    fn provider_message(url: &str, origin: Option<&str>, id: i64) -> SurfaceMessage {
        let mut data = json!({
            "name": PROVIDER_CHANNEL,
            "data": { "id": id, "method": "eth_chainId" },
        });
        if let Some(origin) = origin {
            data["origin"] = json!(origin);
        }
        SurfaceMessage {
            url: url.to_string(),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn first_load_builds_and_registers() {
        let harness = Harness::new();
        let (surface, _rx) = Harness::surface();
        let hook = lifecycle(&harness, &surface);

        let LoadOutcome::Rebuilt(id) = hook.on_load_start(load("https://dapp.example/a")) else {
            panic!("first load builds a bridge");
        };
        let bridge = hook.current_bridge().expect("bridge");
        assert_eq!(bridge.id(), id);
        assert_eq!(bridge.origin(), "https://dapp.example");
        assert!(harness.sessions.get_session(id).is_some());

        let record = harness.dapps.get_dapp("https://dapp.example").expect("registered");
        assert_eq!(record.name, "Dapp");
        assert!(!record.is_connected);
    }

    #[tokio::test]
    async fn same_origin_navigation_keeps_the_bridge() {
        let harness = Harness::new();
        let (surface, _rx) = Harness::surface();
        let hook = lifecycle(&harness, &surface);

        hook.on_load_start(load("https://dapp.example/a"));
        let first = hook.current_bridge().expect("bridge");
        assert_eq!(
            hook.on_load_start(load("https://dapp.example/b")),
            LoadOutcome::Updated
        );
        assert_eq!(hook.current_bridge().expect("bridge").id(), first.id());
        assert_eq!(first.url(), "https://dapp.example/b");
    }

    #[tokio::test]
    async fn forced_reload_and_origin_change_rebuild() {
        let harness = Harness::new();
        let (surface, _rx) = Harness::surface();
        let hook = lifecycle(&harness, &surface);

        hook.on_load_start(load("https://dapp.example/"));
        let first = hook.current_bridge().expect("bridge");

        let reload = NavigationEvent {
            force_reload: true,
            ..load("https://dapp.example/")
        };
        assert!(matches!(hook.on_load_start(reload), LoadOutcome::Rebuilt(_)));
        let second = hook.current_bridge().expect("bridge");
        assert!(first.disconnected());
        assert_ne!(first.id(), second.id());
        assert!(harness.sessions.get_session(first.id()).is_none());

        assert!(matches!(
            hook.on_load_start(load("https://other.example/")),
            LoadOutcome::Rebuilt(_)
        ));
        assert!(second.disconnected());
        assert_eq!(
            hook.current_bridge().expect("bridge").origin(),
            "https://other.example"
        );
        assert_eq!(harness.sessions.session_count(), 1);
    }

    #[tokio::test]
    async fn disconnected_bridge_is_replaced_on_next_load() {
        let harness = Harness::new();
        let (surface, _rx) = Harness::surface();
        let hook = lifecycle(&harness, &surface);

        hook.on_load_start(load("https://dapp.example/"));
        let first = hook.current_bridge().expect("bridge");
        first.on_disconnect();

        assert!(matches!(
            hook.on_load_start(load("https://dapp.example/")),
            LoadOutcome::Rebuilt(_)
        ));
        assert!(!hook.current_bridge().expect("bridge").disconnected());
    }

    #[tokio::test]
    async fn loads_during_a_rebuild_are_ignored() {
        let harness = Harness::new();
        let (surface, _rx) = Harness::surface();
        let hook = lifecycle(&harness, &surface);

        hook.reloading.store(true, Ordering::SeqCst);
        assert_eq!(
            hook.on_load_start(load("https://dapp.example/")),
            LoadOutcome::Ignored
        );
        assert!(hook.current_bridge().is_none());
        assert_eq!(hook.site().url(), "");
    }

    #[test]
    fn reloading_flag_is_released_even_when_a_load_panics() {
        let flag = AtomicBool::new(false);
        let held = ReloadGuard::acquire(&flag).expect("free flag");
        assert!(ReloadGuard::acquire(&flag).is_none());
        drop(held);

        let result = std::panic::catch_unwind(|| {
            let _guard = ReloadGuard::acquire(&flag).expect("free flag");
            panic!("load failed");
        });
        assert!(result.is_err());
        assert!(!flag.load(Ordering::SeqCst));
        assert!(ReloadGuard::acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn spoofed_origins_never_reach_the_bridge() {
        let harness = Harness::new();
        let (surface, mut rx) = Harness::surface();
        let hook = lifecycle(&harness, &surface);
        hook.on_load_start(load("https://dapp.example/"));

        assert_eq!(
            hook.on_message(provider_message("https://evil.example/", None, 1)),
            MessageOutcome::Rejected
        );
        assert_eq!(
            hook.on_message(provider_message(
                "https://dapp.example/",
                Some("https://evil.example"),
                2
            )),
            MessageOutcome::Rejected
        );
        assert_eq!(
            hook.on_message(provider_message("https://dapp.example/x", None, 3)),
            MessageOutcome::Forwarded
        );

        let bridge = hook.current_bridge().expect("bridge");
        let response = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                let frame = rx.recv().await.expect("surface alive");
                if frame["data"].get("id").is_some() {
                    return frame["data"].clone();
                }
            }
        })
        .await
        .expect("response");
        assert_eq!(response["id"], 3);
        assert!(!bridge.disconnected());
    }

    #[tokio::test]
    async fn internal_messages_update_site_refs() {
        let harness = Harness::new();
        let (surface, _rx) = Harness::surface();
        let hook = lifecycle(&harness, &surface);
        hook.on_load_start(load("https://dapp.example/"));

        let nav = json!({
            "type": "RD::NAV_CHANGE",
            "payload": { "url": "https://dapp.example/#/swap", "title": "Swap", "icon": "https://dapp.example/i.png" },
        });
        assert_eq!(
            hook.on_message(SurfaceMessage {
                url: "https://dapp.example/".to_string(),
                data: nav.to_string(),
            }),
            MessageOutcome::Internal
        );
        assert_eq!(hook.site().url(), "https://dapp.example/#/swap");
        assert_eq!(hook.site().title(), "Swap");
        assert_eq!(hook.site().icon(), "https://dapp.example/i.png");

        let cross = json!({
            "type": "RD::NAV_CHANGE",
            "payload": { "url": "https://evil.example/" },
        });
        hook.on_message(SurfaceMessage {
            url: "https://dapp.example/".to_string(),
            data: cross.to_string(),
        });
        assert_eq!(hook.site().url(), "https://dapp.example/#/swap");

        let height = json!({ "type": "RD::GET_HEIGHT", "payload": { "height": 900 } });
        assert_eq!(
            hook.on_message(SurfaceMessage {
                url: "https://dapp.example/".to_string(),
                data: height.to_string(),
            }),
            MessageOutcome::Internal
        );

        for data in ["not json", r#"{"type":"RD::UNKNOWN"}"#, r#"{"hello":1}"#] {
            assert_eq!(
                hook.on_message(SurfaceMessage {
                    url: "https://dapp.example/".to_string(),
                    data: data.to_string(),
                }),
                MessageOutcome::Dropped
            );
        }
    }

    #[tokio::test]
    async fn unmount_destroys_the_bridge() {
        let harness = Harness::new();
        let (surface, _rx) = Harness::surface();
        let hook = lifecycle(&harness, &surface);
        hook.on_load_start(load("https://dapp.example/"));
        let bridge = hook.current_bridge().expect("bridge");

        hook.unmount();
        assert!(bridge.disconnected());
        assert!(hook.current_bridge().is_none());
        assert_eq!(harness.sessions.session_count(), 0);
        assert_eq!(
            hook.on_message(provider_message("https://dapp.example/", None, 1)),
            MessageOutcome::Dropped
        );
    }
}
