//! One provider connection per page: port, multiplexer and RPC engine wired
//! together, plus the page's session registration.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{
    config::BridgeSettings,
    engine::{
        spawn_engine_stream, Engine, MethodHandlerContext, MethodHandlerFactory, OriginTag,
        Sanitize,
    },
    error::BridgeError,
    origin::{host_of, origin_or_raw},
    port::{FrameKind, Port, WebSurface},
    rpc::{notification, PROVIDER_CHANNEL},
    services::{ChainQuery, ChainRegistry, DappRegistry, KeyringState},
    session::{BroadcastEvent, SessionProps, SessionService},
    site::SiteRefs,
    stream::{Channel, ChannelWriter, ObjectMultiplex, PortEvent, PortEventSender, PortStream},
};

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`BackgroundBridge`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BridgeId(u64);

impl BridgeId {
    fn next() -> Self {
        Self(NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The page a bridge serves.
pub struct BridgeOptions {
    pub surface: Weak<dyn WebSurface>,
    pub site: SiteRefs,
    pub frame: FrameKind,
}

/// Services shared by every bridge of the process.
#[derive(Clone)]
pub struct BridgeContext {
    pub sessions: Arc<SessionService>,
    pub dapps: Arc<dyn DappRegistry>,
    pub keyring: Arc<dyn KeyringState>,
    pub chains: Arc<dyn ChainRegistry>,
    pub method_handler: Arc<dyn MethodHandlerFactory>,
    pub settings: BridgeSettings,
}

pub struct BackgroundBridge {
    id: BridgeId,
    origin: String,
    site: SiteRefs,
    port: Arc<Port>,
    engine: Arc<Engine>,
    provider: ChannelWriter,
    port_events: Mutex<Option<PortEventSender>>,
    disconnected: AtomicBool,
    initial_chain: Mutex<Option<JoinHandle<()>>>,
    sessions: Arc<SessionService>,
    keyring: Arc<dyn KeyringState>,
}

impl BackgroundBridge {
    pub fn new(options: BridgeOptions, context: &BridgeContext) -> Arc<Self> {
        let BridgeOptions {
            surface,
            site,
            frame,
        } = options;
        let url = site.url();
        let origin = origin_or_raw(&url);

        let port = Arc::new(Port::new(surface, frame));
        let (stream, port_events) = PortStream::new(Arc::clone(&port));
        let mut mux = ObjectMultiplex::new(stream);
        let Channel { incoming, writer } = mux.create_stream(PROVIDER_CHANNEL);

        let bridge = Arc::new_cyclic(|this: &Weak<Self>| {
            let handler = context.method_handler.create(MethodHandlerContext {
                hostname: host_of(&url).unwrap_or_default(),
                site: site.clone(),
                bridge: this.clone(),
            });
            let engine = Engine::new(vec![
                Arc::new(OriginTag::new(site.clone())),
                handler,
                Arc::new(Sanitize::new(context.settings.sanitize_fields.iter().cloned())),
            ]);

            Self {
                id: BridgeId::next(),
                origin,
                site: site.clone(),
                port,
                engine: Arc::new(engine),
                provider: writer.clone(),
                port_events: Mutex::new(Some(port_events)),
                disconnected: AtomicBool::new(true),
                initial_chain: Mutex::new(None),
                sessions: Arc::clone(&context.sessions),
                keyring: Arc::clone(&context.keyring),
            }
        });

        spawn_engine_stream(Arc::clone(&bridge.engine), incoming, writer);

        let engine = Arc::clone(&bridge.engine);
        let this = Arc::downgrade(&bridge);
        let id = bridge.id;
        mux.spawn(move |result| {
            match result {
                Ok(()) => debug!(target: "bridge::port", %id, "provider stream ended"),
                Err(error) => warn!(target: "bridge::port", %id, %error, "provider stream failed"),
            }
            engine.destroy();
            if let Some(bridge) = this.upgrade() {
                bridge.on_disconnect();
            }
        });
        bridge.disconnected.store(false, Ordering::SeqCst);

        context
            .sessions
            .get_or_create_session(&bridge)
            .set_prop(SessionProps {
                origin: Some(bridge.origin.clone()),
                name: Some(site.title()),
                icon: Some(site.icon()),
            });

        let timer = spawn_initial_chain(&bridge, context);
        *bridge.initial_chain.lock() = Some(timer);

        info!(
            target: "bridge::port",
            id = %bridge.id,
            origin = %bridge.origin,
            ?frame,
            "bridge connected"
        );
        bridge
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    /// Origin pinned at construction.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Live url of the hosting surface.
    pub fn url(&self) -> String {
        self.site.url()
    }

    pub fn webview_id(&self) -> String {
        self.site.webview_id()
    }

    pub fn site(&self) -> &SiteRefs {
        &self.site
    }

    pub fn frame(&self) -> FrameKind {
        self.port.frame()
    }

    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn is_unlocked(&self) -> bool {
        self.keyring.is_unlocked()
    }

    pub fn on_unlock(&self) -> Result<(), BridgeError> {
        self.send_provider_event(BroadcastEvent::Unlock.as_str(), Value::Null)
    }

    pub fn on_lock(&self) -> Result<(), BridgeError> {
        self.send_provider_event(BroadcastEvent::Lock.as_str(), Value::Null)
    }

    /// Feeds a message received from the page into the provider stream.
    pub fn on_message(&self, message: Value) {
        if self.disconnected() {
            trace!(target: "bridge::port", id = %self.id, "message after disconnect ignored");
            return;
        }
        if let Some(events) = self.port_events.lock().as_ref() {
            let _ = events.send(PortEvent::Message(message));
        }
    }

    /// Tears the bridge down. Only the first call has any effect.
    pub fn on_disconnect(&self) {
        let Some(events) = self.port_events.lock().take() else {
            return;
        };
        self.disconnected.store(true, Ordering::SeqCst);
        if let Some(timer) = self.initial_chain.lock().take() {
            timer.abort();
        }
        let _ = events.send(PortEvent::Disconnect);
        self.port.clear();
        self.sessions.delete_session(self.id);
        info!(target: "bridge::port", id = %self.id, origin = %self.origin, "bridge disconnected");
    }

    /// Writes a raw payload to the provider channel.
    #[deprecated(note = "use `send_provider_event`")]
    pub fn send_notification(&self, payload: Value) -> Result<(), BridgeError> {
        self.ensure_connected()?;
        self.provider.write(payload)
    }

    /// Pushes a `{ method, params }` provider event to the page.
    pub fn send_provider_event(&self, event: &str, data: Value) -> Result<(), BridgeError> {
        self.ensure_connected()?;
        self.provider.write(notification(event, data))
    }

    fn ensure_connected(&self) -> Result<(), BridgeError> {
        if self.disconnected() || self.port.is_inert() {
            return Err(BridgeError::Disconnected(self.id.get()));
        }
        Ok(())
    }
}

fn spawn_initial_chain(bridge: &Arc<BackgroundBridge>, context: &BridgeContext) -> JoinHandle<()> {
    let this = Arc::downgrade(bridge);
    let delay = context.settings.initial_chain_delay;
    let default_chain = context.settings.default_chain.clone();
    let dapps = Arc::clone(&context.dapps);
    let chains = Arc::clone(&context.chains);

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(bridge) = this.upgrade() else {
            return;
        };

        // A record naming an unknown chain falls back to the default one.
        let chain = dapps
            .get_dapp(bridge.origin())
            .and_then(|dapp| dapp.chain_id)
            .and_then(|chain| chains.find_chain(&ChainQuery::Enum(chain)))
            .or_else(|| chains.find_chain(&ChainQuery::Enum(default_chain.clone())));
        let Some(chain) = chain else {
            warn!(target: "bridge::port", chain = %default_chain, "unknown default chain");
            return;
        };

        if let Err(error) =
            bridge.send_provider_event(BroadcastEvent::ChainChanged.as_str(), chain.changed_params())
        {
            debug!(target: "bridge::port", id = %bridge.id(), %error, "initial chainChanged not sent");
        }
    })
}
