//! Registry of live page sessions and the permission-scoped broadcast.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    bridge::{BackgroundBridge, BridgeId},
    error::BridgeError,
    services::{DappRegistry, KeyringState},
};

const EVENT_BUS_CAPACITY: usize = 64;

/// Provider events the wallet pushes to pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BroadcastEvent {
    AccountsChanged,
    ChainChanged,
    Unlock,
    Lock,
}

impl BroadcastEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccountsChanged => "accountsChanged",
            Self::ChainChanged => "chainChanged",
            Self::Unlock => "unlock",
            Self::Lock => "lock",
        }
    }
}

/// Published on the in-process bus after every broadcast.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionEvent {
    pub event: BroadcastEvent,
    pub data: Value,
    pub origin: Option<String>,
    /// Sessions the event reached.
    pub delivered: usize,
}

/// Fields updated through [`Session::set_prop`]; `None` leaves a field as is.
#[derive(Clone, Debug, Default)]
pub struct SessionProps {
    pub origin: Option<String>,
    pub name: Option<String>,
    pub icon: Option<String>,
}

#[derive(Clone, Debug, Default)]
struct SessionMeta {
    origin: String,
    name: String,
    icon: String,
}

pub struct Session {
    id: BridgeId,
    created_at: DateTime<Utc>,
    meta: RwLock<SessionMeta>,
    bridges: RwLock<Vec<Arc<BackgroundBridge>>>,
}

impl Session {
    fn new(bridge: &Arc<BackgroundBridge>) -> Self {
        Self {
            id: bridge.id(),
            created_at: Utc::now(),
            meta: RwLock::new(SessionMeta {
                origin: bridge.origin().to_string(),
                ..SessionMeta::default()
            }),
            bridges: RwLock::new(vec![Arc::clone(bridge)]),
        }
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn origin(&self) -> String {
        self.meta.read().origin.clone()
    }

    pub fn name(&self) -> String {
        self.meta.read().name.clone()
    }

    pub fn icon(&self) -> String {
        self.meta.read().icon.clone()
    }

    pub fn set_prop(&self, props: SessionProps) {
        let mut meta = self.meta.write();
        if let Some(origin) = props.origin {
            meta.origin = origin;
        }
        if let Some(name) = props.name {
            meta.name = name;
        }
        if let Some(icon) = props.icon {
            meta.icon = icon;
        }
    }

    pub fn bridges(&self) -> Vec<Arc<BackgroundBridge>> {
        self.bridges.read().clone()
    }

    /// Pushes `event` to every bridge of the session; the first failure aborts.
    pub fn push_event(&self, event: BroadcastEvent, data: &Value) -> Result<(), BridgeError> {
        for bridge in self.bridges() {
            bridge.send_provider_event(event.as_str(), data.clone())?;
        }
        Ok(())
    }
}

/// Process-wide map of bridge identity to session.
pub struct SessionService {
    sessions: RwLock<HashMap<BridgeId, Arc<Session>>>,
    dapps: Arc<dyn DappRegistry>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionService {
    pub fn new(dapps: Arc<dyn DappRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            dapps,
            events,
        }
    }

    pub fn get_or_create_session(&self, bridge: &Arc<BackgroundBridge>) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        let session = sessions.entry(bridge.id()).or_insert_with(|| {
            debug!(target: "bridge::session", id = %bridge.id(), origin = bridge.origin(), "session created");
            Arc::new(Session::new(bridge))
        });
        Arc::clone(session)
    }

    pub fn get_session(&self, id: BridgeId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn delete_session(&self, id: BridgeId) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(&id);
        if removed.is_some() {
            debug!(target: "bridge::session", %id, "session deleted");
        }
        removed
    }

    /// Pushes `event` to every permitted session, optionally only those of
    /// `origin`. Sessions that fail to take the event are deleted.
    pub fn broadcast_event(&self, event: BroadcastEvent, data: Value, origin: Option<&str>) -> usize {
        let snapshot: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();

        let mut delivered = 0;
        for session in snapshot {
            let session_origin = session.origin();
            if !self.dapps.has_permission(&session_origin) {
                continue;
            }
            if origin.is_some_and(|origin| origin != session_origin) {
                continue;
            }

            match session.push_event(event, &data) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(
                        target: "bridge::session",
                        id = %session.id(),
                        origin = %session_origin,
                        event = event.as_str(),
                        %error,
                        "broadcast failed, dropping session"
                    );
                    self.delete_session(session.id());
                }
            }
        }

        // No subscribers is fine.
        let _ = self.events.send(SessionEvent {
            event,
            data,
            origin: origin.map(str::to_string),
            delivered,
        });
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Distinct origins with a live session, sorted.
    pub fn origins(&self) -> Vec<String> {
        let mut origins: Vec<String> = self
            .sessions
            .read()
            .values()
            .map(|session| session.origin())
            .collect();
        origins.sort();
        origins.dedup();
        origins
    }

    /// Mirrors keyring lock transitions to every permitted page.
    pub fn spawn_keyring_forwarder(self: &Arc<Self>, keyring: &dyn KeyringState) -> JoinHandle<()> {
        let mut state = keyring.subscribe();
        let sessions: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let unlocked = *state.borrow_and_update();
                let Some(sessions) = sessions.upgrade() else {
                    break;
                };
                info!(target: "bridge::session", unlocked, "keyring state changed");
                if unlocked {
                    sessions.broadcast_event(BroadcastEvent::Unlock, Value::Null, None);
                } else {
                    sessions.broadcast_event(BroadcastEvent::AccountsChanged, json!([]), None);
                    sessions.broadcast_event(BroadcastEvent::Lock, Value::Null, None);
                }
            }
        })
    }
}
