//! Outbound half of the page transport: turns payloads into scripts injected
//! into the embedded surface.

use std::sync::Weak;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

use crate::error::BridgeError;

/// The embedded browser surface, as far as the bridge needs it.
pub trait WebSurface: Send + Sync {
    fn inject_javascript(&self, script: String) -> Result<(), BridgeError>;
}

/// Which frame of the surface the port talks to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameKind {
    #[default]
    Top,
    Sub,
}

pub struct Port {
    surface: RwLock<Option<Weak<dyn WebSurface>>>,
    frame: FrameKind,
}

impl Port {
    pub fn new(surface: Weak<dyn WebSurface>, frame: FrameKind) -> Self {
        Self {
            surface: RwLock::new(Some(surface)),
            frame,
        }
    }

    pub fn frame(&self) -> FrameKind {
        self.frame
    }

    /// Posts `payload` to the page. Failures are dropped: a page that went
    /// away must not surface errors for late notifications.
    pub fn post_message(&self, payload: &Value, target_origin: Option<&str>) {
        if let Err(error) = self.try_post_message(payload, target_origin) {
            trace!(target: "bridge::port", %error, "dropping outbound message");
        }
    }

    pub fn try_post_message(
        &self,
        payload: &Value,
        target_origin: Option<&str>,
    ) -> Result<(), BridgeError> {
        let surface = self
            .surface
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(BridgeError::SurfaceGone)?;
        let script = post_message_script(self.frame, payload, target_origin.unwrap_or("*"))?;
        surface.inject_javascript(script)
    }

    /// Forgets the surface; every later send is a no-op.
    pub fn clear(&self) {
        self.surface.write().take();
    }

    pub fn is_inert(&self) -> bool {
        self.surface
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .is_none()
    }
}

/// Script that delivers `payload` through `window.postMessage` in the top frame,
/// or in every iframe for [`FrameKind::Sub`].
pub fn post_message_script(
    frame: FrameKind,
    payload: &Value,
    target_origin: &str,
) -> Result<String, serde_json::Error> {
    let payload = js_literal(&serde_json::to_string(payload)?);
    let target_origin = js_literal(&serde_json::to_string(target_origin)?);

    Ok(match frame {
        FrameKind::Top => format!(
            ";(function () {{ try {{ window.postMessage({payload}, {target_origin}); }} catch (e) {{}} }})(); true;"
        ),
        FrameKind::Sub => format!(
            ";(function () {{ try {{ var frames = document.getElementsByTagName('iframe'); \
             for (var i = 0; i < frames.length; i++) {{ \
             frames[i].contentWindow && frames[i].contentWindow.postMessage({payload}, {target_origin}); \
             }} }} catch (e) {{}} }})(); true;"
        ),
    })
}

// JSON allows raw U+2028/U+2029 in strings, older JS parsers do not.
fn js_literal(json: &str) -> String {
    json.replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;
    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::WebSurface;
    use crate::error::BridgeError;

    /// Extracts the payload passed to `postMessage` from an injected script.
    pub(crate) fn decode_injected(script: &str) -> Option<Value> {
        let start = script.find("postMessage(")? + "postMessage(".len();
        serde_json::Deserializer::from_str(&script[start..])
            .into_iter::<Value>()
            .next()?
            .ok()
    }

    /// Surface that hands every decoded payload to a channel.
    pub(crate) struct RecordingSurface {
        tx: mpsc::UnboundedSender<Value>,
        pub(crate) scripts: Mutex<Vec<String>>,
    }

    impl RecordingSurface {
        pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Value>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    tx,
                    scripts: Mutex::new(Vec::new()),
                },
                rx,
            )
        }
    }

    impl WebSurface for RecordingSurface {
        fn inject_javascript(&self, script: String) -> Result<(), BridgeError> {
            let payload = decode_injected(&script).ok_or(BridgeError::SurfaceGone)?;
            self.scripts.lock().push(script);
            self.tx.send(payload).map_err(|_| BridgeError::SurfaceGone)
        }
    }
}
