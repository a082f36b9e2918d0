//! Duplex plumbing between a [`Port`] and the provider engine.
//!
//! [`PortStream`] exposes a port as a `Stream` + `Sink` of JSON values;
//! [`ObjectMultiplex`] splits such a duplex into `{ name, data }` framed
//! sub-channels and pumps both directions until the transport goes away.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace, warn};

use crate::{error::BridgeError, port::Port, rpc::Frame};

/// Typed events delivered to the readable side of a [`PortStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    Message(Value),
    Disconnect,
}

pub type PortEventSender = mpsc::UnboundedSender<PortEvent>;

pub struct PortStream {
    port: Arc<Port>,
    events: mpsc::UnboundedReceiver<PortEvent>,
    ended: bool,
}

impl PortStream {
    pub fn new(port: Arc<Port>) -> (Self, PortEventSender) {
        let (tx, events) = mpsc::unbounded_channel();
        (
            Self {
                port,
                events,
                ended: false,
            },
            tx,
        )
    }
}

impl Stream for PortStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        if self.ended {
            return Poll::Ready(None);
        }
        match self.events.poll_recv(cx) {
            Poll::Ready(Some(PortEvent::Message(value))) => Poll::Ready(Some(value)),
            Poll::Ready(Some(PortEvent::Disconnect)) | Poll::Ready(None) => {
                self.ended = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Sink<Value> for PortStream {
    type Error = BridgeError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), BridgeError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Value) -> Result<(), BridgeError> {
        self.port.try_post_message(&item, None)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), BridgeError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), BridgeError>> {
        Poll::Ready(Ok(()))
    }
}

/// Write half of one multiplexed channel.
#[derive(Clone, Debug)]
pub struct ChannelWriter {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl ChannelWriter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write(&self, data: Value) -> Result<(), BridgeError> {
        self.tx
            .send(Frame {
                name: self.name.to_string(),
                data,
            })
            .map_err(|_| BridgeError::StreamClosed(self.name.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
impl ChannelWriter {
    pub(crate) fn for_tests(name: &str, tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            name: Arc::from(name),
            tx,
        }
    }
}

/// One named sub-channel of an [`ObjectMultiplex`].
pub struct Channel {
    pub incoming: mpsc::UnboundedReceiver<Value>,
    pub writer: ChannelWriter,
}

pub struct ObjectMultiplex<S> {
    inner: S,
    channels: HashMap<String, mpsc::UnboundedSender<Value>>,
    out_tx: mpsc::UnboundedSender<Frame>,
    out_rx: mpsc::UnboundedReceiver<Frame>,
}

impl<S> ObjectMultiplex<S>
where
    S: Stream<Item = Value> + Sink<Value, Error = BridgeError> + Unpin + Send + 'static,
{
    pub fn new(inner: S) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Self {
            inner,
            channels: HashMap::new(),
            out_tx,
            out_rx,
        }
    }

    /// Opens the channel `name`. Opening a name twice replaces the first
    /// channel's inbound side.
    pub fn create_stream(&mut self, name: &str) -> Channel {
        let (tx, incoming) = mpsc::unbounded_channel();
        if self.channels.insert(name.to_string(), tx).is_some() {
            warn!(target: "bridge::mux", name, "channel opened twice");
        }
        Channel {
            incoming,
            writer: ChannelWriter {
                name: Arc::from(name),
                tx: self.out_tx.clone(),
            },
        }
    }

    /// Pumps until the transport ends; `on_complete` runs exactly once.
    pub fn spawn<F>(self, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<(), BridgeError>) + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.run().await;
            on_complete(result);
        })
    }

    async fn run(self) -> Result<(), BridgeError> {
        let Self {
            inner,
            channels,
            out_tx,
            mut out_rx,
        } = self;
        // Only channel writers keep the outbound queue alive.
        drop(out_tx);

        let (mut sink, mut stream) = inner.split();
        let mut outbound_open = true;

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(value) => route(&channels, value),
                    None => {
                        debug!(target: "bridge::mux", "underlying stream ended");
                        return Ok(());
                    }
                },
                frame = out_rx.recv(), if outbound_open => match frame {
                    Some(frame) => {
                        let value = serde_json::to_value(&frame)?;
                        sink.send(value).await?;
                    }
                    None => outbound_open = false,
                },
            }
        }
    }
}

fn route(channels: &HashMap<String, mpsc::UnboundedSender<Value>>, value: Value) {
    let frame = match serde_json::from_value::<Frame>(value) {
        Ok(frame) => frame,
        Err(error) => {
            debug!(target: "bridge::mux", %error, "dropping unframed message");
            return;
        }
    };

    match channels.get(&frame.name) {
        Some(tx) => {
            if tx.send(frame.data).is_err() {
                trace!(target: "bridge::mux", name = %frame.name, "channel reader gone");
            }
        }
        None => trace!(target: "bridge::mux", name = %frame.name, "no such channel"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::{sync::oneshot, time::timeout};

    use super::*;
    use crate::port::{testing::RecordingSurface, FrameKind, WebSurface};

    fn harness() -> (
        Arc<dyn WebSurface>,
        mpsc::UnboundedReceiver<Value>,
        ObjectMultiplex<PortStream>,
        PortEventSender,
    ) {
        let (surface, rx) = RecordingSurface::new();
        let surface: Arc<dyn WebSurface> = Arc::new(surface);
        let port = Arc::new(Port::new(Arc::downgrade(&surface), FrameKind::Top));
        let (stream, events) = PortStream::new(port);
        (surface, rx, ObjectMultiplex::new(stream), events)
    }

    #[tokio::test]
    async fn routes_frames_by_channel_name() {
        let (_surface, mut injected, mut mux, events) = harness();
        let mut provider = mux.create_stream("rabby-provider");
        let mut other = mux.create_stream("other");
        let (done_tx, _done_rx) = oneshot::channel();
        mux.spawn(move |result| {
            let _ = done_tx.send(result.is_ok());
        });

        events
            .send(PortEvent::Message(json!({ "name": "other", "data": 1 })))
            .expect("send event");
        events
            .send(PortEvent::Message(json!({ "name": "rabby-provider", "data": 2 })))
            .expect("send event");
        events
            .send(PortEvent::Message(json!({ "name": "unknown", "data": 3 })))
            .expect("send event");
        events
            .send(PortEvent::Message(json!("not a frame")))
            .expect("send event");

        assert_eq!(provider.incoming.recv().await, Some(json!(2)));
        assert_eq!(other.incoming.recv().await, Some(json!(1)));

        provider.writer.write(json!({ "id": 1 })).expect("write");
        other.writer.write(json!("x")).expect("write");
        assert_eq!(
            injected.recv().await,
            Some(json!({ "name": "rabby-provider", "data": { "id": 1 } }))
        );
        assert_eq!(
            injected.recv().await,
            Some(json!({ "name": "other", "data": "x" }))
        );
    }

    #[tokio::test]
    async fn completes_once_on_disconnect() {
        let (_surface, _injected, mut mux, events) = harness();
        let channel = mux.create_stream("rabby-provider");
        let (done_tx, done_rx) = oneshot::channel();
        mux.spawn(move |result| {
            let _ = done_tx.send(result.is_ok());
        });

        events.send(PortEvent::Disconnect).expect("send disconnect");
        let ok = timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("pump completes")
            .expect("completion reported");
        assert!(ok);
        assert!(channel.writer.is_closed());
        assert!(channel.writer.write(json!(1)).is_err());
    }

    #[tokio::test]
    async fn reports_transport_error_when_surface_is_gone() {
        let (surface, _injected, mut mux, _events) = harness();
        let channel = mux.create_stream("rabby-provider");
        let (done_tx, done_rx) = oneshot::channel();
        mux.spawn(move |result| {
            let _ = done_tx.send(result);
        });

        drop(surface);
        channel.writer.write(json!({ "id": 9 })).expect("queued");
        let result = timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("pump completes")
            .expect("completion reported");
        assert!(matches!(result, Err(BridgeError::SurfaceGone)));
    }
}
