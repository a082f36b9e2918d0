//! JSON-RPC engine and its middleware pipeline.
//!
//! A request walks the request phase of every middleware in order until one
//! resolves it; if none does, the outcome is `Method not found`. The response
//! phase then runs over the outcome, again in list order, so the last
//! middleware always sees the final result or error.

mod dispatch;
mod middleware;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace, warn};

pub use dispatch::{
    DispatchFactory, MethodDispatch, MethodHandlerContext, MethodHandlerFactory, ProviderMethod,
};
pub use middleware::{OriginTag, Sanitize, DEFAULT_SANITIZED_FIELDS};

use crate::{
    error::RpcError,
    rpc::{Id, ResponseResult, RpcCall, RpcRequest, RpcResponse},
    stream::ChannelWriter,
};

/// Who is asking, as stamped by [`OriginTag`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSession {
    pub origin: String,
    pub hostname: String,
    pub name: String,
    pub icon: String,
}

/// A request travelling through the pipeline.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub id: Id,
    pub method: String,
    pub params: Value,
    pub session: RequestSession,
}

impl From<RpcRequest> for ProviderRequest {
    fn from(request: RpcRequest) -> Self {
        Self {
            id: request.id,
            method: request.method,
            params: request.params,
            session: RequestSession::default(),
        }
    }
}

/// Result of a middleware's request phase.
#[derive(Debug)]
pub enum Flow {
    Next,
    Done(Result<Value, RpcError>),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, _request: &mut ProviderRequest) -> Flow {
        Flow::Next
    }

    fn on_response(&self, _request: &ProviderRequest, _response: &mut ResponseResult) {}

    /// Releases listeners once the transport is gone.
    fn destroy(&self) {}
}

pub struct Engine {
    middleware: Vec<Arc<dyn Middleware>>,
    destroyed: AtomicBool,
}

impl Engine {
    pub fn new(middleware: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            middleware,
            destroyed: AtomicBool::new(false),
        }
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let mut request = ProviderRequest::from(request);

        let mut outcome = None;
        for middleware in &self.middleware {
            if let Flow::Done(result) = middleware.on_request(&mut request).await {
                trace!(
                    target: "bridge::engine",
                    id = %request.id,
                    method = %request.method,
                    middleware = middleware.name(),
                    "request resolved"
                );
                outcome = Some(result);
                break;
            }
        }

        let mut result = ResponseResult::from(
            outcome.unwrap_or_else(|| Err(RpcError::method_not_found(&request.method))),
        );
        for middleware in &self.middleware {
            middleware.on_response(&request, &mut result);
        }

        RpcResponse::new(request.id, result)
    }

    /// Runs every middleware's `destroy` hook, once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for middleware in &self.middleware {
            middleware.destroy();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Feeds requests from `incoming` into `engine` and writes every response to
/// `writer`. Requests run concurrently; a response goes out as soon as its
/// own handler finishes.
pub fn spawn_engine_stream(
    engine: Arc<Engine>,
    mut incoming: mpsc::UnboundedReceiver<Value>,
    writer: ChannelWriter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(value) = incoming.recv().await {
            match RpcCall::from_value(value) {
                RpcCall::Request(request) => {
                    let engine = Arc::clone(&engine);
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        let id = request.id.clone();
                        let handled =
                            tokio::spawn(async move { engine.handle(request).await }).await;
                        // A panicking handler still owes the page an answer.
                        let response = handled.unwrap_or_else(|error| {
                            warn!(target: "bridge::engine", %id, %error, "request handler failed");
                            RpcResponse::new(
                                id,
                                ResponseResult::Error(RpcError::internal("Internal error")),
                            )
                        });
                        if writer.write(response.to_value()).is_err() {
                            trace!(target: "bridge::engine", id = %response.id, "response undeliverable");
                        }
                    });
                }
                RpcCall::Notification { method } => {
                    trace!(target: "bridge::engine", %method, "ignoring page notification");
                }
                RpcCall::Invalid { id } => {
                    debug!(target: "bridge::engine", %id, "invalid rpc call");
                    let _ = writer.write(RpcResponse::invalid_request(id).to_value());
                }
            }
        }
        trace!(target: "bridge::engine", "provider channel closed");
    })
}
