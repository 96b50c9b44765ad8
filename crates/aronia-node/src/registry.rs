//! Method registry for inbound RPC.
//!
//! Handlers run on the receive side: a `REQUEST` frame names a method,
//! the registry dispatches it with the decoded params and a handle to the
//! calling peer, and the outcome (value or error) becomes the `RESPONSE`
//! frame. Unknown methods answer with `method-not-found` rather than an
//! error event.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use aronia_crypto::PeerId;
use aronia_wire::frame::now_ms;
use aronia_wire::payload::{Capabilities, ResponseError};

/// The calling peer, as seen by a handler.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    /// The caller's public key.
    pub pubkey: PeerId,
    /// The caller's last announced capabilities.
    pub capabilities: Capabilities,
}

/// Outcome of a handler invocation.
pub type HandlerResult = std::result::Result<serde_json::Value, ResponseError>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
type Handler = Arc<dyn Fn(serde_json::Value, PeerHandle) -> HandlerFuture + Send + Sync>;

/// Mapping from method name to handler.
pub struct MethodRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    /// Create a registry with the built-in `ping` handler.
    pub fn new() -> Self {
        let registry = Self {
            handlers: RwLock::new(HashMap::new()),
        };
        registry.register("ping", |_params, _peer| async {
            Ok(serde_json::json!({ "pong": true, "timestamp": now_ms() }))
        });
        registry
    }

    /// Register (or replace) the handler for `method`.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value, PeerHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params, peer| Box::pin(handler(params, peer)));
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        handlers.insert(method.into(), handler);
    }

    /// Remove the handler for `method`. Returns whether one was present.
    pub fn unregister(&self, method: &str) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        handlers.remove(method).is_some()
    }

    /// Invoke the handler for `method`, answering `method-not-found` if
    /// none is registered.
    pub async fn dispatch(
        &self,
        method: &str,
        params: serde_json::Value,
        peer: PeerHandle,
    ) -> HandlerResult {
        let handler = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            handlers.get(method).cloned()
        };
        match handler {
            Some(handler) => handler(params, peer).await,
            None => Err(ResponseError::method_not_found(method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aronia_wire::payload::ERR_METHOD_NOT_FOUND;

    fn caller() -> PeerHandle {
        PeerHandle {
            pubkey: [5u8; 32],
            capabilities: Capabilities::default(),
        }
    }

    #[tokio::test]
    async fn test_builtin_ping() {
        let registry = MethodRegistry::new();
        let result = registry
            .dispatch("ping", serde_json::Value::Null, caller())
            .await
            .expect("ping answers");
        assert_eq!(result["pong"], true);
        assert!(result["timestamp"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let registry = MethodRegistry::new();
        let err = registry
            .dispatch("no-such-method", serde_json::Value::Null, caller())
            .await
            .expect_err("must fail");
        assert_eq!(err.code, ERR_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_custom_handler_sees_params_and_peer() {
        let registry = MethodRegistry::new();
        registry.register("echo", |params, peer| async move {
            Ok(serde_json::json!({
                "params": params,
                "caller": hex::encode(peer.pubkey),
            }))
        });

        let result = registry
            .dispatch("echo", serde_json::json!({"n": 7}), caller())
            .await
            .expect("echo answers");
        assert_eq!(result["params"]["n"], 7);
        assert_eq!(result["caller"], hex::encode([5u8; 32]));
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let registry = MethodRegistry::new();
        registry.register("fail", |_params, _peer| async {
            Err(ResponseError::handler_failed("deliberate"))
        });

        let err = registry
            .dispatch("fail", serde_json::Value::Null, caller())
            .await
            .expect_err("must fail");
        assert_eq!(err.message, "deliberate");
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = MethodRegistry::new();
        registry.register("gone", |_params, _peer| async {
            Ok(serde_json::Value::Null)
        });
        assert!(registry.unregister("gone"));
        assert!(!registry.unregister("gone"));

        let err = registry
            .dispatch("gone", serde_json::Value::Null, caller())
            .await
            .expect_err("must fail");
        assert_eq!(err.code, ERR_METHOD_NOT_FOUND);
    }
}
