//! Method name → handler map shared between callers and the read loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;

/// Callback for a server → client invocation. Receives the positional arguments.
pub type Handler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Thread-safe registry of invocation handlers.
///
/// Keys are case-sensitive method names. Registering a method twice
/// replaces the earlier handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler for `method`.
    pub fn register(&self, method: impl Into<String>, handler: Handler) {
        let method = method.into();
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if handlers.insert(method.clone(), handler).is_some() {
            log::debug!("[Hub] Replaced handler for {method}");
        }
    }

    /// Call the handler for `method` if one is registered.
    ///
    /// The handler runs outside the registry lock, so it may register
    /// further handlers. Returns `false` when nothing was registered.
    pub fn dispatch(&self, method: &str, arguments: &[Value]) -> bool {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(method)
            .map(Arc::clone);
        match handler {
            Some(handler) => {
                handler(arguments);
                true
            }
            None => false,
        }
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
