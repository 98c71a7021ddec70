//! Handler registry: where producers and consumers agree on what code
//! runs for a given payload type, without either side holding a direct
//! reference to the other.
//!
//! There is no reflection here — handlers are registered explicitly at
//! startup (typed, generic-by-payload-type, or fallback) and looked up by
//! payload type at dispatch time. A handler's stable id is derived from
//! its owner and method name so it survives across process restarts for
//! logging and metrics correlation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use obx_schemas::{FailureContext, HandlerOutcome, Metadata};
use serde_json::Value;

/// Implemented by primary handlers: given a decoded payload and its
/// metadata, does the work and classifies its own failure.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: Value, metadata: Metadata) -> HandlerOutcome;
}

/// Implemented by fallback handlers: invoked once a record's retries are
/// exhausted or its error was non-retryable. Fallbacks cannot themselves
/// trigger another retry — their own failure marks the record FAILED.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle_failure(&self, payload: Value, failure: FailureContext) -> anyhow::Result<()>;
}

/// A blanket function-pointer adapter so simple handlers don't need a
/// struct + trait impl boilerplate pair.
#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Value, Metadata) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerOutcome> + Send,
{
    async fn handle(&self, payload: Value, metadata: Metadata) -> HandlerOutcome {
        (self)(payload, metadata).await
    }
}

/// Builds the stable handler id `owner#method(params)` used for
/// registration keys, logs, and metrics. Stable across restarts because
/// it is derived from source-level identifiers, not a registration order
/// or memory address.
pub fn handler_id(owner: &str, method: &str, params: &str) -> String {
    format!("{owner}#{method}({params})")
}

#[derive(Clone)]
struct TypedEntry {
    id: String,
    handler: Arc<dyn Handler>,
}

struct FallbackEntry {
    id: String,
    handler: Arc<dyn FallbackHandler>,
}

/// Central lookup table mapping payload types to handlers.
///
/// A payload type may have any number of typed handlers, invoked in
/// registration order; what must stay unique is the handler's own id
/// (`owner#method(params)`), not the payload type it is registered
/// against. At most one fallback handler may be registered per payload
/// type, and only for a payload type that already has a typed handler
/// declared. A bare "generic" registration covers any payload type not
/// given a more specific entry.
#[derive(Default)]
pub struct HandlerRegistry {
    typed: HashMap<String, Vec<TypedEntry>>,
    typed_by_id: HashMap<String, TypedEntry>,
    fallback: HashMap<String, FallbackEntry>,
    /// Catch-all handlers that fan out to every registered generic, in
    /// registration order, regardless of payload type.
    generic: Vec<Arc<dyn Handler>>,
    generic_fallback: Option<Arc<dyn FallbackHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("a handler with id {0:?} is already registered")]
    DuplicateHandlerId(String),
    #[error("a fallback handler requires a payload type with a typed handler already registered, got {0:?}")]
    FallbackRequiresPayloadType(String),
    #[error("a fallback is already registered for payload type {0:?}")]
    DuplicateFallback(String),
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed handler for `payload_type`. Multiple typed
    /// handlers may share a payload type — they all run, in the order
    /// they were registered — but a handler id (derived from `owner`,
    /// `method`, and `params`) must be unique across the whole registry.
    pub fn register_typed(
        &mut self,
        payload_type: impl Into<String>,
        owner: &str,
        method: &str,
        params: &str,
        handler: impl Handler + 'static,
    ) -> Result<(), RegistrationError> {
        let payload_type = payload_type.into();
        let id = handler_id(owner, method, params);
        if self.typed_by_id.contains_key(&id) {
            return Err(RegistrationError::DuplicateHandlerId(id));
        }
        let entry = TypedEntry { id: id.clone(), handler: Arc::new(handler) };
        self.typed_by_id.insert(id, entry.clone());
        self.typed.entry(payload_type).or_default().push(entry);
        Ok(())
    }

    pub fn register_generic(&mut self, handler: impl Handler + 'static) {
        self.generic.push(Arc::new(handler));
    }

    /// Registers a fallback handler for `payload_type`. The payload type
    /// must already have at least one typed handler declared — a
    /// fallback for a type nothing primary ever handles is almost
    /// certainly a configuration mistake, so it is rejected rather than
    /// silently never invoked.
    pub fn register_fallback(
        &mut self,
        payload_type: impl Into<String>,
        owner: &str,
        method: &str,
        params: &str,
        handler: impl FallbackHandler + 'static,
    ) -> Result<(), RegistrationError> {
        let payload_type = payload_type.into();
        if !self.typed.contains_key(&payload_type) {
            return Err(RegistrationError::FallbackRequiresPayloadType(payload_type));
        }
        if self.fallback.contains_key(&payload_type) {
            return Err(RegistrationError::DuplicateFallback(payload_type));
        }
        let id = handler_id(owner, method, params);
        self.fallback.insert(payload_type, FallbackEntry { id, handler: Arc::new(handler) });
        Ok(())
    }

    pub fn register_generic_fallback(&mut self, handler: impl FallbackHandler + 'static) {
        self.generic_fallback = Some(Arc::new(handler));
    }

    /// Resolves the primary handler for a payload type: the first typed
    /// handler if one is registered, else the first generic handler (for
    /// callers that only care about "is there anything to invoke at
    /// all").
    pub fn resolve(&self, payload_type: &str) -> Option<Arc<dyn Handler>> {
        match self.typed.get(payload_type).and_then(|entries| entries.first()) {
            Some(entry) => Some(entry.handler.clone()),
            None => self.generic.first().cloned(),
        }
    }

    /// Resolves the full dispatch chain for `payload_type`: every typed
    /// handler registered for it, in registration order, followed by
    /// every registered generic handler, also in registration order. The
    /// primary stage invokes these in order and stops at the first
    /// non-success outcome.
    pub fn resolve_chain(&self, payload_type: &str) -> Vec<Arc<dyn Handler>> {
        let typed = self.typed.get(payload_type).map(Vec::as_slice).unwrap_or(&[]);
        let mut chain = Vec::with_capacity(typed.len() + self.generic.len());
        chain.extend(typed.iter().map(|entry| entry.handler.clone()));
        chain.extend(self.generic.iter().cloned());
        chain
    }

    /// Resolves the stable id of the first handler that would be chosen
    /// for `payload_type`, for logging before invocation.
    pub fn resolve_id(&self, payload_type: &str) -> Option<&str> {
        self.typed.get(payload_type).and_then(|entries| entries.first()).map(|entry| entry.id.as_str())
    }

    pub fn resolve_fallback(&self, payload_type: &str) -> Option<Arc<dyn FallbackHandler>> {
        match self.fallback.get(payload_type) {
            Some(entry) => Some(entry.handler.clone()),
            None => self.generic_fallback.clone(),
        }
    }
}
