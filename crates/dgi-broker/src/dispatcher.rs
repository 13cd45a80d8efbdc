//! Dispatcher -- routes messages to handlers by message type.
//!
//! Inbound ("read") handlers observe a received message; outbound ("write")
//! handlers may rewrite a message before it reaches a connection. Handlers
//! for one type fire in registration order. A failing or panicking handler
//! is logged and skipped; the rest still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use dgi_protocol::{Message, MessageType, PeerIdentity};

use crate::broker::Broker;
use crate::error::HandlerError;

pub type HandlerResult = Result<(), HandlerError>;

/// Handler for a received message.
pub type ReadHandler =
    Arc<dyn Fn(&Message, &HandlerContext<'_>) -> HandlerResult + Send + Sync>;

/// Handler that may rewrite an outbound message.
pub type WriteHandler =
    Arc<dyn Fn(&mut Message, &HandlerContext<'_>) -> HandlerResult + Send + Sync>;

/// What a handler can reach while it runs.
#[derive(Clone, Copy)]
pub struct HandlerContext<'a> {
    broker: Option<&'a Broker>,
    peer: Option<&'a PeerIdentity>,
}

impl<'a> HandlerContext<'a> {
    /// Context for a message flowing through `broker`, to or from `peer`.
    pub fn new(broker: &'a Broker, peer: &'a PeerIdentity) -> Self {
        Self {
            broker: Some(broker),
            peer: Some(peer),
        }
    }

    /// Context with no broker, for dispatching outside an event loop.
    pub fn detached() -> Self {
        Self {
            broker: None,
            peer: None,
        }
    }

    pub fn broker(&self) -> Option<&'a Broker> {
        self.broker
    }

    /// The remote peer: the sender for inbound, the destination for outbound.
    pub fn peer(&self) -> Option<&'a PeerIdentity> {
        self.peer
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct Dispatcher {
    read: RwLock<HashMap<MessageType, Vec<ReadHandler>>>,
    read_any: RwLock<Vec<ReadHandler>>,
    write: RwLock<HashMap<MessageType, Vec<WriteHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an inbound handler for `kind`. Duplicates are allowed and each fires.
    pub fn register_read_handler<F>(&self, kind: impl Into<MessageType>, handler: F)
    where
        F: Fn(&Message, &HandlerContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        let kind = kind.into();
        let mut table = self.read.write().unwrap_or_else(|e| e.into_inner());
        let handlers = table.entry(kind.clone()).or_default();
        handlers.push(Arc::new(handler));
        tracing::debug!(%kind, count = handlers.len(), "dispatcher: read handler registered");
    }

    /// Append an inbound handler that sees every message, after the typed ones.
    pub fn register_read_any<F>(&self, handler: F)
    where
        F: Fn(&Message, &HandlerContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.read_any
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(handler));
    }

    /// Append an outbound handler for `kind`.
    pub fn register_write_handler<F>(&self, kind: impl Into<MessageType>, handler: F)
    where
        F: Fn(&mut Message, &HandlerContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        let kind = kind.into();
        let mut table = self.write.write().unwrap_or_else(|e| e.into_inner());
        let handlers = table.entry(kind.clone()).or_default();
        handlers.push(Arc::new(handler));
        tracing::debug!(%kind, count = handlers.len(), "dispatcher: write handler registered");
    }

    /// Number of inbound handlers registered for `kind` (wildcards excluded).
    pub fn read_handler_count(&self, kind: &MessageType) -> usize {
        self.read
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .map_or(0, Vec::len)
    }

    /// Run every inbound handler for `message`.
    ///
    /// Unknown types are ignored: peers may speak newer protocol versions.
    pub fn dispatch(&self, message: &Message, ctx: &HandlerContext<'_>) -> DispatchReport {
        // Snapshot so handlers may register without deadlocking.
        let mut handlers: Vec<ReadHandler> = self
            .read
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message.kind)
            .cloned()
            .unwrap_or_default();
        handlers.extend(
            self.read_any
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned(),
        );

        if handlers.is_empty() {
            tracing::debug!(
                kind = %message.kind,
                source = %message.source,
                "dispatcher: no handler"
            );
            return DispatchReport::default();
        }

        let mut report = DispatchReport::default();
        for (index, handler) in handlers.iter().enumerate() {
            report.invoked += 1;
            if let Err(e) = invoke(|| handler(message, ctx)) {
                report.failed += 1;
                tracing::warn!(
                    kind = %message.kind,
                    source = %message.source,
                    handler = index,
                    "dispatcher: read handler failed: {e}"
                );
            }
        }
        report
    }

    /// Run every outbound handler for `message`, in order, before it is sent.
    pub fn prepare_outbound(
        &self,
        message: &mut Message,
        ctx: &HandlerContext<'_>,
    ) -> DispatchReport {
        let handlers: Vec<WriteHandler> = self
            .write
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message.kind)
            .cloned()
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        for (index, handler) in handlers.iter().enumerate() {
            report.invoked += 1;
            if let Err(e) = invoke(|| handler(&mut *message, ctx)) {
                report.failed += 1;
                tracing::warn!(
                    kind = %message.kind,
                    handler = index,
                    "dispatcher: write handler failed: {e}"
                );
            }
        }
        report
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let read = self.read.read().map(|t| t.len()).unwrap_or(0);
        let write = self.write.read().map(|t| t.len()).unwrap_or(0);
        f.debug_struct("Dispatcher")
            .field("read_types", &read)
            .field("write_types", &write)
            .finish()
    }
}

/// Call a handler, turning a panic into a `HandlerError`.
fn invoke(f: impl FnOnce() -> HandlerResult) -> HandlerResult {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            Err(HandlerError::Panicked(reason))
        }
    }
}
