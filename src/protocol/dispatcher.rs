use crate::core::frame::{split_prefix, ConversationId};
use crate::error::{constants, ProtocolError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

/// Separator between prefix and body in client-bound messages (`log:alice`).
pub const CLIENT_SEPARATOR: u8 = b':';

/// Separator between prefix and body in server-bound requests (`login;alice`).
pub const SERVER_SEPARATOR: u8 = b';';

type HandlerFn<C> =
    dyn Fn(C, ConversationId, Vec<u8>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static;

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers invoked
    pub handled: usize,
    /// Handlers that returned an error or panicked
    pub faults: usize,
}

/// Prefix-keyed handler lists for messages no continuation claimed.
///
/// `C` is the context handed to every handler, typically the multiplexer
/// or peer the message arrived on. Handlers for one prefix run in
/// registration order; a failing handler is logged and does not stop the
/// ones after it.
pub struct PrefixActions<C> {
    separator: u8,
    handlers: RwLock<HashMap<String, Vec<Arc<HandlerFn<C>>>>>,
}

impl<C> PrefixActions<C>
where
    C: Clone + Send + 'static,
{
    pub fn new(separator: u8) -> Self {
        Self {
            separator,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn separator(&self) -> u8 {
        self.separator
    }

    /// Append a handler for `prefix`.
    pub fn register<F, Fut>(&self, prefix: &str, handler: F) -> Result<()>
    where
        F: Fn(C, ConversationId, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;

        let boxed: Arc<HandlerFn<C>> =
            Arc::new(move |ctx, id, body| handler(ctx, id, body).boxed());
        handlers.entry(prefix.to_string()).or_default().push(boxed);
        Ok(())
    }

    pub fn handler_count(&self, prefix: &str) -> usize {
        self.handlers
            .read()
            .map(|handlers| handlers.get(prefix).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Split `payload` at the separator and dispatch the body.
    pub async fn route(&self, ctx: C, id: ConversationId, payload: &[u8]) -> Result<DispatchReport> {
        let (prefix, body) = split_prefix(payload, self.separator);
        self.dispatch(ctx, &prefix, id, body.to_vec()).await
    }

    /// Run every handler registered for `prefix`.
    pub async fn dispatch(
        &self,
        ctx: C,
        prefix: &str,
        id: ConversationId,
        body: Vec<u8>,
    ) -> Result<DispatchReport> {
        let registered = {
            let handlers = self.handlers.read().map_err(|_| {
                ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string())
            })?;
            handlers.get(prefix).cloned().unwrap_or_default()
        };

        if registered.is_empty() {
            error!(%prefix, %id, "No prefix action registered");
            return Ok(DispatchReport::default());
        }

        let mut report = DispatchReport::default();
        for handler in registered {
            report.handled += 1;
            let (ctx, body) = (ctx.clone(), body.clone());
            let call = AssertUnwindSafe(async move { handler(ctx, id, body).await });
            match call.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.faults += 1;
                    warn!(%prefix, %id, error = %e, "Prefix action failed");
                }
                Err(_) => {
                    report.faults += 1;
                    error!(%prefix, %id, "Prefix action panicked");
                }
            }
        }
        Ok(report)
    }
}

impl<C> Default for PrefixActions<C>
where
    C: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new(CLIENT_SEPARATOR)
    }
}
