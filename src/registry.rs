//! HandlerRegistry (spec §4.1): maps a request-type identifier to a handler
//! function plus its codec descriptors.

use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::RequestContext;

/// Type-erased async handler body: takes the raw request payload and the
/// context it arrived in, returns the raw response payload or a handler
/// error message. Boxed so the registry can hold handlers for arbitrarily
/// different concrete request/response types behind one entry type.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Bytes, String>> + Send>>;
pub type HandlerFn = Arc<dyn Fn(Arc<RequestContext>, Bytes) -> HandlerFuture + Send + Sync>;

/// A registered handler plus the codec descriptors spec.md §4.1 names.
/// `input_codec`/`output_codec` are opaque descriptor strings here (e.g. a
/// type name or schema id) since codec *implementation* is an external
/// collaborator (spec §1); the registry only needs to remember which was
/// declared at registration time.
#[derive(Clone)]
pub struct HandlerEntry {
    pub message_name: String,
    pub handler: HandlerFn,
    pub input_codec: String,
    pub output_codec: String,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("message_name", &self.message_name)
            .field("input_codec", &self.input_codec)
            .field("output_codec", &self.output_codec)
            .finish()
    }
}

/// Read-mostly map of message name to handler. Registration is idempotent
/// by name: re-registering replaces the entry outright (spec §4.1 — a
/// deliberate no-error design to support hot reconfiguration).
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    entries: Arc<DashMap<String, Arc<HandlerEntry>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        input_codec: impl Into<String>,
        output_codec: impl Into<String>,
        handler: HandlerFn,
    ) {
        let name = name.into();
        self.entries.insert(
            name.clone(),
            Arc::new(HandlerEntry {
                message_name: name,
                handler,
                input_codec: input_codec.into(),
                output_codec: output_codec.into(),
            }),
        );
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<HandlerEntry>> {
        self.entries.get(name).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
