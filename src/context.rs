//! Per-request server-side record (spec §3 `RequestContext`).

use crate::envelope::Envelope;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::time::Instant;

/// Outcome handed to a request's `on_complete` callback, and recorded into
/// [`crate::stats::RequestStatistics`].
#[derive(Debug)]
pub enum Outcome {
    Response(bytes::Bytes),
    Timeout,
    HandlerError(String),
    Rejected,
    NoHandler,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Response(_))
    }
}

/// A decoded request plus the bookkeeping the dispatcher and filter chain
/// attach to it. Confined to the connection/task that produced it; never
/// migrates across threads mid-flight (spec §5 ordering guarantee).
pub struct RequestContext {
    pub envelope: Envelope,
    pub received_at: Instant,
    /// `received_at + request_timeout`. Checked at dequeue time.
    pub queue_deadline: Instant,
    /// `received_at + response_generation_timeout`, if that timeout is
    /// enabled (spec §4.4: disabled when configured `<= 0`).
    pub service_deadline: Option<Instant>,
    attributes: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl RequestContext {
    pub fn new(envelope: Envelope, queue_timeout: std::time::Duration, service_timeout: Option<std::time::Duration>) -> Self {
        let received_at = Instant::now();
        Self {
            envelope,
            received_at,
            queue_deadline: received_at + queue_timeout,
            service_deadline: service_timeout.map(|d| received_at + d),
            attributes: Mutex::new(HashMap::new()),
        }
    }

    /// Filters mutate attributes through a shared reference (the context is
    /// held behind `Arc` once it reaches the executor); access is guarded
    /// by an internal lock rather than requiring `&mut self`.
    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attributes.lock().insert(key.into(), Box::new(value));
    }

    pub fn attribute<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.attributes.lock().get(key).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    pub fn message_name(&self) -> &str {
        &self.envelope.message_name
    }
}
