//! ChannelPipeline (spec §4.6): the per-connection stages wiring frame I/O
//! to the executor. Stateless between requests on the same connection — a
//! slow request never blocks a later one on the same socket, since each
//! decoded envelope is dispatched to the executor and its response is
//! written back independently as soon as it completes.

use crate::codec::{write_envelope, FrameReader};
use crate::context::{Outcome, RequestContext};
use crate::envelope::Envelope;
use crate::executor::MessageExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Drives one accepted connection until it closes or a frame error occurs.
pub struct ChannelPipeline {
    executor: MessageExecutor,
    request_timeout: Duration,
    service_timeout: Option<Duration>,
}

impl ChannelPipeline {
    pub fn new(executor: MessageExecutor, request_timeout: Duration, service_timeout: Option<Duration>) -> Self {
        Self {
            executor,
            request_timeout,
            service_timeout,
        }
    }

    /// Runs the read/dispatch/write loop over one connection's halves.
    /// Returns once the peer closes the connection or a framing error
    /// forces it shut; errors are logged, not propagated, since one
    /// connection's failure must not affect others (spec §5).
    pub async fn run<R, W>(&self, mut reader: FrameReader<R>, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        // Responses can complete out of request order (no ordering
        // guarantee, spec §5), so they're funneled through a channel to a
        // single writer task rather than writing directly from whichever
        // executor worker finishes first.
        let (response_tx, response_rx) = mpsc::channel::<Envelope>(64);
        let writer_task = tokio::spawn(write_loop(writer, response_rx));

        loop {
            let envelope = match reader.read_envelope().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "closing connection after frame error");
                    break;
                }
            };

            let request_id = envelope.request_id;
            let message_name = envelope.message_name.clone();
            let ctx = Arc::new(RequestContext::new(envelope, self.request_timeout, self.service_timeout));
            let response_tx = response_tx.clone();

            self.executor.submit(
                ctx,
                Box::new(move |outcome| {
                    let response = outcome_to_envelope(request_id, &message_name, outcome);
                    let _ = response_tx.try_send(response);
                }),
            );
        }

        drop(response_tx);
        let _ = writer_task.await;
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut responses: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = responses.recv().await {
        if let Err(err) = write_envelope(&mut writer, &envelope).await {
            tracing::warn!(error = %err, "failed to write response, closing connection");
            break;
        }
    }
}

fn outcome_to_envelope(request_id: crate::envelope::RequestId, message_name: &str, outcome: Outcome) -> Envelope {
    match outcome {
        Outcome::Response(bytes) => Envelope::ok_response(request_id, message_name, bytes),
        Outcome::Timeout => Envelope::error_response(request_id, message_name, "Timeout: request timed out"),
        Outcome::HandlerError(msg) => Envelope::error_response(request_id, message_name, format!("HandlerError: {msg}")),
        Outcome::Rejected => Envelope::error_response(request_id, message_name, "Rejected: executor saturated"),
        Outcome::NoHandler => Envelope::error_response(request_id, message_name, format!("NoHandler: no handler registered for {message_name:?}")),
    }
}
