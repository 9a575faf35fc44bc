//! Per-connection session loop.
//!
//! The reader runs on the connection's task and dispatches inbound events
//! into the router. A separate writer task drains the connection's outbound
//! queue into the transport. Disconnecting detaches the queue, so the writer
//! flushes what is left and closes the socket.

use crate::handlers::{AppState, SessionSlot};
use crate::metrics::{self, ConnectionMetricsGuard};
use parley_core::{OutboundReceiver, RouterError};
use parley_protocol::codec::Encoding;
use parley_protocol::ConnectionId;
use parley_transport::{Connection, FrameSink, FrameStream, Inbound};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Drive one connection until it closes or the server shuts down. The
/// session counts as running until `slot` drops at the end.
pub async fn run<C: Connection>(conn: C, state: Arc<AppState>, slot: SessionSlot) {
    let _slot = slot;
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    let outbound = match state.router.connect(&connection_id) {
        Ok(outbound) => outbound,
        Err(e) => {
            error!(connection = %connection_id, error = %e, "Failed to register connection");
            return;
        }
    };

    debug!(
        connection = %connection_id,
        transport = conn.transport(),
        remote = ?conn.remote_addr(),
        "Connection opened"
    );

    let (sink, mut stream) = conn.split();
    let mut writer = tokio::spawn(write_loop(connection_id.clone(), sink, outbound));
    let mut shutdown = state.shutdown.subscribe();

    let reason = loop {
        tokio::select! {
            _ = shutdown.wait_for(|stopping| *stopping) => break "server shutdown",

            inbound = stream.recv() => match inbound {
                Ok(Some(Inbound::Event(envelope, encoding))) => {
                    let start = Instant::now();
                    metrics::record_inbound(encoding_label(encoding));

                    if let Err(e) = state.router.dispatch(&connection_id, envelope) {
                        metrics::record_error(e.code());
                    }
                    metrics::record_latency(start.elapsed().as_secs_f64());
                }
                Ok(Some(Inbound::Malformed(reason))) => {
                    let err = RouterError::InvalidPayload(reason);
                    state.router.reject(&connection_id, &err, None);
                    metrics::record_error(err.code());
                }
                Ok(None) => break "closed by peer",
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Transport error");
                    metrics::record_error("transport");
                    break "transport error";
                }
            },
        }
    };

    if let Err(e) = state.router.disconnect(&connection_id, reason) {
        warn!(connection = %connection_id, error = %e, "Disconnect failed");
    }
    metrics::record_router_stats(&state.router.stats());

    let grace = state.config.shutdown.grace_period();
    if tokio::time::timeout(grace, &mut writer).await.is_err() {
        warn!(connection = %connection_id, "Writer did not flush within grace period");
        writer.abort();
    }

    debug!(connection = %connection_id, reason = reason, "Connection finished");
}

/// Forward queued events to the transport until the queue is detached.
async fn write_loop<S: FrameSink>(connection_id: ConnectionId, mut sink: S, mut outbound: OutboundReceiver) {
    while let Some(event) = outbound.recv().await {
        match sink.send(&event).await {
            Ok(bytes) => metrics::record_outbound(event.name(), bytes),
            Err(e) => {
                debug!(connection = %connection_id, error = %e, "Send failed, stopping writer");
                break;
            }
        }
    }

    if let Err(e) = sink.close().await {
        trace!(connection = %connection_id, error = %e, "Close failed");
    }
}

fn encoding_label(encoding: Encoding) -> &'static str {
    match encoding {
        Encoding::Json => "json",
        Encoding::MessagePack => "msgpack",
    }
}
