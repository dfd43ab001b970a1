use std::sync::Arc;

use log::debug;

use super::OsegInner;
use crate::server::monitoring::OSEG_METRICS;
use crate::types::{MigrateAck, ServerMessageRouter};

/// Drains the ack outbox, retrying each acknowledgment until the transport
/// accepts it.
///
/// Losing an ack would leave the old owner stuck holding the object's
/// connection forever, so transport pushback only re-arms the attempt. The
/// object leaves the receiving set here, after the dispatch, not when the
/// ack was queued: until the old owner can actually learn about the handoff,
/// this side must keep refusing further migrations of the object.
pub(super) async fn run_dispatcher(
    inner: Arc<OsegInner>,
    outbox: flume::Receiver<MigrateAck>,
    router: Arc<dyn ServerMessageRouter>,
) {
    loop {
        let ack = tokio::select! {
            _ = inner.stopping.cancelled() => break,
            ack = outbox.recv_async() => match ack {
                Ok(ack) => ack,
                Err(_) => break,
            },
        };

        loop {
            if inner.stopping.is_cancelled() {
                return;
            }
            if router.try_route(&ack) {
                break;
            }
            tokio::time::sleep(inner.settings.ack_retry_interval).await;
        }

        debug!(
            "acknowledged migration of {} to server {}",
            ack.object_id, ack.to_server
        );
        if let Some(metrics) = OSEG_METRICS.get() {
            metrics.acks_routed.inc();
        }
        inner.transit.finish_receiving(ack.object_id);
    }
}
