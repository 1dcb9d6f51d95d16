use super::{MediaShared, TARGET, monotonic_usec};
use ftlcore::nack::Lookup;
use ftlcore::rtcp::{Feedback, NackFeedback, PingPacket, parse_feedback};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::time::timeout;

const RECV_POLL: Duration = Duration::from_millis(50);
const RECV_BUFFER: usize = 2048;

/// Reads NACKs and ping echoes coming back from the ingest.
pub(super) async fn run(shared: Arc<MediaShared>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    let ingest_ip = shared.ingest_addr.ip();

    debug!(target: TARGET, "Receiver started");

    while shared.rx_running.load(Ordering::Acquire) {
        let received = tokio::select! {
            result = timeout(RECV_POLL, shared.socket.recv_from(&mut buf)) => result,
            _ = shared.rx_shutdown.notified() => break,
        };

        let (len, from) = match received {
            Err(_) => continue,
            Ok(Err(e)) => {
                trace!(target: TARGET, "Media socket read failed: {e}");
                continue;
            }
            Ok(Ok(read)) => read,
        };

        if from.ip() != ingest_ip {
            warn!(target: TARGET, "Dropping packet from unexpected source {from}");
            continue;
        }
        if len < 2 {
            continue;
        }

        match parse_feedback(&buf[..len]) {
            Ok(Feedback::Nack(nack)) => handle_nack(&shared, &nack).await,
            Ok(Feedback::PingEcho(ping)) => handle_ping_echo(&shared, ping),
            Err(e) => trace!(target: TARGET, "Ignoring datagram: {e}"),
        }
    }

    debug!(target: TARGET, "Receiver stopped");
}

async fn handle_nack(shared: &MediaShared, nack: &NackFeedback) {
    let Some(component) = shared.component_by_ssrc(nack.media_ssrc) else {
        warn!(target: TARGET, "NACK for unknown ssrc {}", nack.media_ssrc);
        return;
    };

    for sequence in nack.requested() {
        let resend = match component.ring.lookup(sequence, Instant::now()) {
            Lookup::Found(resend) => resend,
            Lookup::Evicted { cached } => {
                let found = cached.map_or_else(|| "nothing".to_string(), |s| s.to_string());
                warn!(
                    target: TARGET,
                    "[{}] expected sn {sequence} in slot but found {found}...discarding",
                    component.ssrc
                );
                continue;
            }
        };

        if component.is_nack_enabled() {
            if let Err(e) = shared.send_datagram(&resend.packet).await {
                warn!(target: TARGET, "[{}] resend of sn {sequence} failed: {e}", component.ssrc);
            } else {
                let delay = resend.since_xmit.map_or(-1, |d| d.as_millis() as i64);
                info!(
                    target: TARGET,
                    "[{}] resent sn {sequence}, request delay was {delay} ms, was part of iframe? {}",
                    component.ssrc,
                    resend.keyframe
                );
            }
        }

        component.stats().nack_requests += 1;
    }
}

fn handle_ping_echo(shared: &MediaShared, ping: PingPacket) {
    let rtt_ms = monotonic_usec().saturating_sub(ping.sent_at_usec) as i64 / 1000;
    shared.video.stats().rtt.record(rtt_ms);
    shared.last_rtt_ms.store(rtt_ms, Ordering::Release);
    trace!(target: TARGET, "Ping echo, rtt {rtt_ms} ms");
}
