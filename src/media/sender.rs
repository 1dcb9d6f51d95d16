use super::{MediaComponent, MediaShared, TARGET};
use ftlcore::StatusMessage;
use ftlcore::pacing::{Admission, LeakyBucket};
use ftlcore::types::MediaKind;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::time::sleep;

/// Drains one component's ring onto the socket. Video is paced through a
/// leaky bucket that follows the component's `peak_kbps`.
pub(super) async fn run(shared: Arc<MediaShared>, kind: MediaKind) {
    let component = match kind {
        MediaKind::Video => &shared.video,
        MediaKind::Audio => &shared.audio,
    };
    let paced = kind == MediaKind::Video;
    let mut bucket = LeakyBucket::new(
        component.peak_kbps.load(Ordering::Relaxed),
        shared.config.max_mtu,
        Instant::now(),
    );

    debug!(target: TARGET, "{kind:?} sender started");

    loop {
        match component.pkt_ready.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => break,
        }
        if !shared.tx_running.load(Ordering::Acquire) {
            break;
        }

        let Some(outgoing) = component.ring.peek_next(Instant::now()) else {
            continue;
        };

        let paced_since = Instant::now();
        if paced && !wait_for_budget(&shared, component, &mut bucket, outgoing.packet.len()).await {
            break;
        }

        // The slot stays owned by the sender until the packet is about to leave.
        if !component.ring.commit(&outgoing, Instant::now()) {
            debug!(target: TARGET, "{kind:?} packet {} dropped by a ring reset", outgoing.sequence);
            continue;
        }

        if let Err(e) = shared.send_datagram(&outgoing.packet).await {
            warn!(target: TARGET, "{kind:?} packet {} not sent: {e}", outgoing.sequence);
        }

        let delay_ms = (outgoing.queued_for + paced_since.elapsed()).as_millis() as i64;
        component
            .stats()
            .record_sent(outgoing.packet.len(), outgoing.end_of_frame, delay_ms);

        if paced {
            report_stats(&shared);
        }
    }

    debug!(target: TARGET, "{kind:?} sender stopped");
}

/// Blocks until the bucket admits `len` bytes. Returns false if the
/// transport stopped meanwhile.
async fn wait_for_budget(
    shared: &MediaShared,
    component: &MediaComponent,
    bucket: &mut LeakyBucket,
    len: usize,
) -> bool {
    bucket.set_rate(component.peak_kbps.load(Ordering::Relaxed));

    while let Admission::Wait(backoff) = bucket.admit(len, Instant::now()) {
        component.stats().bw_throttling_count += 1;
        sleep(backoff).await;
        if !shared.tx_running.load(Ordering::Acquire) {
            return false;
        }
    }
    true
}

/// Publishes the periodic video statistics once the stats interval passed.
fn report_stats(shared: &MediaShared) {
    let Some(interval_ms) = shared.take_stats_interval(shared.config.stats_interval()) else {
        return;
    };

    let video = &shared.video;
    let period_ms = video.stats_age_ms();
    let fullness = video.ring.queue_fullness();
    let (packets, instant, frames) = {
        let mut stats = video.stats();
        (
            stats.packet_stats(period_ms),
            stats.take_instant_stats(interval_ms),
            stats.take_frame_stats(interval_ms, fullness),
        )
    };

    for message in [
        StatusMessage::VideoPackets(packets),
        StatusMessage::VideoPacketsInstant(instant),
        StatusMessage::Video(frames),
    ] {
        let _ = shared.status.enqueue(message);
    }
}
