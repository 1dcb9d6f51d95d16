use super::{MediaComponent, MediaShared, TARGET};
use ftlcore::rtcp::SenderReport;
use log::{debug, trace};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::time::sleep;

/// Sends RTT pings every tick and sender reports once per report interval.
pub(super) async fn run(shared: Arc<MediaShared>) {
    let interval = shared.config.ping_interval();
    let report_interval = shared.config.sender_report_interval();
    let mut last_report = Instant::now();

    debug!(target: TARGET, "Ping task started");

    while shared.ping_running.load(Ordering::Acquire) {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = shared.ping_shutdown.notified() => break,
        }
        if !shared.ping_running.load(Ordering::Acquire) {
            break;
        }

        if !shared.ping_disabled.load(Ordering::Acquire) {
            if let Err(e) = shared.send_ping().await {
                trace!(target: TARGET, "Ping not sent: {e}");
            }
        }

        if shared.sender_reports_disabled.load(Ordering::Acquire)
            || last_report.elapsed() <= report_interval
        {
            continue;
        }
        last_report = Instant::now();

        for component in [&shared.video, &shared.audio] {
            let Some(report) = sender_report(&shared, component) else {
                continue;
            };
            if let Err(e) = shared.send_datagram(&report.encode()).await {
                trace!(target: TARGET, "Sender report for {} not sent: {e}", component.ssrc);
            }
        }
    }

    debug!(target: TARGET, "Ping task stopped");
}

/// Report for a component that has clocked at least one packet.
fn sender_report(shared: &MediaShared, component: &MediaComponent) -> Option<SenderReport> {
    let (rtp_timestamp, media_usec) = {
        let clock = component.clock();
        (clock.timestamp(), clock.elapsed_usec()?)
    };
    let ntp_timestamp = shared.sr_clock().ntp_for(media_usec)?;
    let (packet_count, octet_count) = {
        let stats = component.stats();
        (stats.packets_sent as u32, stats.payload_bytes_sent as u32)
    };

    Some(SenderReport {
        ssrc: component.ssrc,
        ntp_timestamp,
        rtp_timestamp,
        packet_count,
        octet_count,
    })
}
