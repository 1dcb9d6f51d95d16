//! Adaptive bitrate loop: samples the video statistics, asks the host to
//! apply each recommendation and retunes the sender's pacing.

use crate::media::MediaTransport;
use crate::session::TaskSwitch;
use crate::status::StatusQueue;
use async_trait::async_trait;
use ftlcore::StatusMessage;
use ftlcore::abr::{BitrateController, Decision};
use log::{debug, info};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;

const TARGET: &str = "Ingest/Abr";

/// Host hook deciding whether the encoder takes a new bitrate.
#[async_trait]
pub trait BitrateChangeHandler: Send + Sync {
    /// Returns `true` once the encoder runs at `bitrate` bits per second.
    async fn on_bitrate_change(&self, bitrate: u64) -> bool;
}

#[async_trait]
impl<F> BitrateChangeHandler for F
where
    F: Fn(u64) -> bool + Send + Sync,
{
    async fn on_bitrate_change(&self, bitrate: u64) -> bool {
        self(bitrate)
    }
}

/// Runs until `switch` is turned off.
pub(crate) async fn run(
    switch: Arc<TaskSwitch>,
    media: Arc<MediaTransport>,
    status: Arc<StatusQueue>,
    mut controller: BitrateController,
    handler: Arc<dyn BitrateChangeHandler>,
) {
    let sample_interval = controller.config().sample_interval();
    let cooldown = controller.config().cooldown();

    info!(target: TARGET, "Adaptive bitrate started at {} bps", controller.current());

    while switch.is_running() {
        if !switch.sleep(sample_interval).await {
            break;
        }

        controller.record(media.video_stats());

        let proposal = match controller.evaluate(Instant::now()) {
            Decision::Hold => continue,
            Decision::Stabilized(change) => {
                info!(target: TARGET, "Bitrate stabilized at {} bps ({:?})", change.current_bitrate, change.reason);
                let _ = status.enqueue(StatusMessage::BitrateChanged(change));
                continue;
            }
            Decision::Propose(proposal) => proposal,
        };

        debug!(
            target: TARGET,
            "Proposing {} bps ({:?}), ratio {:.3}, rtt {:.1} ms, fullness {:.2}",
            proposal.bitrate,
            proposal.reason,
            proposal.metrics.nacks_to_frames_ratio,
            proposal.metrics.avg_rtt,
            proposal.metrics.queue_fullness
        );

        let accepted = handler.on_bitrate_change(proposal.bitrate).await;
        let Some(change) = controller.commit(proposal, accepted, Instant::now()) else {
            debug!(target: TARGET, "Host declined {} bps", proposal.bitrate);
            continue;
        };

        media.set_peak_kbps(controller.peak_kbps());
        info!(
            target: TARGET,
            "Bitrate {:?} from {} to {} bps ({:?})",
            change.kind,
            change.previous_bitrate,
            change.current_bitrate,
            change.reason
        );
        let _ = status.enqueue(StatusMessage::BitrateChanged(change));

        if !switch.sleep(cooldown).await {
            break;
        }
        controller.rebase(media.video_stats());
    }

    info!(target: TARGET, "Adaptive bitrate stopped at {} bps", controller.current());
}
