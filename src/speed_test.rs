//! Pre-stream bandwidth probe: floods the audio stream with random payload
//! at a target rate and derives the usable bitrate from loss and RTT drift.

use crate::media::{MediaShared, MediaTransport};
use ftlcore::FtlError;
use ftlcore::pacing::{Admission, LeakyBucket};
use ftlcore::speed_test::{SpeedTestMeasurements, SpeedTestResult};
use log::{Level, info, warn};
use rand::RngCore;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const TARGET: &str = "Ingest/SpeedTest";
const INITIAL_PINGS: usize = 3;
const INITIAL_RTT_RETRIES: u32 = 5;
const FINAL_RTT_WAIT: Duration = Duration::from_millis(2000);

impl MediaTransport {
    /// Measures the usable upstream bandwidth by sending `kbps` of audio
    /// packets for `duration_ms`. The audio stream is rewound afterwards.
    pub async fn speed_test(&self, kbps: i64, duration_ms: u64) -> Result<SpeedTestResult, FtlError> {
        let shared = self.shared();
        shared.speed_test_active.store(true, Ordering::Release);
        let _active = scopeguard::guard(shared, |shared| {
            restore_after_test(shared);
        });

        if !shared.is_ready() {
            return Err(FtlError::SpeedTestAborted);
        }

        shared.audio.set_nack_enabled(false);
        shared.ping_disabled.store(true, Ordering::Release);
        shared.first_frame_sent.store(true, Ordering::Release);

        let tick = shared.config.ping_interval();

        shared.last_rtt_ms.store(-1, Ordering::Release);
        for _ in 0..INITIAL_PINGS {
            let _ = shared.send_ping().await;
        }
        let mut initial_rtt = None;
        for _ in 0..INITIAL_RTT_RETRIES {
            initial_rtt = current_rtt(shared);
            if initial_rtt.is_some() {
                break;
            }
            sleep(tick).await;
        }

        let initial_nacks = shared.audio.stats().nack_requests;
        let flood = flood(self, kbps, Duration::from_millis(duration_ms)).await?;

        shared.last_rtt_ms.store(-1, Ordering::Release);
        let mut final_rtt = None;
        for _ in 0..(FINAL_RTT_WAIT.as_millis() / tick.as_millis().max(1)) {
            final_rtt = current_rtt(shared);
            if final_rtt.is_some() {
                break;
            }
            let _ = shared.send_ping().await;
            sleep(tick).await;
        }

        let measurements = SpeedTestMeasurements {
            pkts_sent: flood.pkts_sent,
            bytes_sent: flood.bytes_sent,
            nack_requests: shared.audio.stats().nack_requests.saturating_sub(initial_nacks),
            elapsed_ms: flood.elapsed.as_millis() as i64,
            initial_rtt,
            final_rtt,
        };
        let result = SpeedTestResult::compute(&measurements);

        shared.status.log(
            TARGET,
            Level::Info,
            format!(
                "Speed test completed: peak kbps {}, initial rtt {:?}, final rtt {:?}, {} lost packets of {} sent in {} ms",
                result.peak_kbps,
                result.starting_rtt,
                result.ending_rtt,
                result.lost_pkts,
                result.pkts_sent,
                result.duration_ms
            ),
        );
        Ok(result)
    }
}

struct Flood {
    pkts_sent: u64,
    bytes_sent: u64,
    elapsed: Duration,
}

async fn flood(media: &MediaTransport, kbps: i64, duration: Duration) -> Result<Flood, FtlError> {
    let mtu = media.shared().config.max_mtu;
    let mut payload = vec![0u8; mtu];
    rand::rng().fill_bytes(&mut payload);

    let started = Instant::now();
    let mut bucket = LeakyBucket::with_level(kbps, mtu, mtu as i64, started);
    let mut pkts_sent = 0u64;
    let mut bytes_sent = 0u64;

    while started.elapsed() < duration {
        if let Admission::Wait(backoff) = bucket.admit(0, Instant::now()) {
            sleep(backoff).await;
            continue;
        }

        pkts_sent += 1;
        let sent = media.send_audio(0, &payload);
        if sent < mtu {
            warn!(target: TARGET, "Audio stream refused packet {pkts_sent}, aborting");
            return Err(FtlError::SpeedTestAborted);
        }
        bytes_sent += sent as u64;
        bucket.consume(sent);

        // Keep the flood cooperative with the sender draining the ring.
        tokio::task::yield_now().await;
    }

    Ok(Flood {
        pkts_sent,
        bytes_sent,
        elapsed: started.elapsed(),
    })
}

fn current_rtt(shared: &MediaShared) -> Option<i64> {
    let rtt = shared.last_rtt_ms.load(Ordering::Acquire);
    (rtt >= 0).then_some(rtt)
}

/// Puts the audio stream back into its just-connected state.
fn restore_after_test(shared: &MediaShared) {
    {
        let _producer = shared.audio.lock_producer();
        shared.audio.reset();
        shared.sr_clock().reset();
    }
    shared.first_frame_sent.store(false, Ordering::Release);
    shared.audio.set_nack_enabled(true);
    shared.ping_disabled.store(false, Ordering::Release);
    shared.speed_test_active.store(false, Ordering::Release);
    info!(target: TARGET, "Audio stream reset after speed test");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::status::StatusQueue;
    use ftlcore::rtcp::PING_PACKET_LEN;
    use std::sync::Arc;
    use tokio::net::UdpSocket;

    async fn start(ingest: &UdpSocket) -> MediaTransport {
        let _ = env_logger::builder().is_test(true).try_init();
        MediaTransport::start(
            "127.0.0.1".parse().unwrap(),
            ingest.local_addr().unwrap().port(),
            3,
            0,
            TransportConfig::default(),
            Arc::new(StatusQueue::new(10)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_speed_test_with_echoing_ingest() {
        let ingest = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let media = start(&ingest).await;

        let echo = {
            let ingest = ingest.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                while let Ok((len, from)) = ingest.recv_from(&mut buf).await {
                    if len == PING_PACKET_LEN && buf[1] == 250 {
                        let _ = ingest.send_to(&buf[..len], from).await;
                    }
                }
            })
        };

        let result = media.speed_test(4_000, 300).await.unwrap();
        assert!(result.pkts_sent > 0);
        assert_eq!(result.bytes_sent, result.pkts_sent * 1404);
        assert!(result.starting_rtt.is_some());
        assert!(result.ending_rtt.is_some());
        assert!(result.peak_kbps > 0);

        let shared = media.shared();
        assert!(!shared.speed_test_active.load(Ordering::Acquire));
        assert!(!shared.first_frame_sent.load(Ordering::Acquire));
        assert!(shared.audio.is_nack_enabled());
        assert!(shared.audio.clock().base_dts_usec().is_none());
        assert_eq!(shared.audio.ring.next_sequence(), 0);
        assert_eq!(shared.audio.ring.pending(), 0);

        // The sender keeps draining the rewound ring.
        shared.first_frame_sent.store(true, Ordering::Release);
        for dts in 0..3 {
            assert!(media.send_audio(dts * 20_000, &[0xfc, 0xff, 0xfe]) > 0);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(shared.audio.ring.next_sequence(), 3);
        assert_eq!(shared.audio.ring.pending(), 0);

        media.shutdown().await;
        echo.abort();
    }

    #[tokio::test]
    async fn test_speed_test_requires_ready_media() {
        let ingest = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let media = start(&ingest).await;
        media.shutdown().await;

        assert_eq!(media.speed_test(1_000, 100).await, Err(FtlError::SpeedTestAborted));
        assert!(!media.shared().speed_test_active.load(Ordering::Acquire));
    }
}
