//! UDP media transport: the send API, one paced sender task per stream, the
//! feedback receiver and the ping/sender-report task.

mod component;
mod ping;
mod receiver;
mod sender;

pub(crate) use component::MediaComponent;

use crate::config::TransportConfig;
use crate::status::StatusQueue;
use ftlcore::FtlError;
use ftlcore::clock::{SenderReportClock, unix_now_usec};
use ftlcore::h264::{NalHeader, NalUnitType, fragments};
use ftlcore::nack::PacketMeta;
use ftlcore::rtcp::PingPacket;
use ftlcore::stats::VideoStatsSnapshot;
use ftlcore::types::MediaKind;
use log::{Level, debug, info, warn};
use once_cell::sync::Lazy;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const TARGET: &str = "Ingest/Media";
const SPEED_TEST_POLL: Duration = Duration::from_millis(250);

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Microseconds on the process-wide monotonic clock carried by ping packets.
pub(crate) fn monotonic_usec() -> u64 {
    EPOCH.elapsed().as_micros() as u64
}

/// State shared by the send API and the transport tasks.
#[derive(Debug)]
pub(crate) struct MediaShared {
    pub socket: UdpSocket,
    pub ingest_addr: SocketAddr,
    pub config: TransportConfig,
    pub status: Arc<StatusQueue>,
    pub video: MediaComponent,
    pub audio: MediaComponent,

    pub ready: AtomicBool,
    pub tx_running: AtomicBool,
    pub rx_running: AtomicBool,
    pub ping_running: AtomicBool,
    pub ping_disabled: AtomicBool,
    pub sender_reports_disabled: AtomicBool,
    pub speed_test_active: AtomicBool,
    pub audio_ready: AtomicBool,
    pub first_frame_sent: AtomicBool,

    pub rx_shutdown: Notify,
    pub ping_shutdown: Notify,

    /// Latest ping RTT in milliseconds, -1 while none has been measured.
    pub last_rtt_ms: AtomicI64,
    sr_clock: Mutex<SenderReportClock>,
    stats_reported: Mutex<Instant>,
}

impl MediaShared {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn component_by_ssrc(&self, ssrc: u32) -> Option<&MediaComponent> {
        [&self.audio, &self.video]
            .into_iter()
            .find(|component| component.ssrc == ssrc)
    }

    pub fn sr_clock(&self) -> MutexGuard<'_, SenderReportClock> {
        self.sr_clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Anchors the sender-report wall clock and the component's base DTS on
    /// first use, then converts `dts_usec` to RTP ticks.
    fn update_timestamp(&self, component: &MediaComponent, dts_usec: i64) -> u32 {
        {
            let mut sr_clock = self.sr_clock();
            if !sr_clock.is_anchored() {
                let now = unix_now_usec();
                sr_clock.anchor(|| now);
                info!(target: TARGET, "Sender report base ntp time set to {now} us");
            }
        }

        let mut clock = component.clock();
        if clock.base_dts_usec().is_none() {
            info!(target: TARGET, "Stream ({}) base dts set to {dts_usec}", component.payload_type);
        }
        clock.update(dts_usec)
    }

    pub async fn send_datagram(&self, datagram: &[u8]) -> Result<usize, FtlError> {
        self.socket
            .send_to(datagram, self.ingest_addr)
            .await
            .map_err(|e| {
                debug!(target: TARGET, "Send to {} failed: {e}", self.ingest_addr);
                FtlError::SocketNotConnected
            })
    }

    pub async fn send_ping(&self) -> Result<(), FtlError> {
        let ping = PingPacket {
            sent_at_usec: monotonic_usec(),
        };
        self.send_datagram(&ping.encode()).await.map(|_| ())
    }

    /// Takes the stats timer if `interval` has passed, returning the elapsed
    /// milliseconds.
    pub fn take_stats_interval(&self, interval: Duration) -> Option<i64> {
        let mut last = self
            .stats_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let elapsed = last.elapsed();
        if elapsed <= interval {
            return None;
        }
        *last = Instant::now();
        Some(elapsed.as_millis() as i64)
    }
}

#[derive(Debug, Default)]
struct Tasks {
    senders: Vec<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
    ping: Option<JoinHandle<()>>,
}

/// A running media session towards one ingest.
#[derive(Debug)]
pub struct MediaTransport {
    shared: Arc<MediaShared>,
    tasks: Mutex<Tasks>,
}

impl MediaTransport {
    /// Opens the media socket towards `ingest_ip:port` and starts the
    /// transport tasks. Audio uses `channel_id` as SSRC, video the next value.
    pub async fn start(
        ingest_ip: IpAddr,
        port: u16,
        channel_id: u32,
        peak_kbps: i64,
        config: TransportConfig,
        status: Arc<StatusQueue>,
    ) -> Result<Self, FtlError> {
        let bind: SocketAddr = if ingest_ip.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await.map_err(|e| {
            warn!(target: TARGET, "Failed to open media socket: {e}");
            FtlError::SocketNotConnected
        })?;

        let audio = MediaComponent::new(MediaKind::Audio, channel_id, config.nack_capacity, 0)?;
        let video = MediaComponent::new(
            MediaKind::Video,
            channel_id.wrapping_add(1),
            config.nack_capacity,
            peak_kbps,
        )?;

        let shared = Arc::new(MediaShared {
            socket,
            ingest_addr: SocketAddr::new(ingest_ip, port),
            config,
            status,
            video,
            audio,
            ready: AtomicBool::new(false),
            tx_running: AtomicBool::new(true),
            rx_running: AtomicBool::new(true),
            ping_running: AtomicBool::new(true),
            ping_disabled: AtomicBool::new(false),
            sender_reports_disabled: AtomicBool::new(false),
            speed_test_active: AtomicBool::new(false),
            audio_ready: AtomicBool::new(false),
            first_frame_sent: AtomicBool::new(false),
            rx_shutdown: Notify::new(),
            ping_shutdown: Notify::new(),
            last_rtt_ms: AtomicI64::new(-1),
            sr_clock: Mutex::new(SenderReportClock::default()),
            stats_reported: Mutex::new(Instant::now()),
        });

        let tasks = Tasks {
            senders: vec![
                tokio::spawn(sender::run(shared.clone(), MediaKind::Video)),
                tokio::spawn(sender::run(shared.clone(), MediaKind::Audio)),
            ],
            receiver: Some(tokio::spawn(receiver::run(shared.clone()))),
            ping: Some(tokio::spawn(ping::run(shared.clone()))),
        };

        shared.ready.store(true, Ordering::Release);
        info!(
            target: TARGET,
            "Media transport to {} ready (audio ssrc {}, video ssrc {})",
            shared.ingest_addr,
            shared.audio.ssrc,
            shared.video.ssrc
        );

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<MediaShared> {
        &self.shared
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    pub fn ingest_addr(&self) -> SocketAddr {
        self.shared.ingest_addr
    }

    /// New pacing target for the video sender; applied from the next packet.
    pub fn set_peak_kbps(&self, peak_kbps: i64) {
        self.shared.video.peak_kbps.store(peak_kbps, Ordering::Relaxed);
    }

    pub fn peak_kbps(&self) -> i64 {
        self.shared.video.peak_kbps.load(Ordering::Relaxed)
    }

    /// Counters sampled by the bitrate controller. Resets the RTT average.
    pub fn video_stats(&self) -> VideoStatsSnapshot {
        let video = &self.shared.video;
        let fullness = video.ring.queue_fullness();
        video.stats().take_video_snapshot(fullness)
    }

    /// Queues one audio frame as a single packet. Returns the bytes queued,
    /// 0 when the frame was dropped.
    pub fn send_audio(&self, dts_usec: i64, frame: &[u8]) -> usize {
        let shared = &self.shared;
        let audio = &shared.audio;

        // Video waits for this flag; audio in turn waits for the first keyframe.
        shared.audio_ready.store(true, Ordering::Release);
        if !shared.first_frame_sent.load(Ordering::Acquire) {
            return 0;
        }

        let Some(_producer) = audio.try_produce() else {
            return 0;
        };
        if !shared.is_ready() {
            return 0;
        }

        let timestamp = shared.update_timestamp(audio, dts_usec);
        let meta = PacketMeta {
            keyframe: false,
            end_of_frame: true,
        };
        audio
            .queue_packet(timestamp, false, meta, frame.len(), |buf| {
                buf.extend_from_slice(frame)
            })
            .unwrap_or(0)
    }

    /// Packetizes one H.264 NAL. Returns the bytes queued, which is short of
    /// the whole NAL when the ring filled up.
    pub fn send_video(&self, dts_usec: i64, nal: &[u8], end_of_frame: bool) -> usize {
        let shared = &self.shared;
        let video = &shared.video;

        if !shared.audio_ready.load(Ordering::Acquire) {
            if end_of_frame {
                video.stats().record_dropped_frame();
            }
            return 0;
        }

        let Some(mut producer) = video.try_produce() else {
            return 0;
        };
        if !shared.is_ready() || nal.is_empty() {
            return 0;
        }

        let header = NalHeader(nal[0]);
        if producer.wait_for_idr {
            if header.unit_type() != NalUnitType::Sps {
                if end_of_frame {
                    video.stats().record_dropped_frame();
                }
                return 0;
            }

            producer.wait_for_idr = false;
            let dropped = video.stats().dropped_frames;
            let message = if shared.first_frame_sent.swap(true, Ordering::AcqRel) {
                format!("Got key frame, continuing (dropped {dropped} frames)")
            } else {
                format!("Audio is ready and we have the first iframe, starting stream. (dropped {dropped} frames)")
            };
            shared.status.log(TARGET, Level::Info, message);
        }

        let timestamp = shared.update_timestamp(video, dts_usec);
        let keyframe = header.unit_type() == NalUnitType::Idr;
        let mut queued = 0;

        for fragment in fragments(nal, shared.config.max_mtu) {
            let marker = fragment.last && end_of_frame;
            let meta = PacketMeta {
                keyframe,
                end_of_frame: marker,
            };
            match video.queue_packet(timestamp, marker, meta, fragment.len(), |buf| {
                fragment.write_to(buf)
            }) {
                Some(len) => queued += len,
                None => {
                    if header.nri() != 0 {
                        shared.status.log(
                            TARGET,
                            Level::Info,
                            "Video queue full, dropping packets until next key frame",
                        );
                        producer.wait_for_idr = true;
                    }
                    return queued;
                }
            }
        }

        video.stats().record_nal(nal.len(), end_of_frame);
        queued
    }

    /// Stops every task and releases the socket. Safe to call more than once.
    pub async fn shutdown(&self) {
        let shared = &self.shared;

        // Wait out any send in progress, then close the send API.
        {
            let _audio = shared.audio.lock_producer();
            let _video = shared.video.lock_producer();
            shared.ready.store(false, Ordering::Release);
        }

        while shared.speed_test_active.load(Ordering::Acquire) {
            tokio::time::sleep(SPEED_TEST_POLL).await;
        }

        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );

        shared.ping_running.store(false, Ordering::Release);
        shared.ping_shutdown.notify_one();
        if let Some(ping) = tasks.ping {
            join(ping, "ping").await;
        }

        shared.tx_running.store(false, Ordering::Release);
        shared.video.pkt_ready.close();
        shared.audio.pkt_ready.close();
        for sender in tasks.senders {
            join(sender, "sender").await;
        }

        shared.rx_running.store(false, Ordering::Release);
        shared.rx_shutdown.notify_one();
        if let Some(receiver) = tasks.receiver {
            join(receiver, "receiver").await;
        }

        shared.video.ring.reset();
        shared.audio.ring.reset();
        debug!(target: TARGET, "Media transport to {} stopped", shared.ingest_addr);
    }
}

async fn join(handle: JoinHandle<()>, name: &str) {
    if let Err(e) = handle.await {
        warn!(target: TARGET, "Media {name} task ended abnormally: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftlcore::rtp::RtpHeader;

    async fn transport() -> (MediaTransport, UdpSocket) {
        let _ = env_logger::builder().is_test(true).try_init();
        let ingest = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = ingest.local_addr().unwrap().port();
        let config = TransportConfig {
            nack_capacity: 16,
            ..Default::default()
        };
        let transport = MediaTransport::start(
            "127.0.0.1".parse().unwrap(),
            port,
            1000,
            0,
            config,
            Arc::new(StatusQueue::new(10)),
        )
        .await
        .unwrap();
        (transport, ingest)
    }

    const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1f];
    const IDR: [u8; 4] = [0x65, 0x88, 0x84, 0x00];

    #[tokio::test]
    async fn test_audio_video_gate() {
        let (transport, _ingest) = transport().await;

        // Video before audio is dropped and counted per frame.
        assert_eq!(transport.send_video(0, &SPS, true), 0);
        assert_eq!(transport.shared.video.stats().dropped_frames, 1);

        // Audio before the first keyframe is dropped but opens the gate.
        assert_eq!(transport.send_audio(0, &[1, 2, 3]), 0);

        // A non-SPS NAL still waits for the keyframe.
        assert_eq!(transport.send_video(0, &IDR, true), 0);
        assert_eq!(transport.shared.video.stats().dropped_frames, 2);

        assert_eq!(transport.send_video(0, &SPS, false), 16);
        assert_eq!(transport.send_video(0, &IDR, true), 16);
        assert_eq!(transport.send_audio(0, &[1, 2, 3]), 15);
        assert_eq!(transport.shared.video.stats().frames_received, 1);

        transport.shutdown().await;
        assert_eq!(transport.send_audio(20_000, &[1]), 0);
    }

    #[tokio::test]
    async fn test_video_reaches_ingest() {
        let (transport, ingest) = transport().await;
        transport.send_audio(0, &[0]);
        transport.send_video(0, &SPS, true);

        let mut buf = [0u8; 1500];
        loop {
            let (len, _) = ingest.recv_from(&mut buf).await.unwrap();
            // Skip pings and sender reports.
            if buf[1] & 0x7f == 96 {
                let (header, offset) = RtpHeader::decode(&buf[..len]).unwrap();
                assert_eq!(header.ssrc, 1001);
                assert!(header.marker);
                assert_eq!(&buf[offset..len], &SPS);
                break;
            }
        }

        transport.shutdown().await;
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_large_nal_is_fragmented() {
        let (transport, _ingest) = transport().await;
        transport.send_audio(0, &[0]);
        transport.send_video(0, &SPS, false);

        let mut nal = vec![0x65u8];
        nal.extend(std::iter::repeat_n(0xAB, 3000));
        let queued = transport.send_video(33_000, &nal, true);

        // 3000 body bytes split into 1378-byte fragments.
        assert_eq!(queued, 3 * 14 + 3000);
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_ring_waits_for_keyframe() {
        let (transport, _ingest) = transport().await;
        transport.shutdown().await;

        // With the tasks gone nothing drains the ring.
        transport.shared.ready.store(true, Ordering::Release);
        transport.send_audio(0, &[0]);
        transport.send_video(0, &SPS, false);

        let big = {
            let mut nal = vec![0x65u8];
            nal.extend(std::iter::repeat_n(0u8, 40 * 1400));
            nal
        };
        let queued = transport.send_video(0, &big, true);
        assert_eq!(queued, 15 * 1392);
        assert!(transport.shared.video.try_produce().unwrap().wait_for_idr);
    }
}
