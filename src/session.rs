//! Caller-facing ingest session: connect and disconnect, the media send API
//! and the lifetime of every background task.

use crate::abr::{self, BitrateChangeHandler};
use crate::config::{IngestParams, TransportConfig};
use crate::control::{ControlChannel, handshake};
use crate::ingest::{IngestDirectory, select_ingest};
use crate::media::MediaTransport;
use crate::status::StatusQueue;
use ftlcore::abr::BitrateController;
use ftlcore::clock::DtsGenerator;
use ftlcore::handshake::SessionMetadata;
use ftlcore::speed_test::SpeedTestResult;
use ftlcore::stats::VideoStatsSnapshot;
use ftlcore::status::StatusEvent;
use ftlcore::types::{AUDIO_PAYLOAD_TYPE, MediaKind, VIDEO_PAYLOAD_TYPE};
use ftlcore::{FtlError, StatusMessage};
use log::{Level, debug, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const TARGET: &str = "Ingest/Control";
const LEGACY_VIDEO_WIDTH: u32 = 1280;
const LEGACY_VIDEO_HEIGHT: u32 = 720;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Running flag plus wake-up for one background task.
#[derive(Debug)]
pub(crate) struct TaskSwitch {
    running: AtomicBool,
    shutdown: Notify,
}

impl TaskSwitch {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_one();
    }

    /// Sleeps for `duration`. Returns false if the task was stopped meanwhile.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_running(),
            _ = self.shutdown.notified() => false,
        }
    }
}

#[derive(Debug)]
struct Worker {
    switch: Arc<TaskSwitch>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(Arc<TaskSwitch>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let switch = Arc::new(TaskSwitch::new());
        let handle = tokio::spawn(task(switch.clone()));
        Self { switch, handle }
    }

    async fn stop(self, name: &str) {
        self.switch.stop();
        if let Err(e) = self.handle.await {
            warn!(target: TARGET, "{name} task ended abnormally: {e}");
        }
    }

    /// Stops a task from inside itself, where joining would never finish.
    fn release(self) {
        self.switch.stop();
    }
}

#[derive(Debug, Default)]
struct Workers {
    keepalive: Option<Worker>,
    watchdog: Option<Worker>,
    abr: Option<Worker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HandshakeInFlight,
    Connected,
    DisconnectInProgress,
}

/// One established ingest connection.
#[derive(Debug)]
pub(crate) struct Connection {
    pub control: ControlChannel,
    pub media: Arc<MediaTransport>,
    pub channel_id: u32,
    pub media_port: u16,
}

pub(crate) struct SessionInner {
    pub(crate) config: TransportConfig,
    pub(crate) status: Arc<StatusQueue>,
    params: Mutex<IngestParams>,
    directory: Mutex<Option<Arc<dyn IngestDirectory>>>,
    state: Mutex<SessionState>,
    disconnect_lock: tokio::sync::Mutex<()>,
    connection: Mutex<Option<Arc<Connection>>>,
    workers: Mutex<Workers>,
    dts: Mutex<DtsGenerator>,
    destroyed: AtomicBool,
}

impl SessionInner {
    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        lock(&self.connection).clone()
    }

    /// Tears the connection down in order: media, control tasks, bitrate
    /// loop, then the control socket. The watchdog passes `from_watchdog` so
    /// it is not joined by itself.
    pub(crate) async fn internal_disconnect(&self, from_watchdog: bool) {
        self.set_state(SessionState::DisconnectInProgress);

        let connection = lock(&self.connection).take();
        let workers = std::mem::take(&mut *lock(&self.workers));

        if let Some(connection) = &connection {
            connection.media.shutdown().await;
        }

        if let Some(keepalive) = workers.keepalive {
            keepalive.stop("Keepalive").await;
        }
        if let Some(watchdog) = workers.watchdog {
            if from_watchdog {
                watchdog.release();
            } else {
                watchdog.stop("Watchdog").await;
            }
        }
        if let Some(abr) = workers.abr {
            abr.stop("Adaptive bitrate").await;
        }

        if let Some(connection) = connection {
            if let Err(e) = connection.control.send_command("DISCONNECT").await {
                debug!(target: TARGET, "DISCONNECT not delivered: {e}");
            }
            connection.control.shutdown().await;
            info!(target: TARGET, "Disconnected from ingest {}", connection.control.peer_addr());
        }

        self.set_state(SessionState::Idle);
    }

    /// Entry point for the watchdog once the ingest link is dead.
    pub(crate) async fn connection_lost(&self, error: FtlError) {
        self.status.log(TARGET, Level::Error, format!("Ingest connection lost: {error}"));

        // A user disconnect already in progress owns the teardown.
        if let Ok(_guard) = self.disconnect_lock.try_lock() {
            if self.state() == SessionState::Connected {
                self.internal_disconnect(true).await;
            }
        }
        self.status.event(StatusEvent::dropped(error));
    }
}

/// A publishing session towards one FTL ingest.
///
/// Cloning yields another handle to the same session, so one task can park
/// in [`get_status`](Self::get_status) while another sends media.
#[derive(Clone)]
pub struct IngestSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for IngestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestSession")
            .field("state", &self.inner.state())
            .field("params", &*lock(&self.inner.params))
            .finish()
    }
}

impl IngestSession {
    pub fn new(params: IngestParams) -> Result<Self, FtlError> {
        Self::with_config(params, TransportConfig::default())
    }

    pub fn with_config(params: IngestParams, config: TransportConfig) -> Result<Self, FtlError> {
        params.validate()?;
        config.validate()?;

        let inner = SessionInner {
            status: Arc::new(StatusQueue::new(config.status_queue_capacity)),
            dts: Mutex::new(DtsGenerator::new(params.fps_num, params.fps_den)),
            params: Mutex::new(params),
            config,
            directory: Mutex::new(None),
            state: Mutex::new(SessionState::Idle),
            disconnect_lock: tokio::sync::Mutex::new(()),
            connection: Mutex::new(None),
            workers: Mutex::new(Workers::default()),
            destroyed: AtomicBool::new(false),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Supplies the candidates probed when the ingest hostname is `auto`.
    pub fn set_ingest_directory(&self, directory: impl IngestDirectory + 'static) {
        *lock(&self.inner.directory) = Some(Arc::new(directory));
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// UDP port the ingest assigned to this connection.
    pub fn media_port(&self) -> Option<u16> {
        self.inner.connection().map(|c| c.media_port)
    }

    fn ensure_alive(&self) -> Result<(), FtlError> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            Err(FtlError::NotInitialized)
        } else {
            Ok(())
        }
    }

    fn media(&self) -> Result<Arc<MediaTransport>, FtlError> {
        self.inner
            .connection()
            .map(|c| c.media.clone())
            .ok_or(FtlError::NotConnected)
    }

    /// Runs the handshake and starts streaming tasks.
    pub async fn connect(&self) -> Result<(), FtlError> {
        self.ensure_alive()?;
        {
            let mut state = lock(&self.inner.state);
            if *state != SessionState::Idle {
                return Err(FtlError::AlreadyConnected);
            }
            *state = SessionState::HandshakeInFlight;
        }

        // Anything short of success, cancellation included, leaves the session idle.
        let _in_flight = scopeguard::guard(&self.inner, |inner| {
            let mut state = lock(&inner.state);
            if *state == SessionState::HandshakeInFlight {
                *state = SessionState::Idle;
            }
        });

        let connection = Arc::new(self.establish().await?);
        let inner = &self.inner;

        *lock(&inner.connection) = Some(connection.clone());
        {
            let mut workers = lock(&inner.workers);
            workers.keepalive = Some(Worker::spawn(|switch| {
                inner.clone().keepalive_loop(switch, connection.clone())
            }));
            workers.watchdog = Some(Worker::spawn(|switch| {
                inner.clone().watchdog_loop(switch, connection.clone())
            }));
        }
        {
            let params = lock(&inner.params);
            *lock(&inner.dts) = DtsGenerator::new(params.fps_num, params.fps_den);
        }
        inner.set_state(SessionState::Connected);

        inner.status.log(
            TARGET,
            Level::Info,
            format!(
                "Successfully connected to ingest. Media will be sent to {}",
                connection.media.ingest_addr()
            ),
        );
        inner.status.event(StatusEvent::connected());
        Ok(())
    }

    async fn establish(&self) -> Result<Connection, FtlError> {
        let inner = &self.inner;
        let params = lock(&inner.params).clone();
        let key = params.validate()?;

        let host = if params.is_auto_ingest() {
            let directory = lock(&inner.directory).clone().ok_or_else(|| {
                warn!(target: TARGET, "Automatic ingest selection needs an ingest directory");
                FtlError::ConfigError
            })?;
            let best = select_ingest(directory.as_ref(), &inner.config).await?;
            best.probe_host().to_string()
        } else {
            params.ingest_hostname.clone()
        };

        let control =
            ControlChannel::connect(&host, inner.config.control_port, inner.config.recv_timeout())
                .await?;

        let metadata = SessionMetadata {
            vendor_name: params.vendor_name.clone(),
            vendor_version: params.vendor_version.clone(),
            video_codec: params.video_codec,
            video_width: LEGACY_VIDEO_WIDTH,
            video_height: LEGACY_VIDEO_HEIGHT,
            video_payload_type: VIDEO_PAYLOAD_TYPE,
            video_ssrc: key.channel_id.wrapping_add(1),
            audio_codec: params.audio_codec,
            audio_payload_type: AUDIO_PAYLOAD_TYPE,
            audio_ssrc: key.channel_id,
        };

        let media_port =
            match handshake(&control, &key, &metadata, inner.config.legacy_media_port).await {
                Ok(port) => port,
                Err(e) => {
                    warn!(target: TARGET, "Ingest handshake with {host} failed: {e}");
                    control.shutdown().await;
                    return Err(e);
                }
            };

        let media = match MediaTransport::start(
            control.peer_addr().ip(),
            media_port,
            key.channel_id,
            params.peak_kbps,
            inner.config.clone(),
            inner.status.clone(),
        )
        .await
        {
            Ok(media) => media,
            Err(e) => {
                control.shutdown().await;
                return Err(e);
            }
        };

        Ok(Connection {
            control,
            media: Arc::new(media),
            channel_id: key.channel_id,
            media_port,
        })
    }

    /// Ends the stream. Succeeds when already disconnected.
    pub async fn disconnect(&self) -> Result<(), FtlError> {
        self.ensure_alive()?;
        let _guard = self.inner.disconnect_lock.lock().await;

        if self.inner.state() != SessionState::Connected {
            debug!(target: TARGET, "Disconnect requested while {:?}", self.inner.state());
            return Ok(());
        }

        self.inner.internal_disconnect(false).await;
        self.inner.status.event(StatusEvent::user_disconnect());
        Ok(())
    }

    /// Disconnects and shuts the status queue down. A host parked in
    /// [`get_status`](Self::get_status) receives a `Destroyed` event.
    pub async fn destroy(&self) -> Result<(), FtlError> {
        self.disconnect().await?;
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.status.close().await;
        Ok(())
    }

    /// Waits up to `timeout` for the next status message.
    pub async fn get_status(&self, timeout: Duration) -> Result<StatusMessage, FtlError> {
        self.inner.status.dequeue(timeout).await
    }

    /// Applies a new pacing target now and a new ingest hostname on the
    /// next connect.
    pub fn update_params(&self, update: &IngestParams) -> Result<(), FtlError> {
        self.ensure_alive()?;
        {
            let mut params = lock(&self.inner.params);
            params.peak_kbps = update.peak_kbps;
            params.ingest_hostname = update.ingest_hostname.clone();
        }
        if let Ok(media) = self.media() {
            media.set_peak_kbps(update.peak_kbps);
        }
        Ok(())
    }

    /// Sends with an explicit decode timestamp. Returns the bytes queued, 0
    /// when the data was dropped.
    pub fn send_media_dts(&self, kind: MediaKind, dts_usec: i64, data: &[u8], end_of_frame: bool) -> usize {
        let Ok(media) = self.media() else {
            return 0;
        };
        match kind {
            MediaKind::Video => media.send_video(dts_usec, data, end_of_frame),
            MediaKind::Audio => media.send_audio(dts_usec, data),
        }
    }

    /// Sends with a timestamp derived from the configured frame rate.
    pub fn send_media(&self, kind: MediaKind, data: &[u8], end_of_frame: bool) -> usize {
        let dts_usec = {
            let mut dts = lock(&self.inner.dts);
            match kind {
                MediaKind::Video => dts.next_video(end_of_frame),
                MediaKind::Audio => dts.next_audio(),
            }
        };
        self.send_media_dts(kind, dts_usec, data, end_of_frame)
    }

    pub fn send_video(&self, dts_usec: i64, nal: &[u8], end_of_frame: bool) -> usize {
        self.send_media_dts(MediaKind::Video, dts_usec, nal, end_of_frame)
    }

    pub fn send_audio(&self, dts_usec: i64, frame: &[u8]) -> usize {
        self.send_media_dts(MediaKind::Audio, dts_usec, frame, true)
    }

    /// Measures upstream bandwidth over the connected media path.
    pub async fn speed_test(&self, kbps: i64, duration_ms: u64) -> Result<SpeedTestResult, FtlError> {
        self.ensure_alive()?;
        self.media()?.speed_test(kbps, duration_ms).await
    }

    /// Counters the bitrate controller samples. Resets the RTT average.
    pub fn video_stats(&self) -> Result<VideoStatsSnapshot, FtlError> {
        Ok(self.media()?.video_stats())
    }

    /// Starts recommending encoder bitrates between `min_bps` and `max_bps`.
    /// Replaces a running controller.
    pub async fn start_adaptive_bitrate(
        &self,
        handler: impl BitrateChangeHandler + 'static,
        initial_bps: u64,
        min_bps: u64,
        max_bps: u64,
    ) -> Result<(), FtlError> {
        self.ensure_alive()?;
        let media = self.media()?;
        self.stop_adaptive_bitrate().await;

        let controller = BitrateController::new(
            self.inner.config.abr.clone(),
            initial_bps,
            min_bps,
            max_bps,
            media.video_stats(),
            Instant::now(),
        );
        let handler: Arc<dyn BitrateChangeHandler> = Arc::new(handler);
        let status = self.inner.status.clone();
        let worker = Worker::spawn(|switch| abr::run(switch, media, status, controller, handler));

        if let Some(previous) = lock(&self.inner.workers).abr.replace(worker) {
            previous.release();
        }
        Ok(())
    }

    pub async fn stop_adaptive_bitrate(&self) {
        let worker = lock(&self.inner.workers).abr.take();
        if let Some(worker) = worker {
            worker.stop("Adaptive bitrate").await;
        }
    }
}
