//! Picks the ingest with the lowest round-trip time.

use crate::config::TransportConfig;
use async_trait::async_trait;
use ftlcore::FtlError;
use ftlcore::ingest::{IngestCandidate, UNREACHABLE_RTT, best_candidate, parse_ingest_list};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout};

const PROBE_PAYLOAD: [u8; 4] = [0u8; 4];

/// Source of ingest candidates for automatic selection.
#[async_trait]
pub trait IngestDirectory: Send + Sync {
    async fn candidates(&self) -> Result<Vec<IngestCandidate>, FtlError>;
}

/// A fixed candidate list, typically parsed from a cached directory response.
#[derive(Debug, Clone, Default)]
pub struct StaticIngestDirectory {
    candidates: Vec<IngestCandidate>,
}

impl StaticIngestDirectory {
    pub fn new(candidates: Vec<IngestCandidate>) -> Self {
        Self { candidates }
    }

    pub fn from_json(json: &str) -> Result<Self, FtlError> {
        let candidates = parse_ingest_list(json).map_err(|e| {
            warn!(target: "Ingest/Selector", "Failed to parse ingest list: {e}");
            FtlError::ConfigError
        })?;
        Ok(Self::new(candidates))
    }

    /// Builds candidates from bare host names.
    pub fn from_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let candidates = hosts
            .into_iter()
            .map(|host| {
                let host = host.into();
                IngestCandidate::new(host.clone(), host)
            })
            .collect();
        Self::new(candidates)
    }
}

#[async_trait]
impl IngestDirectory for StaticIngestDirectory {
    async fn candidates(&self) -> Result<Vec<IngestCandidate>, FtlError> {
        Ok(self.candidates.clone())
    }
}

async fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            debug!(target: "Ingest/Selector", "Failed to resolve {host}: {e}");
            None
        }
    }
}

/// Sends one UDP probe and times the first reply. Hosts that cannot be
/// resolved or do not answer within `wait` get [`UNREACHABLE_RTT`].
pub async fn probe_rtt(host: &str, port: u16, wait: Duration) -> Duration {
    let Some(addr) = resolve(host, port).await else {
        return UNREACHABLE_RTT;
    };

    let bind: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };

    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(target: "Ingest/Selector", "Failed to open probe socket: {e}");
            return UNREACHABLE_RTT;
        }
    };
    if socket.connect(addr).await.is_err() {
        return UNREACHABLE_RTT;
    }

    let start = Instant::now();
    if let Err(e) = socket.send(&PROBE_PAYLOAD).await {
        debug!(target: "Ingest/Selector", "Probe send to {addr} failed: {e}");
        return UNREACHABLE_RTT;
    }

    let mut buf = [0u8; 64];
    match timeout(wait, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => start.elapsed(),
        _ => UNREACHABLE_RTT,
    }
}

/// Probes every candidate in parallel and returns the closest one.
pub async fn find_best(
    candidates: Vec<IngestCandidate>,
    config: &TransportConfig,
) -> Result<IngestCandidate, FtlError> {
    if candidates.is_empty() {
        return Err(FtlError::DnsFailure);
    }

    let started = Instant::now();
    let mut join_set = JoinSet::new();
    let total = candidates.len();

    for (index, candidate) in candidates.iter().enumerate() {
        let host = candidate.probe_host().to_string();
        let port = config.probe_port;
        let wait = config.probe_timeout();
        join_set.spawn(async move { (index, probe_rtt(&host, port, wait).await) });

        // Spread the probes so they do not queue behind each other locally.
        if index + 1 < total {
            sleep(config.probe_spacing()).await;
        }
    }

    let mut probed = candidates;
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok((index, rtt)) => {
                debug!(target: "Ingest/Selector", "{} answered in {:?}", probed[index].name, rtt);
                probed[index].rtt = Some(rtt);
            }
            Err(e) => warn!(target: "Ingest/Selector", "Probe task failed: {e}"),
        }
    }

    let best = best_candidate(&probed).cloned().ok_or(FtlError::DnsFailure)?;
    info!(
        target: "Ingest/Selector",
        "It took {} ms to pick {} ({:?}) out of {} ingests",
        started.elapsed().as_millis(),
        best.name,
        best.rtt.unwrap_or(UNREACHABLE_RTT),
        total
    );
    Ok(best)
}

/// Fetches the candidate list from `directory` and probes it.
pub async fn select_ingest(
    directory: &dyn IngestDirectory,
    config: &TransportConfig,
) -> Result<IngestCandidate, FtlError> {
    let candidates = directory.candidates().await?;
    find_best(candidates, config).await
}
