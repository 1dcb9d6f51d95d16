use crate::session::{Connection, SessionInner, TaskSwitch};
use ftlcore::handshake::{ping_command, read_response_code};
use ftlcore::{FtlError, ResponseCode};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;

impl SessionInner {
    /// Sends `PING <channel>` on the control channel every keepalive
    /// interval. The ingest's `201` answers are consumed by the watchdog.
    pub(crate) async fn keepalive_loop(self: Arc<Self>, switch: Arc<TaskSwitch>, connection: Arc<Connection>) {
        let interval = self.config.keepalive_interval();
        let warn_after = self.config.keepalive_warn_after();
        let command = ping_command(connection.channel_id);
        let mut last_sent = Instant::now();

        debug!(target: "Ingest/Keepalive", "Keepalive started, interval {interval:?}");

        while switch.sleep(interval).await {
            let since_last = last_sent.elapsed();
            if since_last > warn_after {
                warn!(
                    target: "Ingest/Keepalive",
                    "Keepalive ping sent late: {} ms since the previous one",
                    since_last.as_millis()
                );
            }

            if let Err(e) = connection.control.send_command(&command).await {
                warn!(target: "Ingest/Keepalive", "Keepalive ping failed: {e}");
            }
            last_sent = Instant::now();
        }

        debug!(target: "Ingest/Keepalive", "Shutdown signaled, exiting keepalive loop.");
    }

    /// Reads control responses as they arrive and declares the connection
    /// dead on an error code, a closed socket, or prolonged ping silence.
    pub(crate) async fn watchdog_loop(self: Arc<Self>, switch: Arc<TaskSwitch>, connection: Arc<Connection>) {
        let poll = self.config.watchdog_poll();
        let no_ping_timeout = self.config.no_ping_timeout();
        let mut last_ping = Instant::now();

        let error = loop {
            if !switch.sleep(poll).await {
                debug!(target: "Ingest/Keepalive", "Shutdown signaled, exiting watchdog loop.");
                return;
            }

            match connection.control.poll_response().await {
                Ok(Some(line)) => match read_response_code(&line) {
                    ResponseCode::Ping => {
                        last_ping = Instant::now();
                        continue;
                    }
                    code => {
                        if let Some(error) = code.to_error() {
                            warn!(target: "Ingest/Keepalive", "Ingest sent {}: {}", code.code(), code.describe());
                            break error;
                        }
                    }
                },
                Ok(None) => {}
                Err(error) => break error,
            }

            if last_ping.elapsed() >= no_ping_timeout {
                break FtlError::NoPingResponse;
            }
        };

        switch.stop();
        info!(target: "Ingest/Keepalive", "Watchdog detected a dead connection: {error}");
        self.connection_lost(error).await;
    }
}
