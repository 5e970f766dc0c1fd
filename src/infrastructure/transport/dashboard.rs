//! Dashboard connector.
//!
//! Polls the data directory for a `dashboard.port` discovery file; when
//! present, opens a duplex stream to the address inside and mirrors the
//! event bus over newline-delimited JSON frames. Handles `ping → pong`
//! and `request_status → server_status`, and reconnects with exponential
//! backoff. Every failure is logged and swallowed: the core never
//! depends on the dashboard being reachable.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::DashboardConfig;
use crate::services::event_bus::{EventBus, EventKind};

pub struct DashboardConnector {
    bus: Arc<EventBus>,
    config: DashboardConfig,
    discovery_path: PathBuf,
    repository_path: String,
    project_id: Option<Uuid>,
    start_time: DateTime<Utc>,
}

impl DashboardConnector {
    pub fn new(
        bus: Arc<EventBus>,
        config: DashboardConfig,
        discovery_path: PathBuf,
        repository_path: impl Into<String>,
        project_id: Option<Uuid>,
    ) -> Self {
        Self {
            bus,
            config,
            discovery_path,
            repository_path: repository_path.into(),
            project_id,
            start_time: Utc::now(),
        }
    }

    /// The connector loop: discover, connect, mirror, back off, repeat.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.fresh_backoff();
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let Some(address) = self.discover().await else {
                let check =
                    std::time::Duration::from_millis(self.config.connection_check_interval_ms);
                tokio::select! {
                    () = tokio::time::sleep(check) => continue,
                    _ = shutdown.changed() => continue,
                }
            };

            match self.mirror(&address, &mut shutdown).await {
                Ok(()) => {
                    // Clean disconnect; start discovery over with a
                    // fresh backoff.
                    backoff = self.fresh_backoff();
                    attempts = 0;
                }
                Err(e) => {
                    tracing::debug!(error = %e, address, "dashboard connection failed");
                    attempts += 1;
                    if !self.config.auto_reconnect
                        || attempts >= self.config.max_reconnect_attempts
                    {
                        tracing::info!(
                            attempts,
                            "dashboard unreachable, giving up until next discovery"
                        );
                        backoff = self.fresh_backoff();
                        attempts = 0;
                        let check = std::time::Duration::from_millis(
                            self.config.connection_check_interval_ms,
                        );
                        tokio::time::sleep(check).await;
                        continue;
                    }
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| {
                            std::time::Duration::from_millis(self.config.max_reconnect_delay_ms)
                        });
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    fn fresh_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(self.config.reconnect_delay_ms),
            max_interval: std::time::Duration::from_millis(self.config.max_reconnect_delay_ms),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Read the discovery file and normalize its contents to an address.
    async fn discover(&self) -> Option<String> {
        let raw = tokio::fs::read_to_string(&self.discovery_path).await.ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(port) = trimmed.parse::<u16>() {
            return Some(format!("127.0.0.1:{port}"));
        }
        // Accept "host:port" or a ws://-style URL.
        let stripped = trimmed
            .strip_prefix("ws://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        Some(stripped.trim_end_matches('/').to_string())
    }

    /// One connection: register, then forward bus events and answer
    /// control frames until the stream or the bus goes away.
    async fn mirror(
        &self,
        address: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), CoreError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| CoreError::TransportUnavailable(format!("{address}: {e}")))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let register = json!({
            "type": "register",
            "projectId": self.project_id,
            "serverInfo": {
                "repositoryPath": self.repository_path,
                "startTime": self.start_time.to_rfc3339(),
            },
        });
        send_frame(&mut write_half, &register).await?;
        tracing::info!(address, "dashboard connected");

        let (subscription, mut events) = self.bus.subscribe_many(&EventKind::ALL, None)?;
        let result = loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        break Ok(());
                    };
                    let frame = json!({
                        "type": "event",
                        "eventType": event.kind().as_str(),
                        "payload": event,
                    });
                    if let Err(e) = send_frame(&mut write_half, &frame).await {
                        break Err(e);
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(reply) = self.handle_control(&line) {
                                if let Err(e) = send_frame(&mut write_half, &reply).await {
                                    break Err(e);
                                }
                            }
                        }
                        Ok(None) => break Ok(()),
                        Err(e) => {
                            break Err(CoreError::TransportUnavailable(e.to_string()));
                        }
                    }
                }
                _ = shutdown.changed() => {
                    break Ok(());
                }
            }
        };

        self.bus.unsubscribe(subscription);
        result
    }

    fn handle_control(&self, line: &str) -> Option<Value> {
        let message: Value = serde_json::from_str(line).ok()?;
        match message.get("type").and_then(Value::as_str) {
            Some("ping") => Some(json!({ "type": "pong" })),
            Some("request_status") => Some(json!({
                "type": "server_status",
                "payload": {
                    "repositoryPath": self.repository_path,
                    "startTime": self.start_time.to_rfc3339(),
                    "uptimeSeconds": (Utc::now() - self.start_time).num_seconds(),
                    "subscriberCount": self.bus.subscriber_count(),
                },
            })),
            _ => None,
        }
    }
}

async fn send_frame(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    frame: &Value,
) -> Result<(), CoreError> {
    let mut bytes = frame.to_string().into_bytes();
    bytes.push(b'\n');
    write_half
        .write_all(&bytes)
        .await
        .map_err(|e| CoreError::TransportUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::EventPayload;
    use tokio::net::TcpListener;

    async fn write_discovery(dir: &std::path::Path, content: &str) -> PathBuf {
        let path = dir.join("dashboard.port");
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    fn connector(bus: Arc<EventBus>, discovery: PathBuf) -> DashboardConnector {
        DashboardConnector::new(
            bus,
            DashboardConfig {
                connection_check_interval_ms: 20,
                reconnect_delay_ms: 10,
                max_reconnect_delay_ms: 50,
                ..DashboardConfig::default()
            },
            discovery,
            "/r",
            None,
        )
    }

    #[tokio::test]
    async fn test_register_then_event_then_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let discovery = write_discovery(dir.path(), &port.to_string()).await;

        let bus = Arc::new(EventBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connector(Arc::clone(&bus), discovery).run(shutdown_rx));

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // Register frame arrives first
        let register: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(register["type"], "register");
        assert_eq!(register["serverInfo"]["repositoryPath"], "/r");

        // A bus event is mirrored
        bus.emit(EventPayload::SystemWarning {
            error: "w".into(),
            context: "test".into(),
            repository_path: Some("/r".into()),
        });
        let event: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(event["type"], "event");
        assert_eq!(event["eventType"], "system_warning");

        // Ping gets a pong
        write_half.write_all(b"{\"type\":\"ping\"}\n").await.unwrap();
        let pong: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(pong["type"], "pong");

        shutdown_tx.send(true).unwrap();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_missing_discovery_file_keeps_polling() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(
            connector(bus, dir.path().join("dashboard.port")).run(shutdown_rx),
        );

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(!task.is_finished(), "connector keeps waiting for discovery");

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), task).await;
    }
}
