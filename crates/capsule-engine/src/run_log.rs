use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use capsule_core::types::RunEvent;

/// JSONL run logger.
///
/// Consumes `RunEvent`s from the event bus and appends one JSON object per
/// line to `{log_dir}/{graph_id}/{timestamp}.jsonl`. Lines are flushed as
/// they are written, so a crashed process leaves a readable prefix.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    graph_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1 = run start/end, 2 = per step, 3 = per attempt and window changes.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write entries until the run ends or `cancel` fires.
    ///
    /// Takes an already subscribed receiver so no event published after the
    /// caller subscribed is missed while the file is being opened.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<RunEvent>,
        graph_id: String,
        cancel: CancellationToken,
    ) {
        let graph_dir = self.log_dir.join(&graph_id);
        if let Err(e) = tokio::fs::create_dir_all(&graph_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%.3f").to_string();
        let log_path = graph_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&graph_id, &event) else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if event.is_terminal() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Minimum level at which an event is written.
    fn event_level(event: &RunEvent) -> u8 {
        match event {
            RunEvent::RunStarted { .. }
            | RunEvent::RunCompleted { .. }
            | RunEvent::RunFailed { .. } => 1,
            RunEvent::StepStarted { .. }
            | RunEvent::StepCompleted { .. }
            | RunEvent::StepFailed { .. }
            | RunEvent::SlotOverwritten { .. } => 2,
            RunEvent::AttemptStarted { .. }
            | RunEvent::AttemptSucceeded { .. }
            | RunEvent::AttemptFailed { .. }
            | RunEvent::WindowAdjusted { .. } => 3,
        }
    }

    /// Convert an event to a log entry; `None` if filtered by level.
    fn event_to_entry(&self, graph_id: &str, event: &RunEvent) -> Option<LogEntry> {
        if Self::event_level(event) > self.level {
            return None;
        }

        let mut detail = serde_json::to_value(event).ok()?;
        let event_type = detail
            .as_object_mut()
            .and_then(|m| {
                m.remove("step_id");
                m.remove("type")
            })
            .and_then(|t| t.as_str().map(str::to_string))
            .unwrap_or_default();
        let detail = detail
            .as_object()
            .filter(|m| !m.is_empty())
            .map(|_| detail.clone());

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            graph_id: graph_id.to_string(),
            event_type,
            step_id: event.step_id().map(str::to_string),
            detail,
        })
    }
}
