use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use guardsymbi_core::event::EventBus;
use guardsymbi_core::types::{EventKind, RunEvent};

/// JSONL execution logger.
///
/// Subscribes to the EventBus and writes one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crashed run still leaves every earlier transition on disk.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    seq: u64,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run and task events, 2 = + steps and
    /// guards, 3 = + AI assistance.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write in the background until `RunCompleted` or
    /// cancellation.
    ///
    /// Subscribing before the spawn means no event published after this call
    /// is missed.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: broadcast::Receiver<RunEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, dir = %self.log_dir.display(), "Failed to create log directory");
            return;
        }

        let mut writer: Option<(PathBuf, BufWriter<tokio::fs::File>)> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let done = matches!(event.kind, EventKind::RunCompleted { .. });
                            if let Some(entry) = self.event_to_entry(&event) {
                                if writer.is_none() {
                                    writer = self.open(&event).await;
                                }
                                let Some((_, out)) = writer.as_mut() else {
                                    break;
                                };
                                if let Err(e) = write_entry(out, &entry).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                            }
                            if done {
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

        if let Some((path, mut out)) = writer {
            out.flush().await.ok();
            debug!(path = %path.display(), "RunLogger finished");
        }
    }

    async fn open(&self, event: &RunEvent) -> Option<(PathBuf, BufWriter<tokio::fs::File>)> {
        let path = log_path(&self.log_dir, &event.run_id.0);
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => {
                info!(path = %path.display(), "RunLogger started");
                Some((path, BufWriter::new(file)))
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open log file");
                None
            }
        }
    }

    /// Convert an event to a log entry, or `None` when filtered by level.
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        if event_level(&event.kind) > self.level {
            return None;
        }

        let detail = match serde_json::to_value(&event.kind) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("event");
                (!map.is_empty()).then_some(serde_json::Value::Object(map))
            }
            _ => None,
        };

        Some(LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            run_id: event.run_id.0.clone(),
            seq: event.seq,
            event_type: event.kind.name(),
            task: event.task.clone(),
            step: event.step.clone(),
            detail,
        })
    }
}

/// Lowest verbosity level that includes `kind`.
fn event_level(kind: &EventKind) -> u8 {
    match kind {
        EventKind::RunStarted { .. }
        | EventKind::RunCompleted { .. }
        | EventKind::TaskReady
        | EventKind::TaskStarted { .. }
        | EventKind::TaskSucceeded
        | EventKind::TaskFailed { .. }
        | EventKind::TaskAborted { .. } => 1,
        EventKind::StepStarted { .. }
        | EventKind::StepSucceeded { .. }
        | EventKind::StepFaulted { .. }
        | EventKind::RetryScheduled { .. }
        | EventKind::RetriesExhausted { .. }
        | EventKind::GuardPassed
        | EventKind::GuardFailed { .. } => 2,
        EventKind::AiRequested { .. }
        | EventKind::AiResponded { .. }
        | EventKind::AiFailed { .. } => 3,
    }
}

/// Where the log for `run_id` is written.
pub fn log_path(log_dir: &Path, run_id: &str) -> PathBuf {
    log_dir.join(format!("{}.jsonl", run_id))
}

async fn write_entry(out: &mut BufWriter<tokio::fs::File>, entry: &LogEntry) -> std::io::Result<()> {
    let json = serde_json::to_string(entry)?;
    out.write_all(json.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use guardsymbi_core::types::{McpRequestKind, RunId, RunStatus};

    fn event(run_id: &RunId, seq: u64, kind: EventKind) -> RunEvent {
        RunEvent {
            run_id: run_id.clone(),
            seq,
            task: Some("load".into()),
            step: None,
            timestamp: Utc::now(),
            kind,
        }
    }

    #[test]
    fn test_level_filtering() {
        let logger = RunLogger::new(PathBuf::from("unused"), 1);
        let id = RunId::new();
        assert!(logger
            .event_to_entry(&event(&id, 0, EventKind::TaskSucceeded))
            .is_some());
        assert!(logger
            .event_to_entry(&event(&id, 1, EventKind::StepStarted { attempt: 1 }))
            .is_none());

        let verbose = RunLogger::new(PathBuf::from("unused"), 3);
        let entry = verbose
            .event_to_entry(&event(
                &id,
                2,
                EventKind::AiRequested {
                    id: "req-1".into(),
                    kind: McpRequestKind::Fix,
                },
            ))
            .unwrap();
        assert_eq!(entry.event_type, "ai_requested");
        let detail = entry.detail.unwrap();
        assert_eq!(detail["id"], "req-1");
        assert!(detail.get("event").is_none());
    }

    #[tokio::test]
    async fn test_writes_jsonl_until_run_completed() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(64);
        let handle = RunLogger::new(dir.path().to_path_buf(), 2).spawn(&bus, CancellationToken::new());

        let id = RunId::new();
        bus.publish(event(
            &id,
            0,
            EventKind::RunStarted {
                entry: "load".into(),
                tasks: 1,
            },
        ));
        bus.publish(event(&id, 1, EventKind::StepStarted { attempt: 1 }));
        bus.publish(event(
            &id,
            2,
            EventKind::AiRequested {
                id: "req-1".into(),
                kind: McpRequestKind::Fix,
            },
        ));
        bus.publish(event(
            &id,
            3,
            EventKind::RunCompleted {
                status: RunStatus::Succeeded,
            },
        ));
        handle.await.unwrap();

        let content = std::fs::read_to_string(log_path(dir.path(), &id.0)).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event_type"], "run_started");
        assert_eq!(lines[1]["event_type"], "step_started");
        assert_eq!(lines[2]["event_type"], "run_completed");
        assert_eq!(lines[2]["detail"]["status"], "succeeded");
    }
}
