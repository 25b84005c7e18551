//! Write-behind application log: a bounded in-memory ring flushed to
//! `app_logs.json` every 42 seconds or once 50 entries have accumulated,
//! whichever comes first. Reads merge the on-disk tail with the buffer.

use super::JsonFile;
use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Hard cap on retained entries, in memory and on disk.
pub const LOG_CAP: usize = 200;
/// Buffer size that forces an early flush.
pub const FLUSH_THRESHOLD: usize = 50;
/// Periodic flush interval.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(42);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

#[derive(Debug)]
pub struct LogBuffer {
    file: JsonFile<Vec<LogEntry>>,
    buffer: Mutex<VecDeque<LogEntry>>,
}

impl LogBuffer {
    pub fn new(file: JsonFile<Vec<LogEntry>>) -> Self {
        Self {
            file,
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends an entry and schedules an early flush once the buffer reaches
    /// the threshold. The periodic task covers the 42-second cadence.
    pub async fn record(self: Arc<Self>, level: impl Into<String>, message: impl Into<String>) {
        if self.push(level, message).await {
            let buffer = self;
            tokio::spawn(async move {
                if let Err(e) = buffer.flush().await {
                    warn!("early app log flush failed: {e}");
                }
            });
        }
    }

    /// Appends an entry; returns true when the buffer hit the flush threshold.
    pub async fn push(&self, level: impl Into<String>, message: impl Into<String>) -> bool {
        let mut buffer = self.buffer.lock().await;
        buffer.push_back(LogEntry {
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
        });
        while buffer.len() > LOG_CAP {
            buffer.pop_front();
        }
        buffer.len() >= FLUSH_THRESHOLD
    }

    /// On-disk tail merged with the in-memory buffer, newest last, capped.
    pub async fn snapshot(&self) -> Result<Vec<LogEntry>, GatewayError> {
        let mut entries = self.file.load().await?;
        {
            let buffer = self.buffer.lock().await;
            entries.extend(buffer.iter().cloned());
        }
        if entries.len() > LOG_CAP {
            entries.drain(..entries.len() - LOG_CAP);
        }
        Ok(entries)
    }

    /// Drains the buffer into the file.
    pub async fn flush(&self) -> Result<(), GatewayError> {
        let drained: Vec<LogEntry> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(());
        }
        let mut entries = self.file.load().await?;
        entries.extend(drained);
        if entries.len() > LOG_CAP {
            entries.drain(..entries.len() - LOG_CAP);
        }
        self.file.store(&entries).await
    }

    /// Periodic flush loop; also drains when `push` reports the threshold.
    pub fn spawn_flush_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let buffer = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = buffer.flush().await {
                    warn!("app log flush failed: {e}");
                }
            }
        })
    }
}
