//! Fire-and-forget execution log.
//!
//! Records go through a bounded queue drained by one background task.
//! Delivery is at-most-once: a full or closed queue drops the record, and
//! sink failures are logged and swallowed. Nothing here can fail a lookup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::StoreError;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionRecord {
    /// One lookup evaluation, successful or not.
    Lookup {
        session_id: String,
        lookup: String,
        matched_rule: Option<i32>,
        used_default: bool,
        /// Action kind that ran (`value`, `formula`, `lookup`, `error`, `legacy`).
        action: Option<String>,
        success: bool,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A freshly computed calculation value.
    Calculation {
        session_id: String,
        name: String,
        value: f64,
        unit: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn record(&self, record: &ExecutionRecord) -> Result<(), StoreError>;
}

/// Sink that keeps everything in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<ExecutionRecord>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().clone()
    }

    /// Make every subsequent write fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionSink for MemorySink {
    async fn record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("log sink rejected write".to_string()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}

pub struct ExecutionLog {
    sender: Mutex<Option<mpsc::Sender<ExecutionRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl ExecutionLog {
    /// Log that discards everything.
    pub fn disabled() -> Self {
        Self {
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            dropped: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the drain task on the current runtime. Outside a runtime the
    /// log comes up disabled.
    pub fn spawn(sink: Arc<dyn ExecutionSink>, capacity: usize) -> Self {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no async runtime; execution log disabled");
            return Self::disabled();
        };

        let (tx, mut rx) = mpsc::channel::<ExecutionRecord>(capacity.max(1));
        let failed = Arc::new(AtomicU64::new(0));
        let failed_in_task = failed.clone();
        let worker = handle.spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = sink.record(&record).await {
                    failed_in_task.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "execution record not persisted");
                }
            }
        });

        Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            dropped: Arc::new(AtomicU64::new(0)),
            failed,
        }
    }

    /// Queue a record without waiting. Returns whether it was accepted.
    pub fn submit(&self, record: ExecutionRecord) -> bool {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return false;
        };
        if tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("execution record dropped (backpressure)");
            return false;
        }
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.lock().is_some()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Stop accepting records and wait for the queue to drain.
    pub async fn close(&self) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "execution log worker ended abnormally");
            }
        }
    }
}
