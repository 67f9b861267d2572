//! # Exception Log
//!
//! Append-only, bounded, in-memory buffer of exception records. The oldest
//! record is evicted first once the capacity is exceeded. Statistics are
//! derived on demand, and every write is announced to subscribers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::classifier::classify;
use crate::context::{self, Context};
use crate::environment::EnvironmentSnapshot;
use crate::error::Result;
use crate::monitoring;
use crate::sanitization::sanitize_payload;
use crate::settings::LogLevel;
use crate::types::{Exception, ExceptionKind};

/// Default number of records retained
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// A captured exception, immutable once written
#[derive(Debug, Serialize)]
pub struct ExceptionRecord {
    /// Per-log sequence number, increasing with every write
    pub id: u64,
    /// When the record was written
    pub timestamp: DateTime<Utc>,
    /// The captured exception
    pub exception: Exception,
    /// Classification of the exception
    pub kind: ExceptionKind,
    /// Capture site label
    pub context: String,
    /// Sanitized structured context
    pub payload: serde_json::Value,
    /// Environment at capture time, shared with every other record
    #[serde(serialize_with = "serialize_environment")]
    pub environment: Arc<EnvironmentSnapshot>,
}

fn serialize_environment<S: Serializer>(
    environment: &Arc<EnvironmentSnapshot>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    environment.as_ref().serialize(serializer)
}

impl ExceptionRecord {
    /// True when the record reports a failing handler
    pub fn is_handler_failure(&self) -> bool {
        self.context == context::HANDLER_FAILURE
    }
}

/// Configuration for an exception log
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Maximum number of records retained
    pub max_entries: usize,
    /// Verbosity of the log's tracing output
    pub log_level: LogLevel,
    /// Buffered notifications per subscriber before it starts lagging
    pub channel_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            log_level: LogLevel::default(),
            channel_capacity: 64,
        }
    }
}

/// Aggregate view over the retained records
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogStats {
    pub total: usize,
    pub by_kind: BTreeMap<ExceptionKind, usize>,
    pub by_context: BTreeMap<String, usize>,
    pub handler_failures: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// The exception log
#[derive(Debug)]
pub struct ExceptionLog {
    max_entries: usize,
    log_level: RwLock<LogLevel>,
    records: RwLock<VecDeque<Arc<ExceptionRecord>>>,
    next_id: AtomicU64,
    environment: Arc<EnvironmentSnapshot>,
    notifier: broadcast::Sender<Arc<ExceptionRecord>>,
}

impl Default for ExceptionLog {
    fn default() -> Self {
        Self::new(LogConfig::default())
    }
}

impl ExceptionLog {
    /// Creates a log sharing the process-wide environment snapshot
    pub fn new(config: LogConfig) -> Self {
        Self::with_environment(config, EnvironmentSnapshot::current())
    }

    /// Creates a log with an explicit environment snapshot
    pub fn with_environment(config: LogConfig, environment: Arc<EnvironmentSnapshot>) -> Self {
        let (notifier, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            max_entries: config.max_entries,
            log_level: RwLock::new(config.log_level),
            records: RwLock::new(VecDeque::with_capacity(config.max_entries.min(DEFAULT_MAX_ENTRIES))),
            next_id: AtomicU64::new(1),
            environment,
            notifier,
        }
    }

    /// Appends a record for the exception, evicting the oldest records past
    /// capacity
    pub fn write<C: Into<Context>>(&self, exception: Exception, context: C) -> Arc<ExceptionRecord> {
        let context = context.into();
        let record = Arc::new(ExceptionRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            kind: classify(&exception),
            exception,
            context: context.label.clone(),
            payload: sanitize_payload(&context.payload()),
            environment: Arc::clone(&self.environment),
        });

        {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            records.push_back(Arc::clone(&record));
            while records.len() > self.max_entries {
                records.pop_front();
            }
        }

        self.trace(&record);
        monitoring::record_exception(record.kind, &record.context);

        // No subscribers is the common case
        let _ = self.notifier.send(Arc::clone(&record));

        record
    }

    fn trace(&self, record: &ExceptionRecord) {
        let level = self.log_level();
        if level == LogLevel::None {
            return;
        }

        if record.is_handler_failure() && level >= LogLevel::Warn {
            warn!(
                record_id = record.id,
                name = %record.exception.name,
                message = %record.exception.message,
                "Exception handler failed"
            );
        } else {
            error!(
                record_id = record.id,
                kind = %record.kind,
                context = %record.context,
                name = %record.exception.name,
                message = %record.exception.message,
                "Exception captured"
            );
        }

        if level >= LogLevel::Debug {
            debug!(record_id = record.id, payload = %record.payload, "Exception context");
        }
    }

    /// Current tracing verbosity
    pub fn log_level(&self) -> LogLevel {
        *self.log_level.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes the tracing verbosity
    pub fn set_log_level(&self, level: LogLevel) {
        *self.log_level.write().unwrap_or_else(PoisonError::into_inner) = level;
    }

    /// Maximum number of records retained
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// The environment snapshot attached to new records
    pub fn environment(&self) -> &Arc<EnvironmentSnapshot> {
        &self.environment
    }

    /// Subscribes to write notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ExceptionRecord>> {
        self.notifier.subscribe()
    }

    /// All retained records, oldest first
    pub fn records(&self) -> Vec<Arc<ExceptionRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.iter().cloned().collect()
    }

    /// The `n` most recent records, oldest first
    pub fn recent(&self, n: usize) -> Vec<Arc<ExceptionRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let skip = records.len().saturating_sub(n);
        records.iter().skip(skip).cloned().collect()
    }

    /// Records of the given kind
    pub fn by_kind(&self, kind: ExceptionKind) -> Vec<Arc<ExceptionRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.iter().filter(|r| r.kind == kind).cloned().collect()
    }

    /// Records written under the given context label
    pub fn by_context(&self, label: &str) -> Vec<Arc<ExceptionRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.iter().filter(|r| r.context == label).cloned().collect()
    }

    /// Looks up a retained record by id
    pub fn get(&self, id: u64) -> Option<Arc<ExceptionRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.iter().find(|r| r.id == id).cloned()
    }

    /// Number of retained records
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when no records are retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every retained record. Ids keep increasing.
    pub fn clear(&self) {
        self.records.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Derives statistics over the retained records
    pub fn stats(&self) -> LogStats {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = LogStats {
            total: records.len(),
            oldest: records.front().map(|r| r.timestamp),
            newest: records.back().map(|r| r.timestamp),
            ..LogStats::default()
        };

        for record in records.iter() {
            *stats.by_kind.entry(record.kind).or_insert(0) += 1;
            *stats.by_context.entry(record.context.clone()).or_insert(0) += 1;
            if record.is_handler_failure() {
                stats.handler_failures += 1;
            }
        }

        stats
    }

    /// Serializes the retained records as a JSON array
    pub fn export_json(&self) -> Result<String> {
        let records = self.records();
        let view: Vec<&ExceptionRecord> = records.iter().map(|r| r.as_ref()).collect();
        Ok(serde_json::to_string_pretty(&view)?)
    }
}
