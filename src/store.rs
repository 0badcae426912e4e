//! File Record Store - Lifecycle State Machine
//!
//! Owns every state transition. `transition` is the only mutator of
//! `state`; illegal transitions are loud errors, never silently clamped.
//! The store serializes all writes behind one lock, which is what makes
//! `discover` idempotent under concurrent scans of the same bytes.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::IntakeConfig;
use crate::identity::ContentIdentity;
use crate::record::{detail, FileRecord, FileState, IdentifierMapping, ManualOverride};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown record: {0}")]
    UnknownRecord(String),

    #[error("Illegal transition {from} -> {to} for {content_hash}")]
    IllegalTransition {
        content_hash: String,
        from: FileState,
        to: FileState,
    },

    #[error("State file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State file corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Why intake refused a file. Terminal; never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationFailure {
    TooSmall,
    TooLarge,
    ResolutionTooLow,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValidationFailure::TooSmall => "TooSmall",
            ValidationFailure::TooLarge => "TooLarge",
            ValidationFailure::ResolutionTooLow => "ResolutionTooLow",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    records: Vec<FileRecord>,
    last_saved: DateTime<Utc>,
}

pub struct FileRecordStore {
    records: Mutex<HashMap<String, FileRecord>>,
    intake: IntakeConfig,
    state_file: Option<PathBuf>,
}

impl FileRecordStore {
    pub fn new(intake: IntakeConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            intake,
            state_file: None,
        }
    }

    /// Open a store backed by a JSON state file, creating it on first save.
    /// Records left in `rendering` by a crash are rolled back to their
    /// pre-render state, derived from the history log alone.
    pub fn open(intake: IntakeConfig, state_file: PathBuf) -> Result<Self, StoreError> {
        let mut records = HashMap::new();
        if state_file.exists() {
            let content = fs::read_to_string(&state_file)?;
            let state: StateFile = serde_json::from_str(&content)?;
            for record in state.records {
                records.insert(record.content_hash.clone(), record);
            }
            info!(count = records.len(), "loaded tracked files from state");
        }

        let store = Self {
            records: Mutex::new(records),
            intake,
            state_file: Some(state_file),
        };
        store.recover_interrupted();
        Ok(store)
    }

    /// Register a file by content. Re-dropping identical bytes returns the
    /// existing record unchanged, whatever state it is in. New files are
    /// validated; failures create the record directly in `rejected`.
    pub fn discover(&self, path: &Path, bytes: &[u8]) -> FileRecord {
        let identity = ContentIdentity::compute(path, bytes);
        let mut records = self.records.lock();

        if let Some(existing) = records.get(&identity.content_hash) {
            return existing.clone();
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut record = FileRecord::new(&identity, filename, path.to_path_buf());
        record.append_history(
            "file_discovered",
            detail(&[
                ("path", &path.display().to_string()),
                ("size_bytes", &identity.size_bytes.to_string()),
            ]),
        );

        if let Some(failure) = self.validate(&identity) {
            record.state = FileState::Rejected;
            record.append_history(
                "validation_rejected",
                detail(&[("reason", &failure.to_string())]),
            );
            warn!(hash = %record.content_hash, reason = %failure, "file rejected at intake");
        } else {
            info!(hash = %record.content_hash, file = %record.filename, "discovered new file");
        }

        let snapshot = record.clone();
        records.insert(record.content_hash.clone(), record);
        self.persist(&records);
        snapshot
    }

    fn validate(&self, identity: &ContentIdentity) -> Option<ValidationFailure> {
        if identity.size_bytes < self.intake.min_file_size_bytes {
            return Some(ValidationFailure::TooSmall);
        }
        if identity.size_bytes > self.intake.max_file_size_bytes {
            return Some(ValidationFailure::TooLarge);
        }
        // Dimensions stay unknown for formats the probe cannot decode;
        // the scheduler re-checks those at the first real decode before
        // rendering.
        if let Some(longest) = identity.longest_side() {
            if longest < self.intake.min_resolution {
                return Some(ValidationFailure::ResolutionTooLow);
            }
        }
        None
    }

    /// The sole state mutator. Appends one history entry and swaps the
    /// state atomically under the lock.
    pub fn transition(
        &self,
        content_hash: &str,
        to: FileState,
        reason: &str,
    ) -> Result<FileRecord, StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(content_hash)
            .ok_or_else(|| StoreError::UnknownRecord(content_hash.to_string()))?;

        if !record.state.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                content_hash: content_hash.to_string(),
                from: record.state,
                to,
            });
        }

        let from = record.state;
        record.append_history(
            "state_change",
            detail(&[
                ("from", &from.to_string()),
                ("to", &to.to_string()),
                ("reason", reason),
            ]),
        );
        record.state = to;
        info!(hash = %content_hash, %from, %to, "state transition");

        let snapshot = record.clone();
        self.persist(&records);
        Ok(snapshot)
    }

    /// Attach (or replace) the computed identifier mapping. Mutable until
    /// approval; a manual override still wins over whatever lands here.
    pub fn attach_mapping(
        &self,
        content_hash: &str,
        mapping: IdentifierMapping,
    ) -> Result<FileRecord, StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(content_hash)
            .ok_or_else(|| StoreError::UnknownRecord(content_hash.to_string()))?;

        record.append_history(
            "identifier_mapped",
            detail(&[
                (
                    "identifier",
                    mapping.mapped_identifier.as_deref().unwrap_or("-"),
                ),
                ("confidence", &format!("{:.2}", mapping.confidence_score)),
            ]),
        );
        record.identifier_mapping = Some(mapping);

        let snapshot = record.clone();
        self.persist(&records);
        Ok(snapshot)
    }

    /// Record a human edit of a system-derived field. Appended to history,
    /// never discarded, and permanently preferred over recomputed values.
    /// Does not trigger re-rendering by itself.
    pub fn apply_override(
        &self,
        content_hash: &str,
        field: &str,
        value: &str,
        reason: &str,
    ) -> Result<FileRecord, StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(content_hash)
            .ok_or_else(|| StoreError::UnknownRecord(content_hash.to_string()))?;

        record.manual_overrides.insert(
            field.to_string(),
            ManualOverride {
                value: value.to_string(),
                reason: reason.to_string(),
                applied_at: Utc::now(),
            },
        );
        record.append_history(
            "manual_override",
            detail(&[("field", field), ("value", value), ("reason", reason)]),
        );

        let snapshot = record.clone();
        self.persist(&records);
        Ok(snapshot)
    }

    /// Reject a file. Mid-render rejections are deferred: there is no
    /// in-flight cancellation, so the attempt is logged as a no-op history
    /// entry and the batch runs to completion.
    pub fn reject(&self, content_hash: &str, reason: &str) -> Result<FileRecord, StoreError> {
        {
            let mut records = self.records.lock();
            let record = records
                .get_mut(content_hash)
                .ok_or_else(|| StoreError::UnknownRecord(content_hash.to_string()))?;

            if record.state == FileState::Rendering {
                warn!(hash = %content_hash, "rejection received mid-render, deferred");
                record.append_history(
                    "rejection_deferred",
                    detail(&[("reason", reason), ("state", "rendering")]),
                );
                let snapshot = record.clone();
                self.persist(&records);
                return Ok(snapshot);
            }
        }
        self.transition(content_hash, FileState::Rejected, reason)
    }

    /// Record a transient collaborator failure: state is kept, the retry
    /// counter advances and the next attempt backs off exponentially.
    pub fn mark_transient_failure(
        &self,
        content_hash: &str,
        reason: &str,
        backoff_base_seconds: u64,
        backoff_cap_seconds: u64,
    ) -> Result<FileRecord, StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(content_hash)
            .ok_or_else(|| StoreError::UnknownRecord(content_hash.to_string()))?;

        record.retry_count += 1;
        let exp = record.retry_count.saturating_sub(1).min(16);
        let delay = backoff_base_seconds
            .saturating_mul(1u64 << exp)
            .min(backoff_cap_seconds);
        record.next_retry_at = Some(Utc::now() + Duration::seconds(delay as i64));
        record.append_history(
            "transient_failure",
            detail(&[
                ("reason", reason),
                ("retry_count", &record.retry_count.to_string()),
                ("backoff_seconds", &delay.to_string()),
            ]),
        );
        warn!(hash = %content_hash, reason, retry = record.retry_count, "transient failure, backing off");

        let snapshot = record.clone();
        self.persist(&records);
        Ok(snapshot)
    }

    pub fn clear_backoff(&self, content_hash: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(content_hash)
            .ok_or_else(|| StoreError::UnknownRecord(content_hash.to_string()))?;
        record.retry_count = 0;
        record.next_retry_at = None;
        self.persist(&records);
        Ok(())
    }

    /// Roll interrupted renders back so a later approval or scheduler tick
    /// re-attempts the batch. Returns the affected hashes.
    pub fn recover_interrupted(&self) -> Vec<String> {
        let mut recovered = Vec::new();
        let mut records = self.records.lock();
        for record in records.values_mut() {
            if record.state == FileState::Rendering {
                let back_to = record.pre_render_state();
                record.append_history(
                    "state_change",
                    detail(&[
                        ("from", &FileState::Rendering.to_string()),
                        ("to", &back_to.to_string()),
                        ("reason", "interrupted render recovered at startup"),
                    ]),
                );
                record.state = back_to;
                warn!(hash = %record.content_hash, %back_to, "recovered interrupted render");
                recovered.push(record.content_hash.clone());
            }
        }
        if !recovered.is_empty() {
            self.persist(&records);
        }
        recovered
    }

    pub fn get(&self, content_hash: &str) -> Option<FileRecord> {
        self.records.lock().get(content_hash).cloned()
    }

    pub fn by_state(&self, state: FileState) -> Vec<FileRecord> {
        self.records
            .lock()
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect()
    }

    /// Records whose backoff window has elapsed (or was never set).
    pub fn retry_due(&self, state: FileState, now: DateTime<Utc>) -> Vec<FileRecord> {
        self.records
            .lock()
            .values()
            .filter(|r| r.state == state)
            .filter(|r| r.next_retry_at.map_or(true, |t| t <= now))
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> BTreeMap<String, usize> {
        let records = self.records.lock();
        let mut stats = BTreeMap::new();
        for state in [
            FileState::Discovered,
            FileState::Identified,
            FileState::AwaitingReview,
            FileState::Approved,
            FileState::Rendering,
            FileState::Completed,
            FileState::Rejected,
            FileState::Failed,
        ] {
            stats.insert(
                state.to_string(),
                records.values().filter(|r| r.state == state).count(),
            );
        }
        stats.insert("total".to_string(), records.len());
        stats
    }

    fn persist(&self, records: &HashMap<String, FileRecord>) {
        let Some(path) = &self.state_file else {
            return;
        };
        let state = StateFile {
            records: records.values().cloned().collect(),
            last_saved: Utc::now(),
        };
        let result = serde_json::to_string_pretty(&state)
            .map_err(std::io::Error::other)
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                // Write-then-rename keeps the state file whole under crashes.
                let tmp = path.with_extension("json.tmp");
                fs::write(&tmp, json)?;
                fs::rename(&tmp, path)
            });
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to persist state file");
        }
    }
}
