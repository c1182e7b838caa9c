//! Diff-hashed, reversible batch edits.
//!
//! A [`MutationRecord`] is proposed in memory, committed through the
//! [`IssueStore`] and only then appended to the per-repository log. Undo
//! replays the inverse of every change in reverse order. Both directions run
//! a compensating rollback when a write fails midway.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::engine::Severity;
use crate::overrides::{OverrideError, OverrideStore};
use crate::retry::{Deadline, RetryPolicy};
use crate::store::{repo_key, IssueStore, StoreError};
use crate::task::{FieldValue, TaskField, TaskId};

pub const MIN_HASH_PREFIX: usize = 7;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldChange {
    pub task_id: TaskId,
    pub field: TaskField,
    pub old_value: FieldValue,
    pub new_value: FieldValue,
}

impl FieldChange {
    pub fn new(
        task_id: impl Into<TaskId>,
        field: TaskField,
        old_value: FieldValue,
        new_value: FieldValue,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            field,
            old_value,
            new_value,
        }
    }

    pub fn inverse(&self) -> Self {
        Self {
            task_id: self.task_id.clone(),
            field: self.field,
            old_value: self.new_value.clone(),
            new_value: self.old_value.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Proposed,
    Applied,
    Undone,
}

impl MutationState {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationState::Proposed => "proposed",
            MutationState::Applied => "applied",
            MutationState::Undone => "undone",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSeverity {
    Low,
    Medium,
    High,
}

impl FeedbackSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackSeverity::Low => "low",
            FeedbackSeverity::Medium => "medium",
            FeedbackSeverity::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Why a human reverted a mutation. Stored next to the record, never in it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReversalFeedback {
    pub hash: String,
    pub reason: String,
    pub severity: FeedbackSeverity,
    #[serde(default)]
    pub flow_area: Option<String>,
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutationRecord {
    pub hash: String,
    /// Commit sequence within the repository; 0 while proposed.
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    #[serde(default)]
    pub summary: String,
    pub diff: Vec<FieldChange>,
    pub state: MutationState,
    #[serde(default)]
    pub undone_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub undone_by: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<ReversalFeedback>,
    #[serde(default)]
    pub shadow: Option<String>,
}

impl MutationRecord {
    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }

    pub fn task_ids(&self) -> BTreeSet<&str> {
        self.diff.iter().map(|change| change.task_id.as_str()).collect()
    }
}

pub fn diff_hash(diff: &[FieldChange]) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_vec(diff)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Failure of a single field write.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Override(#[from] OverrideError),
    #[error("{task_id}.{field} changed concurrently: expected {expected}, found {actual}")]
    Drifted {
        task_id: TaskId,
        field: TaskField,
        expected: String,
        actual: String,
    },
    #[error("writes applied but the mutation log could not record them: {0}")]
    Unrecorded(String),
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("Mutation log IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Mutation log serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Mutation log is corrupt: {0}")]
    Corrupt(String),
    #[error("Invalid mutation: {0}")]
    Validation(String),
    #[error("Conflict on {task_id}.{field}: expected {expected}, found {actual}; re-propose and retry")]
    Conflict {
        task_id: TaskId,
        field: TaskField,
        expected: String,
        actual: String,
    },
    #[error("Mutation {hash} cannot be {action}: {reason}")]
    InvalidState {
        hash: String,
        action: &'static str,
        reason: String,
    },
    #[error("No mutation matches hash {0}")]
    NotFound(String),
    #[error("Hash prefix {prefix} is ambiguous ({matches} mutations match)")]
    Ambiguous { prefix: String, matches: usize },
    #[error("{stage} of {hash} failed at {task_id}.{field} after {applied} write(s); rolled back: {source}")]
    PartialApply {
        hash: String,
        stage: &'static str,
        task_id: TaskId,
        field: TaskField,
        applied: usize,
        #[source]
        source: WriteError,
    },
    #[error("{stage} of {hash} failed at {task_id} ({source}) and rollback of {rollback_task_id} also failed: {rollback_error}; issue state is no longer described by the mutation log")]
    RollbackFailed {
        hash: String,
        stage: &'static str,
        task_id: TaskId,
        #[source]
        source: WriteError,
        rollback_task_id: TaskId,
        rollback_error: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Override(#[from] OverrideError),
}

impl MutationError {
    pub fn severity(&self) -> Severity {
        match self {
            MutationError::RollbackFailed { .. } => Severity::Critical,
            MutationError::Override(err) if err.is_diverged() => Severity::Critical,
            MutationError::Conflict { .. }
            | MutationError::InvalidState { .. }
            | MutationError::Validation(_)
            | MutationError::NotFound(_)
            | MutationError::Ambiguous { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn hash(&self) -> Option<&str> {
        match self {
            MutationError::InvalidState { hash, .. }
            | MutationError::PartialApply { hash, .. }
            | MutationError::RollbackFailed { hash, .. } => Some(hash),
            MutationError::NotFound(prefix) => Some(prefix),
            _ => None,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            MutationError::Conflict { task_id, .. }
            | MutationError::PartialApply { task_id, .. }
            | MutationError::RollbackFailed { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MutationEvent {
    Applied {
        event_id: String,
        seq: u64,
        hash: String,
        timestamp: DateTime<Utc>,
        actor: String,
        #[serde(default)]
        summary: String,
        diff: Vec<FieldChange>,
    },
    Undone {
        event_id: String,
        seq: u64,
        hash: String,
        timestamp: DateTime<Utc>,
        actor: String,
    },
    Feedback {
        event_id: String,
        seq: u64,
        hash: String,
        timestamp: DateTime<Utc>,
        actor: String,
        reason: String,
        severity: FeedbackSeverity,
        #[serde(default)]
        flow_area: Option<String>,
    },
    Shadow {
        event_id: String,
        seq: u64,
        hash: String,
        timestamp: DateTime<Utc>,
        location: String,
    },
}

/// Reviewable mirror of a multi-task batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowRef {
    pub location: String,
    pub comment: String,
}

pub trait ShadowMirror {
    fn publish(&self, repo: &str, record: &MutationRecord) -> Result<ShadowRef, MutationError>;
}

pub fn shadow_comment(hash: &str) -> String {
    format!("diff-hash: `{}`", hash)
}

#[derive(Debug, Serialize)]
struct ShadowDocument<'a> {
    hash: &'a str,
    repo: &'a str,
    actor: &'a str,
    summary: &'a str,
    comment: String,
    diff: &'a [FieldChange],
}

/// Writes each mirrored batch as a JSON document under `<state>/shadow/`.
#[derive(Debug, Clone)]
pub struct FileShadowMirror {
    dir: PathBuf,
}

impl FileShadowMirror {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("shadow"),
        }
    }
}

impl ShadowMirror for FileShadowMirror {
    fn publish(&self, repo: &str, record: &MutationRecord) -> Result<ShadowRef, MutationError> {
        let dir = self.dir.join(repo_key(repo));
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("shadow-{}.json", record.short_hash()));
        let comment = shadow_comment(&record.hash);
        let document = ShadowDocument {
            hash: &record.hash,
            repo,
            actor: &record.actor,
            summary: &record.summary,
            comment: comment.clone(),
            diff: &record.diff,
        };
        fs::write(&path, serde_json::to_string_pretty(&document)?)?;
        Ok(ShadowRef {
            location: path.to_string_lossy().to_string(),
            comment,
        })
    }
}

pub fn mutations_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("mutations")
}

pub struct MutationLog<'a> {
    repo: String,
    path: PathBuf,
    lock_path: PathBuf,
    issues: &'a dyn IssueStore,
    overrides: &'a OverrideStore,
    retry: RetryPolicy,
    rollback_budget: Duration,
    shadow: Option<Box<dyn ShadowMirror + 'a>>,
}

impl<'a> MutationLog<'a> {
    pub fn new(
        state_dir: &Path,
        repo: &str,
        issues: &'a dyn IssueStore,
        overrides: &'a OverrideStore,
    ) -> Self {
        let dir = mutations_dir(state_dir);
        let key = repo_key(repo);
        Self {
            repo: repo.to_string(),
            path: dir.join(format!("{}.jsonl", key)),
            lock_path: dir.join(format!("{}.lock", key)),
            issues,
            overrides,
            retry: RetryPolicy::default(),
            rollback_budget: Duration::from_secs(30),
            shadow: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rollback_budget(mut self, budget: Duration) -> Self {
        self.rollback_budget = budget;
        self
    }

    pub fn with_shadow(mut self, mirror: impl ShadowMirror + 'a) -> Self {
        self.shadow = Some(Box::new(mirror));
        self
    }

    pub fn log_path(&self) -> &Path {
        &self.path
    }

    /// Stage a batch. Touches nothing but memory.
    pub fn propose(
        &self,
        actor: &str,
        summary: &str,
        changes: Vec<FieldChange>,
    ) -> Result<MutationRecord, MutationError> {
        if changes.is_empty() {
            return Err(MutationError::Validation(
                "a mutation needs at least one field change".to_string(),
            ));
        }
        if let Some(change) = changes.iter().find(|change| change.task_id.trim().is_empty()) {
            return Err(MutationError::Validation(format!(
                "change to {} has an empty task id",
                change.field
            )));
        }
        let hash = diff_hash(&changes)?;
        debug!(hash = %hash, changes = changes.len(), "mutation proposed");
        Ok(MutationRecord {
            hash,
            seq: 0,
            timestamp: Utc::now(),
            actor: actor.to_string(),
            summary: summary.to_string(),
            diff: changes,
            state: MutationState::Proposed,
            undone_at: None,
            undone_by: None,
            feedback: Vec::new(),
            shadow: None,
        })
    }

    pub fn commit(
        &self,
        mut record: MutationRecord,
        deadline: &Deadline,
    ) -> Result<MutationRecord, MutationError> {
        if record.state != MutationState::Proposed {
            return Err(MutationError::InvalidState {
                hash: record.hash,
                action: "committed",
                reason: format!("record is {}", record.state.as_str()),
            });
        }
        if diff_hash(&record.diff)? != record.hash {
            return Err(MutationError::Validation(format!(
                "diff no longer matches hash {}",
                record.hash
            )));
        }
        let _lock = self.lock()?;
        // Read the log before touching the store: an unreadable log must fail
        // the commit while nothing has been written.
        let records = self.load_records()?;
        self.check_preconditions(record.diff.iter(), deadline, |change| {
            (&change.old_value, &change.new_value)
        })?;

        self.apply_all(&record.hash, "commit", &record.diff, &record.actor, deadline)?;

        record.seq = records.iter().map(|r| r.seq).max().unwrap_or(0) + 1;
        record.state = MutationState::Applied;
        record.timestamp = Utc::now();
        let event = MutationEvent::Applied {
            event_id: Ulid::new().to_string(),
            seq: record.seq,
            hash: record.hash.clone(),
            timestamp: record.timestamp,
            actor: record.actor.clone(),
            summary: record.summary.clone(),
            diff: record.diff.clone(),
        };
        if let Err(err) = self.append(&event) {
            // Unrecorded writes could never be undone; take them back.
            return Err(self.compensate(
                &record.hash,
                "commit",
                &record.diff,
                record.diff.len(),
                WriteError::Unrecorded(err.to_string()),
                &record.actor,
            ));
        }
        info!(
            hash = %record.hash,
            seq = record.seq,
            actor = %record.actor,
            changes = record.diff.len(),
            "mutation applied"
        );

        if record.task_ids().len() > 1 {
            if let Some(mirror) = self.shadow.as_ref() {
                match mirror.publish(&self.repo, &record) {
                    Ok(shadow) => {
                        let event = MutationEvent::Shadow {
                            event_id: Ulid::new().to_string(),
                            seq: record.seq,
                            hash: record.hash.clone(),
                            timestamp: Utc::now(),
                            location: shadow.location.clone(),
                        };
                        match self.append(&event) {
                            Ok(()) => record.shadow = Some(shadow.location),
                            Err(err) => {
                                warn!(
                                    hash = %record.hash,
                                    location = %shadow.location,
                                    error = %err,
                                    "batch mirrored but its location was not logged"
                                );
                            }
                        }
                    }
                    Err(err) => {
                        warn!(
                            hash = %record.hash,
                            error = %err,
                            "failed to mirror batch for review"
                        );
                    }
                }
            }
        }
        Ok(record)
    }

    /// Revert a committed record. Only the `window` most recent commits of
    /// this repository are eligible.
    pub fn undo(
        &self,
        hash_prefix: &str,
        window: usize,
        actor: &str,
        deadline: &Deadline,
    ) -> Result<MutationRecord, MutationError> {
        let _lock = self.lock()?;
        let records = self.load_records()?;
        let mut record = resolve(&records, hash_prefix)?.clone();

        if record.state == MutationState::Undone {
            return Err(MutationError::InvalidState {
                hash: record.hash,
                action: "undone",
                reason: "already undone".to_string(),
            });
        }
        let newer = records.iter().filter(|other| other.seq > record.seq).count();
        if newer >= window {
            return Err(MutationError::InvalidState {
                hash: record.hash,
                action: "undone",
                reason: format!(
                    "{} newer mutation(s) committed; commit window is {}",
                    newer, window
                ),
            });
        }

        self.check_preconditions(record.diff.iter().rev(), deadline, |change| {
            (&change.new_value, &change.old_value)
        })?;

        let inverse = inverse_plan(&record.diff);
        self.apply_all(&record.hash, "undo", &inverse, actor, deadline)?;

        let now = Utc::now();
        let event = MutationEvent::Undone {
            event_id: Ulid::new().to_string(),
            seq: record.seq,
            hash: record.hash.clone(),
            timestamp: now,
            actor: actor.to_string(),
        };
        if let Err(err) = self.append(&event) {
            // Re-apply the original diff so the record stays Applied and true.
            return Err(self.compensate(
                &record.hash,
                "undo",
                &inverse,
                inverse.len(),
                WriteError::Unrecorded(err.to_string()),
                actor,
            ));
        }
        record.state = MutationState::Undone;
        record.undone_at = Some(now);
        record.undone_by = Some(actor.to_string());
        info!(hash = %record.hash, seq = record.seq, actor, "mutation undone");
        Ok(record)
    }

    pub fn feedback(
        &self,
        hash_prefix: &str,
        reason: &str,
        severity: FeedbackSeverity,
        flow_area: Option<&str>,
        actor: &str,
    ) -> Result<ReversalFeedback, MutationError> {
        if reason.trim().is_empty() {
            return Err(MutationError::Validation("feedback reason is required".to_string()));
        }
        let _lock = self.lock()?;
        let records = self.load_records()?;
        let record = resolve(&records, hash_prefix)?;
        let feedback = ReversalFeedback {
            hash: record.hash.clone(),
            reason: reason.trim().to_string(),
            severity,
            flow_area: flow_area
                .map(|area| area.trim().to_string())
                .filter(|area| !area.is_empty()),
            actor: actor.to_string(),
            recorded_at: Utc::now(),
        };
        self.append(&MutationEvent::Feedback {
            event_id: Ulid::new().to_string(),
            seq: record.seq,
            hash: feedback.hash.clone(),
            timestamp: feedback.recorded_at,
            actor: feedback.actor.clone(),
            reason: feedback.reason.clone(),
            severity,
            flow_area: feedback.flow_area.clone(),
        })?;
        Ok(feedback)
    }

    pub fn get(&self, hash_prefix: &str) -> Result<MutationRecord, MutationError> {
        let records = self.load_records()?;
        resolve(&records, hash_prefix).cloned()
    }

    /// Most recent records first.
    pub fn history(&self, limit: usize) -> Result<Vec<MutationRecord>, MutationError> {
        let mut records = self.load_records()?;
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    /// Records in commit order, rebuilt from the log.
    pub fn load_records(&self) -> Result<Vec<MutationRecord>, MutationError> {
        let events = self.read_events()?;
        let mut records: BTreeMap<u64, MutationRecord> = BTreeMap::new();
        for event in events {
            match event {
                MutationEvent::Applied {
                    seq,
                    hash,
                    timestamp,
                    actor,
                    summary,
                    diff,
                    ..
                } => {
                    records.insert(
                        seq,
                        MutationRecord {
                            hash,
                            seq,
                            timestamp,
                            actor,
                            summary,
                            diff,
                            state: MutationState::Applied,
                            undone_at: None,
                            undone_by: None,
                            feedback: Vec::new(),
                            shadow: None,
                        },
                    );
                }
                MutationEvent::Undone {
                    seq,
                    timestamp,
                    actor,
                    ..
                } => {
                    if let Some(record) = records.get_mut(&seq) {
                        record.state = MutationState::Undone;
                        record.undone_at = Some(timestamp);
                        record.undone_by = Some(actor);
                    }
                }
                MutationEvent::Feedback {
                    seq,
                    hash,
                    timestamp,
                    actor,
                    reason,
                    severity,
                    flow_area,
                    ..
                } => {
                    if let Some(record) = records.get_mut(&seq) {
                        record.feedback.push(ReversalFeedback {
                            hash,
                            reason,
                            severity,
                            flow_area,
                            actor,
                            recorded_at: timestamp,
                        });
                    }
                }
                MutationEvent::Shadow { seq, location, .. } => {
                    if let Some(record) = records.get_mut(&seq) {
                        record.shadow = Some(location);
                    }
                }
            }
        }
        Ok(records.into_values().collect())
    }

    fn read_events(&self) -> Result<Vec<MutationEvent>, MutationError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event = serde_json::from_str::<MutationEvent>(trimmed)
                .map_err(|err| MutationError::Corrupt(format!("line {}: {}", idx + 1, err)))?;
            events.push(event);
        }
        Ok(events)
    }

    fn append(&self, event: &MutationEvent) -> Result<(), MutationError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{}", line)?;
        file.sync_data()?;
        Ok(())
    }

    /// Single writer per repository across processes.
    fn lock(&self) -> Result<LogLock, MutationError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(LogLock { file })
    }

    /// Walk `changes` in application order and verify every field holds the
    /// value the plan expects. Repeated fields are checked against the value
    /// an earlier change in the same plan leaves behind.
    fn check_preconditions<'c, I, F>(
        &self,
        changes: I,
        deadline: &Deadline,
        expect: F,
    ) -> Result<(), MutationError>
    where
        I: Iterator<Item = &'c FieldChange>,
        F: Fn(&'c FieldChange) -> (&'c FieldValue, &'c FieldValue),
    {
        let mut pending: BTreeMap<(&str, TaskField), FieldValue> = BTreeMap::new();
        for change in changes {
            let (before, after) = expect(change);
            let key = (change.task_id.as_str(), change.field);
            let current = match pending.get(&key) {
                Some(value) => value.clone(),
                None => self.read_with_retry(&change.task_id, change.field, deadline)?,
            };
            if !same_value(change.field, &current, before) {
                return Err(MutationError::Conflict {
                    task_id: change.task_id.clone(),
                    field: change.field,
                    expected: before.as_formatted(),
                    actual: current.as_formatted(),
                });
            }
            pending.insert(key, after.clone());
        }
        Ok(())
    }

    fn read_with_retry(
        &self,
        task_id: &str,
        field: TaskField,
        deadline: &Deadline,
    ) -> Result<FieldValue, MutationError> {
        let attempt = self.retry.run(deadline, "read_field", || {
            match self.current_value(task_id, field) {
                Ok(value) => Ok(Ok(value)),
                Err(WriteError::Store(err)) if err.is_transient() => Err(err),
                Err(other) => Ok(Err(other)),
            }
        })?;
        attempt.map_err(|err| match err {
            WriteError::Store(err) => MutationError::Store(err),
            WriteError::Override(err) => MutationError::Override(err),
            WriteError::Drifted { .. } | WriteError::Unrecorded(_) => {
                MutationError::Corrupt(err.to_string())
            }
        })
    }

    fn current_value(&self, task_id: &str, field: TaskField) -> Result<FieldValue, WriteError> {
        if field == TaskField::Pinned {
            // The override store is the arbiter for pins; the board field mirrors it.
            let pinned = self
                .overrides
                .get(&self.repo, task_id)?
                .map(|entry| entry.is_active_pin())
                .unwrap_or(false);
            return Ok(if pinned {
                FieldValue::Flag(true)
            } else {
                FieldValue::Absent
            });
        }
        Ok(self.issues.get_task(&self.repo, task_id)?.get_field(field))
    }

    fn write_value(&self, change: &FieldChange, actor: &str) -> Result<(), WriteError> {
        if change.field == TaskField::Pinned {
            let pinned = change.new_value == FieldValue::Flag(true);
            self.overrides
                .set_pinned(self.issues, &self.repo, &change.task_id, pinned, actor)?;
            return Ok(());
        }
        self.issues
            .update_task_field(&change.task_id, change.field, &change.new_value)?;
        Ok(())
    }

    /// Re-check the precondition before each attempt so a retried write is
    /// never applied twice.
    fn write_change(
        &self,
        change: &FieldChange,
        actor: &str,
        deadline: &Deadline,
    ) -> Result<(), WriteError> {
        self.retry.run(deadline, "update_task_field", || {
            let current = match self.current_value(&change.task_id, change.field) {
                Ok(value) => value,
                Err(WriteError::Store(err)) if err.is_transient() => return Err(err),
                Err(other) => return Ok(Err(other)),
            };
            if same_value(change.field, &current, &change.new_value) {
                return Ok(Ok(()));
            }
            if !same_value(change.field, &current, &change.old_value) {
                return Ok(Err(WriteError::Drifted {
                    task_id: change.task_id.clone(),
                    field: change.field,
                    expected: change.old_value.as_formatted(),
                    actual: current.as_formatted(),
                }));
            }
            match self.write_value(change, actor) {
                Ok(()) => Ok(Ok(())),
                Err(WriteError::Store(err)) if err.is_transient() => Err(err),
                Err(other) => Ok(Err(other)),
            }
        })?
    }

    fn apply_all(
        &self,
        hash: &str,
        stage: &'static str,
        changes: &[FieldChange],
        actor: &str,
        deadline: &Deadline,
    ) -> Result<(), MutationError> {
        for (idx, change) in changes.iter().enumerate() {
            let Err(source) = self.write_change(change, actor, deadline) else {
                continue;
            };
            warn!(
                hash,
                stage,
                task_id = %change.task_id,
                field = %change.field,
                error = %source,
                "write failed, rolling back applied prefix"
            );
            return Err(self.compensate(hash, stage, changes, idx, source, actor));
        }
        Ok(())
    }

    /// Revert the first `applied` entries of `changes`, newest first, after
    /// `source` stopped the batch. Yields `PartialApply` when every inverse
    /// lands and `RollbackFailed` otherwise.
    fn compensate(
        &self,
        hash: &str,
        stage: &'static str,
        changes: &[FieldChange],
        applied: usize,
        source: WriteError,
        actor: &str,
    ) -> MutationError {
        let failed_at = changes
            .get(applied)
            .or_else(|| changes.last())
            .map(|change| (change.task_id.clone(), change.field))
            .unwrap_or_else(|| (String::new(), TaskField::State));
        let rollback = Deadline::after(self.rollback_budget);
        for done in changes[..applied].iter().rev() {
            let inverse = done.inverse();
            if let Err(rollback_err) = self.write_change(&inverse, actor, &rollback) {
                error!(
                    hash,
                    stage,
                    task_id = %inverse.task_id,
                    error = %rollback_err,
                    "compensating rollback failed"
                );
                return MutationError::RollbackFailed {
                    hash: hash.to_string(),
                    stage,
                    task_id: failed_at.0,
                    source,
                    rollback_task_id: inverse.task_id.clone(),
                    rollback_error: rollback_err.to_string(),
                };
            }
        }
        MutationError::PartialApply {
            hash: hash.to_string(),
            stage,
            task_id: failed_at.0,
            field: failed_at.1,
            applied,
            source,
        }
    }
}

struct LogLock {
    file: File,
}

impl Drop for LogLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn inverse_plan(diff: &[FieldChange]) -> Vec<FieldChange> {
    diff.iter().rev().map(FieldChange::inverse).collect()
}

/// Newest record whose hash starts with `prefix`.
fn resolve<'r>(
    records: &'r [MutationRecord],
    prefix: &str,
) -> Result<&'r MutationRecord, MutationError> {
    let prefix = prefix.trim().to_lowercase();
    if prefix.len() < MIN_HASH_PREFIX {
        return Err(MutationError::Validation(format!(
            "hash prefix must be at least {} characters",
            MIN_HASH_PREFIX
        )));
    }
    let matching: Vec<&MutationRecord> = records
        .iter()
        .filter(|record| record.hash.starts_with(&prefix))
        .collect();
    let distinct: BTreeSet<&str> = matching.iter().map(|record| record.hash.as_str()).collect();
    if distinct.len() > 1 {
        return Err(MutationError::Ambiguous {
            prefix,
            matches: distinct.len(),
        });
    }
    matching
        .into_iter()
        .max_by_key(|record| record.seq)
        .ok_or(MutationError::NotFound(prefix))
}

fn normalize(field: TaskField, value: &FieldValue) -> FieldValue {
    match (field, value) {
        (TaskField::Pinned, FieldValue::Flag(false)) => FieldValue::Absent,
        (TaskField::Labels, FieldValue::List(values)) => {
            let set: BTreeSet<String> = values.iter().cloned().collect();
            FieldValue::List(set.into_iter().collect())
        }
        (_, other) => other.clone(),
    }
}

fn same_value(field: TaskField, left: &FieldValue, right: &FieldValue) -> bool {
    normalize(field, left) == normalize(field, right)
}
