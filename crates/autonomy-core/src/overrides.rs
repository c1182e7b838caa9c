use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::store::{repo_key, IssueStore, StoreError};
use crate::task::{FieldValue, TaskField, TaskId};

pub const PINNED_FIELD: &str = "pinned";

#[derive(Debug, Error)]
pub enum OverrideError {
    #[error("Override log IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Override log serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Override log is corrupt: {0}")]
    Corrupt(String),
    #[error("Failed to mirror override for {task_id}: {source}")]
    Mirror {
        task_id: TaskId,
        #[source]
        source: StoreError,
    },
    #[error("Board pin for {task_id} diverged from the override log ({log_error}): {source}")]
    MirrorDiverged {
        task_id: TaskId,
        log_error: String,
        #[source]
        source: StoreError,
    },
}

impl OverrideError {
    /// The board pin no longer matches the override log.
    pub fn is_diverged(&self) -> bool {
        matches!(self, OverrideError::MirrorDiverged { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Override {
    pub task_id: TaskId,
    pub field: String,
    pub value: FieldValue,
    pub set_by: String,
    pub set_at: DateTime<Utc>,
}

impl Override {
    pub fn is_active_pin(&self) -> bool {
        self.field == PINNED_FIELD && self.value == FieldValue::Flag(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OverrideEvent {
    Set {
        event_id: String,
        task_id: TaskId,
        field: String,
        value: FieldValue,
        actor: String,
        timestamp: DateTime<Utc>,
    },
    Cleared {
        event_id: String,
        task_id: TaskId,
        field: String,
        actor: String,
        timestamp: DateTime<Utc>,
    },
}

/// Snapshot of current overrides used by ranking and the doctor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverrideView {
    entries: BTreeMap<(TaskId, String), Override>,
}

impl OverrideView {
    pub fn from_overrides(overrides: impl IntoIterator<Item = Override>) -> Self {
        let entries = overrides
            .into_iter()
            .map(|entry| ((entry.task_id.clone(), entry.field.clone()), entry))
            .collect();
        Self { entries }
    }

    pub fn is_pinned(&self, task_id: &str) -> bool {
        self.entries
            .get(&(task_id.to_string(), PINNED_FIELD.to_string()))
            .map(Override::is_active_pin)
            .unwrap_or(false)
    }

    pub fn get(&self, task_id: &str, field: &str) -> Option<&Override> {
        self.entries.get(&(task_id.to_string(), field.to_string()))
    }

    pub fn pinned_ids(&self) -> BTreeSet<TaskId> {
        self.entries
            .values()
            .filter(|entry| entry.is_active_pin())
            .map(|entry| entry.task_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Durable per-repository override log. The arbiter for pins: ranking
/// consults it before reordering and nothing but an explicit unpin clears a pin.
#[derive(Debug, Clone)]
pub struct OverrideStore {
    dir: PathBuf,
}

pub fn overrides_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("overrides")
}

impl OverrideStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: overrides_dir(state_dir),
        }
    }

    pub fn log_path(&self, repo: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", repo_key(repo)))
    }

    /// Pin or unpin, mirroring the value into the issue tracker's `pinned`
    /// field. Unpinning removes the override; the returned record carries
    /// `false` for the unpin itself.
    pub fn set_pinned(
        &self,
        issues: &dyn IssueStore,
        repo: &str,
        task_id: &str,
        pinned: bool,
        actor: &str,
    ) -> Result<Override, OverrideError> {
        issues
            .update_task_field(task_id, TaskField::Pinned, &FieldValue::Flag(pinned))
            .map_err(|source| OverrideError::Mirror {
                task_id: task_id.to_string(),
                source,
            })?;
        let now = Utc::now();
        let event = if pinned {
            OverrideEvent::Set {
                event_id: Ulid::new().to_string(),
                task_id: task_id.to_string(),
                field: PINNED_FIELD.to_string(),
                value: FieldValue::Flag(true),
                actor: actor.to_string(),
                timestamp: now,
            }
        } else {
            OverrideEvent::Cleared {
                event_id: Ulid::new().to_string(),
                task_id: task_id.to_string(),
                field: PINNED_FIELD.to_string(),
                actor: actor.to_string(),
                timestamp: now,
            }
        };
        if let Err(err) = self.append(repo, &event) {
            // Keep the mirror consistent with the log we failed to write.
            let previous = self
                .get(repo, task_id)
                .ok()
                .flatten()
                .map(|entry| entry.is_active_pin())
                .unwrap_or(false);
            if let Err(source) =
                issues.update_task_field(task_id, TaskField::Pinned, &FieldValue::Flag(previous))
            {
                error!(
                    repo,
                    task_id,
                    error = %source,
                    "board pin left out of step with override log"
                );
                return Err(OverrideError::MirrorDiverged {
                    task_id: task_id.to_string(),
                    log_error: err.to_string(),
                    source,
                });
            }
            return Err(err);
        }
        info!(repo, task_id, pinned, actor, "pin override recorded");
        Ok(Override {
            task_id: task_id.to_string(),
            field: PINNED_FIELD.to_string(),
            value: FieldValue::Flag(pinned),
            set_by: actor.to_string(),
            set_at: now,
        })
    }

    /// Record an override for a field other than `pinned`. Not mirrored.
    pub fn set_field(
        &self,
        repo: &str,
        task_id: &str,
        field: &str,
        value: FieldValue,
        actor: &str,
    ) -> Result<Override, OverrideError> {
        let now = Utc::now();
        let event = OverrideEvent::Set {
            event_id: Ulid::new().to_string(),
            task_id: task_id.to_string(),
            field: field.trim().to_lowercase(),
            value: value.clone(),
            actor: actor.to_string(),
            timestamp: now,
        };
        self.append(repo, &event)?;
        Ok(Override {
            task_id: task_id.to_string(),
            field: field.trim().to_lowercase(),
            value,
            set_by: actor.to_string(),
            set_at: now,
        })
    }

    /// Current pin override for a task.
    pub fn get(&self, repo: &str, task_id: &str) -> Result<Option<Override>, OverrideError> {
        self.get_field(repo, task_id, PINNED_FIELD)
    }

    pub fn get_field(
        &self,
        repo: &str,
        task_id: &str,
        field: &str,
    ) -> Result<Option<Override>, OverrideError> {
        let current = self.replay(repo)?;
        Ok(current
            .get(&(task_id.to_string(), field.to_string()))
            .cloned())
    }

    pub fn list(&self, repo: &str) -> Result<Vec<Override>, OverrideError> {
        Ok(self.replay(repo)?.into_values().collect())
    }

    pub fn view(&self, repo: &str) -> Result<OverrideView, OverrideError> {
        Ok(OverrideView::from_overrides(self.list(repo)?))
    }

    /// Drop every non-pin override of a closed task. Pins are cleared
    /// through the mutation log so the close stays undoable.
    pub fn clear_task(
        &self,
        repo: &str,
        task_id: &str,
        actor: &str,
    ) -> Result<Vec<Override>, OverrideError> {
        let cleared: Vec<Override> = self
            .list(repo)?
            .into_iter()
            .filter(|entry| entry.task_id == task_id && entry.field != PINNED_FIELD)
            .collect();
        for entry in &cleared {
            self.append(
                repo,
                &OverrideEvent::Cleared {
                    event_id: Ulid::new().to_string(),
                    task_id: task_id.to_string(),
                    field: entry.field.clone(),
                    actor: actor.to_string(),
                    timestamp: Utc::now(),
                },
            )?;
        }
        Ok(cleared)
    }

    fn append(&self, repo: &str, event: &OverrideEvent) -> Result<(), OverrideError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.log_path(repo);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.lock_exclusive()?;
        let line = serde_json::to_string(event)?;
        let written = writeln!(file, "{}", line).and_then(|_| file.sync_data());
        file.unlock()?;
        written?;
        Ok(())
    }

    fn replay(&self, repo: &str) -> Result<BTreeMap<(TaskId, String), Override>, OverrideError> {
        let path = self.log_path(repo);
        let mut current = BTreeMap::new();
        if !path.exists() {
            return Ok(current);
        }
        let file = File::open(&path)?;
        file.lock_shared()?;
        let reader = BufReader::new(&file);
        let mut events = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event = serde_json::from_str::<OverrideEvent>(trimmed)
                .map_err(|err| OverrideError::Corrupt(format!("line {}: {}", idx + 1, err)))?;
            events.push(event);
        }
        file.unlock()?;

        for event in events {
            match event {
                OverrideEvent::Set {
                    task_id,
                    field,
                    value,
                    actor,
                    timestamp,
                    ..
                } => {
                    current.insert(
                        (task_id.clone(), field.clone()),
                        Override {
                            task_id,
                            field,
                            value,
                            set_by: actor,
                            set_at: timestamp,
                        },
                    );
                }
                OverrideEvent::Cleared { task_id, field, .. } => {
                    current.remove(&(task_id, field));
                }
            }
        }
        debug!(repo, overrides = current.len(), "override log replayed");
        Ok(current)
    }
}
