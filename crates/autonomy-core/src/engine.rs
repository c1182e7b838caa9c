//! Single dispatch point for every engine operation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::audit::{append_audit_event, AuditError, AuditEvent};
use crate::config::{resolve_config, ConfigError, ResolvedConfig};
use crate::doctor::{self, DoctorReport};
use crate::field_cache::FieldCache;
use crate::hierarchy::{self, SyncContext, SyncOptions, SyncReport};
use crate::mutation::{
    FeedbackSeverity, FieldChange, FileShadowMirror, MutationError, MutationLog, MutationRecord,
    ReversalFeedback,
};
use crate::overrides::{Override, OverrideError, OverrideStore, OverrideView, PINNED_FIELD};
use crate::ranking::{self, RankedTask, ReorderStep};
use crate::retry::{Deadline, RetryPolicy};
use crate::store::{IssueStore, LocalIssueStore, StoreError, TaskFilter};
use crate::task::{FieldValue, Task, TaskField, TaskId, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Override(#[from] OverrideError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("Invalid request: {0}")]
    Validation(String),
}

impl EngineError {
    pub fn severity(&self) -> Severity {
        match self {
            EngineError::Mutation(err) => err.severity(),
            EngineError::Override(err) if err.is_diverged() => Severity::Critical,
            EngineError::Store(StoreError::NotFound(_)) | EngineError::Validation(_) => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Mutation(MutationError::Conflict { .. }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Next { me: bool },
    Explain { task_id: TaskId },
    Rerank { dry_run: bool },
    Update { task_id: TaskId, done: bool, notes: Option<String> },
    Pin { task_id: TaskId },
    Unpin { task_id: TaskId },
    Sync(SyncOptions),
    Scan { apply: bool },
    Undo { hash: String, window: Option<usize> },
    Feedback {
        hash: String,
        reason: String,
        severity: FeedbackSeverity,
        flow_area: Option<String>,
    },
    History { limit: usize },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Next { .. } => "next",
            Operation::Explain { .. } => "explain",
            Operation::Rerank { .. } => "rerank",
            Operation::Update { .. } => "update",
            Operation::Pin { .. } => "pin",
            Operation::Unpin { .. } => "unpin",
            Operation::Sync(_) => "hierarchy_sync",
            Operation::Scan { .. } => "doctor",
            Operation::Undo { .. } => "undo",
            Operation::Feedback { .. } => "feedback",
            Operation::History { .. } => "history",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpContext {
    pub actor: String,
    pub deadline: Deadline,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextTask {
    pub task: Task,
    pub score: f64,
    pub pinned: bool,
    pub explain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerankReport {
    pub dry_run: bool,
    pub order: Vec<TaskId>,
    pub pinned: Vec<TaskId>,
    pub moves: Vec<ReorderStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Next {
        task: Option<NextTask>,
        /// Set when a read fell back to partial data.
        notice: Option<String>,
    },
    Explain {
        task: Task,
        text: String,
    },
    Rerank(RerankReport),
    Updated(MutationRecord),
    Pinned {
        task_id: TaskId,
        pinned: bool,
        record: Option<MutationRecord>,
        pin: Option<Override>,
    },
    Synced(SyncReport),
    Scanned {
        report: DoctorReport,
        applied: Option<MutationRecord>,
    },
    Undone(MutationRecord),
    Feedback(ReversalFeedback),
    History {
        records: Vec<MutationRecord>,
    },
}

pub struct Engine {
    repo: String,
    state_dir: PathBuf,
    config: ResolvedConfig,
    store: Box<dyn IssueStore>,
    overrides: OverrideStore,
    retry: RetryPolicy,
}

impl Engine {
    pub fn new(
        repo: &str,
        state_dir: &Path,
        config: ResolvedConfig,
        store: Box<dyn IssueStore>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        Self {
            repo: repo.to_string(),
            state_dir: state_dir.to_path_buf(),
            overrides: OverrideStore::new(state_dir),
            config,
            store,
            retry,
        }
    }

    /// Engine over the file-backed store, with config resolved from `repo_root`.
    pub fn open_local(repo_root: &Path, state_dir: &Path, repo: &str) -> Result<Self, EngineError> {
        let config = resolve_config(repo_root)?;
        let cache = Arc::new(FieldCache::new(config.store.field_cache_ttl()));
        let store = LocalIssueStore::open(state_dir, repo, cache)?;
        Ok(Self::new(repo, state_dir, config, Box::new(store)))
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn IssueStore {
        self.store.as_ref()
    }

    pub fn overrides(&self) -> &OverrideStore {
        &self.overrides
    }

    pub fn context(&self, actor: &str, now: DateTime<Utc>) -> OpContext {
        OpContext {
            actor: actor.to_string(),
            deadline: Deadline::after(self.config.store.deadline()),
            now,
        }
    }

    pub fn mutation_log(&self) -> MutationLog<'_> {
        MutationLog::new(&self.state_dir, &self.repo, self.store.as_ref(), &self.overrides)
            .with_retry(self.retry.clone())
            .with_rollback_budget(self.config.store.deadline())
            .with_shadow(FileShadowMirror::new(&self.state_dir))
    }

    pub fn run(&self, op: Operation, ctx: &OpContext) -> Result<Outcome, EngineError> {
        let name = op.name();
        let result = match op {
            Operation::Next { me } => self.next(ctx, me),
            Operation::Explain { task_id } => self.explain(ctx, &task_id),
            Operation::Rerank { dry_run } => self.rerank(ctx, dry_run),
            Operation::Update {
                task_id,
                done,
                notes,
            } => self.update(ctx, &task_id, done, notes),
            Operation::Pin { task_id } => self.set_pin(ctx, &task_id, true),
            Operation::Unpin { task_id } => self.set_pin(ctx, &task_id, false),
            Operation::Sync(options) => self.sync(ctx, options),
            Operation::Scan { apply } => self.scan(ctx, apply),
            Operation::Undo { hash, window } => self.undo(ctx, &hash, window),
            Operation::Feedback {
                hash,
                reason,
                severity,
                flow_area,
            } => self
                .mutation_log()
                .feedback(&hash, &reason, severity, flow_area.as_deref(), &ctx.actor)
                .map(Outcome::Feedback)
                .map_err(EngineError::from),
            Operation::History { limit } => self
                .mutation_log()
                .history(limit)
                .map(|records| Outcome::History { records })
                .map_err(EngineError::from),
        };
        if let Err(err) = &result {
            if err.severity() == Severity::Critical {
                error!(operation = name, error = %err, "operation failed critically");
            }
        }
        result
    }

    fn tasks(&self, ctx: &OpContext, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.retry.run(&ctx.deadline, "get_tasks", || {
            self.store.get_tasks(&self.repo, filter)
        })
    }

    /// Look a task up by id, or by issue number (`42` or `#42`).
    fn task(&self, ctx: &OpContext, task_id: &str) -> Result<Task, StoreError> {
        let task_id = task_id.trim();
        match self.retry.run(&ctx.deadline, "get_task", || {
            self.store.get_task(&self.repo, task_id)
        }) {
            Err(StoreError::NotFound(missing)) => {
                let Ok(number) = task_id.trim_start_matches('#').parse::<u64>() else {
                    return Err(StoreError::NotFound(missing));
                };
                self.tasks(ctx, &TaskFilter::all())?
                    .into_iter()
                    .find(|task| task.number == number)
                    .ok_or(StoreError::NotFound(missing))
            }
            other => other,
        }
    }

    /// Overrides for ranking. Falls back to the board pin field, flagged, when
    /// the override log cannot be read.
    fn override_view(&self, tasks: &[Task]) -> (OverrideView, Option<String>) {
        match self.overrides.view(&self.repo) {
            Ok(view) => (view, None),
            Err(err) => {
                warn!(
                    repo = %self.repo,
                    error = %err,
                    "override store unavailable; using board pin field"
                );
                let mirrored = tasks.iter().filter(|task| task.pinned).map(|task| Override {
                    task_id: task.id.clone(),
                    field: PINNED_FIELD.to_string(),
                    value: FieldValue::Flag(true),
                    set_by: "board".to_string(),
                    set_at: task.updated_at,
                });
                (
                    OverrideView::from_overrides(mirrored),
                    Some(format!("override store unavailable ({}); pins read from the board", err)),
                )
            }
        }
    }

    fn audit(&self, event: AuditEvent) {
        if let Err(err) = append_audit_event(&self.state_dir, &event) {
            warn!(action = %event.action, error = %err, "failed to append audit event");
        }
    }

    fn next(&self, ctx: &OpContext, me: bool) -> Result<Outcome, EngineError> {
        let tasks = self.tasks(ctx, &TaskFilter::open())?;
        let (view, notice) = self.override_view(&tasks);
        let assignee = me.then_some(ctx.actor.as_str());
        let task = ranking::select_next(&tasks, &self.config.ranking, &view, ctx.now, assignee).map(
            |(entry, explain): (RankedTask, String)| NextTask {
                score: entry.card.score,
                pinned: entry.pinned,
                task: entry.task,
                explain,
            },
        );
        Ok(Outcome::Next { task, notice })
    }

    fn explain(&self, ctx: &OpContext, task_id: &str) -> Result<Outcome, EngineError> {
        let task = self.task(ctx, task_id)?;
        let (view, notice) = self.override_view(std::slice::from_ref(&task));
        let mut text = ranking::explain(&task, &self.config.ranking, &view, ctx.now);
        if let Some(notice) = notice {
            text.push_str(&format!("\ndegraded: {}", notice));
        }
        Ok(Outcome::Explain { task, text })
    }

    fn rerank(&self, ctx: &OpContext, dry_run: bool) -> Result<Outcome, EngineError> {
        let board = self.tasks(ctx, &TaskFilter::open())?;
        // Never resequence without the arbiter's view of pins.
        let view = self.overrides.view(&self.repo)?;
        let ranked = ranking::rank_scored(&board, &self.config.ranking, &view, ctx.now);
        let moves = ranking::rerank_plan(&board, &ranked);
        if !dry_run {
            for step in &moves {
                self.retry.run(&ctx.deadline, "reorder", || {
                    self.store.reorder(&step.task_id, step.after_id.as_deref())
                })?;
            }
            self.audit(
                AuditEvent::now(&ctx.actor, "rerank").details(json!({
                    "moved": moves.len(),
                    "pinned": view.pinned_ids(),
                })),
            );
            info!(repo = %self.repo, moved = moves.len(), "board reranked");
        }
        Ok(Outcome::Rerank(RerankReport {
            dry_run,
            order: ranked.iter().map(|entry| entry.task.id.clone()).collect(),
            pinned: ranked
                .iter()
                .filter(|entry| entry.pinned)
                .map(|entry| entry.task.id.clone())
                .collect(),
            moves,
        }))
    }

    fn update(
        &self,
        ctx: &OpContext,
        task_id: &str,
        done: bool,
        notes: Option<String>,
    ) -> Result<Outcome, EngineError> {
        let notes = notes.map(|text| text.trim().to_string()).filter(|text| !text.is_empty());
        if !done && notes.is_none() {
            return Err(EngineError::Validation(
                "update needs --done and/or --notes".to_string(),
            ));
        }
        let task = self.task(ctx, task_id)?;
        let mut changes = Vec::new();
        if done {
            if task.state == TaskState::Closed {
                return Err(EngineError::Validation(format!(
                    "{} is already closed",
                    task.display_ref()
                )));
            }
            changes.push(FieldChange::new(
                task.id.clone(),
                TaskField::State,
                task.get_field(TaskField::State),
                FieldValue::from(TaskState::Closed.as_str()),
            ));
        }
        if let Some(notes) = notes {
            changes.push(FieldChange::new(
                task.id.clone(),
                TaskField::Notes,
                task.get_field(TaskField::Notes),
                FieldValue::Text(notes),
            ));
        }
        if done {
            // A closed task's pin goes with it, undoably.
            if self.overrides.view(&self.repo)?.is_pinned(&task.id) {
                changes.push(FieldChange::new(
                    task.id.clone(),
                    TaskField::Pinned,
                    FieldValue::Flag(true),
                    FieldValue::Absent,
                ));
            }
            // Open children roll over to the grandparent, or are detached.
            let heir = FieldValue::from_option(task.parent_id.clone());
            for child_id in &task.child_ids {
                let child = self.task(ctx, child_id)?;
                if child.is_open() {
                    changes.push(FieldChange::new(
                        child.id.clone(),
                        TaskField::Parent,
                        FieldValue::from(task.id.as_str()),
                        heir.clone(),
                    ));
                }
            }
        }

        let log = self.mutation_log();
        let summary = if done {
            format!("update #{} --done", task.number)
        } else {
            format!("update #{} --notes", task.number)
        };
        let record = log.propose(&ctx.actor, &summary, changes)?;
        let record = log.commit(record, &ctx.deadline)?;
        if done {
            let cleared = self.overrides.clear_task(&self.repo, &task.id, &ctx.actor)?;
            if !cleared.is_empty() {
                info!(task_id = %task.id, cleared = cleared.len(), "overrides cleared on close");
            }
        }
        self.audit(
            AuditEvent::now(&ctx.actor, "update")
                .task(&task.id)
                .hash(&record.hash)
                .details(json!({ "done": done, "changes": record.diff.len() })),
        );
        Ok(Outcome::Updated(record))
    }

    fn set_pin(
        &self,
        ctx: &OpContext,
        task_id: &str,
        pinned: bool,
    ) -> Result<Outcome, EngineError> {
        let task = self.task(ctx, task_id)?;
        let current = self.overrides.get(&self.repo, &task.id)?;
        let is_pinned = current.as_ref().map(Override::is_active_pin).unwrap_or(false);
        let action = if pinned { "pin" } else { "unpin" };

        if pinned && !task.is_open() {
            return Err(EngineError::Validation(format!(
                "{} is closed and cannot be pinned",
                task.display_ref()
            )));
        }
        if pinned == is_pinned {
            // Same value again: refresh set_at, nothing to undo.
            let pin = if pinned {
                Some(
                    self.overrides
                        .set_pinned(self.store.as_ref(), &self.repo, &task.id, true, &ctx.actor)?,
                )
            } else {
                None
            };
            return Ok(Outcome::Pinned {
                task_id: task.id,
                pinned,
                record: None,
                pin,
            });
        }

        let log = self.mutation_log();
        let (old_value, new_value) = if pinned {
            (FieldValue::Absent, FieldValue::Flag(true))
        } else {
            (FieldValue::Flag(true), FieldValue::Absent)
        };
        let record = log.propose(
            &ctx.actor,
            &format!("{} #{}", action, task.number),
            vec![FieldChange::new(task.id.clone(), TaskField::Pinned, old_value, new_value)],
        )?;
        let record = log.commit(record, &ctx.deadline)?;
        self.audit(
            AuditEvent::now(&ctx.actor, action)
                .task(&task.id)
                .hash(&record.hash),
        );
        let pin = self.overrides.get(&self.repo, &task.id)?;
        Ok(Outcome::Pinned {
            task_id: task.id,
            pinned,
            record: Some(record),
            pin,
        })
    }

    fn sync(&self, ctx: &OpContext, options: SyncOptions) -> Result<Outcome, EngineError> {
        let log = self.mutation_log();
        let sync_ctx = SyncContext {
            store: self.store.as_ref(),
            log: &log,
            repo: &self.repo,
            config: &self.config.hierarchy,
            retry: &self.retry,
            actor: &ctx.actor,
            deadline: &ctx.deadline,
        };
        let report = hierarchy::sync(&sync_ctx, options)?;
        if !options.dry_run {
            self.audit(
                AuditEvent::now(&ctx.actor, "hierarchy_sync").details(json!({
                    "created": report.created.iter().map(|task| &task.id).collect::<Vec<_>>(),
                    "linked": report.linked.iter().map(|group| &group.hash).collect::<Vec<_>>(),
                    "orphans": report.orphans.len(),
                    "failures": report.failures.len(),
                    "force": options.force,
                })),
            );
        }
        Ok(Outcome::Synced(report))
    }

    fn scan(&self, ctx: &OpContext, apply: bool) -> Result<Outcome, EngineError> {
        let tasks = self.tasks(ctx, &TaskFilter::open())?;
        let (view, notice) = self.override_view(&tasks);
        if let Some(notice) = notice.as_deref() {
            warn!(notice, "doctor scan running on partial data");
        }
        let report = doctor::scan(&tasks, &self.config.doctor, &view, ctx.now);
        if !apply {
            return Ok(Outcome::Scanned {
                report,
                applied: None,
            });
        }
        let changes = doctor::plan_labels(&report);
        if changes.is_empty() {
            return Ok(Outcome::Scanned {
                report,
                applied: None,
            });
        }
        let log = self.mutation_log();
        let record = log.propose(
            &ctx.actor,
            &format!(
                "doctor: {} stale, {} duplicate pair(s), {} oversized",
                report.stale.len(),
                report.duplicates.len(),
                report.oversized.len()
            ),
            changes,
        )?;
        let record = log.commit(record, &ctx.deadline)?;
        self.audit(
            AuditEvent::now(&ctx.actor, "doctor_apply")
                .hash(&record.hash)
                .details(json!({ "labelled": record.task_ids().len() })),
        );
        Ok(Outcome::Scanned {
            report,
            applied: Some(record),
        })
    }

    fn undo(
        &self,
        ctx: &OpContext,
        hash: &str,
        window: Option<usize>,
    ) -> Result<Outcome, EngineError> {
        let window = window.unwrap_or(self.config.undo.commit_window);
        if window == 0 {
            return Err(EngineError::Validation(
                "commit window must be at least 1".to_string(),
            ));
        }
        let record = self
            .mutation_log()
            .undo(hash, window, &ctx.actor, &ctx.deadline)?;
        self.audit(
            AuditEvent::now(&ctx.actor, "undo")
                .hash(&record.hash)
                .details(json!({ "window": window, "changes": record.diff.len() })),
        );
        Ok(Outcome::Undone(record))
    }
}
