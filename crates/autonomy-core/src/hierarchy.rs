//! Epic -> Feature -> Task -> Sub-task maintenance.
//!
//! `plan` is pure: it groups unlinked child-level tasks by their declared
//! epic reference. `sync` executes a plan, one mutation-log batch per group,
//! so a group is either fully linked or untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::HierarchyConfig;
use crate::mutation::{FieldChange, MutationError, MutationLog};
use crate::retry::{Deadline, RetryPolicy};
use crate::store::{IssueStore, NewTask, StoreError, TaskFilter};
use crate::task::{FieldValue, Task, TaskField, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Epic,
    Feature,
    Task,
    Subtask,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Epic => "epic",
            Level::Feature => "feature",
            Level::Task => "task",
            Level::Subtask => "subtask",
        }
    }

    pub fn is_child_level(self) -> bool {
        self != Level::Epic
    }
}

pub fn level_of(task: &Task, config: &HierarchyConfig) -> Option<Level> {
    if task.has_label(&config.epic_label) {
        return Some(Level::Epic);
    }
    if task.has_label(&config.feature_label) {
        return Some(Level::Feature);
    }
    if config.subtask_labels.iter().any(|label| task.has_label(label)) {
        return Some(Level::Subtask);
    }
    if task.has_label(&config.task_label) {
        return Some(Level::Task);
    }
    title_prefix(&task.title).map(|(level, _)| level)
}

fn title_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)^\s*(?:\[(epic|feature|task|sub-?task)\]",
            r"|(epic|feature|task|sub-?task)\s*:)\s*"
        ))
        .expect("regex")
    })
}

fn title_prefix(title: &str) -> Option<(Level, usize)> {
    let caps = title_prefix_regex().captures(title)?;
    let word = caps.get(1).or_else(|| caps.get(2))?.as_str().to_lowercase();
    let level = match word.as_str() {
        "epic" => Level::Epic,
        "feature" => Level::Feature,
        "task" => Level::Task,
        _ => Level::Subtask,
    };
    Some((level, caps.get(0).map(|m| m.end()).unwrap_or(0)))
}

/// Title without a leading `[Epic]` / `Epic:` style marker.
pub fn bare_title(title: &str) -> &str {
    match title_prefix(title) {
        Some((_, end)) => title[end..].trim(),
        None => title.trim(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EpicRef {
    Number(u64),
    Name(String),
}

fn epic_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:\*\*epic:\*\*|\*\*epic\*\*:|epic:)[ \t]*(.+?)[ \t]*$")
            .expect("regex")
    })
}

/// The parent a task declares: an `Epic:` body line, else a group label.
pub fn epic_reference(task: &Task, config: &HierarchyConfig) -> Option<EpicRef> {
    if let Some(caps) = epic_line_regex().captures(&task.body) {
        let value = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if let Some(number) = value.strip_prefix('#').and_then(|n| n.parse().ok()) {
            return Some(EpicRef::Number(number));
        }
        if !value.is_empty() {
            return Some(EpicRef::Name(value.to_string()));
        }
    }
    let prefix = config.group_label_prefix.to_lowercase();
    task.labels.iter().find_map(|label| {
        let lowered = label.to_lowercase();
        lowered
            .starts_with(&prefix)
            .then(|| label.get(prefix.len()..).unwrap_or("").trim().to_string())
            .filter(|name| !name.is_empty())
            .map(EpicRef::Name)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParentTarget {
    Existing(TaskId),
    Create(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedGroup {
    pub parent: ParentTarget,
    pub children: Vec<TaskId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncPlan {
    pub groups: Vec<PlannedGroup>,
    pub orphans: Vec<Task>,
    /// Unresolved groups at or under the threshold, left alone.
    pub deferred: Vec<PlannedGroup>,
}

fn find_parent<'t>(
    tasks: &'t [Task],
    reference: &EpicRef,
    child_level: Level,
    config: &HierarchyConfig,
) -> Option<&'t Task> {
    let above = |task: &&Task| {
        level_of(task, config)
            .map(|level| level < child_level)
            .unwrap_or(false)
    };
    match reference {
        EpicRef::Number(number) => tasks.iter().filter(above).find(|task| task.number == *number),
        EpicRef::Name(name) => {
            let mut matches: Vec<&Task> = tasks
                .iter()
                .filter(above)
                .filter(|task| bare_title(&task.title).eq_ignore_ascii_case(name.trim()))
                .collect();
            matches.sort_by_key(|task| (level_of(task, config), !task.is_open(), task.number));
            matches.into_iter().next()
        }
    }
}

/// Decide which links to make and which parents to create.
pub fn plan(tasks: &[Task], config: &HierarchyConfig, force: bool) -> SyncPlan {
    let mut resolved: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();
    let mut named: BTreeMap<String, (String, Vec<&Task>)> = BTreeMap::new();
    let mut unnamed: Vec<&Task> = Vec::new();

    let mut candidates: Vec<&Task> = tasks
        .iter()
        .filter(|task| task.is_open() && task.parent_id.is_none())
        .collect();
    candidates.sort_by_key(|task| task.number);

    for task in candidates {
        let Some(level) = level_of(task, config).filter(|level| level.is_child_level()) else {
            continue;
        };
        let reference = epic_reference(task, config);
        match reference
            .as_ref()
            .and_then(|reference| find_parent(tasks, reference, level, config))
        {
            Some(parent) if parent.id != task.id => {
                resolved.entry(parent.id.clone()).or_default().push(task.id.clone());
            }
            _ => match reference {
                Some(EpicRef::Name(name)) => {
                    named
                        .entry(name.trim().to_lowercase())
                        .or_insert_with(|| (name.trim().to_string(), Vec::new()))
                        .1
                        .push(task);
                }
                _ => unnamed.push(task),
            },
        }
    }

    let mut plan = SyncPlan::default();
    for (parent, children) in resolved {
        plan.groups.push(PlannedGroup {
            parent: ParentTarget::Existing(parent),
            children,
        });
    }
    for (_, (name, members)) in named {
        let group = PlannedGroup {
            parent: ParentTarget::Create(name),
            children: members.iter().map(|task| task.id.clone()).collect(),
        };
        if force || members.len() > config.orphan_threshold {
            plan.groups.push(group);
        } else {
            plan.deferred.push(group);
        }
    }
    if unnamed.len() > config.orphan_threshold {
        plan.orphans = unnamed.into_iter().cloned().collect();
    }
    plan
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedGroup {
    pub parent_id: TaskId,
    pub children: Vec<TaskId>,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub parent: ParentTarget,
    pub children: Vec<TaskId>,
    pub error: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub created: Vec<Task>,
    pub linked: Vec<LinkedGroup>,
    pub orphans: Vec<Task>,
    pub planned: Vec<PlannedGroup>,
    pub failures: Vec<SyncFailure>,
}

pub struct SyncContext<'a, 'l> {
    pub store: &'a dyn IssueStore,
    pub log: &'a MutationLog<'l>,
    pub repo: &'a str,
    pub config: &'a HierarchyConfig,
    pub retry: &'a RetryPolicy,
    pub actor: &'a str,
    pub deadline: &'a Deadline,
}

pub fn sync(ctx: &SyncContext<'_, '_>, options: SyncOptions) -> Result<SyncReport, StoreError> {
    let tasks = ctx.retry.run(ctx.deadline, "get_tasks", || {
        ctx.store.get_tasks(ctx.repo, &TaskFilter::all())
    })?;
    let plan = plan(&tasks, ctx.config, options.force);
    for group in &plan.deferred {
        debug!(
            parent = ?group.parent,
            children = group.children.len(),
            "group at or under threshold left unlinked"
        );
    }
    if !plan.orphans.is_empty() {
        warn!(
            repo = ctx.repo,
            orphans = plan.orphans.len(),
            "unlinked child-level tasks without a resolvable parent"
        );
    }

    let mut report = SyncReport {
        dry_run: options.dry_run,
        orphans: plan.orphans.clone(),
        planned: plan.groups.clone(),
        ..SyncReport::default()
    };
    if options.dry_run {
        return Ok(report);
    }

    for group in plan.groups {
        let parent_id = match &group.parent {
            ParentTarget::Existing(id) => id.clone(),
            ParentTarget::Create(name) => match create_parent(ctx, name, group.children.len()) {
                Ok(task) => {
                    let id = task.id.clone();
                    report.created.push(task);
                    id
                }
                Err(err) => {
                    warn!(
                        parent = %name,
                        error = %err,
                        "parent creation failed; group left unlinked"
                    );
                    report.failures.push(SyncFailure {
                        retryable: err.is_transient() || matches!(err, StoreError::Timeout(_)),
                        error: err.to_string(),
                        parent: group.parent.clone(),
                        children: group.children.clone(),
                    });
                    continue;
                }
            },
        };

        match link_group(ctx, &parent_id, &group.children) {
            Ok(hash) => {
                info!(
                    parent_id = %parent_id,
                    children = group.children.len(),
                    hash = %hash,
                    "group linked"
                );
                report.linked.push(LinkedGroup {
                    parent_id,
                    children: group.children,
                    hash,
                });
            }
            Err(err) => {
                warn!(parent_id = %parent_id, error = %err, "linking failed; group left unlinked");
                report.failures.push(SyncFailure {
                    retryable: is_retryable(&err),
                    error: err.to_string(),
                    parent: ParentTarget::Existing(parent_id),
                    children: group.children,
                });
            }
        }
    }
    Ok(report)
}

fn is_retryable(err: &MutationError) -> bool {
    match err {
        MutationError::Conflict { .. } => true,
        MutationError::Store(store) => {
            store.is_transient() || matches!(store, StoreError::Timeout(_))
        }
        MutationError::PartialApply { source, .. } => matches!(
            source,
            crate::mutation::WriteError::Store(StoreError::Transient(_) | StoreError::Timeout(_))
        ),
        _ => false,
    }
}

fn link_group(
    ctx: &SyncContext<'_, '_>,
    parent_id: &str,
    children: &[TaskId],
) -> Result<String, MutationError> {
    let changes = children
        .iter()
        .map(|child| {
            FieldChange::new(
                child.clone(),
                TaskField::Parent,
                FieldValue::Absent,
                FieldValue::from(parent_id),
            )
        })
        .collect();
    let record = ctx.log.propose(
        ctx.actor,
        &format!("hierarchy sync: link {} task(s) under {}", children.len(), parent_id),
        changes,
    )?;
    Ok(ctx.log.commit(record, ctx.deadline)?.hash)
}

/// Create a parent Epic. A failed create may still have landed, so every
/// retry first looks for an Epic with the same title.
fn create_parent(
    ctx: &SyncContext<'_, '_>,
    name: &str,
    children: usize,
) -> Result<Task, StoreError> {
    let mut attempt = 0u32;
    ctx.retry.run(ctx.deadline, "create_task", || {
        attempt += 1;
        if attempt > 1 {
            let existing = ctx
                .store
                .get_tasks(ctx.repo, &TaskFilter::all())?
                .into_iter()
                .find(|task| {
                    level_of(task, ctx.config) == Some(Level::Epic)
                        && bare_title(&task.title).eq_ignore_ascii_case(name)
                });
            if let Some(task) = existing {
                debug!(task_id = %task.id, "found epic from an earlier attempt");
                return Ok(task);
            }
        }
        ctx.store.create_task(
            ctx.repo,
            NewTask {
                title: name.to_string(),
                body: format!("Created by hierarchy sync to group {} task(s).", children),
                labels: BTreeSet::from([ctx.config.epic_label.clone()]),
                ..NewTask::default()
            },
        )
    })
}
