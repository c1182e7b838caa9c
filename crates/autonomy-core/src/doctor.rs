use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;

use crate::config::DoctorConfig;
use crate::mutation::FieldChange;
use crate::overrides::OverrideView;
use crate::task::{FieldValue, Task, TaskField, TaskId};

pub const STALE_LABEL: &str = "stale";
pub const DUPLICATE_LABEL: &str = "duplicate-candidate";
pub const OVERSIZED_LABEL: &str = "oversized";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicatePair {
    pub first: Task,
    pub second: Task,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DoctorReport {
    pub scanned: usize,
    pub stale: Vec<Task>,
    pub duplicates: Vec<DuplicatePair>,
    pub oversized: Vec<Task>,
}

impl DoctorReport {
    pub fn is_clean(&self) -> bool {
        self.stale.is_empty() && self.duplicates.is_empty() && self.oversized.is_empty()
    }
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9]+").expect("regex"))
}

pub fn tokens(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    token_regex()
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

#[derive(Debug, Clone)]
struct Fingerprint {
    title: BTreeSet<String>,
    body: BTreeSet<String>,
}

impl Fingerprint {
    fn of(task: &Task) -> Self {
        let body_tokens = tokens(&task.body);
        Self {
            title: tokens(&task.title).into_iter().collect(),
            body: body_tokens
                .windows(2)
                .map(|pair| format!("{} {}", pair[0], pair[1]))
                .collect(),
        }
    }
}

fn jaccard(left: &BTreeSet<String>, right: &BTreeSet<String>) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(right).count();
    let union = left.len() + right.len() - shared;
    shared as f64 / union as f64
}

/// Upper bound on jaccard given only set sizes.
fn size_bound(left: usize, right: usize) -> f64 {
    if left == 0 || right == 0 {
        return 0.0;
    }
    left.min(right) as f64 / left.max(right) as f64
}

fn fingerprint_similarity(left: &Fingerprint, right: &Fingerprint) -> f64 {
    jaccard(&left.title, &right.title).max(jaccard(&left.body, &right.body))
}

/// Symmetric similarity in `[0, 1]`: the better of title-token jaccard and
/// body word-bigram jaccard.
pub fn similarity(left: &Task, right: &Task) -> f64 {
    fingerprint_similarity(&Fingerprint::of(left), &Fingerprint::of(right))
}

pub fn is_stale(
    task: &Task,
    config: &DoctorConfig,
    overrides: &OverrideView,
    now: DateTime<Utc>,
) -> bool {
    task.is_open()
        && !overrides.is_pinned(&task.id)
        && now - task.updated_at > Duration::days(config.stale_days)
}

pub fn is_oversized(task: &Task, config: &DoctorConfig) -> bool {
    task.checklist_items() > config.checklist_limit
}

/// Read-only hygiene pass over the open tasks in `tasks`.
pub fn scan(
    tasks: &[Task],
    config: &DoctorConfig,
    overrides: &OverrideView,
    now: DateTime<Utc>,
) -> DoctorReport {
    let mut open: Vec<&Task> = tasks.iter().filter(|task| task.is_open()).collect();
    open.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.id.cmp(&b.id)));

    let stale = open
        .iter()
        .filter(|task| is_stale(task, config, overrides, now))
        .map(|task| (*task).clone())
        .collect();
    let oversized = open
        .iter()
        .filter(|task| is_oversized(task, config))
        .map(|task| (*task).clone())
        .collect();

    let prints: Vec<Fingerprint> = open.iter().map(|task| Fingerprint::of(task)).collect();
    let threshold = config.duplicate_threshold;
    let mut duplicates = Vec::new();
    for i in 0..open.len() {
        for j in (i + 1)..open.len() {
            let (left, right) = (&prints[i], &prints[j]);
            let reachable = size_bound(left.title.len(), right.title.len()) >= threshold
                || size_bound(left.body.len(), right.body.len()) >= threshold;
            if !reachable {
                continue;
            }
            let score = fingerprint_similarity(left, right);
            if score >= threshold {
                duplicates.push(DuplicatePair {
                    first: open[i].clone(),
                    second: open[j].clone(),
                    similarity: score,
                });
            }
        }
    }

    DoctorReport {
        scanned: open.len(),
        stale,
        duplicates,
        oversized,
    }
}

/// One `labels` change per flagged task adding the doctor's labels.
pub fn plan_labels(report: &DoctorReport) -> Vec<FieldChange> {
    let marks = report
        .stale
        .iter()
        .map(|task| (task, STALE_LABEL))
        .chain(report.duplicates.iter().flat_map(|pair| {
            [(&pair.first, DUPLICATE_LABEL), (&pair.second, DUPLICATE_LABEL)]
        }))
        .chain(report.oversized.iter().map(|task| (task, OVERSIZED_LABEL)));

    let mut flagged: BTreeMap<(u64, TaskId), (&Task, BTreeSet<&'static str>)> = BTreeMap::new();
    for (task, label) in marks {
        flagged
            .entry((task.number, task.id.clone()))
            .or_insert_with(|| (task, BTreeSet::new()))
            .1
            .insert(label);
    }

    flagged
        .into_values()
        .filter_map(|(task, labels)| {
            let before: BTreeSet<String> = task.labels.iter().cloned().collect();
            let mut after = before.clone();
            for label in labels {
                if !task.has_label(label) {
                    after.insert(label.to_string());
                }
            }
            if after == before {
                return None;
            }
            Some(FieldChange::new(
                task.id.clone(),
                TaskField::Labels,
                FieldValue::List(before.into_iter().collect()),
                FieldValue::List(after.into_iter().collect()),
            ))
        })
        .collect()
}
