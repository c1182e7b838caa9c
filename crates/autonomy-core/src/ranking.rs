use std::cmp::Ordering;
use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::config::{RankingConfig, Signal};
use crate::overrides::OverrideView;
use crate::task::{Task, TaskId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalScore {
    pub signal: Signal,
    pub raw: f64,
    pub weight: f64,
    pub contribution: f64,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreCard {
    pub task_id: TaskId,
    pub score: f64,
    pub signals: Vec<SignalScore>,
    pub penalized: bool,
    /// Signals computed from partial data.
    pub degraded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedTask {
    pub task: Task,
    pub card: ScoreCard,
    pub pinned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReorderStep {
    pub task_id: TaskId,
    pub after_id: Option<TaskId>,
}

pub fn score(task: &Task, config: &RankingConfig, now: DateTime<Utc>) -> ScoreCard {
    let mut degraded = Vec::new();

    let (priority_raw, priority_note) = match task.effective_priority() {
        Some((label, inferred)) => {
            let value = config.priority_mapping.get(&label).copied().unwrap_or(0) as f64;
            if inferred {
                degraded.push(format!("priority {} inferred from legacy label", label));
                (value, format!("{} (from label)", label))
            } else {
                (value, label.to_string())
            }
        }
        None => (0.0, "no priority".to_string()),
    };

    let (sprint_raw, sprint_note) = match task.sprint.as_deref() {
        None => (0.0, "no sprint".to_string()),
        Some(sprint) => match sprint_end(sprint, config) {
            Some(end) => {
                let days = (end - now.date_naive()).num_days();
                (
                    1.0 / (1.0 + days.max(0) as f64),
                    format!("{} ends {} ({} day(s))", sprint, end, days),
                )
            }
            None => {
                degraded.push(format!("end date unknown for sprint '{}'", sprint));
                (0.0, format!("{} (end date unknown)", sprint))
            }
        },
    };

    let age_days = (now - task.created_at).num_seconds() as f64 / 86_400.0;
    let age_days = if age_days < 0.0 {
        degraded.push("created in the future; age treated as zero".to_string());
        0.0
    } else {
        age_days
    };
    let capped = age_days.min(f64::from(config.max_age_days));
    let age_raw = (1.0 + capped).ln();
    let age_note = if age_days > capped {
        format!("{:.0} day(s), capped at {}", age_days, config.max_age_days)
    } else {
        format!("{:.0} day(s)", age_days)
    };

    let excluded = task
        .labels
        .iter()
        .find(|label| config.excluded_labels.contains(&label.trim().to_lowercase()));
    let penalized = task.blocked || excluded.is_some();
    let blocked_note = match (task.blocked, excluded) {
        (true, _) => "blocked".to_string(),
        (false, Some(label)) => format!("label '{}'", label),
        (false, None) => "not blocked".to_string(),
    };

    let signals: Vec<SignalScore> = [
        (Signal::PriorityField, priority_raw, priority_note),
        (Signal::SprintProximity, sprint_raw, sprint_note),
        (Signal::IssueAge, age_raw, age_note),
        (
            Signal::BlockedPenalty,
            if penalized { 1.0 } else { 0.0 },
            blocked_note,
        ),
    ]
    .into_iter()
    .map(|(signal, raw, note)| {
        let weight = config.weights.get(signal);
        SignalScore {
            signal,
            raw,
            weight,
            contribution: weight * raw,
            note,
        }
    })
    .collect();

    ScoreCard {
        task_id: task.id.clone(),
        score: signals.iter().map(|signal| signal.contribution).sum(),
        signals,
        penalized,
        degraded,
    }
}

fn sprint_end(sprint: &str, config: &RankingConfig) -> Option<NaiveDate> {
    config
        .sprints
        .get(sprint)
        .copied()
        .or_else(|| NaiveDate::parse_from_str(sprint.trim(), "%Y-%m-%d").ok())
}

fn by_score(left: &RankedTask, right: &RankedTask) -> Ordering {
    right
        .card
        .score
        .total_cmp(&left.card.score)
        .then_with(|| left.task.created_at.cmp(&right.task.created_at))
        .then_with(|| left.task.id.cmp(&right.task.id))
}

/// Order `tasks` (given in board order) by score. Pinned tasks keep their
/// index; unpinned tasks fill the remaining slots.
pub fn rank_scored(
    tasks: &[Task],
    config: &RankingConfig,
    overrides: &OverrideView,
    now: DateTime<Utc>,
) -> Vec<RankedTask> {
    let mut slots: Vec<Option<RankedTask>> = Vec::with_capacity(tasks.len());
    let mut movable = Vec::new();
    for task in tasks {
        let entry = RankedTask {
            card: score(task, config, now),
            pinned: overrides.is_pinned(&task.id),
            task: task.clone(),
        };
        if entry.pinned {
            slots.push(Some(entry));
        } else {
            slots.push(None);
            movable.push(entry);
        }
    }
    movable.sort_by(by_score);
    let mut movable = movable.into_iter();
    slots
        .into_iter()
        .filter_map(|slot| slot.or_else(|| movable.next()))
        .collect()
}

pub fn rank(
    tasks: &[Task],
    config: &RankingConfig,
    overrides: &OverrideView,
    now: DateTime<Utc>,
) -> Vec<Task> {
    rank_scored(tasks, config, overrides, now)
        .into_iter()
        .map(|entry| entry.task)
        .collect()
}

pub fn explain(
    task: &Task,
    config: &RankingConfig,
    overrides: &OverrideView,
    now: DateTime<Utc>,
) -> String {
    render_explain(task, &score(task, config, now), overrides)
}

fn render_explain(task: &Task, card: &ScoreCard, overrides: &OverrideView) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", task.display_ref());
    let _ = writeln!(out, "score: {:.2}", card.score);
    for signal in &card.signals {
        let _ = writeln!(
            out,
            "  {:<17} {:>7.3} x {:>8.2} = {:>8.2}  {}",
            signal.signal.as_str(),
            signal.raw,
            signal.weight,
            signal.contribution,
            signal.note
        );
    }
    match overrides.get(&task.id, crate::overrides::PINNED_FIELD) {
        Some(pin) if pin.is_active_pin() => {
            let _ = writeln!(
                out,
                "pinned: yes, by {} at {}; keeps its board position",
                pin.set_by,
                pin.set_at.to_rfc3339()
            );
        }
        _ => {
            let _ = writeln!(out, "pinned: no");
        }
    }
    if task.pinned != overrides.is_pinned(&task.id) {
        let _ = writeln!(out, "warning: board pin field disagrees with the override store");
    }
    for flag in &card.degraded {
        let _ = writeln!(out, "degraded: {}", flag);
    }
    out.trim_end().to_string()
}

/// First open, unblocked task in rank order, optionally limited to one assignee.
pub fn select_next(
    tasks: &[Task],
    config: &RankingConfig,
    overrides: &OverrideView,
    now: DateTime<Utc>,
    assignee: Option<&str>,
) -> Option<(RankedTask, String)> {
    let candidates: Vec<Task> = tasks
        .iter()
        .filter(|task| task.is_open())
        .filter(|task| match assignee {
            Some(me) => task
                .assignee
                .as_deref()
                .map(|have| have.eq_ignore_ascii_case(me))
                .unwrap_or(false),
            None => true,
        })
        .cloned()
        .collect();
    rank_scored(&candidates, config, overrides, now)
        .into_iter()
        .find(|entry| !entry.card.penalized)
        .map(|entry| {
            let text = render_explain(&entry.task, &entry.card, overrides);
            (entry, text)
        })
}

/// Moves that turn the board order into `ranked`. Pinned tasks are never moved;
/// each unpinned task is placed directly after its ranked predecessor.
pub fn rerank_plan(board: &[Task], ranked: &[RankedTask]) -> Vec<ReorderStep> {
    let mut simulated: Vec<&str> = board.iter().map(|task| task.id.as_str()).collect();
    let mut steps = Vec::new();
    for (idx, entry) in ranked.iter().enumerate() {
        if entry.pinned {
            continue;
        }
        let after = idx.checked_sub(1).map(|prev| ranked[prev].task.id.as_str());
        let Some(from) = simulated.iter().position(|id| *id == entry.task.id) else {
            continue;
        };
        let moved = simulated.remove(from);
        let to = match after {
            None => 0,
            Some(after) => simulated
                .iter()
                .position(|id| *id == after)
                .map(|pos| pos + 1)
                .unwrap_or(simulated.len()),
        };
        simulated.insert(to, moved);
        if to != from {
            steps.push(ReorderStep {
                task_id: entry.task.id.clone(),
                after_id: after.map(ToString::to_string),
            });
        }
    }
    steps
}
