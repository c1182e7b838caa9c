use std::fmt::Write;

use autonomy_core::engine::Outcome;
use autonomy_core::hierarchy::ParentTarget;
use autonomy_core::mutation::MutationRecord;
use autonomy_core::task::Task;

fn task_line(task: &Task) -> String {
    format!("{} [{}]", task.display_ref(), task.id)
}

fn record_line(record: &MutationRecord) -> String {
    format!(
        "{}  {:<7}  {}  {}  {}",
        record.short_hash(),
        record.state.as_str(),
        record.timestamp.format("%Y-%m-%d %H:%M"),
        record.actor,
        record.summary
    )
}

pub fn outcome_text(outcome: &Outcome) -> String {
    let mut out = String::new();
    match outcome {
        Outcome::Next { task: None, .. } => {
            out.push_str("No eligible task.");
        }
        Outcome::Next {
            task: Some(next), ..
        } => {
            let _ = writeln!(out, "Next: {}", task_line(&next.task));
            out.push_str(&next.explain);
        }
        Outcome::Explain { text, .. } => out.push_str(text),
        Outcome::Rerank(report) => {
            let verb = if report.dry_run { "Would move" } else { "Moved" };
            let _ = writeln!(out, "{} {} task(s)", verb, report.moves.len());
            for (idx, id) in report.order.iter().enumerate() {
                let marker = if report.pinned.contains(id) { " (pinned)" } else { "" };
                let _ = writeln!(out, "{:>3}. {}{}", idx + 1, id, marker);
            }
        }
        Outcome::Updated(record) => {
            let _ = writeln!(out, "{}", record.summary);
            let _ = write!(out, "hash: {}", record.hash);
        }
        Outcome::Pinned {
            task_id,
            pinned,
            record,
            ..
        } => {
            let action = if *pinned { "Pinned" } else { "Unpinned" };
            match record {
                Some(record) => {
                    let _ = write!(out, "{} {}\nhash: {}", action, task_id, record.hash);
                }
                None => {
                    let _ = write!(out, "{} {} (unchanged)", action, task_id);
                }
            }
        }
        Outcome::Synced(report) => {
            let prefix = if report.dry_run { "(dry run) " } else { "" };
            if report.dry_run {
                for group in &report.planned {
                    let parent = match &group.parent {
                        ParentTarget::Existing(id) => id.clone(),
                        ParentTarget::Create(name) => format!("new epic '{}'", name),
                    };
                    let _ = writeln!(
                        out,
                        "{}link {} -> {}",
                        prefix,
                        group.children.join(", "),
                        parent
                    );
                }
            }
            for task in &report.created {
                let _ = writeln!(out, "created {}", task_line(task));
            }
            for group in &report.linked {
                let _ = writeln!(
                    out,
                    "linked {} task(s) under {} (hash {})",
                    group.children.len(),
                    group.parent_id,
                    group.hash
                );
            }
            for failure in &report.failures {
                let retry = if failure.retryable { "retryable" } else { "not retryable" };
                let _ = writeln!(
                    out,
                    "failed {} ({}): {}",
                    failure.children.join(", "),
                    retry,
                    failure.error
                );
            }
            let _ = write!(
                out,
                "{}created={} linked={} orphans={}",
                prefix,
                report.created.len(),
                report.linked.len(),
                report.orphans.len()
            );
            for task in &report.orphans {
                let _ = write!(out, "\n  orphan {}", task_line(task));
            }
        }
        Outcome::Scanned { report, applied } => {
            let _ = writeln!(out, "Scanned {} open task(s)", report.scanned);
            for task in &report.stale {
                let _ = writeln!(out, "stale      {}", task_line(task));
            }
            for pair in &report.duplicates {
                let _ = writeln!(
                    out,
                    "duplicate  {} ~ {} ({:.2})",
                    task_line(&pair.first),
                    task_line(&pair.second),
                    pair.similarity
                );
            }
            for task in &report.oversized {
                let _ = writeln!(out, "oversized  {}", task_line(task));
            }
            if report.is_clean() {
                out.push_str("Backlog is clean.");
            } else if let Some(record) = applied {
                let _ = write!(out, "labels applied, hash: {}", record.hash);
            } else {
                out.push_str("Run with --apply to label flagged tasks.");
            }
        }
        Outcome::Undone(record) => {
            let _ = write!(out, "Undone {} ({})", record.hash, record.summary);
        }
        Outcome::Feedback(feedback) => {
            let _ = write!(
                out,
                "Feedback recorded for {} [{}]",
                feedback.hash,
                feedback.severity.as_str()
            );
        }
        Outcome::History { records } => {
            if records.is_empty() {
                out.push_str("No mutations recorded.");
            }
            let lines: Vec<String> = records.iter().map(record_line).collect();
            out.push_str(&lines.join("\n"));
        }
    }
    out.trim_end().to_string()
}
