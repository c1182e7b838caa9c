use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use autonomy_core::config::ResolvedConfig;
use autonomy_core::engine::{Engine, EngineError, Operation, Outcome, Severity};
use autonomy_core::field_cache::FieldCache;
use autonomy_core::mutation::{
    mutations_dir, FeedbackSeverity, FieldChange, MutationError, MutationState,
};
use autonomy_core::store::{
    repo_key, IssueStore, LocalIssueStore, NewTask, StoreError, TaskFilter,
};
use autonomy_core::task::{FieldValue, Task, TaskField, TaskState};
use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const REPO: &str = "acme/app";

fn at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap()
}

fn task(number: u64) -> Task {
    Task {
        id: format!("issue-{}", number),
        number,
        title: format!("Task {}", number),
        body: String::new(),
        state: TaskState::Open,
        labels: BTreeSet::new(),
        assignee: None,
        priority_label: None,
        sprint: None,
        pinned: false,
        blocked: false,
        parent_id: None,
        child_ids: Vec::new(),
        notes: None,
        created_at: at(),
        updated_at: at(),
    }
}

fn local_store(state_dir: &Path, tasks: Vec<Task>) -> LocalIssueStore {
    let store = LocalIssueStore::open(
        state_dir,
        REPO,
        Arc::new(FieldCache::new(Duration::from_secs(60))),
    )
    .expect("open store");
    store.import(tasks).expect("import");
    store
}

fn engine(state_dir: &Path, tasks: Vec<Task>) -> Engine {
    let store = local_store(state_dir, tasks);
    Engine::new(REPO, state_dir, ResolvedConfig::default(), Box::new(store))
}

fn run(engine: &Engine, op: Operation) -> Result<Outcome, EngineError> {
    engine.run(op, &engine.context("dana", Utc::now()))
}

fn done(task_id: &str) -> Operation {
    Operation::Update {
        task_id: task_id.to_string(),
        done: true,
        notes: None,
    }
}

fn undo(hash: &str) -> Operation {
    Operation::Undo {
        hash: hash.to_string(),
        window: None,
    }
}

fn committed_hash(outcome: Outcome) -> String {
    match outcome {
        Outcome::Updated(record) => record.hash,
        Outcome::Pinned {
            record: Some(record),
            ..
        } => record.hash,
        other => panic!("expected a committed mutation, got {:?}", other),
    }
}

#[test]
fn undo_of_done_restores_open_and_absent_notes() {
    let temp = TempDir::new().expect("tempdir");
    let engine = engine(temp.path(), vec![task(42)]);

    let hash = committed_hash(run(&engine, done("42")).expect("done"));
    let closed = engine.store().get_task(REPO, "issue-42").expect("task");
    assert_eq!(closed.state, TaskState::Closed);

    let outcome = run(&engine, undo(&hash[..7])).expect("undo");
    let Outcome::Undone(record) = outcome else {
        panic!("expected undo outcome");
    };
    assert_eq!(record.state, MutationState::Undone);
    assert_eq!(record.undone_by.as_deref(), Some("dana"));

    let restored = engine.store().get_task(REPO, "issue-42").expect("task");
    assert_eq!(restored.state, TaskState::Open);
    assert_eq!(restored.notes, None);
}

#[test]
fn done_with_notes_clears_pin_and_undo_brings_both_back() {
    let temp = TempDir::new().expect("tempdir");
    let engine = engine(temp.path(), vec![task(7)]);
    run(&engine, Operation::Pin { task_id: "issue-7".to_string() }).expect("pin");

    let hash = committed_hash(
        run(
            &engine,
            Operation::Update {
                task_id: "#7".to_string(),
                done: true,
                notes: Some("shipped in 2.4".to_string()),
            },
        )
        .expect("done"),
    );
    let closed = engine.store().get_task(REPO, "issue-7").expect("task");
    assert_eq!(closed.notes.as_deref(), Some("shipped in 2.4"));
    assert!(!closed.pinned);
    assert!(engine.overrides().get(REPO, "issue-7").expect("pin").is_none());

    run(&engine, undo(&hash)).expect("undo");
    let reopened = engine.store().get_task(REPO, "issue-7").expect("task");
    assert_eq!(reopened.state, TaskState::Open);
    assert_eq!(reopened.notes, None);
    assert!(reopened.pinned);
    assert!(engine
        .overrides()
        .get(REPO, "issue-7")
        .expect("pin")
        .map(|pin| pin.is_active_pin())
        .unwrap_or(false));
}

#[test]
fn closing_a_parent_rolls_open_children_up_and_undo_relinks() {
    let temp = TempDir::new().expect("tempdir");
    let mut epic = task(1);
    epic.labels.insert("epic".to_string());
    let mut feature = task(2);
    feature.parent_id = Some("issue-1".to_string());
    let mut open_child = task(3);
    open_child.parent_id = Some("issue-2".to_string());
    let mut closed_child = task(4);
    closed_child.parent_id = Some("issue-2".to_string());
    closed_child.state = TaskState::Closed;
    let engine = engine(temp.path(), vec![epic, feature, open_child, closed_child]);

    let hash = committed_hash(run(&engine, done("issue-2")).expect("done"));
    assert_eq!(
        engine.store().get_task(REPO, "issue-3").expect("child").parent_id.as_deref(),
        Some("issue-1")
    );
    assert_eq!(
        engine.store().get_task(REPO, "issue-4").expect("child").parent_id.as_deref(),
        Some("issue-2")
    );

    run(&engine, undo(&hash)).expect("undo");
    assert_eq!(
        engine.store().get_task(REPO, "issue-3").expect("child").parent_id.as_deref(),
        Some("issue-2")
    );
}

#[test]
fn manual_edit_after_commit_blocks_undo() {
    let temp = TempDir::new().expect("tempdir");
    let engine = engine(temp.path(), vec![task(42)]);
    let hash = committed_hash(run(&engine, done("42")).expect("done"));

    // Someone reopens the issue by hand and leaves a note.
    engine
        .store()
        .update_task_field("issue-42", TaskField::State, &FieldValue::from("open"))
        .expect("manual reopen");

    let err = run(&engine, undo(&hash)).expect_err("conflict");
    assert!(err.is_conflict());
    match err {
        EngineError::Mutation(MutationError::Conflict {
            task_id,
            field,
            expected,
            actual,
        }) => {
            assert_eq!(task_id, "issue-42");
            assert_eq!(field, TaskField::State);
            assert_eq!(expected, "closed");
            assert_eq!(actual, "open");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    let history = engine.mutation_log().history(10).expect("history");
    assert_eq!(history[0].state, MutationState::Applied);
}

#[test]
fn undo_outside_the_commit_window_is_rejected() {
    let temp = TempDir::new().expect("tempdir");
    let engine = engine(temp.path(), (1..=4).map(task).collect());
    let first = committed_hash(run(&engine, done("issue-1")).expect("first"));
    run(&engine, done("issue-2")).expect("second");
    run(&engine, done("issue-3")).expect("third");

    let err = run(
        &engine,
        Operation::Undo {
            hash: first.clone(),
            window: Some(2),
        },
    )
    .expect_err("outside window");
    assert!(matches!(
        err,
        EngineError::Mutation(MutationError::InvalidState { .. })
    ));

    // A wider window reaches it.
    run(
        &engine,
        Operation::Undo {
            hash: first,
            window: Some(3),
        },
    )
    .expect("inside window");
    assert!(engine.store().get_task(REPO, "issue-1").expect("task").is_open());

    let err = run(
        &engine,
        Operation::Undo {
            hash: "abcdef0".to_string(),
            window: Some(0),
        },
    )
    .expect_err("zero window");
    assert!(matches!(err, EngineError::Validation(_)));
}

#[test]
fn undoing_twice_is_an_invalid_state() {
    let temp = TempDir::new().expect("tempdir");
    let engine = engine(temp.path(), vec![task(5)]);
    let hash = committed_hash(run(&engine, done("issue-5")).expect("done"));
    run(&engine, undo(&hash)).expect("first undo");

    let err = run(&engine, undo(&hash)).expect_err("second undo");
    match err {
        EngineError::Mutation(MutationError::InvalidState { reason, .. }) => {
            assert_eq!(reason, "already undone");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn feedback_is_recorded_against_the_reverted_mutation() {
    let temp = TempDir::new().expect("tempdir");
    let engine = engine(temp.path(), vec![task(9)]);
    let hash = committed_hash(run(&engine, done("issue-9")).expect("done"));
    run(&engine, undo(&hash)).expect("undo");

    let outcome = run(
        &engine,
        Operation::Feedback {
            hash: hash[..10].to_string(),
            reason: "closed the wrong issue".to_string(),
            severity: FeedbackSeverity::High,
            flow_area: Some("update".to_string()),
        },
    )
    .expect("feedback");
    let Outcome::Feedback(feedback) = outcome else {
        panic!("expected feedback outcome");
    };
    assert_eq!(feedback.hash, hash);

    let history = run(&engine, Operation::History { limit: 5 }).expect("history");
    let Outcome::History { records } = history else {
        panic!("expected history");
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, MutationState::Undone);
    assert_eq!(records[0].feedback.len(), 1);
    assert_eq!(records[0].feedback[0].severity, FeedbackSeverity::High);
}

/// Rejects field writes to chosen tasks once their allowance is used up.
struct FlakyStore {
    inner: LocalIssueStore,
    allowance: RefCell<BTreeMap<String, usize>>,
}

impl FlakyStore {
    fn new(inner: LocalIssueStore, allowance: &[(&str, usize)]) -> Self {
        Self {
            inner,
            allowance: RefCell::new(
                allowance
                    .iter()
                    .map(|(id, left)| (id.to_string(), *left))
                    .collect(),
            ),
        }
    }
}

impl IssueStore for FlakyStore {
    fn get_tasks(&self, repo: &str, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.inner.get_tasks(repo, filter)
    }

    fn get_task(&self, repo: &str, task_id: &str) -> Result<Task, StoreError> {
        self.inner.get_task(repo, task_id)
    }

    fn update_task_field(
        &self,
        task_id: &str,
        field: TaskField,
        value: &FieldValue,
    ) -> Result<Task, StoreError> {
        if let Some(left) = self.allowance.borrow_mut().get_mut(task_id) {
            if *left == 0 {
                return Err(StoreError::rejected(task_id, "write refused"));
            }
            *left -= 1;
        }
        self.inner.update_task_field(task_id, field, value)
    }

    fn create_task(&self, repo: &str, fields: NewTask) -> Result<Task, StoreError> {
        self.inner.create_task(repo, fields)
    }

    fn link_parent(&self, child_id: &str, parent_id: &str) -> Result<bool, StoreError> {
        self.inner.link_parent(child_id, parent_id)
    }

    fn reorder(&self, task_id: &str, after_id: Option<&str>) -> Result<bool, StoreError> {
        self.inner.reorder(task_id, after_id)
    }
}

fn flaky_engine(state_dir: &Path, allowance: &[(&str, usize)]) -> Engine {
    let mut parent = task(1);
    parent.labels.insert("epic".to_string());
    let mut child = task(2);
    child.parent_id = Some("issue-1".to_string());
    let mut grandchild = task(3);
    grandchild.parent_id = Some("issue-2".to_string());
    let store = FlakyStore::new(local_store(state_dir, vec![parent, child, grandchild]), allowance);
    Engine::new(REPO, state_dir, ResolvedConfig::default(), Box::new(store))
}

#[test]
fn failed_write_rolls_back_the_applied_prefix() {
    let temp = TempDir::new().expect("tempdir");
    // Closing issue-2 writes its state, then re-parents issue-3.
    let engine = flaky_engine(temp.path(), &[("issue-3", 0)]);

    let err = run(&engine, done("issue-2")).expect_err("partial apply");
    assert_eq!(err.severity(), Severity::Error);
    match &err {
        EngineError::Mutation(MutationError::PartialApply {
            task_id, applied, ..
        }) => {
            assert_eq!(task_id, "issue-3");
            assert_eq!(*applied, 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    assert!(engine.store().get_task(REPO, "issue-2").expect("task").is_open());
    assert!(engine.mutation_log().history(10).expect("history").is_empty());
}

#[test]
fn failed_rollback_is_critical_and_names_both_tasks() {
    let temp = TempDir::new().expect("tempdir");
    let engine = flaky_engine(temp.path(), &[("issue-2", 1), ("issue-3", 0)]);

    let err = run(&engine, done("issue-2")).expect_err("rollback failed");
    assert_eq!(err.severity(), Severity::Critical);
    match &err {
        EngineError::Mutation(MutationError::RollbackFailed {
            task_id,
            rollback_task_id,
            ..
        }) => {
            assert_eq!(task_id, "issue-3");
            assert_eq!(rollback_task_id, "issue-2");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(engine.mutation_log().history(10).expect("history").is_empty());
}

/// A second process on the same state dir: no import, just open.
fn attach(state_dir: &Path) -> Engine {
    engine(state_dir, Vec::new())
}

#[test]
fn engines_sharing_a_state_dir_keep_each_others_commits() {
    let temp = TempDir::new().expect("tempdir");
    let cli = engine(temp.path(), vec![task(1), task(2)]);
    let cron = attach(temp.path());

    run(&cli, done("issue-1")).expect("close from cli");
    run(
        &cron,
        Operation::Update {
            task_id: "issue-2".to_string(),
            done: false,
            notes: Some("triaged overnight".to_string()),
        },
    )
    .expect("notes from cron");

    let reopened = attach(temp.path());
    let one = reopened.store().get_task(REPO, "issue-1").expect("issue-1");
    let two = reopened.store().get_task(REPO, "issue-2").expect("issue-2");
    assert_eq!(one.state, TaskState::Closed);
    assert_eq!(two.notes.as_deref(), Some("triaged overnight"));
    assert_eq!(reopened.mutation_log().history(10).expect("history").len(), 2);

    // The second process sees the close and refuses to apply it again.
    let again = run(&cron, done("issue-1")).expect_err("already closed");
    assert_eq!(again.severity(), Severity::Warning);
    assert_eq!(reopened.mutation_log().history(10).expect("history").len(), 2);
}

#[test]
fn proposal_overtaken_by_another_engine_conflicts() {
    let temp = TempDir::new().expect("tempdir");
    let cli = engine(temp.path(), vec![task(1)]);
    let cron = attach(temp.path());

    let log = cron.mutation_log();
    let stale = log
        .propose(
            "cron",
            "close issue-1",
            vec![FieldChange::new(
                "issue-1",
                TaskField::State,
                FieldValue::from("open"),
                FieldValue::from("closed"),
            )],
        )
        .expect("propose");
    run(
        &cli,
        Operation::Update {
            task_id: "issue-1".to_string(),
            done: false,
            notes: Some("investigating".to_string()),
        },
    )
    .expect("notes");
    run(&cli, done("issue-1")).expect("close from cli");

    let ctx = cron.context("cron", Utc::now());
    let err = log.commit(stale, &ctx.deadline).expect_err("conflict");
    match err {
        MutationError::Conflict {
            task_id,
            field,
            expected,
            actual,
        } => {
            assert_eq!(task_id, "issue-1");
            assert_eq!(field, TaskField::State);
            assert_eq!(expected, "open");
            assert_eq!(actual, "closed");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(log.history(10).expect("history").len(), 2);
}

#[test]
fn unreadable_log_fails_the_commit_before_any_write() {
    let temp = TempDir::new().expect("tempdir");
    let engine = engine(temp.path(), vec![task(42)]);
    let log_path = engine.mutation_log().log_path().to_path_buf();
    fs::create_dir_all(mutations_dir(temp.path())).expect("dir");
    fs::write(&log_path, "{torn line\n").expect("write");

    let err = run(&engine, done("issue-42")).expect_err("corrupt log");
    assert!(matches!(
        err,
        EngineError::Mutation(MutationError::Corrupt(_))
    ));
    assert!(engine.store().get_task(REPO, "issue-42").expect("task").is_open());
}

/// Makes the mutation log unwritable right after the batch's last field
/// write, optionally refusing every write after that.
struct LogBreakingStore {
    inner: LocalIssueStore,
    log_path: PathBuf,
    writes_left: Cell<usize>,
    refuse_after_break: bool,
}

impl IssueStore for LogBreakingStore {
    fn get_tasks(&self, repo: &str, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.inner.get_tasks(repo, filter)
    }

    fn get_task(&self, repo: &str, task_id: &str) -> Result<Task, StoreError> {
        self.inner.get_task(repo, task_id)
    }

    fn update_task_field(
        &self,
        task_id: &str,
        field: TaskField,
        value: &FieldValue,
    ) -> Result<Task, StoreError> {
        let left = self.writes_left.get();
        if left == 0 && self.refuse_after_break {
            return Err(StoreError::rejected(task_id, "write refused"));
        }
        let updated = self.inner.update_task_field(task_id, field, value)?;
        if left == 1 {
            fs::create_dir_all(&self.log_path).map_err(StoreError::from)?;
        }
        self.writes_left.set(left.saturating_sub(1));
        Ok(updated)
    }

    fn create_task(&self, repo: &str, fields: NewTask) -> Result<Task, StoreError> {
        self.inner.create_task(repo, fields)
    }

    fn link_parent(&self, child_id: &str, parent_id: &str) -> Result<bool, StoreError> {
        self.inner.link_parent(child_id, parent_id)
    }

    fn reorder(&self, task_id: &str, after_id: Option<&str>) -> Result<bool, StoreError> {
        self.inner.reorder(task_id, after_id)
    }
}

fn log_breaking_engine(state_dir: &Path, refuse_after_break: bool) -> Engine {
    let store = LogBreakingStore {
        inner: local_store(state_dir, vec![task(7)]),
        log_path: mutations_dir(state_dir).join(format!("{}.jsonl", repo_key(REPO))),
        writes_left: Cell::new(1),
        refuse_after_break,
    };
    Engine::new(REPO, state_dir, ResolvedConfig::default(), Box::new(store))
}

#[test]
fn unrecorded_commit_is_rolled_back() {
    let temp = TempDir::new().expect("tempdir");
    let engine = log_breaking_engine(temp.path(), false);

    let err = run(&engine, done("issue-7")).expect_err("log append fails");
    assert_eq!(err.severity(), Severity::Error);
    match &err {
        EngineError::Mutation(MutationError::PartialApply {
            task_id, applied, ..
        }) => {
            assert_eq!(task_id, "issue-7");
            assert_eq!(*applied, 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(engine.store().get_task(REPO, "issue-7").expect("task").is_open());
}

#[test]
fn unrecorded_commit_with_failed_rollback_is_critical() {
    let temp = TempDir::new().expect("tempdir");
    let engine = log_breaking_engine(temp.path(), true);

    let err = run(&engine, done("issue-7")).expect_err("log append fails");
    assert_eq!(err.severity(), Severity::Critical);
    match &err {
        EngineError::Mutation(MutationError::RollbackFailed {
            rollback_task_id,
            ..
        }) => assert_eq!(rollback_task_id, "issue-7"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(
        engine.store().get_task(REPO, "issue-7").expect("task").state,
        TaskState::Closed
    );
}
