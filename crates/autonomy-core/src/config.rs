use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::task::PriorityLabel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Scoring signals understood by the ranking engine.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    PriorityField,
    SprintProximity,
    IssueAge,
    BlockedPenalty,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::PriorityField => "priority_field",
            Signal::SprintProximity => "sprint_proximity",
            Signal::IssueAge => "issue_age",
            Signal::BlockedPenalty => "blocked_penalty",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "priority_field" => Some(Self::PriorityField),
            "sprint_proximity" => Some(Self::SprintProximity),
            "issue_age" => Some(Self::IssueAge),
            "blocked_penalty" => Some(Self::BlockedPenalty),
            _ => None,
        }
    }

    pub fn all() -> [Signal; 4] {
        [
            Self::PriorityField,
            Self::SprintProximity,
            Self::IssueAge,
            Self::BlockedPenalty,
        ]
    }
}

/// Validated signal weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Weights {
    pub priority_field: f64,
    pub sprint_proximity: f64,
    pub issue_age: f64,
    pub blocked_penalty: f64,
}

impl Weights {
    pub fn get(&self, signal: Signal) -> f64 {
        match signal {
            Signal::PriorityField => self.priority_field,
            Signal::SprintProximity => self.sprint_proximity,
            Signal::IssueAge => self.issue_age,
            Signal::BlockedPenalty => self.blocked_penalty,
        }
    }
}

/// Raw `[ranking]` section as written in TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RankingSection {
    pub weights: BTreeMap<String, f64>,
    pub excluded_labels: BTreeSet<String>,
    pub priority_mapping: BTreeMap<String, i64>,
    pub max_age_days: u32,
    pub sprints: BTreeMap<String, NaiveDate>,
}

impl Default for RankingSection {
    fn default() -> Self {
        let weights = Signal::all()
            .into_iter()
            .zip([5.0, 3.0, 1.0, -100.0])
            .map(|(signal, weight)| (signal.as_str().to_string(), weight))
            .collect();
        let priority_mapping = PriorityLabel::all()
            .into_iter()
            .zip([4, 3, 2, 1])
            .map(|(label, value)| (label.as_str().to_string(), value))
            .collect();
        Self {
            weights,
            excluded_labels: BTreeSet::from(["blocked".to_string()]),
            priority_mapping,
            max_age_days: 90,
            sprints: BTreeMap::new(),
        }
    }
}

/// Ranking configuration after validation. Only constructible through
/// [`RankingSection::validate`], so holding one means the blocked penalty
/// is known to sink every blocked task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingConfig {
    pub weights: Weights,
    pub excluded_labels: BTreeSet<String>,
    pub priority_mapping: BTreeMap<PriorityLabel, i64>,
    pub max_age_days: u32,
    pub sprints: BTreeMap<String, NaiveDate>,
}

impl Default for RankingConfig {
    fn default() -> Self {
        match RankingSection::default().validate() {
            Ok(config) => config,
            Err(err) => unreachable!("built-in ranking defaults are invalid: {err}"),
        }
    }
}

impl RankingSection {
    pub fn validate(&self) -> Result<RankingConfig, ConfigError> {
        for name in self.weights.keys() {
            if Signal::parse(name).is_none() {
                return Err(ConfigError::invalid(
                    format!("ranking.weights.{}", name),
                    "unknown signal",
                ));
            }
        }
        let weight = |signal: Signal| -> Result<f64, ConfigError> {
            let field = format!("ranking.weights.{}", signal.as_str());
            let value = *self
                .weights
                .get(signal.as_str())
                .ok_or_else(|| ConfigError::invalid(&field, "missing"))?;
            if !value.is_finite() {
                return Err(ConfigError::invalid(&field, "must be a finite number"));
            }
            Ok(value)
        };
        let weights = Weights {
            priority_field: weight(Signal::PriorityField)?,
            sprint_proximity: weight(Signal::SprintProximity)?,
            issue_age: weight(Signal::IssueAge)?,
            blocked_penalty: weight(Signal::BlockedPenalty)?,
        };

        let mut priority_mapping = BTreeMap::new();
        for (name, value) in &self.priority_mapping {
            let label = PriorityLabel::parse(name).ok_or_else(|| {
                ConfigError::invalid(
                    format!("ranking.priority_mapping.{}", name),
                    "unknown priority",
                )
            })?;
            if *value < 0 {
                return Err(ConfigError::invalid(
                    format!("ranking.priority_mapping.{}", name),
                    "must not be negative",
                ));
            }
            priority_mapping.insert(label, *value);
        }
        for label in PriorityLabel::all() {
            if !priority_mapping.contains_key(&label) {
                return Err(ConfigError::invalid(
                    format!("ranking.priority_mapping.{}", label),
                    "missing",
                ));
            }
        }

        if self.max_age_days == 0 {
            return Err(ConfigError::invalid(
                "ranking.max_age_days",
                "must be greater than zero",
            ));
        }

        let max_priority = priority_mapping.values().copied().max().unwrap_or(0) as f64;
        let age_ceiling = (1.0 + f64::from(self.max_age_days)).ln();
        let span = weights.priority_field.abs() * max_priority
            + weights.sprint_proximity.abs()
            + weights.issue_age.abs() * age_ceiling;
        if weights.blocked_penalty >= -span {
            return Err(ConfigError::invalid(
                "ranking.weights.blocked_penalty",
                format!(
                    "must be below -{:.2} so blocked tasks always rank under unblocked ones",
                    span
                ),
            ));
        }

        let smallest_step = smallest_priority_step(&priority_mapping) as f64;
        if weights.issue_age.abs() * age_ceiling > weights.priority_field.abs() * smallest_step {
            warn!(
                max_age_days = self.max_age_days,
                "issue_age can outweigh a full priority step; consider lowering max_age_days"
            );
        }

        Ok(RankingConfig {
            weights,
            excluded_labels: self
                .excluded_labels
                .iter()
                .map(|label| label.trim().to_lowercase())
                .filter(|label| !label.is_empty())
                .collect(),
            priority_mapping,
            max_age_days: self.max_age_days,
            sprints: self.sprints.clone(),
        })
    }
}

fn smallest_priority_step(mapping: &BTreeMap<PriorityLabel, i64>) -> i64 {
    let mut values: Vec<i64> = mapping.values().copied().collect();
    values.sort_unstable();
    values.dedup();
    values
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .min()
        .unwrap_or(1)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DoctorConfig {
    pub stale_days: i64,
    pub checklist_limit: usize,
    pub duplicate_threshold: f64,
}

impl Default for DoctorConfig {
    fn default() -> Self {
        Self {
            stale_days: 14,
            checklist_limit: 10,
            duplicate_threshold: 0.9,
        }
    }
}

impl DoctorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_days <= 0 {
            return Err(ConfigError::invalid(
                "doctor.stale_days",
                "must be greater than zero",
            ));
        }
        if !(self.duplicate_threshold > 0.0 && self.duplicate_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "doctor.duplicate_threshold",
                "must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HierarchyConfig {
    pub orphan_threshold: usize,
    pub epic_label: String,
    pub feature_label: String,
    pub task_label: String,
    pub subtask_labels: Vec<String>,
    pub group_label_prefix: String,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            orphan_threshold: 3,
            epic_label: "epic".to_string(),
            feature_label: "feature".to_string(),
            task_label: "task".to_string(),
            subtask_labels: vec!["subtask".to_string(), "sub-task".to_string()],
            group_label_prefix: "epic:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UndoConfig {
    pub commit_window: usize,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self { commit_window: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub field_cache_ttl_secs: u64,
    pub deadline_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            field_cache_ttl_secs: 300,
            deadline_secs: 30,
        }
    }
}

impl StoreConfig {
    pub fn field_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.field_cache_ttl_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// One config file. Absent sections fall through to the next layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AutonomyConfig {
    pub ranking: Option<RankingSection>,
    pub doctor: Option<DoctorConfig>,
    pub hierarchy: Option<HierarchyConfig>,
    pub undo: Option<UndoConfig>,
    pub retry: Option<RetryConfig>,
    pub store: Option<StoreConfig>,
}

/// Effective configuration with each section validated.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub ranking: RankingConfig,
    pub doctor: DoctorConfig,
    pub hierarchy: HierarchyConfig,
    pub undo: UndoConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    pub sources: BTreeMap<&'static str, &'static str>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        match resolve_layers(None, None) {
            Ok(config) => config,
            Err(err) => unreachable!("built-in defaults are invalid: {err}"),
        }
    }
}

pub fn config_filename_candidates() -> [&'static str; 2] {
    [".autonomy.toml", ".autonomyrc"]
}

pub fn config_path(repo_root: &Path) -> PathBuf {
    repo_root.join(".autonomy.toml")
}

pub fn resolve_user_home_dir() -> Option<PathBuf> {
    for key in ["HOME", "USERPROFILE"] {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
    }
    None
}

pub fn resolve_autonomy_home_dir() -> Option<PathBuf> {
    if let Ok(value) = std::env::var("AUTONOMY_HOME") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    resolve_user_home_dir().map(|home| home.join(".autonomy"))
}

pub fn global_config_path() -> Option<PathBuf> {
    resolve_autonomy_home_dir().map(|home| home.join("config.toml"))
}

pub fn find_config_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    for candidate in start.ancestors() {
        for name in config_filename_candidates() {
            if candidate.join(name).is_file() {
                return Some(candidate.to_path_buf());
            }
        }
    }
    None
}

fn read_config_file(path: &Path) -> Result<AutonomyConfig, ConfigError> {
    let text = fs::read_to_string(path)?;
    toml::from_str::<AutonomyConfig>(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Project config, if any. A file that exists but does not parse is an error.
pub fn load_config(repo_root: &Path) -> Result<Option<AutonomyConfig>, ConfigError> {
    for name in config_filename_candidates() {
        let path = repo_root.join(name);
        if path.is_file() {
            return read_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

pub fn load_global_config() -> Result<Option<AutonomyConfig>, ConfigError> {
    let Some(path) = global_config_path() else {
        return Ok(None);
    };
    if !path.is_file() {
        return Ok(None);
    }
    read_config_file(&path).map(Some)
}

pub fn write_config(repo_root: &Path, config: &AutonomyConfig) -> Result<PathBuf, ConfigError> {
    let path = config_path(repo_root);
    let body = toml::to_string_pretty(config)?;
    fs::write(&path, body)?;
    Ok(path)
}

/// Resolve project > global > default per section and validate the result.
pub fn resolve_config(repo_root: &Path) -> Result<ResolvedConfig, ConfigError> {
    let project = load_config(repo_root)?;
    let global = load_global_config()?;
    resolve_layers(project.as_ref(), global.as_ref())
}

pub fn resolve_layers(
    project: Option<&AutonomyConfig>,
    global: Option<&AutonomyConfig>,
) -> Result<ResolvedConfig, ConfigError> {
    let mut sources = BTreeMap::new();

    macro_rules! pick {
        ($section:ident) => {{
            if let Some(value) = project.and_then(|c| c.$section.clone()) {
                sources.insert(stringify!($section), "project");
                value
            } else if let Some(value) = global.and_then(|c| c.$section.clone()) {
                sources.insert(stringify!($section), "global");
                value
            } else {
                sources.insert(stringify!($section), "default");
                Default::default()
            }
        }};
    }

    let ranking_section: RankingSection = pick!(ranking);
    let doctor: DoctorConfig = pick!(doctor);
    let hierarchy: HierarchyConfig = pick!(hierarchy);
    let undo: UndoConfig = pick!(undo);
    let retry: RetryConfig = pick!(retry);
    let store: StoreConfig = pick!(store);

    let ranking = ranking_section.validate()?;
    doctor.validate()?;
    if undo.commit_window == 0 {
        return Err(ConfigError::invalid(
            "undo.commit_window",
            "must be at least 1",
        ));
    }
    if retry.max_attempts == 0 {
        return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
    }
    if retry.max_backoff_ms < retry.initial_backoff_ms {
        return Err(ConfigError::invalid(
            "retry.max_backoff_ms",
            "must be >= retry.initial_backoff_ms",
        ));
    }

    Ok(ResolvedConfig {
        ranking,
        doctor,
        hierarchy,
        undo,
        retry,
        store,
        sources,
    })
}
