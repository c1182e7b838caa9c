use std::path::{Path, PathBuf};

use crate::config::config_filename_candidates;

pub const STATE_DIR_NAME: &str = ".autonomy";

pub fn state_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(STATE_DIR_NAME)
}

/// Nearest ancestor holding a config file, a state directory or `.git`.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    start
        .ancestors()
        .find(|candidate| {
            config_filename_candidates()
                .iter()
                .any(|name| candidate.join(name).is_file())
                || candidate.join(STATE_DIR_NAME).is_dir()
                || candidate.join(".git").exists()
        })
        .map(Path::to_path_buf)
}

/// `owner/name` used when no repository is given: `local/<directory>`.
pub fn default_repo_name(repo_root: &Path) -> String {
    let name = repo_root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "repo".to_string());
    format!("local/{}", name)
}
