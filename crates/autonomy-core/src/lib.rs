//! Core engine for the autonomy task-board assistant.

pub mod audit;
pub mod config;
pub mod doctor;
pub mod engine;
pub mod field_cache;
pub mod hierarchy;
pub mod mutation;
pub mod overrides;
pub mod paths;
pub mod ranking;
pub mod retry;
pub mod store;
pub mod task;

#[cfg(test)]
mod test_env;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::version;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
