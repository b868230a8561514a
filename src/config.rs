//! Workflow configuration with defaults and environment overrides

use anyhow::Context;
use chrono::Duration;
use std::path::PathBuf;

pub const ENV_DB_PATH: &str = "ARTISAN_WORKFLOW_DB_PATH";
pub const ENV_ESTIMATE_VALIDITY_DAYS: &str = "ARTISAN_WORKFLOW_ESTIMATE_VALIDITY_DAYS";
pub const ENV_MAX_LINE_ITEMS: &str = "ARTISAN_WORKFLOW_MAX_LINE_ITEMS";
pub const ENV_REQUIRE_DISPUTE_REASON: &str = "ARTISAN_WORKFLOW_REQUIRE_DISPUTE_REASON";

/// Upper bound on the default estimate validity, in days.
pub const MAX_ESTIMATE_VALIDITY_DAYS: i64 = 3_650;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// Where the sled ledger lives.
    pub db_path: PathBuf,
    /// Deadline applied to estimates issued without one. `None` means estimates never expire.
    pub estimate_validity: Option<Duration>,
    pub max_line_items: usize,
    pub require_dispute_reason: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("artisan_workflow.db"),
            estimate_validity: Some(Duration::days(30)),
            max_line_items: 100,
            require_dispute_reason: true,
        }
    }
}

impl WorkflowConfig {
    pub fn set_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }
    pub fn set_estimate_validity(mut self, validity: Option<Duration>) -> Self {
        self.estimate_validity = validity;
        self
    }
    pub fn set_max_line_items(mut self, max: usize) -> Self {
        self.max_line_items = max;
        self
    }
    pub fn set_require_dispute_reason(mut self, required: bool) -> Self {
        self.require_dispute_reason = required;
        self
    }

    /// Defaults overridden by whichever `ARTISAN_WORKFLOW_*` variables are set.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_DB_PATH) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(days) = lookup(ENV_ESTIMATE_VALIDITY_DAYS) {
            let days: i64 = days.trim().parse().with_context(|| {
                format!("{ENV_ESTIMATE_VALIDITY_DAYS} must be a whole number of days")
            })?;
            anyhow::ensure!(
                (0..=MAX_ESTIMATE_VALIDITY_DAYS).contains(&days),
                "{ENV_ESTIMATE_VALIDITY_DAYS} must be between 0 and {MAX_ESTIMATE_VALIDITY_DAYS}"
            );
            config.estimate_validity = match days {
                0 => None,
                days => Some(
                    Duration::try_days(days)
                        .with_context(|| format!("{days} days is not a representable duration"))?,
                ),
            };
        }
        if let Some(max) = lookup(ENV_MAX_LINE_ITEMS) {
            config.max_line_items = max
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MAX_LINE_ITEMS} must be a positive integer"))?;
            anyhow::ensure!(config.max_line_items > 0, "{ENV_MAX_LINE_ITEMS} must be positive");
        }
        if let Some(flag) = lookup(ENV_REQUIRE_DISPUTE_REASON) {
            config.require_dispute_reason = flag
                .trim()
                .parse()
                .with_context(|| format!("{ENV_REQUIRE_DISPUTE_REASON} must be true or false"))?;
        }

        tracing::debug!(?config, "workflow configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let config = WorkflowConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WorkflowConfig::default());
        assert_eq!(config.estimate_validity, Some(Duration::days(30)));
    }

    #[test]
    fn overrides_are_applied() {
        let config = WorkflowConfig::from_lookup(lookup(&[
            (ENV_DB_PATH, "/tmp/ledger"),
            (ENV_ESTIMATE_VALIDITY_DAYS, "0"),
            (ENV_MAX_LINE_ITEMS, "12"),
            (ENV_REQUIRE_DISPUTE_REASON, "false"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/ledger"));
        assert_eq!(config.estimate_validity, None);
        assert_eq!(config.max_line_items, 12);
        assert!(!config.require_dispute_reason);
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(WorkflowConfig::from_lookup(lookup(&[(ENV_MAX_LINE_ITEMS, "lots")])).is_err());
        assert!(
            WorkflowConfig::from_lookup(lookup(&[(ENV_ESTIMATE_VALIDITY_DAYS, "-3")])).is_err()
        );
    }

    #[test]
    fn oversized_validity_is_an_error() {
        for days in ["3651", "100000000", "200000000000"] {
            let result = WorkflowConfig::from_lookup(lookup(&[(ENV_ESTIMATE_VALIDITY_DAYS, days)]));
            assert!(result.is_err(), "{days} days should be refused");
        }

        let config =
            WorkflowConfig::from_lookup(lookup(&[(ENV_ESTIMATE_VALIDITY_DAYS, "3650")])).unwrap();
        assert_eq!(config.estimate_validity, Some(Duration::days(3_650)));
    }
}
