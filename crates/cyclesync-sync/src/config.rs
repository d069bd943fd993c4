use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use cyclesync_storage::{
    BackoffPolicy, LogOnlySink, MonitorSink, PushNotifier, TableName, WarehouseCapabilities,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_TABLE: &str = "wash_cycles";
const DEFAULT_SYNC_CRON: &str = "0 0 * * * *";
const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "snapshot window is not configured; set CYCLESYNC_SNAPSHOT_WINDOW_DAYS, snapshot_window_days or --window-days"
    )]
    MissingSnapshotWindow,
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("write strategy {strategy} needs immediate row mutation, which the {backend} warehouse does not support")]
    UnsupportedStrategy {
        strategy: &'static str,
        backend: &'static str,
    },
    #[error("reading {}: {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Protocol used to persist New and Changed rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// Delete changed ids, then append New and Changed rows.
    DeleteInsert,
    /// Append New rows; merge Changed rows from a staging table.
    StageMerge,
    /// Load New and Changed rows into a staging table; merge once.
    LoadMerge,
}

impl WriteStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeleteInsert => "delete-insert",
            Self::StageMerge => "stage-merge",
            Self::LoadMerge => "load-merge",
        }
    }

    pub fn requires_immediate_row_mutation(self) -> bool {
        matches!(self, Self::DeleteInsert)
    }
}

impl std::fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured strategy before it is checked against a warehouse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyPreference {
    /// Delete-insert when the warehouse can mutate fresh rows, load-merge otherwise.
    #[default]
    Auto,
    DeleteInsert,
    StageMerge,
    LoadMerge,
}

impl StrategyPreference {
    pub fn resolve(
        self,
        capabilities: WarehouseCapabilities,
        backend: &'static str,
    ) -> Result<WriteStrategy, ConfigError> {
        let strategy = match self {
            Self::Auto if capabilities.supports_immediate_row_mutation => WriteStrategy::DeleteInsert,
            Self::Auto => WriteStrategy::LoadMerge,
            Self::DeleteInsert => WriteStrategy::DeleteInsert,
            Self::StageMerge => WriteStrategy::StageMerge,
            Self::LoadMerge => WriteStrategy::LoadMerge,
        };
        if strategy.requires_immediate_row_mutation() && !capabilities.supports_immediate_row_mutation {
            return Err(ConfigError::UnsupportedStrategy {
                strategy: strategy.as_str(),
                backend,
            });
        }
        Ok(strategy)
    }
}

impl FromStr for StrategyPreference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "auto" => Ok(Self::Auto),
            "delete-insert" => Ok(Self::DeleteInsert),
            "stage-merge" => Ok(Self::StageMerge),
            "load-merge" => Ok(Self::LoadMerge),
            _ => Err(ConfigError::InvalidValue {
                key: "CYCLESYNC_WRITE_STRATEGY",
                value: s.to_string(),
            }),
        }
    }
}

/// The explicit per-run configuration handed to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    /// How far back from now stored rows are consulted when classifying.
    pub snapshot_window: TimeDelta,
    pub write_strategy: WriteStrategy,
    /// Classify and report without writing or notifying.
    pub dry_run: bool,
}

/// Process configuration: environment first, then an optional YAML file,
/// then command-line overrides.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub table: TableName,
    pub snapshot_window_days: Option<u32>,
    pub write_strategy: StrategyPreference,
    pub dry_run: bool,
    pub monitor_push_url: Option<String>,
    pub notify_timeout_secs: u64,
    pub reports_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

/// Keys accepted in a `--config` YAML file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileOverrides {
    pub database_url: Option<String>,
    pub table: Option<String>,
    pub snapshot_window_days: Option<u32>,
    pub write_strategy: Option<StrategyPreference>,
    pub dry_run: Option<bool>,
    pub monitor_push_url: Option<String>,
    pub notify_timeout_secs: Option<u64>,
    pub reports_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub scheduler_enabled: Option<bool>,
    pub sync_cron: Option<String>,
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

fn parse_number<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let table = lookup("CYCLESYNC_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string());
        let table = TableName::parse(table.clone()).map_err(|_| ConfigError::InvalidValue {
            key: "CYCLESYNC_TABLE",
            value: table,
        })?;

        Ok(Self {
            database_url: non_empty(lookup("DATABASE_URL")),
            table,
            snapshot_window_days: non_empty(lookup("CYCLESYNC_SNAPSHOT_WINDOW_DAYS"))
                .map(|v| parse_number("CYCLESYNC_SNAPSHOT_WINDOW_DAYS", v))
                .transpose()?,
            write_strategy: lookup("CYCLESYNC_WRITE_STRATEGY")
                .map(|v| v.parse::<StrategyPreference>())
                .transpose()?
                .unwrap_or_default(),
            dry_run: lookup("CYCLESYNC_DRY_RUN").is_some_and(|v| parse_flag(&v)),
            monitor_push_url: non_empty(lookup("UPTIME_KUMA_PUSH_URL")),
            notify_timeout_secs: lookup("CYCLESYNC_NOTIFY_TIMEOUT_SECS")
                .map(|v| parse_number("CYCLESYNC_NOTIFY_TIMEOUT_SECS", v))
                .transpose()?
                .unwrap_or(DEFAULT_NOTIFY_TIMEOUT_SECS),
            reports_dir: non_empty(lookup("CYCLESYNC_REPORTS_DIR")).map(PathBuf::from),
            archive_dir: non_empty(lookup("CYCLESYNC_ARCHIVE_DIR")).map(PathBuf::from),
            scheduler_enabled: lookup("CYCLESYNC_SCHEDULER_ENABLED").is_some_and(|v| parse_flag(&v)),
            sync_cron: non_empty(lookup("CYCLESYNC_SYNC_CRON")).unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }

    pub fn load_file(path: &Path) -> Result<FileOverrides, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply(&mut self, overrides: FileOverrides) -> Result<(), ConfigError> {
        if let Some(table) = overrides.table {
            self.table = TableName::parse(table.clone()).map_err(|_| ConfigError::InvalidValue {
                key: "table",
                value: table,
            })?;
        }
        if overrides.database_url.is_some() {
            self.database_url = overrides.database_url;
        }
        if overrides.snapshot_window_days.is_some() {
            self.snapshot_window_days = overrides.snapshot_window_days;
        }
        if let Some(strategy) = overrides.write_strategy {
            self.write_strategy = strategy;
        }
        if let Some(dry_run) = overrides.dry_run {
            self.dry_run = dry_run;
        }
        if overrides.monitor_push_url.is_some() {
            self.monitor_push_url = overrides.monitor_push_url;
        }
        if let Some(secs) = overrides.notify_timeout_secs {
            self.notify_timeout_secs = secs;
        }
        if overrides.reports_dir.is_some() {
            self.reports_dir = overrides.reports_dir;
        }
        if overrides.archive_dir.is_some() {
            self.archive_dir = overrides.archive_dir;
        }
        if let Some(enabled) = overrides.scheduler_enabled {
            self.scheduler_enabled = enabled;
        }
        if let Some(cron) = overrides.sync_cron {
            self.sync_cron = cron;
        }
        Ok(())
    }

    pub fn snapshot_window(&self) -> Result<TimeDelta, ConfigError> {
        let days = self.snapshot_window_days.ok_or(ConfigError::MissingSnapshotWindow)?;
        if days == 0 {
            return Err(ConfigError::InvalidValue {
                key: "snapshot_window_days",
                value: days.to_string(),
            });
        }
        TimeDelta::try_days(i64::from(days)).ok_or(ConfigError::InvalidValue {
            key: "snapshot_window_days",
            value: days.to_string(),
        })
    }

    /// Resolve the run configuration for a concrete warehouse. Fails before
    /// any write when the window is missing or the strategy cannot run there.
    pub fn run_config(
        &self,
        capabilities: WarehouseCapabilities,
        backend: &'static str,
    ) -> Result<RunConfig, ConfigError> {
        Ok(RunConfig {
            snapshot_window: self.snapshot_window()?,
            write_strategy: self.write_strategy.resolve(capabilities, backend)?,
            dry_run: self.dry_run,
        })
    }

    /// Push notifier when a URL is configured, otherwise a log-only sink.
    pub fn monitor_sink(&self) -> anyhow::Result<Arc<dyn MonitorSink>> {
        let sink: Arc<dyn MonitorSink> = match &self.monitor_push_url {
            Some(url) => Arc::new(PushNotifier::new(
                url.clone(),
                Duration::from_secs(self.notify_timeout_secs),
                BackoffPolicy::default(),
            )?),
            None => Arc::new(LogOnlySink),
        };
        Ok(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const APPEND_ONLY: WarehouseCapabilities = WarehouseCapabilities {
        supports_immediate_row_mutation: false,
    };
    const MUTABLE: WarehouseCapabilities = WarehouseCapabilities {
        supports_immediate_row_mutation: true,
    };

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = SyncConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.table.as_str(), "wash_cycles");
        assert_eq!(config.write_strategy, StrategyPreference::Auto);
        assert_eq!(config.sync_cron, "0 0 * * * *");
        assert!(!config.dry_run);
        assert!(config.monitor_push_url.is_none());
        assert!(matches!(
            config.run_config(MUTABLE, "memory"),
            Err(ConfigError::MissingSnapshotWindow)
        ));
    }

    #[test]
    fn environment_values_are_parsed() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("CYCLESYNC_TABLE", "cycles_eu"),
            ("CYCLESYNC_SNAPSHOT_WINDOW_DAYS", "7"),
            ("CYCLESYNC_WRITE_STRATEGY", "stage_merge"),
            ("CYCLESYNC_DRY_RUN", "true"),
            ("UPTIME_KUMA_PUSH_URL", "https://kuma.example/api/push/abc"),
        ]))
        .unwrap();
        let run = config.run_config(APPEND_ONLY, "memory").unwrap();
        assert_eq!(run.snapshot_window, TimeDelta::days(7));
        assert_eq!(run.write_strategy, WriteStrategy::StageMerge);
        assert!(run.dry_run);
        assert_eq!(config.table.as_str(), "cycles_eu");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(SyncConfig::from_lookup(lookup_from(&[("CYCLESYNC_TABLE", "cycles; drop")])).is_err());
        assert!(SyncConfig::from_lookup(lookup_from(&[("CYCLESYNC_WRITE_STRATEGY", "upsert")])).is_err());
        assert!(SyncConfig::from_lookup(lookup_from(&[("CYCLESYNC_SNAPSHOT_WINDOW_DAYS", "two")])).is_err());
        let zero = SyncConfig::from_lookup(lookup_from(&[("CYCLESYNC_SNAPSHOT_WINDOW_DAYS", "0")])).unwrap();
        assert!(zero.snapshot_window().is_err());
    }

    #[test]
    fn auto_strategy_follows_capability() {
        assert_eq!(
            StrategyPreference::Auto.resolve(MUTABLE, "postgres").unwrap(),
            WriteStrategy::DeleteInsert
        );
        assert_eq!(
            StrategyPreference::Auto.resolve(APPEND_ONLY, "memory").unwrap(),
            WriteStrategy::LoadMerge
        );
        assert!(matches!(
            StrategyPreference::DeleteInsert.resolve(APPEND_ONLY, "memory"),
            Err(ConfigError::UnsupportedStrategy { .. })
        ));
        assert_eq!(
            StrategyPreference::StageMerge.resolve(MUTABLE, "postgres").unwrap(),
            WriteStrategy::StageMerge
        );
    }

    #[test]
    fn yaml_file_overrides_environment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cyclesync.yaml");
        std::fs::write(
            &path,
            "snapshot_window_days: 2\nwrite_strategy: load-merge\nreports_dir: ./reports\n",
        )
        .unwrap();

        let mut config = SyncConfig::from_lookup(lookup_from(&[("CYCLESYNC_SNAPSHOT_WINDOW_DAYS", "7")])).unwrap();
        config.apply(SyncConfig::load_file(&path).unwrap()).unwrap();
        assert_eq!(config.snapshot_window_days, Some(2));
        assert_eq!(config.write_strategy, StrategyPreference::LoadMerge);
        assert_eq!(config.reports_dir, Some(PathBuf::from("./reports")));
    }

    #[test]
    fn unknown_yaml_keys_fail_loudly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "snapshot_windw_days: 2\n").unwrap();
        assert!(matches!(
            SyncConfig::load_file(&path),
            Err(ConfigError::ParseFile { .. })
        ));
    }
}
