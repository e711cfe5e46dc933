//! Configuration file support for caseport.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (prefixed with `CASEPORT_`, `__` between
//!    section and key, e.g. `CASEPORT_QASE__TOKEN`)
//! 3. An explicit `--config` file
//! 4. `./caseport.toml`
//! 5. `~/.config/caseport/config.toml`
//! 6. Built-in defaults
//!
//! Example config file:
//! ```toml
//! [testrail]
//! host = "https://example.testrail.io"
//! user = "me@example.com"
//! api_key = "..."
//!
//! [qase]
//! token = "..."            # or CASEPORT_QASE__TOKEN
//! scim_token = "..."       # optional, enables user provisioning
//!
//! [users]
//! default = 1              # destination user for unmatched source users
//! create = false
//!
//! [pools]
//! destination_workers = 8
//! destination_requests = 230
//! destination_interval_secs = 10
//! source_workers = 16
//!
//! [retry]
//! max_retries = 0
//!
//! [import]
//! attachments = true
//! runs = true
//!
//! [report]
//! prefix = "caseport"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use caseport::migrate::{DEFAULT_REPORT_PREFIX, MigrationOptions, StageToggles};
use caseport::qase::{QASE_API_URL, QASE_SCIM_URL};
use caseport::{PoolConfig, RetryConfig};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const REDACTED: &str = "********";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required keys are not set anywhere.
    #[error("missing required configuration: {}", keys.join(", "))]
    Missing { keys: Vec<&'static str> },

    /// A source could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Top-level configuration.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub testrail: TestRailConfig,
    pub qase: QaseConfig,
    pub users: UsersConfig,
    pub pools: PoolsConfig,
    pub retry: RetrySettings,
    /// Stage toggles.
    pub import: ImportConfig,
    pub report: ReportConfig,
}

/// Source instance.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TestRailConfig {
    /// Instance URL, e.g. `https://example.testrail.io`.
    pub host: Option<String>,
    pub user: Option<String>,
    pub api_key: Option<String>,
}

/// Destination workspace.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QaseConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub scim_url: String,
    /// SCIM token. User provisioning is only possible when set.
    pub scim_token: Option<String>,
}

impl Default for QaseConfig {
    fn default() -> Self {
        Self {
            api_url: QASE_API_URL.to_string(),
            token: None,
            scim_url: QASE_SCIM_URL.to_string(),
            scim_token: None,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UsersConfig {
    /// Destination user id that unmatched source users map to.
    pub default: Option<u64>,
    /// Provision unmatched active users through SCIM.
    pub create: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub destination_workers: usize,
    /// Destination requests allowed per window.
    pub destination_requests: usize,
    pub destination_interval_secs: u64,
    pub source_workers: usize,
    /// Optional cap on source requests per second.
    pub source_requests_per_second: Option<u32>,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            destination_workers: defaults.destination_workers,
            destination_requests: defaults.destination_requests,
            destination_interval_secs: defaults.destination_interval.as_secs(),
            source_workers: defaults.source_workers,
            source_requests_per_second: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Zero disables retrying.
    pub max_retries: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_retries: defaults.max_retries,
            min_delay_ms: defaults.min_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            jitter: defaults.with_jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImportConfig {
    pub users: bool,
    pub projects: bool,
    pub attachments: bool,
    pub fields: bool,
    pub configurations: bool,
    pub milestones: bool,
    pub suites: bool,
    pub shared_steps: bool,
    pub cases: bool,
    pub runs: bool,
    /// Migrate projects marked completed at the source.
    pub include_completed: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            users: true,
            projects: true,
            attachments: true,
            fields: true,
            configurations: true,
            milestones: true,
            suites: true,
            shared_steps: true,
            cases: true,
            runs: true,
            include_completed: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Where statistics checkpoints are written. Defaults to the state dir.
    pub dir: Option<PathBuf>,
    pub prefix: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: None,
            prefix: DEFAULT_REPORT_PREFIX.to_string(),
        }
    }
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// `explicit` must exist when given; the other files are optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(xdg_config) = Self::default_config_path()
            && xdg_config.exists()
        {
            tracing::debug!(path = %xdg_config.display(), "Loading config");
            builder = builder.add_source(
                File::from(xdg_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        let local_config = PathBuf::from("caseport.toml");
        if local_config.exists() {
            tracing::debug!("Loading config from ./caseport.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        if let Some(path) = explicit {
            tracing::debug!(path = %path.display(), "Loading config");
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        // CASEPORT_QASE__TOKEN -> qase.token
        builder = builder.add_source(
            Environment::with_prefix("CASEPORT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Check that every required key is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut keys = Vec::new();
        if is_blank(&self.testrail.host) {
            keys.push("testrail.host");
        }
        if is_blank(&self.testrail.user) {
            keys.push("testrail.user");
        }
        if is_blank(&self.testrail.api_key) {
            keys.push("testrail.api_key");
        }
        if is_blank(&self.qase.token) {
            keys.push("qase.token");
        }
        if self.users.default.is_none() {
            keys.push("users.default");
        }

        if keys.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing { keys })
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            destination_workers: self.pools.destination_workers.max(1),
            destination_requests: self.pools.destination_requests.max(1),
            destination_interval: Duration::from_secs(self.pools.destination_interval_secs.max(1)),
            source_workers: self.pools.source_workers.max(1),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            Duration::from_millis(self.retry.min_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.max_retries,
        )
        .with_jitter(self.retry.jitter)
    }

    pub fn stage_toggles(&self) -> StageToggles {
        let import = &self.import;
        StageToggles {
            users: import.users,
            projects: import.projects,
            attachments: import.attachments,
            fields: import.fields,
            configurations: import.configurations,
            milestones: import.milestones,
            suites: import.suites,
            shared_steps: import.shared_steps,
            cases: import.cases,
            runs: import.runs,
        }
    }

    pub fn migration_options(&self) -> MigrationOptions {
        MigrationOptions {
            stages: self.stage_toggles(),
            retry: self.retry_config(),
            create_missing_users: self.users.create,
            include_completed_projects: self.import.include_completed,
            report_prefix: self.report.prefix.clone(),
        }
    }

    /// Directory for statistics checkpoints.
    pub fn report_dir(&self) -> PathBuf {
        self.report
            .dir
            .clone()
            .or_else(Self::default_state_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Copy with every secret replaced, for display.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for secret in [
            &mut config.testrail.api_key,
            &mut config.qase.token,
            &mut config.qase.scim_token,
        ] {
            if secret.is_some() {
                *secret = Some(REDACTED.to_string());
            }
        }
        config
    }

    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "caseport").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// On Linux, `$XDG_STATE_HOME/caseport` or `~/.local/state/caseport`.
    /// Elsewhere falls back to the data directory.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "caseport").map(|dirs| {
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use caseport::StageKind;

    use super::*;

    fn parse(toml: &str) -> Config {
        ConfigBuilder::builder()
            .add_source(config::File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    fn complete() -> Config {
        parse(
            r#"
            [testrail]
            host = "https://tr.example.com"
            user = "me@example.com"
            api_key = "tr-key"

            [qase]
            token = "qase-token"

            [users]
            default = 7
            "#,
        )
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.qase.api_url, QASE_API_URL);
        assert_eq!(config.pools.destination_requests, 230);
        assert_eq!(config.pools.destination_interval_secs, 10);
        assert_eq!(config.pools.source_workers, 16);
        assert_eq!(config.retry.max_retries, 0);
        assert!(config.import.runs);
        assert_eq!(config.report.prefix, DEFAULT_REPORT_PREFIX);
        assert!(!config.users.create);
    }

    #[test]
    fn test_validate_lists_every_missing_key() {
        let err = Config::default().validate().unwrap_err();
        let ConfigError::Missing { keys } = err else {
            panic!("expected missing keys");
        };
        assert_eq!(
            keys,
            [
                "testrail.host",
                "testrail.user",
                "testrail.api_key",
                "qase.token",
                "users.default"
            ]
        );

        complete().validate().unwrap();
    }

    #[test]
    fn test_blank_values_count_as_missing() {
        let mut config = complete();
        config.qase.token = Some("   ".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("qase.token"));
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let config = parse(
            r#"
            [pools]
            destination_workers = 2

            [import]
            attachments = false
            "#,
        );

        assert_eq!(config.pools.destination_workers, 2);
        assert_eq!(config.pools.destination_requests, 230);
        let options = config.migration_options();
        assert!(!options.stages.is_enabled(StageKind::Attachments));
        assert!(options.stages.is_enabled(StageKind::Cases));
    }

    #[test]
    fn test_pool_and_retry_conversion() {
        let config = parse(
            r#"
            [pools]
            destination_requests = 50
            destination_interval_secs = 5
            source_workers = 0

            [retry]
            max_retries = 3
            min_delay_ms = 200
            jitter = false
            "#,
        );

        let pools = config.pool_config();
        assert_eq!(pools.destination_requests, 50);
        assert_eq!(pools.destination_interval, Duration::from_secs(5));
        assert_eq!(pools.source_workers, 1);

        let retry = config.retry_config();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.min_delay, Duration::from_millis(200));
        assert!(!retry.with_jitter);
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = complete();
        config.qase.scim_token = Some("scim".to_string());

        let redacted = config.redacted();

        assert_eq!(redacted.testrail.api_key.as_deref(), Some(REDACTED));
        assert_eq!(redacted.qase.token.as_deref(), Some(REDACTED));
        assert_eq!(redacted.qase.scim_token.as_deref(), Some(REDACTED));
        assert_eq!(redacted.testrail.user.as_deref(), Some("me@example.com"));
    }

    #[test]
    fn test_config_merging_order() {
        let settings = ConfigBuilder::builder()
            .add_source(config::File::from_str(
                "[report]\nprefix = \"base\"\n[users]\ndefault = 1",
                FileFormat::Toml,
            ))
            .add_source(config::File::from_str(
                "[report]\nprefix = \"override\"",
                FileFormat::Toml,
            ))
            .build()
            .unwrap();

        let config: Config = settings.try_deserialize().unwrap();

        assert_eq!(config.report.prefix, "override");
        assert_eq!(config.users.default, Some(1));
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let result = Config::load(Some(Path::new("/nonexistent/caseport.toml")));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_report_dir_prefers_configured_value() {
        let config = parse("[report]\ndir = \"/tmp/reports\"");
        assert_eq!(config.report_dir(), PathBuf::from("/tmp/reports"));
    }
}
