//! Configuration loading via `ortho-config`.

use std::env;
use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::advisor::PollSettings;
use crate::service::AwsCliConfig;

/// Thing name prefix used by the suite runner.
pub const ADVISOR_THING_PREFIX: &str = "DATest_";
/// Thing name prefix used by the metrics exercise.
pub const DEFENDER_THING_PREFIX: &str = "DDTest_";

/// Harness settings merged from defaults, configuration files, and
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "DEVICERIG",
    discovery(
        app_name = "devicerig",
        env_var = "DEVICERIG_CONFIG_PATH",
        config_file_name = "devicerig.toml",
        dotfile_name = ".devicerig.toml",
        project_file_name = "devicerig.toml"
    )
)]
pub struct HarnessConfig {
    /// Region every remote call targets.
    #[ortho_config(default = "us-east-1".to_owned())]
    pub region: String,
    /// Path to the `aws` executable.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Named credentials profile passed to every call.
    pub aws_profile: Option<String>,
    /// Directory holding the built samples and test executables.
    #[ortho_config(default = "build".to_owned())]
    pub build_dir: String,
    /// Directory receiving the provisioned certificate and key. Defaults to
    /// the system temporary directory.
    #[ortho_config(default = default_credentials_dir())]
    pub credentials_dir: String,
    /// Overrides the per-variant thing name prefix.
    pub thing_prefix: Option<String>,
    /// Whether to create and attach a device policy during provisioning.
    #[ortho_config(default = false)]
    pub attach_policy: bool,
    /// Delay between suite polls in milliseconds.
    #[ortho_config(default = 2000)]
    pub poll_interval_ms: u64,
    /// Upper bound on polling one suite run, in seconds.
    #[ortho_config(default = 1800)]
    pub max_wait_secs: u64,
    /// Delay between starting the tunnel destination and source, in seconds.
    #[ortho_config(default = 10)]
    pub grace_period_secs: u64,
    /// Hard limit on each test executable, in seconds. Zero disables it.
    #[ortho_config(default = 0)]
    pub launch_timeout_secs: u64,
    /// Hard limit on the metrics report sample, in seconds.
    #[ortho_config(default = 120)]
    pub report_timeout_secs: u64,
    /// Wait after the report sample exits, in seconds.
    #[ortho_config(default = 0)]
    pub report_settle_secs: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            region: String::from("us-east-1"),
            aws_bin: String::from("aws"),
            aws_profile: None,
            build_dir: String::from("build"),
            credentials_dir: default_credentials_dir(),
            thing_prefix: None,
            attach_policy: false,
            poll_interval_ms: 2000,
            max_wait_secs: 1800,
            grace_period_secs: 10,
            launch_timeout_secs: 0,
            report_timeout_secs: 120,
            report_settle_secs: 0,
        }
    }
}

fn default_credentials_dir() -> String {
    env::temp_dir().to_string_lossy().into_owned()
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to devicerig.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::InvalidValue(format!(
            "{} {reason}: check {} or {} in devicerig.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const REGION: FieldMetadata = FieldMetadata::new("AWS region", "DEVICERIG_REGION", "region");
const AWS_BIN: FieldMetadata = FieldMetadata::new("aws executable", "DEVICERIG_AWS_BIN", "aws_bin");
const AWS_PROFILE: FieldMetadata =
    FieldMetadata::new("AWS profile", "DEVICERIG_AWS_PROFILE", "aws_profile");
const BUILD_DIR: FieldMetadata =
    FieldMetadata::new("build directory", "DEVICERIG_BUILD_DIR", "build_dir");
const CREDENTIALS_DIR: FieldMetadata = FieldMetadata::new(
    "credentials directory",
    "DEVICERIG_CREDENTIALS_DIR",
    "credentials_dir",
);
const THING_PREFIX: FieldMetadata =
    FieldMetadata::new("thing name prefix", "DEVICERIG_THING_PREFIX", "thing_prefix");
const MAX_WAIT: FieldMetadata =
    FieldMetadata::new("maximum suite wait", "DEVICERIG_MAX_WAIT_SECS", "max_wait_secs");
const REPORT_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "report sample timeout",
    "DEVICERIG_REPORT_TIMEOUT_SECS",
    "report_timeout_secs",
);

impl HarnessConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("devicerig")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required value is blank or a bound is
    /// zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, metadata) in [
            (self.region.as_str(), &REGION),
            (self.aws_bin.as_str(), &AWS_BIN),
            (self.build_dir.as_str(), &BUILD_DIR),
            (self.credentials_dir.as_str(), &CREDENTIALS_DIR),
        ] {
            if value.trim().is_empty() {
                return Err(metadata.missing());
            }
        }
        for (value, metadata) in [
            (self.aws_profile.as_deref(), &AWS_PROFILE),
            (self.thing_prefix.as_deref(), &THING_PREFIX),
        ] {
            if value.is_some_and(|text| text.trim().is_empty()) {
                return Err(metadata.invalid("must not be blank when set"));
            }
        }
        if self.max_wait_secs == 0 {
            return Err(MAX_WAIT.invalid("must be greater than zero"));
        }
        if self.report_timeout_secs == 0 {
            return Err(REPORT_TIMEOUT.invalid("must be greater than zero"));
        }
        Ok(())
    }

    /// Settings for the provider command line.
    #[must_use]
    pub fn aws_cli(&self) -> AwsCliConfig {
        AwsCliConfig {
            aws_bin: self.aws_bin.clone(),
            region: self.region.clone(),
            profile: self.aws_profile.clone(),
        }
    }

    /// Polling interval and bound for suite runs.
    #[must_use]
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.max_wait_secs),
        )
    }

    /// Hard limit on test executables, if any.
    #[must_use]
    pub const fn launch_timeout(&self) -> Option<Duration> {
        if self.launch_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.launch_timeout_secs))
        }
    }

    /// Delay between the tunnel destination and source.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Hard limit on the metrics report sample.
    #[must_use]
    pub const fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }

    /// Wait after the metrics report sample exits.
    #[must_use]
    pub const fn report_settle(&self) -> Duration {
        Duration::from_secs(self.report_settle_secs)
    }

    /// Thing name prefix, falling back to `default_prefix`.
    #[must_use]
    pub fn thing_prefix_or<'a>(&'a self, default_prefix: &'a str) -> &'a str {
        self.thing_prefix.as_deref().unwrap_or(default_prefix)
    }

    /// Build directory as a UTF-8 path.
    #[must_use]
    pub fn build_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.build_dir)
    }

    /// Credentials directory as a UTF-8 path.
    #[must_use]
    pub fn credentials_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.credentials_dir)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configured value is out of range.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
