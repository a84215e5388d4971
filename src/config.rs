//! Configuration loading via `ortho-config`.

use std::num::NonZeroU32;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::control_plane::{AwsCliSettings, DEFAULT_AWS_BIN};
use crate::plan::{DEFAULT_SSH_PORT, DEFAULT_WINRM_PORT, Timing};
use crate::retry::RetryPolicy;
use crate::tunnel::DEFAULT_SSH_BIN;

/// Provisioning settings merged from defaults, `landfall.toml`, and
/// `LANDFALL_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "LANDFALL",
    discovery(
        app_name = "landfall",
        env_var = "LANDFALL_CONFIG_PATH",
        config_file_name = "landfall.toml",
        dotfile_name = ".landfall.toml",
        project_file_name = "landfall.toml"
    )
)]
pub struct ProvisionConfig {
    /// Path to the `aws` executable.
    #[ortho_config(default = DEFAULT_AWS_BIN.to_owned())]
    pub aws_bin: String,
    /// AWS region passed to every call. Falls back to the CLI's own
    /// resolution when unset.
    pub region: Option<String>,
    /// Named AWS CLI profile.
    pub profile: Option<String>,
    /// Path to the `ssh` executable used for gateway tunnels.
    #[ortho_config(default = DEFAULT_SSH_BIN.to_owned())]
    pub ssh_bin: String,
    /// Login user handed to the bootstrap step.
    pub ssh_user: Option<String>,
    /// SSH port probed on the target.
    #[ortho_config(default = DEFAULT_SSH_PORT)]
    pub ssh_port: u16,
    /// `WinRM` port probed on the target.
    #[ortho_config(default = DEFAULT_WINRM_PORT)]
    pub winrm_port: u16,
    /// Explicit gateway as `[user@]host[:port]`.
    pub ssh_gateway: Option<String>,
    /// Private key for the gateway, overriding SSH client configuration.
    pub ssh_gateway_identity: Option<String>,
    /// Private key matching the instance key pair. Supports `~/`.
    pub identity_file: Option<String>,
    /// SSH client configuration consulted for proxy commands.
    #[ortho_config(default = "~/.ssh/config".to_owned())]
    pub ssh_config_file: String,
    /// Attempts allowed for the tag and elastic-IP step.
    #[ortho_config(default = 6)]
    pub tag_retry_attempts: u32,
    /// Seconds between tag and elastic-IP attempts.
    #[ortho_config(default = 5)]
    pub tag_retry_delay_secs: u64,
    /// Seconds between readiness polls.
    #[ortho_config(default = 1)]
    pub readiness_poll_interval_secs: u64,
    /// Seconds before the first probe outside a VPC.
    #[ortho_config(default = 10)]
    pub probe_initial_delay_secs: u64,
    /// Seconds before the first probe inside a VPC.
    #[ortho_config(default = 40)]
    pub probe_private_network_initial_delay_secs: u64,
    /// Seconds between probe attempts.
    #[ortho_config(default = 10)]
    pub probe_interval_secs: u64,
    /// Probe attempts before giving up. Unset or zero polls until the
    /// target answers.
    pub probe_attempt_limit: Option<u32>,
    /// Seconds the shell probe waits for a banner.
    #[ortho_config(default = 5)]
    pub banner_timeout_secs: u64,
    /// Seconds a gateway tunnel may take to start listening.
    #[ortho_config(default = 15)]
    pub tunnel_setup_timeout_secs: u64,
    /// Seconds between generated-password polls.
    #[ortho_config(default = 1000)]
    pub password_poll_interval_secs: u64,
    /// Milliseconds between attachment polls.
    #[ortho_config(default = 0)]
    pub nic_poll_interval_millis: u64,
    /// Command run once the target is reachable. Without one, a summary is
    /// printed instead.
    pub bootstrap_command: Option<String>,
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
            "missing {}: set {} or add {} to landfall.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "invalid {} ({reason}): check {} or {} in landfall.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl ProvisionConfig {
    fn require_value(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.missing());
        }
        Ok(())
    }

    fn require_optional_value(
        value: Option<&str>,
        metadata: &FieldMetadata,
    ) -> Result<(), ConfigError> {
        value.map_or(Ok(()), |inner| Self::require_value(inner, metadata))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("landfall")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that set the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for blank values and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_value(
            &self.aws_bin,
            &FieldMetadata::new("aws CLI binary", "LANDFALL_AWS_BIN", "aws_bin"),
        )?;
        Self::require_value(
            &self.ssh_bin,
            &FieldMetadata::new("ssh binary", "LANDFALL_SSH_BIN", "ssh_bin"),
        )?;
        Self::require_value(
            &self.ssh_config_file,
            &FieldMetadata::new(
                "ssh config file",
                "LANDFALL_SSH_CONFIG_FILE",
                "ssh_config_file",
            ),
        )?;
        Self::require_optional_value(
            self.identity_file.as_deref(),
            &FieldMetadata::new("identity file", "LANDFALL_IDENTITY_FILE", "identity_file"),
        )?;
        Self::require_optional_value(
            self.ssh_gateway.as_deref(),
            &FieldMetadata::new("ssh gateway", "LANDFALL_SSH_GATEWAY", "ssh_gateway"),
        )?;
        Self::require_optional_value(
            self.bootstrap_command.as_deref(),
            &FieldMetadata::new(
                "bootstrap command",
                "LANDFALL_BOOTSTRAP_COMMAND",
                "bootstrap_command",
            ),
        )?;
        if self.tag_retry_attempts == 0 {
            return Err(FieldMetadata::new(
                "tag retry attempts",
                "LANDFALL_TAG_RETRY_ATTEMPTS",
                "tag_retry_attempts",
            )
            .invalid("must be at least 1"));
        }
        if self.ssh_port == 0 {
            return Err(
                FieldMetadata::new("ssh port", "LANDFALL_SSH_PORT", "ssh_port")
                    .invalid("must be non-zero"),
            );
        }
        if self.winrm_port == 0 {
            return Err(
                FieldMetadata::new("winrm port", "LANDFALL_WINRM_PORT", "winrm_port")
                    .invalid("must be non-zero"),
            );
        }
        Ok(())
    }

    /// Settings for the AWS CLI control plane.
    #[must_use]
    pub fn aws_settings(&self) -> AwsCliSettings {
        AwsCliSettings {
            program: self.aws_bin.clone(),
            region: self.region.clone(),
            profile: self.profile.clone(),
        }
    }

    /// Polling and retry constants.
    #[must_use]
    pub fn timing(&self) -> Timing {
        let attempts = NonZeroU32::new(self.tag_retry_attempts).unwrap_or(NonZeroU32::MIN);
        Timing {
            tag_retry: RetryPolicy::new(attempts, Duration::from_secs(self.tag_retry_delay_secs)),
            readiness_poll_interval: Duration::from_secs(self.readiness_poll_interval_secs),
            probe_initial_delay: Duration::from_secs(self.probe_initial_delay_secs),
            probe_private_network_initial_delay: Duration::from_secs(
                self.probe_private_network_initial_delay_secs,
            ),
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            banner_timeout: Duration::from_secs(self.banner_timeout_secs),
            probe_attempt_limit: self.probe_attempt_limit.and_then(NonZeroU32::new),
            password_poll_interval: Duration::from_secs(self.password_poll_interval_secs),
            nic_poll_interval: Duration::from_millis(self.nic_poll_interval_millis),
        }
    }

    /// How long a gateway tunnel may take to start listening.
    #[must_use]
    pub const fn tunnel_setup_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_setup_timeout_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is out of range.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
