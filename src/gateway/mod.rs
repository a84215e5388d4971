//! SSH gateway resolution.
//!
//! A gateway is either configured explicitly as `[user@]host[:port]` or
//! discovered from an `ssh [options] <gateway> nc %h %p` proxy command in the
//! local SSH client configuration. When neither applies, probes connect
//! directly.

pub mod ssh_config;

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

pub use ssh_config::{HostSettings, SshConfig, SshConfigError, SshConfigSource};

/// Default SSH port used for gateways without an explicit or configured port.
pub const DEFAULT_GATEWAY_PORT: u16 = 22;

/// Errors raised while parsing a gateway specification.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GatewayError {
    /// The specification has no host part.
    #[error("ssh gateway '{spec}' has no host")]
    MissingHost {
        /// Specification as supplied.
        spec: String,
    },
    /// The port is not a valid TCP port.
    #[error("ssh gateway '{spec}' has an invalid port '{port}'")]
    InvalidPort {
        /// Specification as supplied.
        spec: String,
        /// Port text that failed to parse.
        port: String,
    },
}

/// Parsed `[user@]host[:port]` gateway specification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GatewaySpec {
    /// Login user, if given.
    pub user: Option<String>,
    /// Gateway host name or address.
    pub host: String,
    /// Gateway SSH port, if given.
    pub port: Option<u16>,
}

impl FromStr for GatewaySpec {
    type Err = GatewayError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let trimmed = spec.trim();
        let (user, host_port) = match trimmed.rsplit_once('@') {
            Some((user, rest)) => (Some(user.to_owned()).filter(|name| !name.is_empty()), rest),
            None => (None, trimmed),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port_text)) => {
                let port = port_text
                    .parse::<u16>()
                    .map_err(|_| GatewayError::InvalidPort {
                        spec: spec.to_owned(),
                        port: port_text.to_owned(),
                    })?;
                (host, Some(port))
            }
            None => (host_port, None),
        };
        if host.is_empty() {
            return Err(GatewayError::MissingHost {
                spec: spec.to_owned(),
            });
        }
        Ok(Self {
            user,
            host: host.to_owned(),
            port,
        })
    }
}

/// Where a resolved gateway came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GatewaySource {
    /// Configured explicitly by the operator.
    Explicit,
    /// Discovered from a proxy command in the SSH client configuration.
    ProxyCommand,
}

/// Fully resolved gateway used to open tunnels.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GatewayDescriptor {
    /// Login user, when known.
    pub user: Option<String>,
    /// Gateway host.
    pub host: String,
    /// Gateway SSH port.
    pub port: u16,
    /// Candidate private keys in preference order. Empty leaves key
    /// selection to the SSH client.
    pub identity_files: Vec<Utf8PathBuf>,
    /// Where the gateway was configured.
    pub source: GatewaySource,
}

impl fmt::Display for GatewayDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// `ssh` options that consume a value, either attached (`-p2222`) or as the
/// next word.
const SSH_FLAGS_WITH_VALUE: &str = "BbcDEeFIiJLlmOoPpQRSWw";

/// Extracts the gateway from an `ssh [options] <gateway> nc %h %p` proxy
/// command.
///
/// `-l` and `-p` fill in the user and port when the gateway word does not
/// carry them; other options are skipped. Commands that do not relay through
/// `nc` (or a relative such as `ncat`) yield `None`.
///
/// # Errors
///
/// Returns [`GatewayError`] when the gateway word or the `-p` value does not
/// parse.
pub fn gateway_from_proxy_command(command: &str) -> Result<Option<GatewaySpec>, GatewayError> {
    let mut tokens = command.split_whitespace();
    if tokens
        .by_ref()
        .find(|token| *token == "ssh" || token.ends_with("/ssh"))
        .is_none()
    {
        return Ok(None);
    }

    let mut user = None;
    let mut port = None;
    while let Some(token) = tokens.next() {
        let Some(flags) = token.strip_prefix('-') else {
            if !tokens.next().is_some_and(|relay| relay.starts_with("nc")) {
                return Ok(None);
            }
            let spec = token.parse::<GatewaySpec>()?;
            return Ok(Some(GatewaySpec {
                user: spec.user.or(user),
                port: spec.port.or(port),
                host: spec.host,
            }));
        };
        let Some(flag) = flags.chars().next().filter(|flag| SSH_FLAGS_WITH_VALUE.contains(*flag))
        else {
            continue;
        };
        let attached = flags.get(1..).unwrap_or_default();
        let value = if attached.is_empty() {
            match tokens.next() {
                Some(next) => next,
                None => return Ok(None),
            }
        } else {
            attached
        };
        match flag {
            'p' => {
                port = Some(value.parse::<u16>().map_err(|_| GatewayError::InvalidPort {
                    spec: command.to_owned(),
                    port: value.to_owned(),
                })?);
            }
            'l' => user = Some(value.to_owned()),
            _ => {}
        }
    }
    Ok(None)
}

/// Decides whether probes must be tunnelled and through which gateway.
#[derive(Debug)]
pub struct GatewayResolver<'a, S: ?Sized> {
    ssh_config: &'a S,
    identity_override: Vec<Utf8PathBuf>,
}

impl<'a, S> GatewayResolver<'a, S>
where
    S: SshConfigSource + ?Sized,
{
    /// Creates a resolver. A non-empty `identity_override` replaces any keys
    /// found in the SSH client configuration.
    #[must_use]
    pub const fn new(ssh_config: &'a S, identity_override: Vec<Utf8PathBuf>) -> Self {
        Self {
            ssh_config,
            identity_override,
        }
    }

    /// Resolves the gateway for `target_host`, or `None` for a direct
    /// connection.
    #[must_use]
    pub fn resolve(
        &self,
        explicit: Option<&GatewaySpec>,
        target_host: &str,
    ) -> Option<GatewayDescriptor> {
        if let Some(spec) = explicit {
            return Some(self.describe(spec, GatewaySource::Explicit));
        }

        let proxy_command = self.ssh_config.settings_for(target_host).proxy_command?;
        match gateway_from_proxy_command(&proxy_command) {
            Ok(Some(spec)) => Some(self.describe(&spec, GatewaySource::ProxyCommand)),
            Ok(None) => {
                debug!(target_host, proxy_command, "proxy command does not name an ssh gateway");
                None
            }
            Err(err) => {
                warn!(target_host, error = %err, "ignoring unusable proxy command gateway");
                None
            }
        }
    }

    fn describe(&self, spec: &GatewaySpec, source: GatewaySource) -> GatewayDescriptor {
        let settings = self.ssh_config.settings_for(&spec.host);
        let identity_files = if self.identity_override.is_empty() {
            settings
                .identity_files
                .into_iter()
                .map(Utf8PathBuf::from)
                .collect()
        } else {
            self.identity_override.clone()
        };
        let descriptor = GatewayDescriptor {
            user: spec.user.clone().or(settings.user),
            host: spec.host.clone(),
            port: spec.port.or(settings.port).unwrap_or(DEFAULT_GATEWAY_PORT),
            identity_files,
            source,
        };
        debug!(gateway = %descriptor, ?source, "resolved ssh gateway");
        descriptor
    }
}
