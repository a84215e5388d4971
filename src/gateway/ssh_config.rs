//! Minimal OpenSSH client configuration reader.
//!
//! Only the directives gateway resolution needs are interpreted: `User`,
//! `Port`, `HostName`, `ProxyCommand` and `IdentityFile`. `Match` blocks are
//! skipped.

use camino::Utf8Path;
use thiserror::Error;

use crate::util::{expand_tilde, read_to_string_ambient};

/// Settings that apply to one host after evaluating every matching block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostSettings {
    /// `User` directive.
    pub user: Option<String>,
    /// `Port` directive.
    pub port: Option<u16>,
    /// `HostName` directive.
    pub hostname: Option<String>,
    /// `ProxyCommand` directive.
    pub proxy_command: Option<String>,
    /// Every `IdentityFile` directive in file order, with `~` expanded.
    pub identity_files: Vec<String>,
}

/// Source of per-host SSH client settings.
pub trait SshConfigSource {
    /// Returns the settings that apply when connecting to `host`.
    fn settings_for(&self, host: &str) -> HostSettings;
}

/// Errors raised while loading an SSH client configuration file.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshConfigError {
    /// The file exists but could not be read.
    #[error("failed to read ssh config {path}: {message}")]
    Read {
        /// Path that was read.
        path: String,
        /// I/O error message.
        message: String,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Selector {
    Global,
    Hosts(Vec<String>),
    Match,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct Block {
    selector: Selector,
    directives: Vec<(String, String)>,
}

impl Block {
    fn applies_to(&self, host: &str) -> bool {
        match &self.selector {
            Selector::Global => true,
            Selector::Match => false,
            Selector::Hosts(patterns) => {
                let mut positive = false;
                for pattern in patterns {
                    if let Some(negated) = pattern.strip_prefix('!') {
                        if host_matches(negated, host) {
                            return false;
                        }
                    } else if host_matches(pattern, host) {
                        positive = true;
                    }
                }
                positive
            }
        }
    }
}

/// Parsed SSH client configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SshConfig {
    blocks: Vec<Block>,
}

impl SshConfig {
    /// Parses configuration text.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut blocks = vec![Block {
            selector: Selector::Global,
            directives: Vec::new(),
        }];
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((keyword, value)) = split_directive(line) else {
                continue;
            };
            match keyword.as_str() {
                "host" => blocks.push(Block {
                    selector: Selector::Hosts(
                        value.split_whitespace().map(str::to_owned).collect(),
                    ),
                    directives: Vec::new(),
                }),
                "match" => blocks.push(Block {
                    selector: Selector::Match,
                    directives: Vec::new(),
                }),
                _ => {
                    if let Some(block) = blocks.last_mut() {
                        block.directives.push((keyword, value));
                    }
                }
            }
        }
        Self { blocks }
    }

    /// Loads and parses `path`. A missing file yields an empty configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::Read`] when the file exists but cannot be
    /// read.
    pub fn load(path: &Utf8Path) -> Result<Self, SshConfigError> {
        match read_to_string_ambient(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(SshConfigError::Read {
                path: path.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

impl SshConfigSource for SshConfig {
    fn settings_for(&self, host: &str) -> HostSettings {
        let mut settings = HostSettings::default();
        for block in self.blocks.iter().filter(|block| block.applies_to(host)) {
            for (keyword, value) in &block.directives {
                match keyword.as_str() {
                    "user" => {
                        settings.user.get_or_insert_with(|| value.clone());
                    }
                    "port" => {
                        if settings.port.is_none() {
                            settings.port = value.parse().ok();
                        }
                    }
                    "hostname" => {
                        settings.hostname.get_or_insert_with(|| value.clone());
                    }
                    "proxycommand" => {
                        settings.proxy_command.get_or_insert_with(|| value.clone());
                    }
                    "identityfile" => settings.identity_files.push(expand_tilde(value)),
                    _ => {}
                }
            }
        }
        settings
    }
}

fn split_directive(line: &str) -> Option<(String, String)> {
    let split_at = line.find(|ch: char| ch.is_whitespace() || ch == '=')?;
    let (keyword, rest) = line.split_at(split_at);
    let value = rest
        .trim_start_matches(|ch: char| ch.is_whitespace() || ch == '=')
        .trim();
    let unquoted = value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value);
    if unquoted.is_empty() {
        return None;
    }
    Some((keyword.to_ascii_lowercase(), unquoted.to_owned()))
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern_chars = pattern.chars().collect::<Vec<_>>();
    let host_chars = host.chars().collect::<Vec<_>>();
    glob_matches(&pattern_chars, &host_chars)
}

fn glob_matches(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len())
            .any(|skip| text.get(skip..).is_some_and(|tail| glob_matches(rest, tail))),
        Some(('?', rest)) => text
            .split_first()
            .is_some_and(|(_, tail)| glob_matches(rest, tail)),
        Some((expected, rest)) => text.split_first().is_some_and(|(actual, tail)| {
            actual.eq_ignore_ascii_case(expected) && glob_matches(rest, tail)
        }),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const SAMPLE: &str = r#"
# jump host
Host bastion
    HostName bastion.example.com
    User ops
    Port 2222
    IdentityFile /keys/bastion

Host 10.0.* !10.0.9.*
    ProxyCommand ssh bastion.example.com nc %h %p
    User ec2-user

Match exec "true"
    User ignored

Host *
    User fallback
    IdentityFile=/keys/default
"#;

    #[rstest]
    #[case("10.0.1.5", true)]
    #[case("10.0.9.5", false)]
    #[case("192.168.1.1", false)]
    fn proxy_command_follows_host_patterns(#[case] host: &str, #[case] proxied: bool) {
        let config = SshConfig::parse(SAMPLE);
        let settings = config.settings_for(host);
        assert_eq!(settings.proxy_command.is_some(), proxied, "{host}");
    }

    #[test]
    fn first_value_wins_and_identity_files_accumulate() {
        let config = SshConfig::parse(SAMPLE);
        let settings = config.settings_for("bastion");

        assert_eq!(settings.user.as_deref(), Some("ops"));
        assert_eq!(settings.port, Some(2222));
        assert_eq!(settings.hostname.as_deref(), Some("bastion.example.com"));
        assert_eq!(
            settings.identity_files,
            vec![String::from("/keys/bastion"), String::from("/keys/default")]
        );
    }

    #[test]
    fn match_blocks_are_ignored() {
        let config = SshConfig::parse(SAMPLE);
        assert_eq!(
            config.settings_for("unrelated").user.as_deref(),
            Some("fallback")
        );
    }

    #[rstest]
    #[case("web-?", "web-1", true)]
    #[case("web-?", "web-10", false)]
    #[case("*.internal", "db.INTERNAL", true)]
    #[case("*", "", true)]
    fn glob_patterns_match_like_openssh(
        #[case] pattern: &str,
        #[case] host: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(host_matches(pattern, host), expected);
    }

    #[test]
    fn missing_file_loads_as_empty_configuration() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let path = camino::Utf8PathBuf::from_path_buf(tmp.path().join("config"))
            .expect("utf8 path");

        let config = SshConfig::load(&path).expect("missing file is not an error");
        assert_eq!(config.settings_for("anything"), HostSettings::default());
    }
}
