// src/config.rs
// Relay mapping type, mapping-string parsing and startup validation

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::ConfigError;

/// One forwarding rule: `local_port` -> `remote_host:remote_port`.
///
/// Field names serialize in camelCase so records written by the management
/// layer (`{"localPort": .., "remoteHost": .., "remotePort": .., "desc": ..}`)
/// load as-is. The description takes part in equality, so two rules that differ
/// only by description are distinct relays.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default, rename = "desc", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RelayConfig {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Name for management log lines: the description, or the mapping itself.
    pub fn label(&self) -> String {
        match &self.description {
            Some(desc) => format!("{desc} ({self})"),
            None => self.to_string(),
        }
    }

    /// `host:port` form accepted by `TcpStream::connect`.
    pub fn remote_addr(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }
}

/// Formats `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl fmt::Display for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local_port, self.remote_addr())
    }
}

impl FromStr for RelayConfig {
    type Err = ConfigError;

    /// Parses `LOCAL:HOST:PORT`; IPv6 hosts may be wrapped in brackets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mapping = s.trim();
        let (local, rest) = mapping
            .split_once(':')
            .ok_or_else(|| ConfigError::Malformed(mapping.to_string()))?;
        let (host, remote) = rest
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Malformed(mapping.to_string()))?;

        let local_port = parse_port(mapping, local)?;
        let remote_port = parse_port(mapping, remote)?;

        let host = host.trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(ConfigError::EmptyHost(mapping.to_string()));
        }

        Ok(RelayConfig::new(local_port, host, remote_port))
    }
}

fn parse_port(mapping: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| ConfigError::Port {
        mapping: mapping.to_string(),
        value: value.to_string(),
    })
}

/// Parse every mapping and reject duplicate local ports.
pub fn parse_mappings<I, S>(raw: I) -> Result<Vec<RelayConfig>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in raw {
        let item = item.as_ref().trim();
        if item.is_empty() {
            continue;
        }
        let cfg: RelayConfig = item.parse()?;
        // port 0 means "pick one", several of those never collide
        if cfg.local_port != 0 && !seen.insert(cfg.local_port) {
            return Err(ConfigError::DuplicateLocalPort(cfg.local_port));
        }
        out.push(cfg);
    }
    if out.is_empty() {
        return Err(ConfigError::NoMappings);
    }
    Ok(out)
}

/// Environment variable holding comma-separated mappings.
pub const MAPS_ENV: &str = "RELAY_MAPS";

/// Read mappings from the `RELAY_MAPS` entry of a dotenv-style file.
///
/// The process environment is left untouched.
pub fn mappings_from_env_file(path: impl AsRef<Path>) -> Result<Vec<RelayConfig>, ConfigError> {
    let mut maps = None;
    for item in dotenvy::from_path_iter(path.as_ref())? {
        let (key, value) = item?;
        if key == MAPS_ENV {
            maps = Some(value);
        }
    }
    let maps = maps.ok_or(ConfigError::NoMappings)?;
    parse_mappings(maps.split(','))
}

/// Validation result for configuration checks
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            ..Default::default()
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        for w in &self.warnings {
            warn!("config: {}", w);
        }
        for e in &self.errors {
            error!("config: {}", e);
        }
        if self.valid && self.warnings.is_empty() {
            info!("configuration validation passed");
        }
    }
}

/// Checks that go beyond syntax: self-forwarding loops, unusable ports.
pub fn validate(configs: &[RelayConfig]) -> ConfigValidation {
    let mut validation = ConfigValidation::new();

    for cfg in configs {
        if cfg.remote_port == 0 {
            validation.add_error(format!("{cfg}: remote port 0 cannot be connected to"));
        }
        if cfg.local_port == 0 {
            validation.add_warning(format!("{cfg}: local port 0 binds an ephemeral port"));
        } else if cfg.local_port < 1024 {
            validation.add_warning(format!(
                "{cfg}: local port {} is privileged and may fail to bind",
                cfg.local_port
            ));
        }
        if is_loopback_host(&cfg.remote_host) && cfg.local_port == cfg.remote_port {
            validation.add_error(format!("{cfg}: relay would forward to itself"));
        }
    }

    validation
}

fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback() || ip.is_unspecified())
            .unwrap_or(false)
}
