// Traceroute fleet simulator. Resolves layered configuration from defaults, a JSON file,
// environment variables, and CLI flags.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! `TsimConfig`: resolves facts/data/log/lock directories from defaults, an optional JSON config
//! file, environment variables, and CLI overrides, in that increasing order of precedence.

use serde::Deserialize;
use std::path::PathBuf;

/// Resolved paths the rest of the CLI operates on.
#[derive(Debug, Clone)]
pub struct TsimConfig {
    /// Root of the facts directory (`TSIM_FACTS_DIR`).
    pub facts_dir: PathBuf,
    /// Root of the data directory: queue, progress, runs (`TSIM_DATA_DIR`).
    pub data_dir: PathBuf,
    /// Root of the log directory (`TSIM_LOG_DIR`).
    pub log_dir: PathBuf,
    /// Root of the lock directory: leader lock, per-router locks, queue lock (`TSIM_LOCK_DIR`).
    pub lock_dir: PathBuf,
}

impl Default for TsimConfig {
    fn default() -> Self {
        Self {
            facts_dir: PathBuf::from("/etc/tsim/facts"),
            data_dir: PathBuf::from("/var/lib/tsim"),
            log_dir: PathBuf::from("/var/log/tsim"),
            lock_dir: PathBuf::from("/run/tsim/locks"),
        }
    }
}

/// Shape of the optional JSON config file, every field optional so a partial file only overrides
/// what it sets.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    facts_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    lock_dir: Option<PathBuf>,
}

/// CLI-level overrides, one field per flag; `None` means "not passed on the command line".
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// `--facts-dir`
    pub facts_dir: Option<PathBuf>,
    /// `--data-dir`
    pub data_dir: Option<PathBuf>,
    /// `--log-dir`
    pub log_dir: Option<PathBuf>,
    /// `--lock-dir`
    pub lock_dir: Option<PathBuf>,
}

impl TsimConfig {
    /// Resolve the config by layering defaults, `config_file_path` (if it exists), the
    /// `TSIM_*` environment variables, and `overrides`, each layer replacing only the fields it
    /// sets.
    pub fn resolve(config_file_path: Option<&std::path::Path>, overrides: ConfigOverrides) -> Self {
        let mut config = Self::default();

        if let Some(path) = config_file_path {
            if let Ok(text) = std::fs::read_to_string(path) {
                if let Ok(file) = serde_json::from_str::<ConfigFile>(&text) {
                    if let Some(v) = file.facts_dir {
                        config.facts_dir = v;
                    }
                    if let Some(v) = file.data_dir {
                        config.data_dir = v;
                    }
                    if let Some(v) = file.log_dir {
                        config.log_dir = v;
                    }
                    if let Some(v) = file.lock_dir {
                        config.lock_dir = v;
                    }
                }
            }
        }

        if let Ok(v) = std::env::var("TSIM_FACTS_DIR") {
            config.facts_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TSIM_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TSIM_LOG_DIR") {
            config.log_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TSIM_LOCK_DIR") {
            config.lock_dir = PathBuf::from(v);
        }

        if let Some(v) = overrides.facts_dir {
            config.facts_dir = v;
        }
        if let Some(v) = overrides.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = overrides.log_dir {
            config.log_dir = v;
        }
        if let Some(v) = overrides.lock_dir {
            config.lock_dir = v;
        }

        config
    }
}

/// Orchestrator CLI exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Destination is reachable.
    Reachable = 0,
    /// No forwarding path was found (loop or blackhole).
    NoPath = 1,
    /// Source or destination IP does not resolve to any configured router/subnet.
    IpNotResolvable = 2,
    /// The path reached the fleet edge (external destination).
    FleetEdgeReached = 4,
    /// Input or validation error.
    ValidationError = 10,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

/// Map a [`tsim::Error`] to the exit code the orchestrator CLI reports. Kept as a pure function so
/// it is directly testable without invoking the process.
pub fn exit_code_for_error(error: &tsim::Error) -> ExitCode {
    match error {
        tsim::Error::Path(tsim::PathError::UnknownSource(_)) => ExitCode::IpNotResolvable,
        tsim::Error::Path(tsim::PathError::ForwardingLoop(_, _))
        | tsim::Error::Path(tsim::PathError::Blackhole(_, _))
        | tsim::Error::Path(tsim::PathError::HopCapExceeded(_)) => ExitCode::NoPath,
        tsim::Error::Path(tsim::PathError::InvalidProbe(_)) => ExitCode::ValidationError,
        tsim::Error::Facts(_) | tsim::Error::Matcher(_) => ExitCode::ValidationError,
        _ => ExitCode::ValidationError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_vars_override_defaults_but_not_cli_flags() {
        std::env::set_var("TSIM_FACTS_DIR", "/tmp/env-facts");
        let overrides =
            ConfigOverrides { facts_dir: Some(PathBuf::from("/tmp/cli-facts")), ..Default::default() };
        let config = TsimConfig::resolve(None, overrides);
        assert_eq!(config.facts_dir, PathBuf::from("/tmp/cli-facts"));
        std::env::remove_var("TSIM_FACTS_DIR");
    }

    #[test]
    fn unknown_source_maps_to_ip_not_resolvable() {
        let error = tsim::Error::Path(tsim::PathError::UnknownSource("10.9.9.9".to_string()));
        assert_eq!(exit_code_for_error(&error), ExitCode::IpNotResolvable);
    }

    #[test]
    fn blackhole_maps_to_no_path() {
        let error = tsim::Error::Path(tsim::PathError::Blackhole("gw".to_string(), "eth0".to_string()));
        assert_eq!(exit_code_for_error(&error), ExitCode::NoPath);
    }
}
