// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Server configuration.
//!
//! The federated server config lives in the workspace's startup folder:
//!
//! ```json
//! {
//!   "servers": [{
//!     "name": "example_project",
//!     "admin_host": "localhost",
//!     "admin_port": 5005,
//!     "ssl_cert": "server.crt",
//!     "ssl_private_key": "server.key",
//!     "ssl_root_cert": "rootCA.pem",
//!     "accepted_client_cns": ["admin@org"]
//!   }]
//! }
//! ```
//!
//! Launch-time overrides come from `--set KEY=VALUE` pairs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdminError, Result};
use crate::security::{SessionConfig, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MONITOR_INTERVAL_SECS};
use crate::server::{ServerOptions, TlsFiles};

pub const DEFAULT_ADMIN_HOST: &str = "localhost";
pub const DEFAULT_ADMIN_PORT: u16 = 5005;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Folder under the workspace holding signed startup content.
pub const DEFAULT_STARTUP_FOLDER: &str = "startup";

/// Authorization policy file checked in secure mode.
pub const AUTHORIZATION_FILE: &str = "authorization.json";

/// One admin server entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminServerConfig {
    pub name: String,
    #[serde(default = "default_admin_host")]
    pub admin_host: String,
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    #[serde(default)]
    pub ssl_cert: Option<String>,
    #[serde(default)]
    pub ssl_private_key: Option<String>,
    #[serde(default)]
    pub ssl_root_cert: Option<String>,
    /// Directory for uploaded and downloaded admin files.
    #[serde(default)]
    pub admin_storage: Option<String>,
    #[serde(default)]
    pub accepted_client_cns: Vec<String>,
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout: u64,
    #[serde(default = "default_monitor_interval")]
    pub session_monitor_interval: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub require_login: bool,
}

fn default_admin_host() -> String {
    DEFAULT_ADMIN_HOST.to_string()
}

fn default_admin_port() -> u16 {
    DEFAULT_ADMIN_PORT
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_monitor_interval() -> u64 {
    DEFAULT_MONITOR_INTERVAL_SECS
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl AdminServerConfig {
    /// Certificate files named by this entry, resolved against `startup`.
    ///
    /// `None` unless all three are configured.
    pub fn tls_files(&self, startup: &Path) -> Option<TlsFiles> {
        match (&self.ssl_cert, &self.ssl_private_key, &self.ssl_root_cert) {
            (Some(cert), Some(key), Some(root)) => Some(TlsFiles {
                cert: startup.join(cert),
                key: startup.join(key),
                root_cert: startup.join(root),
            }),
            _ => None,
        }
    }

    /// Names of every certificate file this entry references.
    pub fn cert_file_names(&self) -> Vec<&str> {
        [&self.ssl_cert, &self.ssl_private_key, &self.ssl_root_cert]
            .into_iter()
            .filter_map(|f| f.as_deref())
            .collect()
    }

    /// Listener settings, with launch overrides applied.
    ///
    /// Secure mode requires all three certificate files.
    pub fn server_options(
        &self,
        startup: &Path,
        overrides: &LaunchOverrides,
    ) -> Result<ServerOptions> {
        let tls = if overrides.secure_train {
            let files = self.tls_files(startup).ok_or_else(|| {
                AdminError::Config(format!(
                    "server {} runs in secure mode but ssl_cert, ssl_private_key and \
                     ssl_root_cert are not all configured",
                    self.name
                ))
            })?;
            Some(files)
        } else {
            None
        };
        Ok(ServerOptions {
            host: overrides.host.clone().unwrap_or_else(|| self.admin_host.clone()),
            port: overrides.port.unwrap_or(self.admin_port),
            tls,
            accepted_client_cns: self.accepted_client_cns.clone(),
            max_connections: self.max_connections,
            request_timeout: self.request_timeout_duration(),
        })
    }

    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_secs(self.session_idle_timeout),
            monitor_interval: Duration::from_secs(self.session_monitor_interval),
        }
    }
}

/// The federated server config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FedServerConfig {
    pub servers: Vec<AdminServerConfig>,
}

impl FedServerConfig {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| AdminError::Config(format!("invalid server config: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AdminError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let value = serde_json::from_str(&content)
            .map_err(|e| AdminError::Config(format!("{} is not JSON: {}", path.display(), e)))?;
        Self::from_json(value)
    }

    /// The entry this process serves: the first by name.
    pub fn primary(&self) -> Result<&AdminServerConfig> {
        self.servers
            .iter()
            .min_by(|a, b| a.name.cmp(&b.name))
            .ok_or_else(|| AdminError::Config("no servers configured".into()))
    }
}

// =============================================================================
// LAUNCH OVERRIDES
// =============================================================================

/// Parse `KEY=VALUE` pairs. Later keys win.
pub fn parse_vars(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| AdminError::Config(format!("expected KEY=VALUE, got '{}'", pair)))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(AdminError::Config(format!("missing key in '{}'", pair)));
        }
        vars.insert(key.to_string(), value.trim().to_string());
    }
    Ok(vars)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Ok(true),
        "false" | "f" | "no" | "n" | "0" => Ok(false),
        _ => Err(AdminError::Config(format!(
            "{} must be true or false, got '{}'",
            key, value
        ))),
    }
}

/// Settings that can be changed at launch without editing the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOverrides {
    pub secure_train: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Startup folder name under the workspace.
    pub config_folder: Option<String>,
}

impl LaunchOverrides {
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let mut overrides = Self::default();
        for (key, value) in vars {
            match key.as_str() {
                "secure_train" => overrides.secure_train = parse_bool(key, value)?,
                "host" => overrides.host = Some(value.clone()),
                "port" => {
                    overrides.port = Some(
                        value
                            .parse()
                            .map_err(|_| AdminError::Config(format!("invalid port '{}'", value)))?,
                    )
                }
                "config_folder" => overrides.config_folder = Some(value.clone()),
                other => tracing::warn!(key = other, "ignoring unknown launch variable"),
            }
        }
        Ok(overrides)
    }

    pub fn startup_dir(&self, workspace: &Path) -> PathBuf {
        workspace.join(self.config_folder.as_deref().unwrap_or(DEFAULT_STARTUP_FOLDER))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = FedServerConfig::from_json(json!({"servers": [{"name": "proj"}]})).unwrap();
        let server = config.primary().unwrap();
        assert_eq!(server.admin_host, "localhost");
        assert_eq!(server.admin_port, 5005);
        assert_eq!(server.session_idle_timeout, 3600);
        assert_eq!(server.session_monitor_interval, 5);
        assert_eq!(server.max_connections, 64);
        assert!(!server.require_login);
        assert!(server.tls_files(Path::new("/ws/startup")).is_none());
    }

    #[test]
    fn test_tls_enabled_only_in_secure_mode() {
        let config = FedServerConfig::from_json(json!({"servers": [{
            "name": "proj",
            "admin_port": 8003,
            "ssl_cert": "server.crt",
            "ssl_private_key": "server.key",
            "ssl_root_cert": "rootCA.pem",
            "accepted_client_cns": ["admin@org"]
        }]}))
        .unwrap();
        let server = config.primary().unwrap();
        let startup = Path::new("/ws/startup");

        let insecure = server.server_options(startup, &LaunchOverrides::default()).unwrap();
        assert!(insecure.tls.is_none());
        assert_eq!(insecure.port, 8003);

        let secure = LaunchOverrides {
            secure_train: true,
            port: Some(9000),
            ..LaunchOverrides::default()
        };
        let options = server.server_options(startup, &secure).unwrap();
        let tls = options.tls.unwrap();
        assert_eq!(tls.cert, startup.join("server.crt"));
        assert_eq!(tls.root_cert, startup.join("rootCA.pem"));
        assert_eq!(options.port, 9000);
        assert_eq!(options.accepted_client_cns, vec!["admin@org"]);
        assert_eq!(server.cert_file_names(), vec!["server.crt", "server.key", "rootCA.pem"]);
    }

    #[test]
    fn test_secure_mode_without_certificates_is_refused() {
        let config = FedServerConfig::from_json(json!({"servers": [{
            "name": "proj",
            "ssl_cert": "server.crt"
        }]}))
        .unwrap();
        let server = config.primary().unwrap();
        let secure = LaunchOverrides {
            secure_train: true,
            ..LaunchOverrides::default()
        };

        let err = server.server_options(Path::new("/ws/startup"), &secure).unwrap_err();
        assert!(matches!(err, AdminError::Config(_)));
        assert!(err.to_string().contains("secure mode"));

        let options = server
            .server_options(Path::new("/ws/startup"), &LaunchOverrides::default())
            .unwrap();
        assert!(options.tls.is_none());
    }

    #[test]
    fn test_primary_is_first_by_name() {
        let config = FedServerConfig::from_json(json!({"servers": [
            {"name": "zeta", "admin_port": 7001},
            {"name": "alpha", "admin_port": 7002},
            {"name": "mid"}
        ]}))
        .unwrap();
        let server = config.primary().unwrap();
        assert_eq!(server.name, "alpha");
        assert_eq!(server.admin_port, 7002);
    }

    #[test]
    fn test_empty_servers_is_an_error() {
        let config = FedServerConfig::from_json(json!({"servers": []})).unwrap();
        assert!(config.primary().is_err());
        assert!(FedServerConfig::from_json(json!({"nope": 1})).is_err());
    }

    #[test]
    fn test_parse_vars() {
        let vars = parse_vars(&[
            "secure_train=true".to_string(),
            "port = 7000".to_string(),
            "config_folder=conf".to_string(),
        ])
        .unwrap();
        let overrides = LaunchOverrides::from_vars(&vars).unwrap();
        assert!(overrides.secure_train);
        assert_eq!(overrides.port, Some(7000));
        assert_eq!(overrides.startup_dir(Path::new("/ws")), PathBuf::from("/ws/conf"));

        assert!(parse_vars(&["novalue".to_string()]).is_err());
        assert!(parse_vars(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_bad_override_values() {
        let vars = parse_vars(&["secure_train=maybe".to_string()]).unwrap();
        assert!(LaunchOverrides::from_vars(&vars).is_err());

        let vars = parse_vars(&["port=99999".to_string()]).unwrap();
        assert!(LaunchOverrides::from_vars(&vars).is_err());
    }
}
