//! Driver configuration
//!
//! Command-line flags (with environment fallbacks) are parsed once in `main`
//! into a [`DriverConfig`], which is then handed to every service.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::iscsi::DeviceWaitPolicy;

pub const DEFAULT_DRIVER_NAME: &str = "iscsi.csi.virium.io";
pub const DEFAULT_INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid CSI endpoint '{0}': expected unix:///path or tcp://host:port")]
    InvalidEndpoint(String),

    #[error("invalid driver name '{0}'")]
    InvalidDriverName(String),

    #[error("controller mode requires --api-url")]
    MissingApiUrl,

    #[error("neither controller nor node service is enabled")]
    NoServices,

    #[error("invalid {what}: {detail}")]
    Invalid { what: &'static str, detail: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Where the gRPC server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsiEndpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for CsiEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidEndpoint(s.to_string());

        if let Some(path) = s.strip_prefix("unix://").or_else(|| s.strip_prefix("unix:")) {
            if !path.starts_with('/') {
                return Err(invalid());
            }
            return Ok(CsiEndpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            return addr.parse().map(CsiEndpoint::Tcp).map_err(|_| invalid());
        }
        if s.starts_with('/') {
            return Ok(CsiEndpoint::Unix(PathBuf::from(s)));
        }
        Err(invalid())
    }
}

impl fmt::Display for CsiEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsiEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            CsiEndpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Volume-management API the controller proxies to.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "******"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub node_id: String,
    pub endpoint: CsiEndpoint,
    pub controller: bool,
    pub node: bool,
    pub api: Option<ApiConfig>,
    /// Initiator IQN sent to the API on volume creation
    pub initiator_name: String,
    /// Directory holding persisted connectors
    pub run_dir: PathBuf,
    pub device_wait: DeviceWaitPolicy,
    pub metrics_addr: Option<SocketAddr>,
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name_ok = !self.driver_name.is_empty()
            && self.driver_name.len() <= 63
            && self
                .driver_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
            && self
                .driver_name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric());
        if !name_ok {
            return Err(ConfigError::InvalidDriverName(self.driver_name.clone()));
        }
        if !self.controller && !self.node {
            return Err(ConfigError::NoServices);
        }
        if self.controller && self.api.is_none() {
            return Err(ConfigError::MissingApiUrl);
        }
        Ok(())
    }
}

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "iscsi-csi-driver")]
#[command(about = "iSCSI CSI Driver for Kubernetes")]
pub struct CliArgs {
    /// CSI endpoint (unix socket path or tcp://host:port)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    pub endpoint: String,

    /// Node ID for this CSI node (defaults to the hostname)
    #[arg(long, env = "CSI_NODE_ID")]
    pub node_id: Option<String>,

    /// Driver name
    #[arg(long, env = "CSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    pub driver_name: String,

    /// Run in controller mode (enables controller service)
    #[arg(long, env = "CSI_CONTROLLER", default_value = "false")]
    pub controller: bool,

    /// Run in node mode (enables node service)
    #[arg(long, env = "CSI_NODE", default_value = "true", action = clap::ArgAction::Set)]
    pub node: bool,

    /// Volume-management API base URL
    #[arg(long, env = "API_URL")]
    pub api_url: Option<String>,

    /// Bearer token for the volume-management API
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// API request timeout in seconds
    #[arg(long, env = "API_TIMEOUT_SECS", default_value = "30")]
    pub api_timeout_secs: u64,

    /// Initiator IQN (read from the open-iscsi initiator file when unset)
    #[arg(long, env = "ISCSI_INITIATOR_NAME")]
    pub initiator_name: Option<String>,

    /// Directory for persisted connector files (defaults to /var/run/<driver-name>)
    #[arg(long, env = "CSI_RUN_DIR")]
    pub run_dir: Option<PathBuf>,

    /// Attempts while waiting for a device to appear after login
    #[arg(long, env = "DEVICE_WAIT_ATTEMPTS", default_value = "10")]
    pub device_wait_attempts: u32,

    /// Initial device wait interval in milliseconds
    #[arg(long, env = "DEVICE_WAIT_INITIAL_MS", default_value = "1000")]
    pub device_wait_initial_ms: u64,

    /// Maximum device wait interval in milliseconds
    #[arg(long, env = "DEVICE_WAIT_MAX_MS", default_value = "5000")]
    pub device_wait_max_ms: u64,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl CliArgs {
    /// Resolve defaults and build a validated [`DriverConfig`].
    pub fn into_config(self) -> Result<DriverConfig, ConfigError> {
        let endpoint = self.endpoint.parse()?;

        let node_id = match self.node_id {
            Some(id) if !id.is_empty() => id,
            _ => hostname::get()
                .map_err(|source| ConfigError::Io {
                    path: "hostname".to_string(),
                    source,
                })?
                .to_string_lossy()
                .to_string(),
        };

        let api = self.api_url.filter(|u| !u.is_empty()).map(|url| ApiConfig {
            url: url.trim_end_matches('/').to_string(),
            token: self.api_token.filter(|t| !t.is_empty()),
            timeout: Duration::from_secs(self.api_timeout_secs),
        });
        if let Some(api) = &api
            && !(api.url.starts_with("http://") || api.url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid {
                what: "API URL",
                detail: format!("'{}' must start with http:// or https://", api.url),
            });
        }

        let initiator_name = match self.initiator_name {
            Some(name) => name,
            None if self.controller => {
                read_initiator_name(Path::new(DEFAULT_INITIATOR_NAME_FILE))?.unwrap_or_default()
            }
            None => String::new(),
        };

        let run_dir = self
            .run_dir
            .unwrap_or_else(|| Path::new("/var/run").join(&self.driver_name));

        let metrics_addr = self
            .metrics_addr
            .map(|addr| {
                addr.parse().map_err(|e| ConfigError::Invalid {
                    what: "metrics address",
                    detail: format!("'{}': {}", addr, e),
                })
            })
            .transpose()?;

        let config = DriverConfig {
            driver_name: self.driver_name,
            node_id,
            endpoint,
            controller: self.controller,
            node: self.node,
            api,
            initiator_name,
            run_dir,
            device_wait: DeviceWaitPolicy {
                attempts: self.device_wait_attempts.max(1),
                initial_interval: Duration::from_millis(self.device_wait_initial_ms),
                max_interval: Duration::from_millis(self.device_wait_max_ms),
            },
            metrics_addr,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Read `InitiatorName=` from an open-iscsi initiator file. A missing file
/// yields `None`.
pub fn read_initiator_name(path: &Path) -> Result<Option<String>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            });
        }
    };

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("InitiatorName="))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["iscsi-csi-driver", "--node-id", "node-a"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            "unix:///var/run/csi/csi.sock".parse::<CsiEndpoint>().unwrap(),
            CsiEndpoint::Unix(PathBuf::from("/var/run/csi/csi.sock"))
        );
        assert_eq!(
            "/csi/csi.sock".parse::<CsiEndpoint>().unwrap(),
            CsiEndpoint::Unix(PathBuf::from("/csi/csi.sock"))
        );
        assert_eq!(
            "tcp://127.0.0.1:10000".parse::<CsiEndpoint>().unwrap(),
            CsiEndpoint::Tcp("127.0.0.1:10000".parse().unwrap())
        );
        assert!("unix://relative.sock".parse::<CsiEndpoint>().is_err());
        assert!("tcp://nohost".parse::<CsiEndpoint>().is_err());
        assert!("http://x".parse::<CsiEndpoint>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = args(&[]).into_config().unwrap();
        assert_eq!(config.driver_name, DEFAULT_DRIVER_NAME);
        assert_eq!(config.node_id, "node-a");
        assert!(config.node);
        assert!(!config.controller);
        assert!(config.api.is_none());
        assert_eq!(config.run_dir, PathBuf::from("/var/run/iscsi.csi.virium.io"));
        assert_eq!(config.device_wait, DeviceWaitPolicy::default());
        assert_eq!(config.endpoint.to_string(), "unix:///var/run/csi/csi.sock");
    }

    #[test]
    fn test_controller_requires_api() {
        let err = args(&["--controller", "--initiator-name", "iqn.x"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiUrl));

        let config = args(&[
            "--controller",
            "--initiator-name",
            "iqn.2025-01.test:node-a",
            "--api-url",
            "http://api.local:8080/",
            "--api-token",
            "t0ken",
        ])
        .into_config()
        .unwrap();
        let api = config.api.unwrap();
        assert_eq!(api.url, "http://api.local:8080");
        assert_eq!(api.token.as_deref(), Some("t0ken"));
        assert!(!format!("{:?}", api).contains("t0ken"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(args(&["--driver-name", "bad name"]).into_config().is_err());
        assert!(args(&["--node", "false"]).into_config().is_err());
        assert!(args(&["--metrics-addr", "nope"]).into_config().is_err());
        assert!(args(&["--api-url", "ftp://x"]).into_config().is_err());
    }

    #[test]
    fn test_read_initiator_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("initiatorname.iscsi");
        std::fs::write(
            &path,
            "## generated\n#InitiatorName=iqn.old\nInitiatorName=iqn.2025-01.test:node-a\n",
        )
        .unwrap();
        assert_eq!(
            read_initiator_name(&path).unwrap().as_deref(),
            Some("iqn.2025-01.test:node-a")
        );
        assert_eq!(read_initiator_name(&dir.path().join("missing")).unwrap(), None);
    }
}
