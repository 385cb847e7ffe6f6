use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use anyhow::{Context, Result};

pub const ONE_WEEK_SECS: u64 = 604_800;

/// Backend settings, stored as JSON by the surrounding process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsmasqConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Defaults to `<root_dir>/dnsmasq.leases`
    #[serde(default)]
    pub lease_file: Option<PathBuf>,
    #[serde(default)]
    pub tftp_server: String,
    #[serde(default)]
    pub http_server: String,
    #[serde(default)]
    pub auto_assign: bool,
    #[serde(default)]
    pub pool_start: String,
    #[serde(default)]
    pub pool_end: String,
    #[serde(default = "default_lease_time")]
    pub default_lease_time_secs: u64,
    #[serde(default)]
    pub gateway: String,
    #[serde(default = "default_netmask")]
    pub subnet_mask: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub domain: String,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/var/lib/netboot/dnsmasq")
}

fn default_lease_time() -> u64 {
    ONE_WEEK_SECS
}

fn default_netmask() -> String {
    "255.255.255.0".to_string()
}

impl Default for DnsmasqConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            lease_file: None,
            tftp_server: String::new(),
            http_server: String::new(),
            auto_assign: false,
            pool_start: String::new(),
            pool_end: String::new(),
            default_lease_time_secs: default_lease_time(),
            gateway: String::new(),
            subnet_mask: default_netmask(),
            dns_servers: Vec::new(),
            domain: String::new(),
        }
    }
}

impl DnsmasqConfig {
    /// Read the JSON config, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            info!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn lease_file_path(&self) -> PathBuf {
        self.lease_file
            .clone()
            .unwrap_or_else(|| self.root_dir.join("dnsmasq.leases"))
    }
}
