use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process-level settings read from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// JSON file holding the backend configuration
    pub config_path: PathBuf,
    /// Overrides `root_dir` from the JSON file when set
    pub root_dir: Option<PathBuf>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/netboot/dnsmasq.json"),
            root_dir: None,
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut config = Self::default();

        if let Some(v) = lookup("NETBOOT_CONFIG") {
            config.config_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("NETBOOT_ROOT_DIR") {
            if !v.is_empty() {
                config.root_dir = Some(PathBuf::from(v));
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EnvConfig::from_lookup(|_| None);
        assert_eq!(config.config_path, PathBuf::from("/etc/netboot/dnsmasq.json"));
        assert!(config.root_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = EnvConfig::from_lookup(|key| match key {
            "NETBOOT_CONFIG" => Some("/tmp/nb.json".to_string()),
            "NETBOOT_ROOT_DIR" => Some("/srv/netboot".to_string()),
            _ => None,
        });
        assert_eq!(config.config_path, PathBuf::from("/tmp/nb.json"));
        assert_eq!(config.root_dir, Some(PathBuf::from("/srv/netboot")));
    }
}
