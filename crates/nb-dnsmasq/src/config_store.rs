//! Ironic-style netboot configuration for dnsmasq.
//!
//! `hosts/ironic-<mac>.conf` holds one line per MAC, either
//! `<mac>,set:<tag>,set:ironic` (netboot allowed) or `<mac>,ignore`.
//! `opts/ironic-<node-id>.conf` holds tag-scoped options:
//! `tag:<tag>[,tag:<conditional>],<code>,<value>`.
//!
//! In memory, options are always indexed by MAC regardless of the tag written
//! in the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use nb_common::normalize_mac;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::files::{ensure_dir, is_dir, is_file, read_optional, remove_if_exists, write_atomic};
use crate::watcher::{self, FileWatcher};

const FILE_PREFIX: &str = "ironic-";
const FILE_SUFFIX: &str = ".conf";

pub const OPTION_BOOT_FILE: u16 = 67;
pub const OPTION_TFTP_SERVER: u16 = 66;
pub const OPTION_TFTP_SERVER_ADDRESS: u16 = 150;
pub const OPTION_SERVER_IP: u16 = 255;
pub const OPTION_V6_BOOT_URL: u16 = 59;

pub const TAG_NOT_IPXE: &str = "!ipxe";
pub const TAG_IPXE: &str = "ipxe";
pub const TAG_NOT_IPXE6: &str = "!ipxe6";
pub const TAG_IPXE6: &str = "ipxe6";

/// Per-MAC netboot policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub mac: String,
    pub node_id: String,
    pub tag_id: String,
    pub should_boot: bool,
}

impl HostEntry {
    fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.split(',').map(str::trim);
        let raw_mac = fields.next().unwrap_or_default();
        let mac = normalize_mac(raw_mac).ok_or_else(|| anyhow!("invalid MAC {:?}", raw_mac))?;

        let mut tag_id = None;
        let mut ignore = false;
        for field in fields {
            if field == "ignore" {
                ignore = true;
            } else if let Some(tag) = field.strip_prefix("set:") {
                if tag != "ironic" && tag_id.is_none() {
                    tag_id = Some(tag.to_string());
                }
            }
        }

        match (ignore, tag_id) {
            (true, _) => Ok(Self {
                mac,
                node_id: String::new(),
                tag_id: String::new(),
                should_boot: false,
            }),
            (false, Some(tag_id)) if !tag_id.is_empty() => Ok(Self {
                mac,
                node_id: String::new(),
                tag_id,
                should_boot: true,
            }),
            _ => bail!("neither ignore nor set:<tag> present"),
        }
    }

    /// Options are saved to `ironic-<node_id>.conf`, so a known node ID wins
    /// over whatever tag the host was loaded with.
    fn to_line(&self) -> String {
        if !self.should_boot {
            return format!("{},ignore", self.mac);
        }
        let tag = if self.node_id.is_empty() {
            &self.tag_id
        } else {
            &self.node_id
        };
        format!("{},set:{},set:ironic", self.mac, tag)
    }
}

/// One tag-scoped DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub tag: String,
    pub conditional_tag: String,
    pub option_code: u16,
    pub value: String,
}

impl DhcpOption {
    fn new(tag: &str, conditional_tag: &str, option_code: u16, value: impl Into<String>) -> Self {
        Self {
            tag: tag.to_string(),
            conditional_tag: conditional_tag.to_string(),
            option_code,
            value: value.into(),
        }
    }

    fn parse_line(line: &str) -> Result<Self> {
        let rest = line
            .strip_prefix("tag:")
            .ok_or_else(|| anyhow!("missing tag: prefix"))?;
        let (tag, rest) = rest
            .split_once(',')
            .ok_or_else(|| anyhow!("missing option code"))?;

        let (conditional_tag, rest) = match rest.strip_prefix("tag:") {
            Some(cond) => cond
                .split_once(',')
                .ok_or_else(|| anyhow!("missing option code"))?,
            None => ("", rest),
        };

        let (code, value) = rest.split_once(',').unwrap_or((rest, ""));
        let code = code.trim();
        let code = code
            .strip_prefix("option6:")
            .or_else(|| code.strip_prefix("option:"))
            .unwrap_or(code);
        let option_code: u16 = code
            .parse()
            .map_err(|_| anyhow!("invalid option code {:?}", code))?;

        Ok(Self::new(tag.trim(), conditional_tag.trim(), option_code, value))
    }

    fn to_line(&self) -> String {
        if self.conditional_tag.is_empty() {
            format!("tag:{},{},{}", self.tag, self.option_code, self.value)
        } else {
            format!(
                "tag:{},tag:{},{},{}",
                self.tag, self.conditional_tag, self.option_code, self.value
            )
        }
    }
}

#[derive(Default)]
struct ConfigIndex {
    hosts: HashMap<String, HostEntry>,
    /// Keyed by tag, which is the MAC for everything this store generates.
    options: HashMap<String, Vec<DhcpOption>>,
}

/// hosts/opts directory pair with in-memory indices.
pub struct ConfigStore {
    index: RwLock<ConfigIndex>,
    hosts_dir: PathBuf,
    opts_dir: PathBuf,
    watcher: FileWatcher,
}

impl ConfigStore {
    pub async fn new(root_dir: &Path) -> Result<Self> {
        let store = Self {
            index: RwLock::new(ConfigIndex::default()),
            hosts_dir: root_dir.join("hosts"),
            opts_dir: root_dir.join("opts"),
            watcher: FileWatcher::new()?,
        };
        for dir in [&store.hosts_dir, &store.opts_dir] {
            if is_dir(dir).await {
                store.watcher.watch(dir).await?;
            }
        }
        Ok(store)
    }

    pub fn hosts_dir(&self) -> &Path {
        &self.hosts_dir
    }

    pub fn opts_dir(&self) -> &Path {
        &self.opts_dir
    }

    fn opts_file(&self, node_id: &str) -> PathBuf {
        self.opts_dir
            .join(format!("{}{}{}", FILE_PREFIX, node_id, FILE_SUFFIX))
    }

    /// Reload hosts and options from disk, replacing both indices.
    pub async fn load_config(&self) -> Result<()> {
        let mut hosts = HashMap::new();
        for path in config_files(&self.hosts_dir).await? {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Skipping host file {}: {}", path.display(), e);
                    continue;
                }
            };
            for line in content.lines().map(str::trim) {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match HostEntry::parse_line(line) {
                    Ok(entry) => {
                        hosts.insert(entry.mac.clone(), entry);
                    }
                    Err(e) => warn!("Skipping host line {:?} in {}: {}", line, path.display(), e),
                }
            }
        }

        let mut first_tags: Option<HashMap<String, String>> = None;
        for entry in hosts.values_mut().filter(|e| e.should_boot) {
            if is_file(&self.opts_file(&entry.tag_id)).await {
                entry.node_id = entry.tag_id.clone();
                continue;
            }
            if first_tags.is_none() {
                first_tags = Some(self.scan_first_tags().await?);
            }
            if let Some(node_id) = first_tags.as_ref().and_then(|m| m.get(&entry.tag_id)) {
                entry.node_id = node_id.clone();
            }
        }

        let mut options: HashMap<String, Vec<DhcpOption>> = HashMap::new();
        for entry in hosts.values() {
            if !entry.should_boot || entry.tag_id.is_empty() || entry.node_id.is_empty() {
                continue;
            }
            let path = self.opts_file(&entry.node_id);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Skipping options file {}: {}", path.display(), e);
                    continue;
                }
            };
            let parsed = options.entry(entry.mac.clone()).or_default();
            for line in content.lines().map(str::trim) {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match DhcpOption::parse_line(line) {
                    Ok(mut opt) => {
                        opt.tag = entry.mac.clone();
                        parsed.push(opt);
                    }
                    Err(e) => warn!("Skipping option line {:?} in {}: {}", line, path.display(), e),
                }
            }
        }

        let mut index = self.index.write().await;
        debug!(
            "Loaded {} hosts and options for {} MACs",
            hosts.len(),
            options.len()
        );
        index.hosts = hosts;
        index.options = options;
        Ok(())
    }

    /// Map from the first `tag:` value of each options file to its node ID.
    async fn scan_first_tags(&self) -> Result<HashMap<String, String>> {
        let mut tags = HashMap::new();
        for path in config_files(&self.opts_dir).await? {
            let Some(node_id) = node_id_from_path(&path) else {
                continue;
            };
            let Ok(Some(content)) = read_optional(&path).await else {
                continue;
            };
            let first_tag = content
                .lines()
                .map(str::trim)
                .find_map(|l| l.strip_prefix("tag:"))
                .map(|rest| rest.split(',').next().unwrap_or_default().trim().to_string());
            if let Some(tag) = first_tag {
                tags.entry(tag).or_insert(node_id);
            }
        }
        Ok(tags)
    }

    /// Rewrite one host file per entry and one options file per bootable node.
    /// A disabled host's options file is removed.
    pub async fn save_config(&self) -> Result<()> {
        for dir in [&self.hosts_dir, &self.opts_dir] {
            ensure_dir(dir).await?;
            if self.watcher.watch(dir).await? {
                info!("Watching {} for netboot config changes", dir.display());
            }
        }

        let (hosts, options) = {
            let index = self.index.read().await;
            let hosts: Vec<HostEntry> = index.hosts.values().cloned().collect();
            (hosts, index.options.clone())
        };

        for host in &hosts {
            let path = self
                .hosts_dir
                .join(format!("{}{}{}", FILE_PREFIX, host.mac, FILE_SUFFIX));
            write_atomic(&path, &format!("{}\n", host.to_line())).await?;

            if host.node_id.is_empty() {
                continue;
            }
            let opts_path = self.opts_file(&host.node_id);
            if !host.should_boot {
                if remove_if_exists(&opts_path).await? {
                    debug!("Removed options for disabled host {}", host.mac);
                }
                continue;
            }
            let mut content = String::new();
            for opt in options.get(&host.mac).into_iter().flatten() {
                content.push_str(&opt.to_line());
                content.push('\n');
            }
            write_atomic(&opts_path, &content).await?;
        }

        // Host files now point at ironic-<node_id>.conf.
        let mut index = self.index.write().await;
        for host in index
            .hosts
            .values_mut()
            .filter(|h| h.should_boot && !h.node_id.is_empty())
        {
            host.tag_id = host.node_id.clone();
        }
        Ok(())
    }

    pub async fn get_host(&self, mac: &str) -> Option<HostEntry> {
        self.index.read().await.hosts.get(mac).cloned()
    }

    pub async fn get_options(&self, tag: &str) -> Vec<DhcpOption> {
        self.index
            .read()
            .await
            .options
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_all_options(&self) -> Vec<DhcpOption> {
        self.index
            .read()
            .await
            .options
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub async fn is_netboot_enabled(&self, mac: &str) -> bool {
        self.index
            .read()
            .await
            .hosts
            .get(mac)
            .is_some_and(|h| h.should_boot)
    }

    /// Replace every option for `mac` with the standard iPXE chainload set.
    pub async fn add_netboot_options_with_boot_file(
        &self,
        mac: &str,
        tftp_server: &str,
        http_server: &str,
        boot_file: &str,
    ) {
        let script_url = format!("http://{}/boot.ipxe", http_server);
        let v6_boot_file = if boot_file == "snp.efi" {
            "snp.efi"
        } else {
            "ipxe.efi"
        };

        let mut index = self.index.write().await;
        index.options.remove(mac);

        let host = index
            .hosts
            .entry(mac.to_string())
            .or_insert_with(|| HostEntry {
                mac: mac.to_string(),
                node_id: String::new(),
                tag_id: String::new(),
                should_boot: true,
            });
        host.should_boot = true;
        if host.node_id.is_empty() {
            host.node_id = mac.replace(':', "");
        }
        // Regenerated options live in ironic-<node_id>.conf, so the host tag
        // must point there for the next load to find them.
        host.tag_id = host.node_id.clone();

        index.options.insert(
            mac.to_string(),
            vec![
                DhcpOption::new(mac, TAG_NOT_IPXE, OPTION_BOOT_FILE, boot_file),
                DhcpOption::new(mac, TAG_IPXE, OPTION_BOOT_FILE, script_url.clone()),
                DhcpOption::new(mac, "", OPTION_TFTP_SERVER, tftp_server),
                DhcpOption::new(mac, "", OPTION_TFTP_SERVER_ADDRESS, tftp_server),
                DhcpOption::new(mac, "", OPTION_SERVER_IP, tftp_server),
                DhcpOption::new(
                    mac,
                    TAG_NOT_IPXE6,
                    OPTION_V6_BOOT_URL,
                    format!("tftp://{}/{}", tftp_server, v6_boot_file),
                ),
                DhcpOption::new(mac, TAG_IPXE6, OPTION_V6_BOOT_URL, script_url),
            ],
        );
    }

    /// Drop all options for `mac` and mark it `ignore`.
    pub async fn disable_netboot(&self, mac: &str) {
        let mut index = self.index.write().await;
        index.options.remove(mac);
        index
            .hosts
            .entry(mac.to_string())
            .or_insert_with(|| HostEntry {
                mac: mac.to_string(),
                node_id: String::new(),
                tag_id: String::new(),
                should_boot: false,
            })
            .should_boot = false;
    }

    /// Reload whenever a host or options file changes, until shutdown.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut events) = self.watcher.take_events().await else {
            warn!("Config watcher already running");
            return;
        };

        while let Some(res) = watcher::next_event(&mut events, &mut shutdown).await {
            match res {
                Ok(event) => {
                    let touches_config = event.paths.iter().any(|p| is_config_file(p));
                    if !touches_config || !watcher::is_change_event(&event) {
                        continue;
                    }
                    debug!("Netboot config changed ({:?}), reloading", event.kind);
                    if let Err(e) = self.load_config().await {
                        warn!("Failed to reload netboot config: {:#}", e);
                    }
                }
                Err(e) => warn!("Config watcher error: {}", e),
            }
        }
        debug!("Config watcher stopped");
    }

    pub async fn close(&self) -> Result<()> {
        self.watcher.close().await;
        Ok(())
    }
}

fn is_config_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
}

fn node_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    (!id.is_empty()).then(|| id.to_string())
}

/// `ironic-*.conf` files in `dir`, sorted. A missing directory has none.
async fn config_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list {}", dir.display()));
        }
    };
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to list {}", dir.display()))?
    {
        let path = entry.path();
        if is_config_file(&path) && is_file(&path).await {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
