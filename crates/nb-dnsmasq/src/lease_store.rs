use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use nb_common::normalize_mac;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::files::{ensure_dir, is_dir, read_optional, write_atomic};
use crate::now_unix;
use crate::watcher::{self, FileWatcher};

/// How long a declined IP is withheld from new assignments.
pub const DECLINE_COOLDOWN_SECS: i64 = 300;

/// A DHCP lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub expiry: i64,
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub client_id: Option<String>,
    pub declined: bool,
    pub decline_time: i64,
}

impl Lease {
    pub fn is_active(&self, now: i64) -> bool {
        self.expiry >= now
    }

    pub fn in_decline_cooldown(&self, now: i64) -> bool {
        self.declined && now - self.decline_time < DECLINE_COOLDOWN_SECS
    }

    /// Seconds left before expiry, clamped to the u32 range DHCP carries.
    pub fn remaining_secs(&self, now: i64) -> u32 {
        (self.expiry - now).clamp(0, i64::from(u32::MAX)) as u32
    }

    /// Parse one line of a dnsmasq lease file.
    /// Format: <expiry_timestamp> <mac> <ip> <hostname> [<client_id>]
    fn parse_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            bail!("expected at least 3 fields, got {}", parts.len());
        }

        let expiry: i64 = parts[0]
            .parse()
            .map_err(|_| anyhow!("invalid expiry {:?}", parts[0]))?;
        let mac = normalize_mac(parts[1]).ok_or_else(|| anyhow!("invalid MAC {:?}", parts[1]))?;
        let ip: Ipv4Addr = parts[2]
            .parse()
            .map_err(|_| anyhow!("invalid IP {:?}", parts[2]))?;
        let hostname = parts.get(3).unwrap_or(&"*").to_string();
        let client_id = parts
            .get(4)
            .filter(|c| **c != "*")
            .map(|c| c.to_string());

        Ok(Self {
            expiry,
            mac,
            ip,
            hostname,
            client_id,
            declined: false,
            decline_time: 0,
        })
    }

    fn to_line(&self) -> String {
        match &self.client_id {
            Some(client_id) => format!(
                "{} {} {} {} {}",
                self.expiry, self.mac, self.ip, self.hostname, client_id
            ),
            None => format!("{} {} {} {}", self.expiry, self.mac, self.ip, self.hostname),
        }
    }
}

/// dnsmasq-compatible lease file with an in-memory MAC index.
pub struct LeaseStore {
    leases: RwLock<HashMap<String, Lease>>,
    file_path: PathBuf,
    watcher: FileWatcher,
}

impl LeaseStore {
    /// Create the store and start watching the lease file's directory if it exists.
    /// Nothing is read until [`LeaseStore::load_leases`].
    pub async fn new(file_path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            leases: RwLock::new(HashMap::new()),
            file_path: file_path.into(),
            watcher: FileWatcher::new()?,
        };
        if let Some(dir) = store.watch_dir() {
            if is_dir(&dir).await {
                store.watcher.watch(&dir).await?;
            }
        }
        Ok(store)
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn watch_dir(&self) -> Option<PathBuf> {
        match self.file_path.parent() {
            Some(p) if p.as_os_str().is_empty() => Some(PathBuf::from(".")),
            Some(p) => Some(p.to_path_buf()),
            None => None,
        }
    }

    /// Reload the lease file, replacing the in-memory map.
    /// A missing file yields an empty store. Bad lines are logged and skipped.
    pub async fn load_leases(&self) -> Result<usize> {
        let content = read_optional(&self.file_path)
            .await
            .with_context(|| format!("Failed to load leases from {}", self.file_path.display()))?
            .unwrap_or_default();

        let mut loaded = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Lease::parse_line(line) {
                Ok(lease) => {
                    loaded.insert(lease.mac.clone(), lease);
                }
                Err(e) => warn!(
                    "Skipping lease line {} in {}: {}",
                    lineno + 1,
                    self.file_path.display(),
                    e
                ),
            }
        }

        let mut leases = self.leases.write().await;
        // The file has no decline column; keep flags for unchanged bindings.
        for lease in loaded.values_mut() {
            if let Some(old) = leases.get(&lease.mac) {
                if old.ip == lease.ip && old.declined {
                    lease.declined = true;
                    lease.decline_time = old.decline_time;
                }
            }
        }
        let count = loaded.len();
        *leases = loaded;

        debug!("Loaded {} leases from {}", count, self.file_path.display());
        Ok(count)
    }

    /// Write active leases to `<file>.tmp` and rename it over the lease file.
    pub async fn save_leases(&self) -> Result<()> {
        let now = now_unix();
        let mut lines: Vec<String> = {
            let leases = self.leases.read().await;
            leases
                .values()
                .filter(|l| l.is_active(now))
                .map(Lease::to_line)
                .collect()
        };
        lines.sort_by(|a, b| lease_sort_key(a).cmp(lease_sort_key(b)));

        let mut content = format!(
            "# dnsmasq leases, written {}\n",
            chrono::Utc::now().to_rfc3339()
        );
        for line in lines {
            content.push_str(&line);
            content.push('\n');
        }

        let dir = self.watch_dir();
        if let Some(ref dir) = dir {
            ensure_dir(dir).await?;
        }
        write_atomic(&self.file_path, &content).await?;

        if let Some(dir) = dir {
            if self.watcher.watch(&dir).await? {
                info!("Watching {} for lease changes", dir.display());
            }
        }
        Ok(())
    }

    pub async fn get_lease(&self, mac: &str) -> Option<Lease> {
        self.leases.read().await.get(mac).cloned()
    }

    /// Add or replace the lease for `mac`, expiring `lease_secs` from now.
    /// Whitespace in the hostname or client id is folded to `-`; an empty
    /// hostname is stored as `*`.
    pub async fn add_lease(
        &self,
        mac: &str,
        ip: Ipv4Addr,
        hostname: &str,
        lease_secs: u64,
    ) -> Lease {
        self.add_lease_with_client_id(mac, ip, hostname, lease_secs, None)
            .await
    }

    pub async fn add_lease_with_client_id(
        &self,
        mac: &str,
        ip: Ipv4Addr,
        hostname: &str,
        lease_secs: u64,
        client_id: Option<&str>,
    ) -> Lease {
        let lease_secs = i64::try_from(lease_secs).unwrap_or(i64::MAX);
        let lease = Lease {
            expiry: now_unix().saturating_add(lease_secs),
            mac: mac.to_string(),
            ip,
            hostname: lease_field(hostname).unwrap_or_else(|| "*".to_string()),
            client_id: client_id.and_then(lease_field).filter(|c| c != "*"),
            declined: false,
            decline_time: 0,
        };
        self.leases
            .write()
            .await
            .insert(lease.mac.clone(), lease.clone());
        lease
    }

    pub async fn remove_lease(&self, mac: &str) -> Option<Lease> {
        self.leases.write().await.remove(mac)
    }

    /// Flag every lease holding `ip` as declined, starting the cooldown now.
    pub async fn mark_ip_declined(&self, ip: Ipv4Addr) -> Result<()> {
        let now = now_unix();
        let mut leases = self.leases.write().await;
        let mut found = false;
        for lease in leases.values_mut().filter(|l| l.ip == ip) {
            lease.declined = true;
            lease.decline_time = now;
            found = true;
        }
        if !found {
            bail!("no lease holds {}", ip);
        }
        info!("Marked {} as declined", ip);
        Ok(())
    }

    pub async fn is_ip_declined(&self, ip: Ipv4Addr) -> bool {
        let now = now_unix();
        self.leases
            .read()
            .await
            .values()
            .any(|l| l.ip == ip && l.in_decline_cooldown(now))
    }

    /// IPs still inside their decline cooldown.
    pub async fn declined_ips(&self) -> HashSet<Ipv4Addr> {
        let now = now_unix();
        self.leases
            .read()
            .await
            .values()
            .filter(|l| l.in_decline_cooldown(now))
            .map(|l| l.ip)
            .collect()
    }

    /// Reset decline flags whose cooldown has elapsed. Returns how many were reset.
    pub async fn clear_declined_ips(&self) -> usize {
        let now = now_unix();
        let mut leases = self.leases.write().await;
        let mut cleared = 0;
        for lease in leases
            .values_mut()
            .filter(|l| l.declined && !l.in_decline_cooldown(now))
        {
            lease.declined = false;
            lease.decline_time = 0;
            cleared += 1;
        }
        cleared
    }

    /// Purge expired leases
    pub async fn clean_expired_leases(&self) -> usize {
        let now = now_unix();
        let mut leases = self.leases.write().await;
        let before = leases.len();
        leases.retain(|_, l| l.is_active(now));
        before - leases.len()
    }

    /// Snapshot of non-expired leases keyed by MAC.
    pub async fn get_active_leases(&self) -> HashMap<String, Lease> {
        let now = now_unix();
        self.leases
            .read()
            .await
            .iter()
            .filter(|(_, l)| l.is_active(now))
            .map(|(mac, l)| (mac.clone(), l.clone()))
            .collect()
    }

    /// Reload whenever the lease file changes on disk, until shutdown.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut events) = self.watcher.take_events().await else {
            warn!("Lease watcher for {} already running", self.file_path.display());
            return;
        };
        let file_name = self.file_path.file_name().map(|n| n.to_os_string());

        while let Some(res) = watcher::next_event(&mut events, &mut shutdown).await {
            match res {
                Ok(event) => {
                    let touches_lease_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !touches_lease_file || !watcher::is_change_event(&event) {
                        continue;
                    }
                    debug!("Lease file changed ({:?}), reloading", event.kind);
                    if let Err(e) = self.load_leases().await {
                        warn!("Failed to reload leases: {:#}", e);
                    }
                }
                Err(e) => warn!("Lease watcher error: {}", e),
            }
        }
        debug!("Lease watcher for {} stopped", self.file_path.display());
    }

    pub async fn close(&self) -> Result<()> {
        self.watcher.close().await;
        Ok(())
    }
}

/// Sort saved lines by MAC (second field).
/// `value` as a single lease-file field, or `None` when it is blank.
fn lease_field(value: &str) -> Option<String> {
    let field = value.split_whitespace().collect::<Vec<_>>().join("-");
    (!field.is_empty()).then_some(field)
}

fn lease_sort_key(line: &str) -> &str {
    line.split_whitespace().nth(1).unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC_A: &str = "aa:bb:cc:dd:ee:ff";
    const MAC_B: &str = "11:22:33:44:55:66";

    async fn store_in(dir: &Path) -> LeaseStore {
        LeaseStore::new(dir.join("dnsmasq.leases")).await.unwrap()
    }

    #[test]
    fn test_parse_line() {
        let lease =
            Lease::parse_line("1700000000 AA:BB:CC:DD:EE:FF 10.0.0.5 node1 01:aa:bb:cc:dd:ee:ff")
                .unwrap();
        assert_eq!(lease.expiry, 1_700_000_000);
        assert_eq!(lease.mac, MAC_A);
        assert_eq!(lease.ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(lease.hostname, "node1");
        assert_eq!(lease.client_id.as_deref(), Some("01:aa:bb:cc:dd:ee:ff"));

        let lease = Lease::parse_line("1700000000 aa:bb:cc:dd:ee:ff 10.0.0.5 * *").unwrap();
        assert_eq!(lease.hostname, "*");
        assert!(lease.client_id.is_none());

        assert!(Lease::parse_line("soon aa:bb:cc:dd:ee:ff 10.0.0.5 x").is_err());
        assert!(Lease::parse_line("1700000000 not-a-mac 10.0.0.5 x").is_err());
        assert!(Lease::parse_line("1700000000 aa:bb:cc:dd:ee:ff 10.0.0 x").is_err());
        assert!(Lease::parse_line("1700000000 aa:bb:cc:dd:ee:ff").is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        assert_eq!(store.load_leases().await.unwrap(), 0);
        assert!(store.get_active_leases().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.leases");
        let future = now_unix() + 3600;
        std::fs::write(
            &path,
            format!(
                "# comment\n{future} {MAC_A} 10.0.0.5 node1\ngarbage line here\n\
                 duid 00:01:00:01\n{future} {MAC_B} 10.0.0.6 node2 01:11:22\n"
            ),
        )
        .unwrap();

        let store = store_in(dir.path()).await;
        assert_eq!(store.load_leases().await.unwrap(), 2);
        assert_eq!(store.get_lease(MAC_B).await.unwrap().client_id.as_deref(), Some("01:11:22"));
    }

    #[tokio::test]
    async fn test_load_replaces_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.add_lease(MAC_A, Ipv4Addr::new(10, 0, 0, 5), "a", 3600).await;

        store.load_leases().await.unwrap();
        assert!(store.get_lease(MAC_A).await.is_none());
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store
            .add_lease_with_client_id(MAC_A, Ipv4Addr::new(10, 0, 0, 5), "node-a", 3600, Some("01:aa"))
            .await;
        store.add_lease(MAC_B, Ipv4Addr::new(10, 0, 0, 6), "node-b", 7200).await;
        store.save_leases().await.unwrap();

        let reloaded = store_in(dir.path()).await;
        reloaded.load_leases().await.unwrap();

        let before = store.get_active_leases().await;
        let after = reloaded.get_active_leases().await;
        assert_eq!(before, after);

        let content = std::fs::read_to_string(dir.path().join("dnsmasq.leases")).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("# dnsmasq leases"));
        // sorted by MAC
        assert!(lines.next().unwrap().contains(MAC_B));
    }

    #[tokio::test]
    async fn test_whitespace_fields_stay_one_column() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let lease = store
            .add_lease_with_client_id(MAC_A, Ipv4Addr::new(10, 0, 0, 5), " my  host\t", 3600, Some("01 aa"))
            .await;
        assert_eq!(lease.hostname, "my-host");
        assert_eq!(lease.client_id.as_deref(), Some("01-aa"));

        let blank = store
            .add_lease_with_client_id(MAC_B, Ipv4Addr::new(10, 0, 0, 6), "  ", 3600, Some(" "))
            .await;
        assert_eq!(blank.hostname, "*");
        assert!(blank.client_id.is_none());

        store.save_leases().await.unwrap();
        let reloaded = store_in(dir.path()).await;
        reloaded.load_leases().await.unwrap();
        assert_eq!(reloaded.get_active_leases().await, store.get_active_leases().await);
    }

    #[tokio::test]
    async fn test_save_skips_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.add_lease(MAC_A, Ipv4Addr::new(10, 0, 0, 5), "a", 3600).await;
        store.add_lease(MAC_B, Ipv4Addr::new(10, 0, 0, 6), "b", 3600).await;
        store.leases.write().await.get_mut(MAC_B).unwrap().expiry = now_unix() - 10;

        store.save_leases().await.unwrap();
        let content = std::fs::read_to_string(store.file_path()).unwrap();
        assert!(content.contains(MAC_A));
        assert!(!content.contains(MAC_B));
    }

    #[tokio::test]
    async fn test_save_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("state");
        let store = store_in(&nested).await;
        assert!(!store.watcher.is_watching(&nested).await);

        store.add_lease(MAC_A, Ipv4Addr::new(10, 0, 0, 5), "a", 3600).await;
        store.save_leases().await.unwrap();

        assert!(nested.join("dnsmasq.leases").exists());
        assert!(store.watcher.is_watching(&nested).await);
    }

    #[tokio::test]
    async fn test_add_lease_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.add_lease(MAC_A, Ipv4Addr::new(10, 0, 0, 5), "a", 3600).await;
        store.add_lease(MAC_A, Ipv4Addr::new(10, 0, 0, 9), "a2", 3600).await;

        let active = store.get_active_leases().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[MAC_A].ip, Ipv4Addr::new(10, 0, 0, 9));

        assert!(store.remove_lease(MAC_A).await.is_some());
        assert!(store.get_lease(MAC_A).await.is_none());
    }

    #[tokio::test]
    async fn test_expiry_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.add_lease(MAC_A, Ipv4Addr::new(10, 0, 0, 5), "a", 3600).await;
        store.add_lease(MAC_B, Ipv4Addr::new(10, 0, 0, 6), "b", 3600).await;
        store.leases.write().await.get_mut(MAC_B).unwrap().expiry = now_unix() - 1;

        let active = store.get_active_leases().await;
        assert!(active.contains_key(MAC_A));
        assert!(!active.contains_key(MAC_B));
        // non-destructive
        assert!(store.get_lease(MAC_B).await.is_some());

        assert_eq!(store.clean_expired_leases().await, 1);
        assert!(store.get_lease(MAC_B).await.is_none());
        assert!(store.get_lease(MAC_A).await.is_some());
    }

    #[tokio::test]
    async fn test_decline_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        store.add_lease(MAC_A, ip, "a", 3600).await;

        assert!(!store.is_ip_declined(ip).await);
        store.mark_ip_declined(ip).await.unwrap();
        assert!(store.is_ip_declined(ip).await);
        assert!(store.declined_ips().await.contains(&ip));

        // still cooling down: nothing to clear
        assert_eq!(store.clear_declined_ips().await, 0);

        store.leases.write().await.get_mut(MAC_A).unwrap().decline_time =
            now_unix() - DECLINE_COOLDOWN_SECS - 1;
        assert!(!store.is_ip_declined(ip).await);
        assert!(store.get_lease(MAC_A).await.unwrap().declined);

        assert_eq!(store.clear_declined_ips().await, 1);
        assert!(!store.get_lease(MAC_A).await.unwrap().declined);
    }

    #[tokio::test]
    async fn test_decline_unknown_ip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        assert!(store.mark_ip_declined(Ipv4Addr::new(10, 0, 0, 5)).await.is_err());
    }

    #[tokio::test]
    async fn test_decline_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        store.add_lease(MAC_A, ip, "a", 3600).await;
        store.mark_ip_declined(ip).await.unwrap();
        store.save_leases().await.unwrap();

        store.load_leases().await.unwrap();
        assert!(store.is_ip_declined(ip).await);
    }

    #[tokio::test]
    async fn test_start_exits_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        store.start(rx).await;
        store.close().await.unwrap();
    }
}
