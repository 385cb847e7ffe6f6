//! dnsmasq-compatible netboot backend.
//!
//! Composes the lease store and the hosts/opts config store behind the
//! reader/writer/syncer traits used by the DHCP and TFTP layers. Writes that
//! touch both stores (`put`, auto-assignment, `sync`) run under a single
//! update lock so the two files never interleave with each other.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::anyhow;
use nb_common::arch::default_boot_file;
use nb_common::{
    normalize_mac, BackendError, BackendReader, BackendResult, BackendSyncer, BackendWriter,
    Dhcp, Netboot,
};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::allocator::{assign_ip, IpPool};
use crate::config::{DnsmasqConfig, ONE_WEEK_SECS};
use crate::config_store::{ConfigStore, OPTION_BOOT_FILE, TAG_IPXE};
use crate::lease_store::{Lease, LeaseStore};
use crate::now_unix;

/// Network parameters copied onto every DHCP projection.
#[derive(Debug, Clone, Default)]
struct NetworkDefaults {
    subnet_mask: Option<Ipv4Addr>,
    gateway: Option<Ipv4Addr>,
    name_servers: Vec<Ipv4Addr>,
    domain_name: Option<String>,
}

impl NetworkDefaults {
    fn from_config(config: &DnsmasqConfig) -> BackendResult<Self> {
        let parse = |field: &str, value: &str| -> BackendResult<Option<Ipv4Addr>> {
            if value.trim().is_empty() {
                return Ok(None);
            }
            value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| BackendError::Config(format!("invalid {} {:?}", field, value)))
        };

        let mut name_servers = Vec::with_capacity(config.dns_servers.len());
        for server in &config.dns_servers {
            if let Some(ip) = parse("DNS server", server)? {
                name_servers.push(ip);
            }
        }

        Ok(Self {
            subnet_mask: parse("subnet mask", &config.subnet_mask)?,
            gateway: parse("gateway", &config.gateway)?,
            name_servers,
            domain_name: (!config.domain.is_empty()).then(|| config.domain.clone()),
        })
    }
}

pub struct DnsmasqBackend {
    leases: Arc<LeaseStore>,
    config_store: Arc<ConfigStore>,
    tftp_server: String,
    http_server: String,
    pool: Option<IpPool>,
    auto_assign: bool,
    default_lease_secs: u64,
    network: NetworkDefaults,
    update_lock: Mutex<()>,
}

impl DnsmasqBackend {
    /// Validate the config, open both stores and load them from disk.
    pub async fn new(config: DnsmasqConfig) -> BackendResult<Self> {
        let pool = match (config.pool_start.trim(), config.pool_end.trim()) {
            ("", "") => None,
            (start, end) => Some(IpPool::parse(start, end)?),
        };
        if config.auto_assign && pool.is_none() {
            return Err(BackendError::Config(
                "auto_assign requires pool_start and pool_end".to_string(),
            ));
        }
        let network = NetworkDefaults::from_config(&config)?;

        let leases = Arc::new(LeaseStore::new(config.lease_file_path()).await?);
        let config_store = Arc::new(ConfigStore::new(&config.root_dir).await?);
        leases.load_leases().await?;
        config_store.load_config().await?;

        let default_lease_secs = if config.default_lease_time_secs == 0 {
            ONE_WEEK_SECS
        } else {
            config.default_lease_time_secs
        };

        info!(
            "dnsmasq backend ready: root {}, auto-assign {}",
            config.root_dir.display(),
            match pool {
                Some(p) if config.auto_assign => format!("{}-{}", p.start(), p.end()),
                _ => "disabled".to_string(),
            }
        );

        Ok(Self {
            leases,
            config_store,
            tftp_server: config.tftp_server,
            http_server: config.http_server,
            pool,
            auto_assign: config.auto_assign,
            default_lease_secs,
            network,
            update_lock: Mutex::new(()),
        })
    }

    pub fn lease_store(&self) -> &LeaseStore {
        &self.leases
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config_store
    }

    fn auto_assign_pool(&self) -> Option<&IpPool> {
        self.pool.as_ref().filter(|_| self.auto_assign)
    }

    /// Deterministic pool address for `mac`, skipping addresses leased to
    /// other MACs or still in decline cooldown.
    pub async fn assign_ip_for_mac(&self, mac: &str) -> BackendResult<Ipv4Addr> {
        let pool = self
            .auto_assign_pool()
            .ok_or_else(|| BackendError::Config("automatic assignment is disabled".to_string()))?;

        let taken: HashSet<Ipv4Addr> = self
            .leases
            .get_active_leases()
            .await
            .into_values()
            .filter(|l| l.mac != mac)
            .map(|l| l.ip)
            .collect();
        let declined = self.leases.declined_ips().await;

        assign_ip(pool, mac, &taken, &declined)
    }

    /// Persist both stores. The watchers will reload what was just written.
    async fn save(&self) -> BackendResult<()> {
        self.leases.save_leases().await?;
        self.config_store.save_config().await?;
        Ok(())
    }

    async fn active_lease(&self, mac: &str) -> Option<Lease> {
        let now = now_unix();
        self.leases
            .get_lease(mac)
            .await
            .filter(|l| l.is_active(now))
    }

    /// Lease plus netboot-enablement as seen by callers.
    async fn project(&self, lease: &Lease) -> (Dhcp, Netboot) {
        let dhcp = Dhcp {
            mac: lease.mac.clone(),
            ip: lease.ip,
            hostname: lease.hostname.clone(),
            lease_time: lease.remaining_secs(now_unix()),
            client_id: lease.client_id.clone(),
            subnet_mask: self.network.subnet_mask,
            gateway: self.network.gateway,
            name_servers: self.network.name_servers.clone(),
            domain_name: self.network.domain_name.clone(),
        };

        let allow_netboot = self.config_store.is_netboot_enabled(&lease.mac).await;
        let ipxe_script_url = if allow_netboot {
            self.config_store
                .get_options(&lease.mac)
                .await
                .into_iter()
                .find(|o| o.option_code == OPTION_BOOT_FILE && o.conditional_tag == TAG_IPXE)
                .map(|o| o.value)
        } else {
            None
        };

        (
            dhcp,
            Netboot {
                allow_netboot,
                ipxe_script_url,
            },
        )
    }

    async fn enable_netboot(&self, mac: &str) {
        self.config_store
            .add_netboot_options_with_boot_file(
                mac,
                &self.tftp_server,
                &self.http_server,
                default_boot_file(mac),
            )
            .await;
    }

    /// Auto-assign a lease for an unseen MAC. Default netboot options are
    /// only written when the MAC has no host entry yet.
    async fn assign_new_lease(&self, mac: &str) -> BackendResult<Lease> {
        let _guard = self.update_lock.lock().await;

        // Another request may have assigned it while we waited.
        if let Some(lease) = self.active_lease(mac).await {
            return Ok(lease);
        }

        let ip = self.assign_ip_for_mac(mac).await?;
        let hostname = format!("auto-{}", mac.replace(':', ""));
        self.leases
            .add_lease(mac, ip, &hostname, self.default_lease_secs)
            .await;
        if self.config_store.get_host(mac).await.is_none() {
            self.enable_netboot(mac).await;
        }
        self.save().await?;
        info!("Auto-assigned {} to {}", ip, mac);

        self.active_lease(mac)
            .await
            .ok_or_else(|| BackendError::NotFound(mac.to_string()))
    }

    /// Run both watcher loops until `shutdown` flips to true.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let leases = Arc::clone(&self.leases);
        let lease_shutdown = shutdown.clone();
        let lease_task = tokio::spawn(async move { leases.start(lease_shutdown).await });

        let config_store = Arc::clone(&self.config_store);
        let config_shutdown = shutdown.clone();
        let config_task = tokio::spawn(async move { config_store.start(config_shutdown).await });

        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        for (name, task) in [("lease", lease_task), ("config", config_task)] {
            if let Err(e) = task.await {
                error!("{} watcher task failed: {}", name, e);
            }
        }
    }

    /// Close both stores, reporting every failure.
    pub async fn close(&self) -> BackendResult<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.leases.close().await {
            errors.push(format!("lease store: {:#}", e));
        }
        if let Err(e) = self.config_store.close().await {
            errors.push(format!("config store: {:#}", e));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BackendError::Other(anyhow!(errors.join("; "))))
        }
    }
}

#[async_trait::async_trait]
impl BackendReader for DnsmasqBackend {
    async fn get_by_mac(&self, mac: &str) -> BackendResult<(Dhcp, Netboot)> {
        let mac = normalize_mac(mac).ok_or_else(|| BackendError::NotFound(mac.to_string()))?;

        let lease = match self.active_lease(&mac).await {
            Some(lease) => lease,
            None if self.auto_assign_pool().is_some() => self.assign_new_lease(&mac).await?,
            None => return Err(BackendError::NotFound(mac)),
        };
        Ok(self.project(&lease).await)
    }

    async fn get_by_ip(&self, ip: Ipv4Addr) -> BackendResult<(Dhcp, Netboot)> {
        let mut matches: Vec<Lease> = self
            .leases
            .get_active_leases()
            .await
            .into_values()
            .filter(|l| l.ip == ip)
            .collect();
        if matches.len() > 1 {
            warn!("{} active leases hold {}", matches.len(), ip);
            matches.sort_by(|a, b| a.mac.cmp(&b.mac));
        }
        match matches.first() {
            Some(lease) => Ok(self.project(lease).await),
            None => Err(BackendError::NotFound(ip.to_string())),
        }
    }

    async fn get_keys(&self) -> BackendResult<Vec<String>> {
        let mut keys: Vec<String> = self.leases.get_active_leases().await.into_keys().collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait::async_trait]
impl BackendWriter for DnsmasqBackend {
    async fn put(
        &self,
        mac: &str,
        dhcp: Option<&Dhcp>,
        netboot: Option<&Netboot>,
    ) -> BackendResult<()> {
        let mac = normalize_mac(mac)
            .ok_or_else(|| BackendError::Config(format!("invalid MAC {:?}", mac)))?;
        let _guard = self.update_lock.lock().await;

        if let Some(dhcp) = dhcp {
            let lease_secs = if dhcp.lease_time == 0 {
                self.default_lease_secs
            } else {
                u64::from(dhcp.lease_time)
            };
            self.leases
                .add_lease_with_client_id(
                    &mac,
                    dhcp.ip,
                    &dhcp.hostname,
                    lease_secs,
                    dhcp.client_id.as_deref(),
                )
                .await;
            info!("Stored lease {} -> {} ({}s)", mac, dhcp.ip, lease_secs);
        }

        if let Some(netboot) = netboot {
            if netboot.allow_netboot {
                self.enable_netboot(&mac).await;
                info!("Netboot enabled for {}", mac);
            } else {
                self.config_store.disable_netboot(&mac).await;
                info!("Netboot disabled for {}", mac);
            }
        }

        self.save().await
    }
}

#[async_trait::async_trait]
impl BackendSyncer for DnsmasqBackend {
    async fn sync(&self) -> BackendResult<()> {
        let _guard = self.update_lock.lock().await;
        let expired = self.leases.clean_expired_leases().await;
        self.leases.load_leases().await?;
        self.config_store.load_config().await?;
        info!("Synced leases and netboot config from disk ({} expired)", expired);
        Ok(())
    }
}
