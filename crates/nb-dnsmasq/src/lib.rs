pub mod allocator;
pub mod backend;
pub mod config;
pub mod config_store;
pub mod files;
pub mod lease_store;
pub mod watcher;

pub use backend::DnsmasqBackend;
pub use config::DnsmasqConfig;
pub use config_store::ConfigStore;
pub use lease_store::LeaseStore;

/// Current time as Unix seconds.
pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
