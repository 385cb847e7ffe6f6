pub mod arch;
pub mod backend;
pub mod config;
pub mod error;
pub mod types;

pub use backend::{BackendReader, BackendSyncer, BackendWriter};
pub use error::{BackendError, BackendResult};
pub use types::{normalize_mac, Dhcp, Netboot};
