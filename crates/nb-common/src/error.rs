use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors surfaced to DHCP/TFTP/HTTP callers of a netboot backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("IP pool {start}-{end} exhausted")]
    PoolExhausted { start: Ipv4Addr, end: Ipv4Addr },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
