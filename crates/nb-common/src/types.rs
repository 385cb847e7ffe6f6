use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// DHCP view of a client, as handed to the DHCP and TFTP layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dhcp {
    pub mac: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub hostname: String,
    /// Seconds remaining on the lease. Zero on `put` means "use the default".
    #[serde(default)]
    pub lease_time: u32,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub subnet_mask: Option<Ipv4Addr>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub name_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub domain_name: Option<String>,
}

impl Dhcp {
    pub fn new(mac: &str, ip: Ipv4Addr) -> Self {
        Self {
            mac: mac.to_string(),
            ip,
            hostname: String::new(),
            lease_time: 0,
            client_id: None,
            subnet_mask: None,
            gateway: None,
            name_servers: Vec::new(),
            domain_name: None,
        }
    }
}

/// Netboot policy for a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Netboot {
    pub allow_netboot: bool,
    #[serde(default)]
    pub ipxe_script_url: Option<String>,
}

/// Normalize a hardware address to lowercase, colon-separated form.
/// Accepts `:` or `-` separators. Returns `None` unless there are exactly six hex octets.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let octets: Vec<&str> = mac.trim().split([':', '-']).collect();
    if octets.len() != 6 {
        return None;
    }

    let mut out = Vec::with_capacity(6);
    for octet in octets {
        if octet.is_empty() || octet.len() > 2 {
            return None;
        }
        let value = u8::from_str_radix(octet, 16).ok()?;
        out.push(format!("{:02x}", value));
    }
    Some(out.join(":"))
}
