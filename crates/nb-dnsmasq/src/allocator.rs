//! Deterministic IP placement for first-seen MACs.
//!
//! The MD5 of the MAC picks a starting slot in the pool; collisions are
//! resolved by probing forward one address at a time, wrapping at the end.
//! The same MAC lands on the same IP as long as the pool and the lease table
//! are unchanged.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use md5::{Digest, Md5};
use nb_common::{BackendError, BackendResult};

/// Inclusive IPv4 range used for automatic assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPool {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl IpPool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> BackendResult<Self> {
        if u32::from(start) > u32::from(end) {
            return Err(BackendError::Config(format!(
                "IP pool start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> BackendResult<Self> {
        let start: Ipv4Addr = start
            .trim()
            .parse()
            .map_err(|_| BackendError::Config(format!("invalid pool start {:?}", start)))?;
        let end: Ipv4Addr = end
            .trim()
            .parse()
            .map_err(|_| BackendError::Config(format!("invalid pool end {:?}", end)))?;
        Self::new(start, end)
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        ip >= u32::from(self.start) && ip <= u32::from(self.end)
    }

    /// Address `offset` slots past the start, wrapping inside the pool.
    fn nth(&self, offset: u64) -> Ipv4Addr {
        let offset = offset % self.size();
        // offset < size <= 2^32, and start + offset <= end
        Ipv4Addr::from(u32::from(self.start) + offset as u32)
    }
}

/// First four bytes of MD5(mac) as a big-endian integer.
pub fn mac_offset_seed(mac: &str) -> u32 {
    let digest = Md5::digest(mac.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Pick an IP for `mac`.
///
/// `taken` holds addresses actively leased to other MACs; `declined` holds
/// addresses still inside their decline cooldown.
pub fn assign_ip(
    pool: &IpPool,
    mac: &str,
    taken: &HashSet<Ipv4Addr>,
    declined: &HashSet<Ipv4Addr>,
) -> BackendResult<Ipv4Addr> {
    let size = pool.size();
    let first = u64::from(mac_offset_seed(mac)) % size;

    for step in 0..size {
        let ip = pool.nth(first + step);
        if !taken.contains(&ip) && !declined.contains(&ip) {
            return Ok(ip);
        }
    }

    Err(BackendError::PoolExhausted {
        start: pool.start,
        end: pool.end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> IpPool {
        IpPool::parse("192.168.1.100", "192.168.1.200").unwrap()
    }

    #[test]
    fn test_pool_bounds() {
        let pool = pool();
        assert_eq!(pool.size(), 101);
        assert!(pool.contains(Ipv4Addr::new(192, 168, 1, 100)));
        assert!(pool.contains(Ipv4Addr::new(192, 168, 1, 200)));
        assert!(!pool.contains(Ipv4Addr::new(192, 168, 1, 201)));

        assert_eq!(IpPool::parse("10.0.0.1", "10.0.0.1").unwrap().size(), 1);
        assert_eq!(IpPool::parse("0.0.0.0", "255.255.255.255").unwrap().size(), 1 << 32);
        assert!(IpPool::parse("10.0.0.9", "10.0.0.1").is_err());
        assert!(IpPool::parse("10.0.0", "10.0.0.1").is_err());
        assert!(IpPool::parse("10.0.0.1", "").is_err());
    }

    #[test]
    fn test_seed_is_md5_prefix() {
        // md5("aa:bb:cc:dd:ee:ff") starts with 0x6424e2dc
        assert_eq!(mac_offset_seed("aa:bb:cc:dd:ee:ff"), 1_680_138_972);
        assert_eq!(mac_offset_seed("52:54:00:12:34:56"), 3_677_182_404);
    }

    #[test]
    fn test_deterministic_assignment() {
        let empty = HashSet::new();
        let ip = assign_ip(&pool(), "aa:bb:cc:dd:ee:ff", &empty, &empty).unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 133));
        assert_eq!(
            assign_ip(&pool(), "aa:bb:cc:dd:ee:ff", &empty, &empty).unwrap(),
            ip
        );
        assert_eq!(
            assign_ip(&pool(), "52:54:00:12:34:56", &empty, &empty).unwrap(),
            Ipv4Addr::new(192, 168, 1, 158)
        );
    }

    #[test]
    fn test_collision_probes_forward() {
        let pool = IpPool::parse("10.0.0.1", "10.0.0.10").unwrap();
        let empty = HashSet::new();

        // find two MACs sharing a candidate slot
        let macs: Vec<String> = (0..11).map(|i| format!("02:00:00:00:00:{:02x}", i)).collect();
        let mut seen = std::collections::HashMap::new();
        let (a, b) = macs
            .iter()
            .find_map(|mac| {
                let ip = assign_ip(&pool, mac, &empty, &empty).unwrap();
                seen.insert(ip, mac.clone()).map(|other| (other, mac.clone()))
            })
            .unwrap();

        let x = assign_ip(&pool, &a, &empty, &empty).unwrap();
        let taken: HashSet<Ipv4Addr> = [x].into_iter().collect();
        let y = assign_ip(&pool, &b, &taken, &empty).unwrap();
        assert_ne!(x, y);
        assert_eq!(y, pool.nth(u64::from(u32::from(x) - u32::from(pool.start())) + 1));
    }

    #[test]
    fn test_probe_wraps_to_start() {
        let pool = pool();
        let empty = HashSet::new();
        // 192.168.1.133 is the candidate; take everything from there to the end
        let taken: HashSet<Ipv4Addr> = (133..=200).map(|i| Ipv4Addr::new(192, 168, 1, i)).collect();
        let ip = assign_ip(&pool, "aa:bb:cc:dd:ee:ff", &taken, &empty).unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 100));
    }

    #[test]
    fn test_declined_is_skipped() {
        let empty = HashSet::new();
        let declined: HashSet<Ipv4Addr> = [Ipv4Addr::new(192, 168, 1, 133)].into_iter().collect();
        let ip = assign_ip(&pool(), "aa:bb:cc:dd:ee:ff", &empty, &declined).unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 134));
    }

    #[test]
    fn test_pool_exhausted() {
        let pool = IpPool::parse("10.0.0.1", "10.0.0.2").unwrap();
        let taken: HashSet<Ipv4Addr> = [Ipv4Addr::new(10, 0, 0, 1)].into_iter().collect();
        let declined: HashSet<Ipv4Addr> = [Ipv4Addr::new(10, 0, 0, 2)].into_iter().collect();

        let err = assign_ip(&pool, "aa:bb:cc:dd:ee:ff", &taken, &declined).unwrap_err();
        assert!(matches!(err, BackendError::PoolExhausted { .. }));
    }
}
