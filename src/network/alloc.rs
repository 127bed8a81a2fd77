//! MAC and IP allocation for bridge interfaces.

use crate::error::{Error, Result};
use crate::process::Executable;
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Locally administered, unicast vendor prefix of generated MACs.
pub const MAC_PREFIX: [u8; 3] = [0x02, 0xb0, 0xb0];

const LOW_MASK: u32 = 0x00ff_ffff;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a. Stable across toolchains, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |h, b| (h ^ u32::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Format six octets as `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(b: [u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

/// Parse `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for byte in out.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| Error::invalid_config(format!("invalid mac address '{}'", s)))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| Error::invalid_config(format!("invalid mac address '{}'", s)))?;
    }
    if parts.next().is_some() {
        return Err(Error::invalid_config(format!("invalid mac address '{}'", s)));
    }
    Ok(out)
}

/// Hands out MAC addresses by incrementing the low three bytes of a base.
///
/// Addresses never repeat within one sequencer. Independent sequencers
/// may collide, so assigned MACs must be persisted and reused.
#[derive(Debug, Clone)]
pub struct MacSequencer {
    prefix: [u8; 3],
    base: u32,
    offset: u32,
}

impl MacSequencer {
    /// Sequencer starting at `base` (low three bytes). The first address
    /// handed out is `base + 1` unless [`start_at_zero`](Self::start_at_zero)
    /// is set.
    pub fn new(prefix: [u8; 3], base: u32) -> Self {
        Self {
            prefix,
            base: base & LOW_MASK,
            offset: 1,
        }
    }

    /// Sequencer with a random base.
    pub fn random() -> Self {
        let bytes = uuid::Uuid::new_v4().into_bytes();
        Self::new(MAC_PREFIX, u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    /// Sequencer whose base is derived from `seed`, e.g. a network UID.
    pub fn seeded(seed: &str) -> Self {
        Self::new(MAC_PREFIX, fnv1a(seed.as_bytes()))
    }

    /// Hand out the base itself first.
    pub fn start_at_zero(mut self) -> Self {
        self.offset = 0;
        self
    }

    /// Next address.
    pub fn next_mac(&mut self) -> String {
        let low = self.base.wrapping_add(self.offset) & LOW_MASK;
        self.offset = self.offset.wrapping_add(1);
        let [_, a, b, c] = low.to_be_bytes();
        format_mac([self.prefix[0], self.prefix[1], self.prefix[2], a, b, c])
    }

    /// Next address not in `taken`.
    pub fn next_free(&mut self, taken: &HashSet<String>) -> Result<String> {
        for _ in 0..=LOW_MASK {
            let mac = self.next_mac();
            if !taken.contains(&mac) {
                return Ok(mac);
            }
        }
        Err(Error::network("allocate mac", "address space exhausted"))
    }
}

/// Checks whether an address answers.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn alive(&self, addr: Ipv4Addr) -> bool;
}

/// ICMP probe through the system `ping`.
#[derive(Debug, Clone)]
pub struct PingProber {
    timeout: Duration,
}

impl Default for PingProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl PingProber {
    /// Probe with a single echo request waiting up to `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn alive(&self, addr: Ipv4Addr) -> bool {
        let wait = self.timeout.as_secs().max(1).to_string();
        let target = addr.to_string();
        let mut exe = Executable::new("ping").args(["-c", "1", "-W", wait.as_str(), target.as_str()]);
        // ping's own timeout is whole seconds; bound the call as well.
        matches!(
            tokio::time::timeout(self.timeout + Duration::from_millis(500), exe.output()).await,
            Ok(Ok(_))
        )
    }
}

fn is_unicast(addr: Ipv4Addr) -> bool {
    !(addr.is_unspecified() || addr.is_broadcast() || addr.is_multicast() || addr.is_loopback())
}

/// Pick a free address in the gateway's subnet.
///
/// Candidates are walked upward from the gateway, wrapping around to the
/// start of the subnet. The gateway, network and broadcast addresses,
/// non-unicast addresses, anything in `taken` and anything that answers
/// `prober` are skipped.
pub async fn allocate_ip(
    gateway: Ipv4Addr,
    prefix: u8,
    taken: &HashSet<Ipv4Addr>,
    prober: &dyn Prober,
) -> Result<Ipv4Addr> {
    if !(1..=30).contains(&prefix) {
        return Err(Error::invalid_config(format!(
            "prefix length {} out of range 1-30",
            prefix
        )));
    }
    let host_bits = 32 - u32::from(prefix);
    let mask = !((1u32 << host_bits) - 1);
    let gw = u32::from(gateway);
    let network = gw & mask;
    let broadcast = network | !mask;
    if gw == network || gw == broadcast {
        return Err(Error::invalid_config(format!(
            "gateway {} is not a host address of {}/{}",
            gateway,
            Ipv4Addr::from(network),
            prefix
        )));
    }

    let upward = gw.saturating_add(1)..broadcast;
    let wrapped = (network + 1)..gw;
    for candidate in upward.chain(wrapped).map(Ipv4Addr::from) {
        if candidate == gateway || !is_unicast(candidate) || taken.contains(&candidate) {
            continue;
        }
        if prober.alive(candidate).await {
            tracing::debug!(addr = %candidate, "address answers probe, skipping");
            continue;
        }
        return Ok(candidate);
    }

    Err(Error::network(
        "allocate ip",
        format!("subnet {}/{} exhausted", Ipv4Addr::from(network), prefix),
    ))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Answers for a fixed set of addresses.
    #[derive(Debug, Default)]
    pub struct StaticProber(pub parking_lot::Mutex<HashSet<Ipv4Addr>>);

    impl StaticProber {
        pub fn answering(addrs: impl IntoIterator<Item = Ipv4Addr>) -> Self {
            Self(parking_lot::Mutex::new(addrs.into_iter().collect()))
        }
    }

    #[async_trait]
    impl Prober for StaticProber {
        async fn alive(&self, addr: Ipv4Addr) -> bool {
            self.0.lock().contains(&addr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticProber;
    use super::*;

    #[test]
    fn test_sequencer_start_at_zero_increments() {
        let mut seq = MacSequencer::new(MAC_PREFIX, 0x00_10_20).start_at_zero();
        let first = parse_mac(&seq.next_mac()).unwrap();
        seq.next_mac();
        let third = parse_mac(&seq.next_mac()).unwrap();
        let fourth = parse_mac(&seq.next_mac()).unwrap();
        let fifth = parse_mac(&seq.next_mac()).unwrap();

        assert_eq!(&first[..3], &MAC_PREFIX);
        assert_eq!(first[5], 0x20);
        assert_eq!(third[5], first[5] + 2);
        assert_eq!(fourth[5], first[5] + 3);
        assert_eq!(fifth[5], first[5] + 4);
    }

    #[test]
    fn test_sequencer_default_skips_base() {
        let mut seq = MacSequencer::new(MAC_PREFIX, 0x00_00_ff);
        // Carry propagates into the middle bytes.
        assert_eq!(seq.next_mac(), "02:b0:b0:00:01:00");
    }

    #[test]
    fn test_sequencer_is_locally_administered_unicast() {
        let mac = parse_mac(&MacSequencer::random().next_mac()).unwrap();
        assert_eq!(mac[0] & 0x02, 0x02);
        assert_eq!(mac[0] & 0x01, 0x00);
    }

    #[test]
    fn test_seeded_is_deterministic() {
        let a = MacSequencer::seeded("net-1").next_mac();
        let b = MacSequencer::seeded("net-1").next_mac();
        assert_eq!(a, b);
    }

    #[test]
    fn test_seeded_base_is_fixed() {
        // FNV-1a("net-1") = 0x0b38503a; low three bytes + 1.
        assert_eq!(MacSequencer::seeded("net-1").next_mac(), "02:b0:b0:38:50:3b");
    }

    #[test]
    fn test_next_free_skips_taken() {
        let mut probe = MacSequencer::new(MAC_PREFIX, 0).start_at_zero();
        let taken: HashSet<String> = [probe.next_mac(), probe.next_mac()].into_iter().collect();

        let mut seq = MacSequencer::new(MAC_PREFIX, 0).start_at_zero();
        assert_eq!(seq.next_free(&taken).unwrap(), "02:b0:b0:00:00:02");
    }

    #[test]
    fn test_parse_mac_rejects_garbage() {
        assert!(parse_mac("02:b0:b0:00:00").is_err());
        assert!(parse_mac("02:b0:b0:00:00:zz").is_err());
        assert!(parse_mac("02:b0:b0:00:00:00:00").is_err());
    }

    #[tokio::test]
    async fn test_allocate_skips_gateway_taken_and_answering() {
        let gw = Ipv4Addr::new(10, 0, 0, 1);
        let taken: HashSet<_> = [Ipv4Addr::new(10, 0, 0, 2)].into_iter().collect();
        let prober = StaticProber::answering([Ipv4Addr::new(10, 0, 0, 3)]);

        let ip = allocate_ip(gw, 24, &taken, &prober).await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 4));
    }

    #[tokio::test]
    async fn test_allocate_wraps_below_gateway() {
        let gw = Ipv4Addr::new(10, 0, 0, 6);
        let taken: HashSet<_> = HashSet::new();
        // /29: .1-.6 usable, .7 broadcast.
        let ip = allocate_ip(gw, 29, &taken, &StaticProber::default()).await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[tokio::test]
    async fn test_allocate_rejects_broadcast_gateway() {
        let taken: HashSet<_> = HashSet::new();
        let prober = StaticProber::default();
        for gw in [Ipv4Addr::BROADCAST, Ipv4Addr::new(10, 0, 0, 255), Ipv4Addr::new(10, 0, 0, 0)] {
            let err = allocate_ip(gw, 24, &taken, &prober).await.unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)), "{}", gw);
        }
    }

    #[tokio::test]
    async fn test_allocate_exhausted() {
        let gw = Ipv4Addr::new(10, 0, 0, 1);
        let taken: HashSet<_> = [Ipv4Addr::new(10, 0, 0, 2)].into_iter().collect();
        let err = allocate_ip(gw, 30, &taken, &StaticProber::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exhausted"));
    }
}
