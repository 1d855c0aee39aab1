//! Rate limit policies guarding the probe endpoints.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;

use super::RequestContext;
use crate::ratelimit::{Key, KeyExtractor, Policy};

/// Config key of the per-source-subnet limit.
pub const IP_RATE_LIMIT: &str = "ip_rate_limit";
/// Config key of the per-target limit.
pub const TARGET_RATE_LIMIT: &str = "target_rate_limit";
/// Config key of the service-wide limit.
pub const GLOBAL_RATE_LIMIT: &str = "global_rate_limit";

/// The policies applied to every probe request, in check order.
pub fn probe_policies() -> Vec<Policy<RequestContext>> {
    vec![
        Policy::new(IP_RATE_LIMIT, SourceSubnet::default()),
        Policy::new(TARGET_RATE_LIMIT, ProbeTarget),
        Policy::new(GLOBAL_RATE_LIMIT, GlobalKey).with_fixed_buckets(1),
    ]
}

/// Treat IPv4-mapped IPv6 addresses as plain IPv4.
pub fn canonical_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Keys requests by the network their client address belongs to.
#[derive(Debug, Clone, Copy)]
pub struct SourceSubnet {
    v4_prefix: u8,
    v6_prefix: u8,
}

impl SourceSubnet {
    pub fn new(v4_prefix: u8, v6_prefix: u8) -> Self {
        Self {
            v4_prefix: v4_prefix.min(32),
            v6_prefix: v6_prefix.min(128),
        }
    }

    /// Network address of the subnet containing `addr`.
    pub fn network(&self, addr: IpAddr) -> IpAddr {
        match canonical_ip(addr) {
            IpAddr::V4(v4) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.v4_prefix))
                    .unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.v6_prefix))
                    .unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        }
    }
}

impl Default for SourceSubnet {
    /// /24 for IPv4, /56 for IPv6.
    fn default() -> Self {
        Self::new(24, 56)
    }
}

#[async_trait]
impl KeyExtractor<RequestContext> for SourceSubnet {
    async fn extract(&self, ctx: &RequestContext) -> Key {
        match self.network(ctx.client_addr) {
            IpAddr::V4(net) => Key::Binary(net.octets().to_vec()),
            IpAddr::V6(net) => Key::Binary(net.octets().to_vec()),
        }
    }
}

/// Keys requests by the probe target.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeTarget;

#[async_trait]
impl KeyExtractor<RequestContext> for ProbeTarget {
    async fn extract(&self, ctx: &RequestContext) -> Key {
        Key::Text(ctx.target.clone())
    }
}

/// The same key for every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalKey;

#[async_trait]
impl KeyExtractor<RequestContext> for GlobalKey {
    async fn extract(&self, _ctx: &RequestContext) -> Key {
        Key::Integer(0)
    }
}
