use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use idr_schemas::SubnetPolicy;

/// An IPv4 or IPv6 network in `addr/prefix` form. A bare address is a host
/// route (`/32` or `/128`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrParseError(pub String);

impl fmt::Display for CidrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid CIDR: {}", self.0)
    }
}

impl std::error::Error for CidrParseError {}

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| CidrParseError(s.to_string()))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| CidrParseError(s.to_string()))?,
            None => max,
        };
        Ok(Self {
            network: mask(addr, prefix),
            prefix,
        })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl Cidr {
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(ip, self.prefix) == self.network
            }
            _ => false,
        }
    }
}

fn mask(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let m = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            IpAddr::V4((bits & m).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let m = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix))
            };
            IpAddr::V6((bits & m).into())
        }
    }
}

/// Most specific policy whose CIDR contains `ip` (longest prefix). Ties go
/// to the earlier policy. Policies with an unparsable CIDR never match.
pub fn select_policy<'a>(policies: &'a [SubnetPolicy], ip: &str) -> Option<&'a SubnetPolicy> {
    let host = ip.trim().split('/').next().unwrap_or_default();
    let ip: IpAddr = host.parse().ok()?;

    let mut best: Option<(&SubnetPolicy, u8)> = None;
    for policy in policies {
        let Ok(cidr) = policy.cidr.parse::<Cidr>() else {
            continue;
        };
        if !cidr.contains(ip) {
            continue;
        }
        if best.map_or(true, |(_, p)| cidr.prefix() > p) {
            best = Some((policy, cidr.prefix()));
        }
    }
    best.map(|(p, _)| p)
}
