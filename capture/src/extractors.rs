//! Client-IP extraction.
//!
//! The extracted address is transient input to visitor-ID derivation and
//! geo enrichment; it is never persisted. `direct` trusts only the socket
//! peer and is the safe default; the header modes exist for deployments
//! behind reverse proxies and consult the trusted-proxy list.

use std::net::IpAddr;
use std::str::FromStr;

use axum::http::HeaderMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpExtractorMode {
    /// The socket peer address. Safe, but wrong behind a proxy.
    Direct,
    /// Rightmost untrusted hop of `X-Forwarded-For`.
    Xff,
    /// `X-Real-Ip`, only when the peer is a trusted proxy.
    RealIp,
}

impl FromStr for IpExtractorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "direct" => Ok(IpExtractorMode::Direct),
            "xff" => Ok(IpExtractorMode::Xff),
            "realip" => Ok(IpExtractorMode::RealIp),
            _ => Err(format!("unknown ip extractor: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 32 - u32::from(self.prefix);
                (u32::from(net) >> shift) == (u32::from(*ip) >> shift)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 128 - u32::from(self.prefix);
                (u128::from(net) >> shift) == (u128::from(*ip) >> shift)
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid CIDR {s:?}: missing prefix"))?;
        let network: IpAddr = addr
            .parse()
            .map_err(|_| format!("invalid CIDR {s:?}: bad address"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("invalid CIDR {s:?}: bad prefix"))?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(format!("invalid CIDR {s:?}: prefix exceeds {max}"));
        }
        Ok(Cidr { network, prefix })
    }
}

/// Comma-separated list of trusted proxy CIDR ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CidrList(pub Vec<Cidr>);

impl FromStr for CidrList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            ranges.push(part.parse()?);
        }
        Ok(CidrList(ranges))
    }
}

#[derive(Debug, Clone)]
pub struct ClientIpExtractor {
    mode: IpExtractorMode,
    trusted: CidrList,
}

impl ClientIpExtractor {
    pub fn new(mode: IpExtractorMode, trusted: CidrList) -> Self {
        ClientIpExtractor { mode, trusted }
    }

    pub fn client_ip(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        match self.mode {
            IpExtractorMode::Direct => peer,
            IpExtractorMode::Xff => self.from_forwarded_chain(peer, headers),
            IpExtractorMode::RealIp => self.from_real_ip(peer, headers),
        }
    }

    /// Walks the `X-Forwarded-For` chain right to left, past trusted
    /// proxies, and stops at the first hop we cannot vouch for.
    fn from_forwarded_chain(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        let mut candidate = peer;
        for hop in forwarded_hops(headers).into_iter().rev() {
            if self.is_trusted(&candidate) {
                candidate = hop;
            } else {
                break;
            }
        }
        candidate
    }

    fn from_real_ip(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        if !self.is_trusted(&peer) {
            return peer;
        }
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(peer)
    }

    /// With no configured ranges, private, loopback, and link-local peers
    /// are treated as proxies, mirroring common reverse-proxy layouts.
    fn is_trusted(&self, ip: &IpAddr) -> bool {
        if self.trusted.0.is_empty() {
            return match ip {
                IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
                IpAddr::V6(v6) => {
                    v6.is_loopback()
                        || (v6.segments()[0] & 0xfe00) == 0xfc00
                        || (v6.segments()[0] & 0xffc0) == 0xfe80
                }
            };
        }
        self.trusted.0.iter().any(|cidr| cidr.contains(ip))
    }
}

fn forwarded_hops(headers: &HeaderMap) -> Vec<IpAddr> {
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|hop| hop.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, value.parse().unwrap());
        headers
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn cidr_membership() {
        let cidr: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(cidr.contains(&ip("10.1.2.3")));
        assert!(!cidr.contains(&ip("11.0.0.1")));
        assert!(!cidr.contains(&ip("::1")));

        let v6: Cidr = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains(&ip("2001:db8::beef")));
        assert!(!v6.contains(&ip("2001:db9::1")));
    }

    #[test]
    fn cidr_rejects_malformed_input() {
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn direct_mode_ignores_headers() {
        let extractor = ClientIpExtractor::new(IpExtractorMode::Direct, CidrList::default());
        let headers = headers_with("x-forwarded-for", "203.0.113.5");
        assert_eq!(
            extractor.client_ip(ip("198.51.100.1"), &headers),
            ip("198.51.100.1")
        );
    }

    #[test]
    fn xff_walks_past_trusted_proxies() {
        let trusted: CidrList = "10.0.0.0/8".parse().unwrap();
        let extractor = ClientIpExtractor::new(IpExtractorMode::Xff, trusted);
        let headers = headers_with("x-forwarded-for", "203.0.113.5, 10.0.0.2");
        assert_eq!(extractor.client_ip(ip("10.0.0.1"), &headers), ip("203.0.113.5"));
    }

    #[test]
    fn xff_from_untrusted_peer_is_ignored() {
        let trusted: CidrList = "10.0.0.0/8".parse().unwrap();
        let extractor = ClientIpExtractor::new(IpExtractorMode::Xff, trusted);
        let headers = headers_with("x-forwarded-for", "203.0.113.5");
        assert_eq!(
            extractor.client_ip(ip("198.51.100.9"), &headers),
            ip("198.51.100.9")
        );
    }

    #[test]
    fn realip_requires_a_trusted_peer() {
        let trusted: CidrList = "10.0.0.0/8".parse().unwrap();
        let extractor = ClientIpExtractor::new(IpExtractorMode::RealIp, trusted);
        let headers = headers_with("x-real-ip", "203.0.113.5");
        assert_eq!(extractor.client_ip(ip("10.0.0.1"), &headers), ip("203.0.113.5"));
        assert_eq!(
            extractor.client_ip(ip("198.51.100.9"), &headers),
            ip("198.51.100.9")
        );
    }

    #[test]
    fn loopback_is_trusted_by_default() {
        let extractor = ClientIpExtractor::new(IpExtractorMode::Xff, CidrList::default());
        let headers = headers_with("x-forwarded-for", "203.0.113.5");
        assert_eq!(extractor.client_ip(ip("127.0.0.1"), &headers), ip("203.0.113.5"));
    }
}
