pub(crate) mod resolution;

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::io::Result as IoResult;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::vec::IntoIter;

use crate::error::Result;
pub use resolution::{AddressResolver, AddressResolverReturn};
use resolution::{CustomResolution, DnsResolution};

// imports for docs
#[allow(unused)]
use crate::driver::DriverConfig;

pub(crate) const DEFAULT_PORT: u16 = 7687;

/// A server address: host (name or IP) and port.
///
/// ```
/// use boltdrive::address::Address;
///
/// let address = Address::from(("localhost", 1234));
/// assert_eq!(address.host(), "localhost");
/// assert_eq!(address.port(), 1234);
///
/// // from a string, IPv6 bracket aware, defaulting the port
/// assert_eq!(Address::from("example.com:5678").port(), 5678);
/// assert_eq!(Address::from("localhost").port(), 7687);
/// assert_eq!(Address::from("[::1]:4321").host(), "[::1]");
/// ```
#[derive(Debug, Clone)]
pub struct Address {
    host: String,
    port: u16,
    // host name before DNS resolution; this is what identifies the server
    key: String,
    pub(crate) is_custom_resolved: bool,
    pub(crate) is_dns_resolved: bool,
}

/// Equality (and hashing) considers only [`Address::unresolved_host()`] and
/// [`Address::port()`]; different IP addresses resolved from the same host
/// compare equal.
impl PartialEq for Address {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.port == other.port
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.port.hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.key, self.port).cmp(&(&other.key, other.port))
    }
}

impl Address {
    /// Return the host name or IP address.
    ///
    /// For addresses produced by the driver's resolution chain this is the
    /// final IP address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Return the port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the host name before DNS resolution.
    pub fn unresolved_host(&self) -> &str {
        &self.key
    }

    /// Apply the custom resolver (if any), then DNS, yielding resolved
    /// addresses in order.
    pub(crate) fn fully_resolve(
        self: Arc<Self>,
        resolver: Option<&dyn AddressResolver>,
    ) -> Result<impl Iterator<Item = IoResult<Arc<Self>>> + '_> {
        Ok(CustomResolution::new(self, resolver)?.flat_map(DnsResolution::new))
    }

    fn normalize_ip(host: &str) -> (bool, String) {
        IpAddr::from_str(host)
            .map(|addr| (true, addr.to_string()))
            .unwrap_or_else(|_| (false, host.to_string()))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<(String, u16)> for Address {
    fn from((host, port): (String, u16)) -> Self {
        let (is_resolved, key) = Self::normalize_ip(&host);
        Self {
            host,
            port,
            key,
            is_custom_resolved: false,
            is_dns_resolved: is_resolved,
        }
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        Self::from((String::from(host), port))
    }
}

fn split_host_port(input: &str) -> (&str, u16) {
    let Some(colon) = input.rfind(':') else {
        return (input, DEFAULT_PORT);
    };
    match input.rfind(']') {
        Some(bracket) if bracket > colon => {
            // [IPv6] without trailing port
            return (input, DEFAULT_PORT);
        }
        None if input[..colon].contains(':') => {
            // bare IPv6, the colons are part of the address
            return (input, DEFAULT_PORT);
        }
        _ => {}
    }
    match input[colon + 1..].parse() {
        Ok(port) => (&input[..colon], port),
        Err(_) => (input, DEFAULT_PORT),
    }
}

impl From<&str> for Address {
    fn from(input: &str) -> Self {
        let (host, port) = split_host_port(input);
        Self::from((String::from(host), port))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::from((addr.ip().to_string(), addr.port()))
    }
}

impl ToSocketAddrs for Address {
    type Iter = IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> IoResult<Self::Iter> {
        let host: &str = match (self.host.strip_prefix('['), self.host.strip_suffix(']')) {
            (Some(stripped), Some(_)) => &stripped[..stripped.len() - 1],
            _ => &self.host,
        };
        (host, self.port).to_socket_addrs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("localhost:7687", "localhost", 7687)]
    #[case("localhost:1234", "localhost", 1234)]
    #[case("localhost", "localhost", 7687)]
    #[case("127.0.0.1:1234", "127.0.0.1", 1234)]
    #[case("127.0.0.1", "127.0.0.1", 7687)]
    #[case("[::1]:4321", "[::1]", 4321)]
    #[case("[::1]", "[::1]", 7687)]
    #[case("::1", "::1", 7687)]
    fn parse_from_str(#[case] input: &str, #[case] host: &str, #[case] port: u16) {
        let address = Address::from(input);
        assert_eq!(address.host(), host);
        assert_eq!(address.port(), port);
    }

    #[test]
    fn equality_ignores_dns_resolution() {
        let a = Address::from(("localhost", 7687));
        let b = Address::from(("localhost", 7687));
        let c = Address::from(("localhost", 7688));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn display_wraps_bare_ipv6() {
        assert_eq!(format!("{}", Address::from("::1")), "[::1]:7687");
        assert_eq!(format!("{}", Address::from("localhost:1")), "localhost:1");
    }
}
