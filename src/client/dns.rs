//! DNS resolution used when selecting routes.

use std::fmt;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};

/// Resolves host names to IP addresses.
///
/// A resolver returns every known address; the route selector tries them
/// in the returned order.
pub trait Dns: Send + Sync {
    /// Resolves `host`, returning at least one address on success.
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// The default resolver: blocking `getaddrinfo` through the standard
/// library.
#[derive(Default)]
pub struct SystemDns;

impl Dns for SystemDns {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = (host, 0u16)
            .to_socket_addrs()?
            .map(|addr| addr.ip())
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", host),
            ));
        }
        Ok(addrs)
    }
}

impl fmt::Debug for SystemDns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("SystemDns")
    }
}

#[cfg(test)]
mod tests {
    use super::{Dns, SystemDns};

    #[test]
    fn resolves_literal_addresses() {
        let addrs = SystemDns.lookup("127.0.0.1").unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<std::net::IpAddr>().unwrap()]);
    }
}
