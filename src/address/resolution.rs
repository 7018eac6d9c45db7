use std::error::Error as StdError;
use std::fmt::Debug;
use std::io::Result as IoResult;
use std::net::ToSocketAddrs;
use std::result::Result as StdResult;
use std::sync::Arc;

use log::debug;

use super::Address;
use crate::error::{DriverError, Result, UserCallbackError};

// imports for docs
#[allow(unused)]
use crate::driver::DriverConfig;

type BoxError = Box<dyn StdError + Send + Sync>;
/// See [`AddressResolver::resolve()`].
pub type AddressResolverReturn = StdResult<Vec<Address>, BoxError>;

/// Custom address resolution, applied to every address before DNS.
///
/// See [`DriverConfig::with_resolver()`].
pub trait AddressResolver: Debug + Send + Sync {
    /// Expand `address` into one or more replacement addresses.
    ///
    /// Must not return an empty vector.
    fn resolve(&self, address: &Address) -> AddressResolverReturn;
}

#[derive(Debug)]
pub(super) enum CustomResolution {
    Skipped(Option<Arc<Address>>),
    Resolved(Vec<Arc<Address>>),
}

impl CustomResolution {
    pub(super) fn new(
        address: Arc<Address>,
        resolver: Option<&dyn AddressResolver>,
    ) -> Result<Self> {
        let Some(resolver) = resolver else {
            return Ok(Self::Skipped(Some(address)));
        };
        if address.is_custom_resolved {
            return Ok(Self::Skipped(Some(address)));
        }
        debug!("custom resolver in: {address}");
        match resolver.resolve(&address) {
            Ok(mut addresses) => {
                addresses
                    .iter_mut()
                    .for_each(|a| a.is_custom_resolved = true);
                debug!(
                    "custom resolver out: {:?}",
                    addresses.iter().map(Address::to_string).collect::<Vec<_>>()
                );
                if addresses.is_empty() {
                    return Err(DriverError::invalid_config(
                        "address resolver returned no addresses",
                    ));
                }
                // stored in reverse so iteration can pop from the back
                Ok(Self::Resolved(
                    addresses.into_iter().rev().map(Arc::new).collect(),
                ))
            }
            Err(err) => {
                debug!("custom resolver failed: {err:?}");
                Err(DriverError::UserCallback {
                    error: UserCallbackError::Resolver(err),
                })
            }
        }
    }
}

impl Iterator for CustomResolution {
    type Item = Arc<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Skipped(address) => address.take(),
            Self::Resolved(addresses) => addresses.pop(),
        }
    }
}

#[derive(Debug)]
pub(super) enum DnsResolution {
    AlreadyResolved(Option<Arc<Address>>),
    Resolved(Option<IoResult<Vec<Arc<Address>>>>),
}

impl DnsResolution {
    pub(super) fn new(address: Arc<Address>) -> Self {
        if address.is_dns_resolved {
            return Self::AlreadyResolved(Some(address));
        }
        debug!("dns resolver in: {address}");
        let res = address.to_socket_addrs().map(|resolved| {
            resolved
                .map(|sock_addr| {
                    Arc::new(Address {
                        host: sock_addr.ip().to_string(),
                        port: sock_addr.port(),
                        key: address.host.clone(),
                        is_custom_resolved: address.is_custom_resolved,
                        is_dns_resolved: true,
                    })
                })
                // reversed so iteration can pop from the back
                .rev()
                .collect::<Vec<_>>()
        });
        match &res {
            Ok(addresses) => debug!(
                "dns resolver out: {:?}",
                addresses.iter().map(|a| a.to_string()).collect::<Vec<_>>()
            ),
            Err(err) => debug!("dns resolver out: {err:?}"),
        }
        Self::Resolved(Some(res))
    }
}

impl Iterator for DnsResolution {
    type Item = IoResult<Arc<Address>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::AlreadyResolved(address) => address.take().map(Ok),
            Self::Resolved(res) => match res {
                None => None,
                Some(Err(_)) => Some(Err(res.take().unwrap().unwrap_err())),
                Some(Ok(resolved)) => resolved.pop().map(Ok),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedResolver(Vec<Address>);

    impl AddressResolver for FixedResolver {
        fn resolve(&self, _address: &Address) -> AddressResolverReturn {
            Ok(self.0.clone())
        }
    }

    #[derive(Debug)]
    struct EmptyResolver;

    impl AddressResolver for EmptyResolver {
        fn resolve(&self, _address: &Address) -> AddressResolverReturn {
            Ok(vec![])
        }
    }

    #[test]
    fn custom_resolution_preserves_order() {
        let resolver = FixedResolver(vec![
            Address::from(("10.0.0.1", 1)),
            Address::from(("10.0.0.2", 2)),
        ]);
        let addresses: Vec<_> = CustomResolution::new(
            Arc::new(Address::from(("original", 7687))),
            Some(&resolver),
        )
        .unwrap()
        .collect();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].host(), "10.0.0.1");
        assert_eq!(addresses[1].host(), "10.0.0.2");
        assert!(addresses.iter().all(|a| a.is_custom_resolved));
    }

    #[test]
    fn empty_resolver_result_is_config_error() {
        let res = CustomResolution::new(
            Arc::new(Address::from(("original", 7687))),
            Some(&EmptyResolver),
        );
        assert!(matches!(res, Err(DriverError::InvalidConfig { .. })));
    }

    #[test]
    fn ip_addresses_skip_dns() {
        let address = Arc::new(Address::from(("127.0.0.1", 7687)));
        let resolved: Vec<_> = DnsResolution::new(Arc::clone(&address)).collect();
        assert_eq!(resolved.len(), 1);
        assert!(Arc::ptr_eq(resolved[0].as_ref().unwrap(), &address));
    }
}
