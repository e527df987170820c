//! DNS resolution through hickory.

use std::net::IpAddr;

use futures::future::BoxFuture;
use hickory_resolver::Resolver as HickoryResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;

use crate::resolver::{ResolveError, Resolver};

/// Type alias for the Tokio-based hickory resolver.
type TokioResolver = HickoryResolver<TokioConnectionProvider>;

/// DNS resolver performing A/AAAA lookups directly against name servers.
///
/// Unlike [`SystemResolver`](crate::SystemResolver) this bypasses the
/// platform resolver and caches according to record TTLs.
///
/// ## Example
///
/// ```rust
/// use mortar_resolver::DnsResolver;
///
/// // Create a DNS resolver with the default upstream configuration
/// let resolver = DnsResolver::new();
///
/// // Actual DNS resolution requires network access and is async:
/// // let ip = resolver.resolve("example.com").await?;
/// ```
pub struct DnsResolver {
    resolver: TokioResolver,
}

impl DnsResolver {
    /// Create a new DNS resolver with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ResolverConfig::default(), ResolverOpts::default())
    }

    /// Create a resolver with custom configuration.
    #[must_use]
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        let resolver =
            HickoryResolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self { resolver }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for DnsResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<IpAddr, ResolveError>> {
        Box::pin(async move {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(ip);
            }

            let lookup = self
                .resolver
                .lookup_ip(host)
                .await
                .map_err(|e| ResolveError::Lookup {
                    host: host.to_string(),
                    message: e.to_string(),
                })?;

            let ip = lookup
                .iter()
                .next()
                .ok_or_else(|| ResolveError::NoAddresses(host.to_string()))?;

            tracing::debug!(host, %ip, "resolved host via dns");
            Ok(ip)
        })
    }
}
