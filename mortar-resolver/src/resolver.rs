//! Resolver trait and common implementations.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;

/// Error type for resolution operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// Host is not known to the resolver.
    #[error("host not found: {0}")]
    NotFound(String),

    /// Lookup succeeded but produced no address.
    #[error("no addresses for host: {0}")]
    NoAddresses(String),

    /// The underlying lookup failed.
    #[error("lookup of {host} failed: {message}")]
    Lookup {
        /// Host being resolved.
        host: String,
        /// Backend error description.
        message: String,
    },
}

/// Turns a host string into an IP address.
///
/// The trait is object safe so a transport can hold any backend as
/// `Arc<dyn Resolver>`.
///
/// ## Example
///
/// ```rust
/// use mortar_resolver::{Resolver, StaticResolver};
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let resolver = StaticResolver::new();
/// resolver.add_host("db.internal", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
///
/// // Resolution is async:
/// // let ip = resolver.resolve("db.internal").await?;
/// ```
pub trait Resolver: Send + Sync + 'static {
    /// Resolve a host name to one address.
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<IpAddr, ResolveError>>;
}

impl<R: Resolver + ?Sized> Resolver for Arc<R> {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<IpAddr, ResolveError>> {
        (**self).resolve(host)
    }
}

/// Resolver backed by the operating system (`getaddrinfo`).
///
/// IP literals are returned without a lookup. For names, the first
/// address the system returns wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl SystemResolver {
    /// Create a system resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Resolver for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<IpAddr, ResolveError>> {
        Box::pin(async move {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(ip);
            }

            let mut addrs = tokio::net::lookup_host((host, 0))
                .await
                .map_err(|e| ResolveError::Lookup {
                    host: host.to_string(),
                    message: e.to_string(),
                })?;

            let addr = addrs
                .next()
                .ok_or_else(|| ResolveError::NoAddresses(host.to_string()))?;

            tracing::debug!(host, ip = %addr.ip(), "resolved host");
            Ok(addr.ip())
        })
    }
}

/// A static resolver that returns pre-configured addresses.
///
/// Hosts missing from the table resolve only if they are IP literals.
/// Useful for testing or for pinning names to known addresses.
#[derive(Debug, Default)]
pub struct StaticResolver {
    hosts: DashMap<String, IpAddr>,
}

impl StaticResolver {
    /// Create a new empty static resolver.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hosts: DashMap::new(),
        }
    }

    /// Map a host name to an address, replacing any previous mapping.
    pub fn add_host(&self, host: impl Into<String>, ip: IpAddr) {
        self.hosts.insert(host.into(), ip);
    }

    /// Builder form of [`add_host`](Self::add_host).
    #[must_use]
    pub fn with_host(self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.add_host(host, ip);
        self
    }

    /// Remove a host mapping.
    pub fn remove_host(&self, host: &str) {
        self.hosts.remove(host);
    }
}

impl Resolver for StaticResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<IpAddr, ResolveError>> {
        let result = match self.hosts.get(host) {
            Some(ip) => Ok(*ip),
            None => host
                .parse::<IpAddr>()
                .map_err(|_| ResolveError::NotFound(host.to_string())),
        };
        Box::pin(std::future::ready(result))
    }
}

/// Caching wrapper around a resolver.
pub struct CachingResolver<R> {
    inner: R,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

struct CacheEntry {
    ip: IpAddr,
    expires: Instant,
}

impl<R: Resolver> CachingResolver<R> {
    /// Create a new caching resolver.
    #[must_use]
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Clear the cache.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Invalidate a specific host's cache entry.
    pub fn invalidate(&self, host: &str) {
        self.cache.remove(host);
    }
}

impl<R: Resolver> Resolver for CachingResolver<R> {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<IpAddr, ResolveError>> {
        Box::pin(async move {
            let now = Instant::now();

            if let Some(entry) = self.cache.get(host) {
                if entry.expires > now {
                    return Ok(entry.ip);
                }
            }

            // Failures are not cached
            let ip = self.inner.resolve(host).await?;

            self.cache.insert(
                host.to_string(),
                CacheEntry {
                    ip,
                    expires: now + self.ttl,
                },
            );

            Ok(ip)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const TEN: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    /// Counts lookups and answers from a static table.
    struct Counting {
        inner: StaticResolver,
        lookups: AtomicUsize,
    }

    impl Resolver for Counting {
        fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<IpAddr, ResolveError>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(host)
        }
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver::new().with_host("svc", TEN);
        assert_eq!(resolver.resolve("svc").await.unwrap(), TEN);

        resolver.remove_host("svc");
        assert!(matches!(
            resolver.resolve("svc").await,
            Err(ResolveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_static_resolver_ip_literal() {
        let resolver = StaticResolver::new();
        assert_eq!(
            resolver.resolve("::1").await.unwrap(),
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        );
    }

    #[tokio::test]
    async fn test_system_resolver_ip_literal() {
        let resolver = SystemResolver::new();
        assert_eq!(
            resolver.resolve("127.0.0.1").await.unwrap(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }

    #[tokio::test]
    async fn test_system_resolver_failure() {
        let resolver = SystemResolver::new();
        assert!(resolver.resolve("host.invalid").await.is_err());
    }

    #[tokio::test]
    async fn test_caching_resolver() {
        let inner = Counting {
            inner: StaticResolver::new().with_host("svc", TEN),
            lookups: AtomicUsize::new(0),
        };
        let resolver = CachingResolver::new(inner, Duration::from_secs(60));

        let first = resolver.resolve("svc").await.unwrap();
        let second = resolver.resolve("svc").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(resolver.inner.lookups.load(Ordering::SeqCst), 1);

        resolver.invalidate("svc");
        resolver.resolve("svc").await.unwrap();
        assert_eq!(resolver.inner.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_caching_resolver_does_not_cache_errors() {
        let inner = Counting {
            inner: StaticResolver::new(),
            lookups: AtomicUsize::new(0),
        };
        let resolver = CachingResolver::new(inner, Duration::from_secs(60));

        assert!(resolver.resolve("missing").await.is_err());
        assert!(resolver.resolve("missing").await.is_err());
        assert_eq!(resolver.inner.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shared_resolver() {
        let resolver: Arc<dyn Resolver> = Arc::new(StaticResolver::new().with_host("svc", TEN));
        assert_eq!(resolver.resolve("svc").await.unwrap(), TEN);
    }
}
