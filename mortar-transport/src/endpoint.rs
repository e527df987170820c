//! Endpoint addresses.
//!
//! Client endpoints are URIs of the form `mortar://host[:port]` (plain TCP)
//! or `mortars://host[:port]` (TLS). Listeners additionally accept bare
//! `ip[:port]` addresses.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use url::{Host, Url};

use mortar_core::TransportError;

/// Scheme of plain TCP endpoints.
pub const INSECURE_SCHEME: &str = "mortar";

/// Scheme of TLS endpoints.
pub const SECURE_SCHEME: &str = "mortars";

/// Port used by `mortar://` endpoints without an explicit port.
pub const DEFAULT_INSECURE_PORT: u16 = 25188;

/// Port used by `mortars://` endpoints without an explicit port.
pub const DEFAULT_SECURE_PORT: u16 = 25156;

/// Error returned when an address cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// Not a URI at all.
    #[error("malformed address {address:?}: {reason}")]
    Malformed {
        /// Address as given.
        address: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// URI scheme is neither `mortar` nor `mortars`.
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),

    /// URI has no host.
    #[error("address has no host")]
    MissingHost,

    /// URI carries a path other than `/`.
    #[error("address must not have a path, got {0:?}")]
    UnexpectedPath(String),

    /// URI carries a query, fragment, or user info.
    #[error("address must not have a {0}")]
    UnexpectedComponent(&'static str),

    /// Listener address host is not an IP address.
    #[error("listener host must be an IP address, got {0:?}")]
    NotAnIpAddress(String),
}

impl From<EndpointError> for TransportError {
    fn from(err: EndpointError) -> Self {
        TransportError::InvalidEndpoint(err.to_string())
    }
}

/// A parsed client endpoint.
///
/// Immutable once constructed. Round-trips through its canonical string
/// form `mortar[s]://host:port/`.
///
/// ## Example
///
/// ```rust
/// use mortar_transport::Endpoint;
///
/// let endpoint: Endpoint = "mortars://api.example.com".parse().unwrap();
/// assert_eq!(endpoint.port(), 25156);
/// assert!(endpoint.use_tls());
/// assert_eq!(endpoint.to_string(), "mortars://api.example.com:25156/");
///
/// assert!(Endpoint::parse("http://api.example.com").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

impl Endpoint {
    /// Lenient parse: returns `None` and logs the reason on failure.
    ///
    /// Use [`str::parse`] when the caller needs the error.
    #[must_use]
    pub fn parse(address: &str) -> Option<Self> {
        match address.parse() {
            Ok(endpoint) => Some(endpoint),
            Err(err) => {
                tracing::error!(address, error = %err, "invalid endpoint address");
                None
            }
        }
    }

    /// Endpoint for a known socket address. Port 0 means the scheme default.
    #[must_use]
    pub fn from_socket_addr(addr: SocketAddr, use_tls: bool) -> Self {
        let port = match addr.port() {
            0 => Self::default_port(use_tls),
            port => port,
        };
        Self {
            host: addr.ip().to_string(),
            port,
            use_tls,
        }
    }

    /// Host name or IP literal (IPv6 without brackets).
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether connections to this endpoint use TLS.
    #[must_use]
    pub fn use_tls(&self) -> bool {
        self.use_tls
    }

    /// URI scheme for this endpoint.
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.use_tls {
            SECURE_SCHEME
        } else {
            INSECURE_SCHEME
        }
    }

    fn default_port(use_tls: bool) -> u16 {
        if use_tls {
            DEFAULT_SECURE_PORT
        } else {
            DEFAULT_INSECURE_PORT
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}/", self.scheme(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}/", self.scheme(), self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(address).map_err(|e| EndpointError::Malformed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let use_tls = match url.scheme() {
            INSECURE_SCHEME => false,
            SECURE_SCHEME => true,
            other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
        };

        if !url.username().is_empty() || url.password().is_some() {
            return Err(EndpointError::UnexpectedComponent("user info"));
        }
        if url.query().is_some() {
            return Err(EndpointError::UnexpectedComponent("query"));
        }
        if url.fragment().is_some() {
            return Err(EndpointError::UnexpectedComponent("fragment"));
        }
        match url.path() {
            "" | "/" => {}
            path => return Err(EndpointError::UnexpectedPath(path.to_string())),
        }

        let host = match url.host() {
            Some(Host::Domain(name)) if !name.is_empty() => name.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(EndpointError::MissingHost),
        };

        let port = match url.port() {
            Some(port) if port != 0 => port,
            _ => Self::default_port(use_tls),
        };

        Ok(Self {
            host,
            port,
            use_tls,
        })
    }
}

/// Parse a listener bind address.
///
/// Accepts:
/// - `mortar://ip[:port]` or `mortars://ip[:port]` (scheme default port)
/// - `ip:port` or `[v6]:port` (port 0 binds an ephemeral port)
/// - bare `ip` or `[v6]` (insecure default port)
///
/// Host names are rejected; listeners bind to addresses.
pub fn parse_listen_addr(address: &str) -> Result<SocketAddr, EndpointError> {
    if address.contains("://") {
        let endpoint: Endpoint = address.parse()?;
        let ip = endpoint
            .host()
            .parse::<IpAddr>()
            .map_err(|_| EndpointError::NotAnIpAddress(endpoint.host().to_string()))?;
        return Ok(SocketAddr::new(ip, endpoint.port()));
    }

    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let bare = address
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(address);

    bare.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_INSECURE_PORT))
        .map_err(|_| {
            if address.is_empty() {
                EndpointError::MissingHost
            } else {
                EndpointError::NotAnIpAddress(address.to_string())
            }
        })
}
