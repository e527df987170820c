//! # mortar-resolver
//!
//! Host name resolution for the Mortar RPC transport.
//!
//! This crate provides:
//! - `Resolver` trait for custom resolution backends
//! - `SystemResolver` backed by the operating system resolver (default)
//! - `StaticResolver` for fixed host tables and tests
//! - `CachingResolver` to put a TTL cache in front of any resolver
//! - `DnsResolver` for direct DNS lookups (feature `dns`)

mod resolver;

#[cfg(feature = "dns")]
mod dns;

pub use resolver::{CachingResolver, ResolveError, Resolver, StaticResolver, SystemResolver};

#[cfg(feature = "dns")]
pub use dns::DnsResolver;
