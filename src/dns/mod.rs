//! Host name resolution: a bounded per-worker LRU cache in front of the
//! blocking system resolver.

pub mod cache;

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

use tracing::debug;

use crate::error::{ProxyError, ProxyResult};

pub use cache::NameCache;

/// Resolve `host` to an IPv4 address through the worker's cache.
///
/// A cache miss performs a synchronous `getaddrinfo` call and deliberately
/// blocks the calling worker for the duration of the lookup; the result is
/// inserted into the cache before returning.
pub fn resolve(host: &str, cache: &mut NameCache) -> ProxyResult<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    if let Some(ip) = cache.lookup(host) {
        debug!(host, %ip, "name cache hit");
        return Ok(ip);
    }

    let mut addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|_| ProxyError::resolve_failed(host))?;
    let ip = addrs
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| ProxyError::resolve_failed(host))?;

    debug!(host, %ip, "resolved");
    cache.insert(host, ip);
    Ok(ip)
}
