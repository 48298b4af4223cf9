use anyhow::Result;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 9000;
/// Default per-worker session pool capacity.
pub const DEFAULT_ACCEPT_CAPACITY: usize = 256;
/// Default per-worker name-cache capacity (0 disables caching).
pub const DEFAULT_NAME_CACHE: usize = 128;
/// Default name-cache entry lifetime in seconds.
pub const DEFAULT_CACHE_LIFETIME: u64 = 300;

/// Runtime configuration, resolved from the CLI surface once at startup and
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port shared by all workers.
    pub port: u16,
    /// Number of reactor workers accepting in parallel.
    pub accept_threads: usize,
    /// Reserved for a future worker-pool offload; the core does no offload.
    pub worker_threads: usize,
    /// Per-worker session pool capacity.
    pub accept_capacity: usize,
    /// Per-worker name-cache capacity; 0 disables caching.
    pub name_cache: usize,
    /// Name-cache entry lifetime in seconds.
    pub cache_lifetime: u64,
    /// Detach from the controlling terminal.
    pub daemonize: bool,
    /// Keep stdio open for logs (and raise the log level).
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            accept_threads: default_accept_threads(),
            worker_threads: 0,
            accept_capacity: DEFAULT_ACCEPT_CAPACITY,
            name_cache: DEFAULT_NAME_CACHE,
            cache_lifetime: DEFAULT_CACHE_LIFETIME,
            daemonize: false,
            verbose: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.accept_threads == 0 {
            anyhow::bail!("accept-threads must be at least 1");
        }
        if self.accept_capacity == 0 {
            anyhow::bail!("accept-capacity must be at least 1");
        }
        if self.name_cache > 0 && self.cache_lifetime == 0 {
            anyhow::bail!("cache-lifetime must be non-zero when the name cache is enabled");
        }
        Ok(())
    }
}

/// Default worker count: hardware concurrency where the kernel balances
/// accepts across reuseport listeners, a single worker elsewhere.
pub fn default_accept_threads() -> usize {
    if reuseport_supported() {
        hardware_concurrency()
    } else {
        1
    }
}

/// Whether `SO_REUSEPORT` load balancing is available on this platform.
pub fn reuseport_supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "android"))
}

/// Simple CPU count detection for configuration defaults.
pub fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
