use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use viaduct::config::{self, Config};
use viaduct::proxy::worker;

#[derive(Parser)]
#[command(name = "viaduct")]
#[command(about = "A multi-threaded HTTP/1.x forward proxy")]
struct Args {
    /// Listen port
    #[arg(long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Number of reactor workers; defaults to hardware concurrency where
    /// the kernel balances accepts across reuseport listeners
    #[arg(long)]
    accept_threads: Option<usize>,

    /// Reserved for a future worker-pool offload; currently unused
    #[arg(long, default_value_t = 0)]
    worker_threads: usize,

    /// Per-worker session pool capacity
    #[arg(long, default_value_t = config::DEFAULT_ACCEPT_CAPACITY)]
    accept_capacity: usize,

    /// Per-worker name cache capacity; 0 disables caching
    #[arg(long, default_value_t = config::DEFAULT_NAME_CACHE)]
    name_cache: usize,

    /// Name cache entry lifetime in seconds
    #[arg(long, default_value_t = config::DEFAULT_CACHE_LIFETIME)]
    cache_lifetime: u64,

    /// Detach from the controlling terminal
    #[arg(long)]
    daemonize: bool,

    /// Keep stdio for logs and raise the log level
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("viaduct={level}"))
        .init();

    if let Err(err) = run(args) {
        error!("startup failed: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

/// 10 for allocation failure at startup, 100 for any other startup error.
fn exit_code(err: &anyhow::Error) -> i32 {
    let oom = err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map(|io_err| io_err.kind() == std::io::ErrorKind::OutOfMemory)
            .unwrap_or(false)
    });
    if oom {
        10
    } else {
        100
    }
}

fn run(args: Args) -> Result<()> {
    if !config::reuseport_supported() && args.accept_threads.unwrap_or(1) > 1 {
        warn!("SO_REUSEPORT is unavailable; running a single accept thread");
    }
    if args.worker_threads > 0 {
        warn!("--worker-threads is reserved and currently ignored");
    }

    let config = Config {
        port: args.port,
        accept_threads: args
            .accept_threads
            .unwrap_or_else(config::default_accept_threads),
        worker_threads: args.worker_threads,
        accept_capacity: args.accept_capacity,
        name_cache: args.name_cache,
        cache_lifetime: args.cache_lifetime,
        daemonize: args.daemonize,
        verbose: args.verbose,
    };
    config.validate()?;

    if config.daemonize {
        daemonize(config.verbose).context("failed to daemonize")?;
    }

    info!(
        port = config.port,
        workers = config.accept_threads,
        pool_capacity = config.accept_capacity,
        cache_capacity = config.name_cache,
        "starting viaduct"
    );

    let handles = worker::spawn_all(Arc::new(config))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime.block_on(async {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install CTRL+C handler")
    })?;

    warn!("received CTRL+C, shutting down");
    drop(handles);
    Ok(())
}

/// Detach from the terminal the way the classic `daemon(3)` does: the
/// working directory moves to /var/tmp and stdio is redirected to /dev/null
/// unless `--verbose` kept it for logging. Must run before any worker
/// thread is spawned.
fn daemonize(verbose: bool) -> Result<()> {
    std::env::set_current_dir("/var/tmp").context("chdir /var/tmp")?;
    let noclose = if verbose { 1 } else { 0 };
    let rc = unsafe { libc::daemon(1, noclose) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("daemon");
    }
    Ok(())
}
