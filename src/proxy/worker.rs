use std::cell::RefCell;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, info, warn};

use crate::config::{self, Config};
use crate::dns::NameCache;
use crate::pool::Pool;

use super::driver::{self, SessionPool, SharedCache, SharedStats, WorkerStats};
use super::session::SessionCore;

const LISTEN_BACKLOG: u32 = 1024;

/// A spawned worker thread and the address its listener is bound to.
pub struct WorkerHandle {
    pub local_addr: SocketAddr,
    thread: thread::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn join(self) {
        let _ = self.thread.join();
    }
}

/// Spawn one reactor worker.
///
/// The worker runs a single-threaded runtime with its own reuseport
/// listener, session pool and name cache; the call returns once the
/// listener is bound, so bind failures surface at startup.
pub fn spawn(config: Arc<Config>, id: usize) -> Result<WorkerHandle> {
    let (ready_tx, ready_rx) = mpsc::channel::<io::Result<SocketAddr>>();

    let thread = thread::Builder::new()
        .name(format!("worker-{id}"))
        .spawn(move || run_worker(config, id, ready_tx))
        .context("failed to spawn worker thread")?;

    let local_addr = ready_rx
        .recv()
        .context("worker exited before binding its listener")?
        .context("failed to bind listener")?;

    Ok(WorkerHandle { local_addr, thread })
}

fn run_worker(config: Arc<Config>, id: usize, ready_tx: mpsc::Sender<io::Result<SocketAddr>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(async move {
        let listener = match bind_listener(config.port) {
            Ok(listener) => listener,
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        };
        let _ = ready_tx.send(Ok(addr));

        accept_loop(listener, config, id).await;
    }));
}

/// Every worker binds its own socket to the shared port; with
/// `SO_REUSEPORT` the kernel balances incoming connections across them.
fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    socket.set_reuseport(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
    socket.listen(LISTEN_BACKLOG)
}

async fn accept_loop(listener: TcpListener, config: Arc<Config>, id: usize) {
    let pool: SessionPool = Rc::new(RefCell::new(Pool::with_capacity(config.accept_capacity)));
    let cache: SharedCache = Rc::new(RefCell::new(NameCache::new(
        config.name_cache,
        Duration::from_secs(config.cache_lifetime),
    )));

    info!(
        worker = id,
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        pool_capacity = config.accept_capacity,
        cache_capacity = config.name_cache,
        "worker accepting"
    );

    let stats: SharedStats = Rc::new(WorkerStats::new(id));
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(worker = id, "accept failed: {err}");
                continue;
            }
        };

        let (proxy_ip, client_ip) = match (stream.local_addr(), peer.ip()) {
            (Ok(SocketAddr::V4(local)), IpAddr::V4(client)) => (*local.ip(), client),
            _ => {
                debug!(worker = id, %peer, "dropping non-IPv4 connection");
                continue;
            }
        };

        let slot = {
            let mut pool_ref = pool.borrow_mut();
            match pool_ref.alloc(SessionCore::new(proxy_ip, client_ip)) {
                Ok(slot) => slot,
                Err(_) => {
                    let rejected = stats.record_reject();
                    warn!(
                        worker = id,
                        %peer,
                        rejected,
                        "session pool exhausted, dropping connection"
                    );
                    // hard close; the client sees a FIN without any response
                    drop(stream);
                    continue;
                }
            }
        };

        let accepted = stats.record_accept();
        debug!(worker = id, %peer, slot, accepted, "accepted connection");
        tokio::task::spawn_local(driver::drive(
            stream,
            slot,
            Rc::clone(&pool),
            Rc::clone(&cache),
            Rc::clone(&stats),
        ));
    }
}

/// Spawn the configured number of workers, failing fast if any of them
/// cannot bind.
pub fn spawn_all(config: Arc<Config>) -> Result<Vec<WorkerHandle>> {
    let count = if config::reuseport_supported() {
        config.accept_threads
    } else {
        1
    };
    let mut handles = Vec::with_capacity(count);
    for id in 0..count {
        handles.push(
            spawn(Arc::clone(&config), id).with_context(|| format!("failed to start worker {id}"))?,
        );
    }
    Ok(handles)
}
