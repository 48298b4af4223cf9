use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::rc::Rc;

use tokio::io::{Interest as IoInterest, Ready};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, error};

use crate::dns::NameCache;
use crate::pool::Pool;

use super::session::{Action, Interest, SessionCore};

/// The worker-local session pool. Sessions are confined to one worker, so a
/// plain `Rc<RefCell<..>>` is all the sharing that is ever needed.
pub type SessionPool = Rc<RefCell<Pool<SessionCore>>>;
pub type SharedCache = Rc<RefCell<NameCache>>;
pub type SharedStats = Rc<WorkerStats>;

/// Counters spanning the worker's lifetime, shared between the accept loop
/// and the session drivers it spawns.
pub struct WorkerStats {
    pub worker: usize,
    accepted: Cell<u64>,
    rejected: Cell<u64>,
    spurious_reads: Cell<u64>,
    spurious_writes: Cell<u64>,
}

impl WorkerStats {
    pub fn new(worker: usize) -> Self {
        Self {
            worker,
            accepted: Cell::new(0),
            rejected: Cell::new(0),
            spurious_reads: Cell::new(0),
            spurious_writes: Cell::new(0),
        }
    }

    /// Count an admitted connection; returns the running total.
    pub fn record_accept(&self) -> u64 {
        let total = self.accepted.get() + 1;
        self.accepted.set(total);
        total
    }

    /// Count a connection dropped for pool exhaustion; returns the running
    /// total.
    pub fn record_reject(&self) -> u64 {
        let total = self.rejected.get() + 1;
        self.rejected.set(total);
        total
    }

    /// Fold a finished session's spurious-wakeup counts into the worker
    /// totals; returns the new (reads, writes) totals.
    pub fn absorb_session(&self, reads: u32, writes: u32) -> (u64, u64) {
        self.spurious_reads
            .set(self.spurious_reads.get() + u64::from(reads));
        self.spurious_writes
            .set(self.spurious_writes.get() + u64::from(writes));
        (self.spurious_reads.get(), self.spurious_writes.get())
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.get()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.get()
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>>>>;

enum Wake {
    Front(io::Result<Ready>),
    Back(io::Result<Ready>),
    Connected(io::Result<TcpStream>),
}

/// Drive one session to completion.
///
/// The task owns the sockets; the session core lives in the pool slot and is
/// borrowed per readiness event, never across an await point. On teardown
/// the slot is released back to the pool and the session's spurious-wakeup
/// counts are folded into the worker totals.
pub async fn drive(
    front: TcpStream,
    slot: usize,
    pool: SessionPool,
    cache: SharedCache,
    stats: SharedStats,
) {
    let mut back: Option<TcpStream> = None;
    let mut connecting: Option<ConnectFuture> = None;

    loop {
        let (fe, be) = {
            let pool_ref = pool.borrow();
            match pool_ref.get(slot) {
                Some(core) => (core.front_ev, core.back_ev),
                None => {
                    error!(slot, "session slot vanished");
                    return;
                }
            }
        };

        if !fe.any() && !(be.any() && back.is_some()) && connecting.is_none() {
            error!("session stalled with no armed events");
            break;
        }

        let wake = tokio::select! {
            res = poll_connect(&mut connecting), if connecting.is_some() => {
                Wake::Connected(res)
            }
            res = front.ready(to_interest(fe)), if fe.any() => Wake::Front(res),
            res = ready_on(&back, to_interest(be)), if back.is_some() && be.any() => {
                Wake::Back(res)
            }
        };

        let action = match wake {
            Wake::Connected(Ok(stream)) => {
                debug!(peer = ?stream.peer_addr().ok(), "backend connected");
                back = Some(stream);
                connecting = None;
                Action::Continue
            }
            Wake::Connected(Err(err)) => {
                connecting = None;
                let mut pool_ref = pool.borrow_mut();
                match pool_ref.get_mut(slot) {
                    Some(core) => core.connect_failed(err),
                    None => break,
                }
            }
            Wake::Front(Ok(ready)) => {
                let mut pool_ref = pool.borrow_mut();
                let mut cache_ref = cache.borrow_mut();
                match pool_ref.get_mut(slot) {
                    Some(core) => {
                        let mut action = Action::Continue;
                        if (ready.is_readable() || ready.is_read_closed()) && core.front_ev.read {
                            action = core.front_readable(&front, &mut cache_ref);
                        }
                        if matches!(action, Action::Continue)
                            && (ready.is_writable() || ready.is_write_closed())
                            && core.front_ev.write
                        {
                            action = core.front_writable(&front);
                        }
                        action
                    }
                    None => break,
                }
            }
            Wake::Back(Ok(ready)) => {
                let mut pool_ref = pool.borrow_mut();
                match (pool_ref.get_mut(slot), back.as_ref()) {
                    (Some(core), Some(stream)) => {
                        let mut action = Action::Continue;
                        if (ready.is_readable() || ready.is_read_closed()) && core.back_ev.read {
                            action = core.back_readable(stream);
                        }
                        if matches!(action, Action::Continue)
                            && (ready.is_writable() || ready.is_write_closed())
                            && core.back_ev.write
                        {
                            action = core.back_writable(stream);
                        }
                        action
                    }
                    _ => break,
                }
            }
            Wake::Front(Err(err)) | Wake::Back(Err(err)) => {
                debug!("readiness wait failed: {err}");
                break;
            }
        };

        match action {
            Action::Continue => {}
            Action::Finish => {
                debug!("session finished");
                break;
            }
            Action::Fail(err) => {
                debug!(error = %err, "session terminated");
                break;
            }
            Action::CloseBackend => {
                back = None;
                connecting = None;
            }
            Action::Connect(addr) => {
                back = None;
                connecting = Some(Box::pin(connect_backend(addr)));
            }
        }
    }

    // dropping the streams closes both directions of each connection
    drop(back);
    drop(front);
    let mut pool_ref = pool.borrow_mut();
    if pool_ref.get(slot).is_some() {
        let core = pool_ref.release(slot);
        let (reads, writes) = core.counters();
        let (spurious_reads, spurious_writes) = stats.absorb_session(reads, writes);
        debug!(
            worker = stats.worker,
            slot,
            spurious_reads,
            spurious_writes,
            "session released"
        );
    }
}

/// Non-blocking connect; completion (and `SO_ERROR`) is observed on the
/// first writability wake inside tokio.
async fn connect_backend(addr: SocketAddrV4) -> io::Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    socket.connect(SocketAddr::V4(addr)).await
}

async fn poll_connect(connecting: &mut Option<ConnectFuture>) -> io::Result<TcpStream> {
    match connecting.as_mut() {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn ready_on(stream: &Option<TcpStream>, interest: IoInterest) -> io::Result<Ready> {
    match stream {
        Some(stream) => stream.ready(interest).await,
        None => std::future::pending().await,
    }
}

fn to_interest(ev: Interest) -> IoInterest {
    match (ev.read, ev.write) {
        (true, true) => IoInterest::READABLE | IoInterest::WRITABLE,
        (false, true) => IoInterest::WRITABLE,
        // the read-only variant also covers the disarmed case so the
        // conversion is total; disarmed watchers are filtered by the guards
        _ => IoInterest::READABLE,
    }
}
