//! The per-connection proxy engine: session state machine, readiness
//! driver, and the per-worker accept loop that owns the pools.

pub mod driver;
pub mod session;
pub mod worker;

pub use session::{Action, Interest, Progress, SessionCore};
pub use worker::{spawn, spawn_all, WorkerHandle};
