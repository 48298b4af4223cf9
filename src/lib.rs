//! viaduct — a multi-threaded HTTP/1.0 and HTTP/1.1 forward proxy.
//!
//! Each accepted client connection is paired with a single upstream
//! connection selected by the request's Host header. Heads are parsed and
//! rewritten in flight (Via / X-Forwarded-For); body bytes pass through by
//! swapping ownership of a pair of fixed 4 KiB buffers, so the data path
//! never copies payload. Workers are independent single-threaded reactors
//! sharing nothing but the listen port.

pub mod buf;
pub mod config;
pub mod dns;
pub mod error;
pub mod http;
pub mod pool;
pub mod proxy;

pub use config::Config;
pub use error::{ProxyError, ProxyResult};
