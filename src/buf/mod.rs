//! Byte-buffer primitives: the dual-buffer IO ring and the scanning helpers
//! used by the head parser.

pub mod ring;
pub mod scan;

pub use ring::{IoRing, RecvStatus, SendStatus};
