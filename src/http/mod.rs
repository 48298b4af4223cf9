//! Incremental HTTP/1.x head parsing, in-flight header rewriting, and body
//! framing. One [`Parser`] instance per session, reused for the request and
//! then the response of each exchange.

pub mod body;
pub mod parser;

pub use body::BodyDecoder;
pub use parser::{HttpVersion, ParseStatus, Parser, MAX_HOST_LEN};
