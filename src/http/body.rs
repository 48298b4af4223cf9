use tracing::debug;

use super::parser::ParseStatus;

/// Chunk sizes larger than this are rejected outright; accepting more would
/// overflow the accumulator on the next hex digit.
const MAX_CHUNK_SIZE: u64 = u64::MAX >> 4;

/// Sub-state of the chunked decoder between payload runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Consuming payload, or reading the hex size marker when `skip` is 0.
    NoSearch,
    /// Inside a chunk extension, scanning for the CR that ends the marker line.
    MarkerCrSearch,
    /// The marker CR was seen; only LF is legal next.
    MarkerLfExpect,
    /// Chunk payload consumed; expecting the CR of the chunk-ending CRLF.
    ChunkCrExpect,
    /// Expecting the LF of the chunk-ending CRLF.
    ChunkLfExpect,
    /// Inside a trailer field line, scanning for its CR.
    TrailerCrSearch,
    /// Expecting the LF ending a trailer field line.
    TrailerLfExpect,
    /// After a trailer line; CR here starts the trailer-section terminator.
    TrailerCr2Expect,
    /// Expecting the final LF of the trailer terminator.
    TrailerLf2Expect,
}

/// Body framing decoder.
///
/// The decoder never copies payload bytes: they stay where they were
/// received and are later swap-transferred to the sending ring. `feed` only
/// walks the framing (chunk-size markers, chunk CRLFs, trailers) and counts
/// payload down through `skip`.
#[derive(Debug)]
pub struct BodyDecoder {
    chunked: bool,
    /// Payload bytes still to pass through before the next framing byte.
    skip: u64,
    /// Partially accumulated chunk-size marker; `None` until the first hex
    /// digit of a marker is seen, so a marker split across receives resumes
    /// where it stopped.
    marker: Option<u64>,
    state: ChunkState,
    body_end: bool,
}

impl BodyDecoder {
    pub fn new() -> Self {
        Self {
            chunked: false,
            skip: 0,
            marker: None,
            state: ChunkState::NoSearch,
            body_end: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Arm the decoder from the head metadata of the message whose body
    /// follows.
    pub fn start(&mut self, content_length: Option<u64>, chunked: bool) {
        self.reset();
        self.chunked = chunked;
        if !chunked {
            self.skip = content_length.unwrap_or(0);
        }
    }

    /// Consume framing from the newly received window. Returns `Proceed`
    /// exactly at the final CRLF of the body, `Continue` when more bytes are
    /// needed, `Terminate` on a framing violation.
    pub fn feed(&mut self, chunk: &[u8]) -> ParseStatus {
        if self.chunked {
            self.feed_chunked(chunk)
        } else {
            let take = self.skip.min(chunk.len() as u64);
            self.skip -= take;
            if self.skip == 0 {
                ParseStatus::Proceed
            } else {
                ParseStatus::Continue
            }
        }
    }

    fn feed_chunked(&mut self, chunk: &[u8]) -> ParseStatus {
        let mut i = 0;
        while i < chunk.len() {
            let b = chunk[i];
            match self.state {
                ChunkState::NoSearch => {
                    if self.skip > 0 {
                        let take = self.skip.min((chunk.len() - i) as u64);
                        self.skip -= take;
                        i += take as usize;
                        if self.skip == 0 {
                            self.state = ChunkState::ChunkCrExpect;
                        }
                        continue;
                    }
                    if let Some(digit) = hex_value(b) {
                        let acc = self.marker.unwrap_or(0);
                        if acc > MAX_CHUNK_SIZE {
                            debug!("chunk size marker overflow");
                            return ParseStatus::Terminate;
                        }
                        self.marker = Some(acc << 4 | digit as u64);
                    } else if b == b';' && self.marker.is_some() {
                        self.state = ChunkState::MarkerCrSearch;
                    } else if b == b'\r' && self.marker.is_some() {
                        self.state = ChunkState::MarkerLfExpect;
                    } else {
                        debug!("unexpected byte in chunk size marker");
                        return ParseStatus::Terminate;
                    }
                    i += 1;
                }
                ChunkState::MarkerCrSearch => {
                    // chunk extensions are passed through unexamined
                    match chunk[i..].iter().position(|&b| b == b'\r') {
                        Some(pos) => {
                            i += pos + 1;
                            self.state = ChunkState::MarkerLfExpect;
                        }
                        None => i = chunk.len(),
                    }
                }
                ChunkState::MarkerLfExpect => {
                    if b != b'\n' {
                        debug!("chunk size marker not terminated by CRLF");
                        return ParseStatus::Terminate;
                    }
                    i += 1;
                    let size = self.marker.take().unwrap_or(0);
                    if size == 0 {
                        self.body_end = true;
                        self.state = ChunkState::ChunkCrExpect;
                    } else {
                        self.skip = size;
                        self.state = ChunkState::NoSearch;
                    }
                }
                ChunkState::ChunkCrExpect => {
                    if b == b'\r' {
                        self.state = ChunkState::ChunkLfExpect;
                        i += 1;
                    } else if self.body_end {
                        // a trailer field follows the last chunk
                        self.state = ChunkState::TrailerCrSearch;
                    } else {
                        debug!("chunk payload not terminated by CRLF");
                        return ParseStatus::Terminate;
                    }
                }
                ChunkState::ChunkLfExpect => {
                    if b != b'\n' {
                        debug!("chunk payload not terminated by CRLF");
                        return ParseStatus::Terminate;
                    }
                    i += 1;
                    if self.body_end {
                        return ParseStatus::Proceed;
                    }
                    self.state = ChunkState::NoSearch;
                }
                ChunkState::TrailerCrSearch => {
                    match chunk[i..].iter().position(|&b| b == b'\r') {
                        Some(pos) => {
                            i += pos + 1;
                            self.state = ChunkState::TrailerLfExpect;
                        }
                        None => i = chunk.len(),
                    }
                }
                ChunkState::TrailerLfExpect => {
                    if b != b'\n' {
                        debug!("trailer field not terminated by CRLF");
                        return ParseStatus::Terminate;
                    }
                    i += 1;
                    self.state = ChunkState::TrailerCr2Expect;
                }
                ChunkState::TrailerCr2Expect => {
                    if b == b'\r' {
                        self.state = ChunkState::TrailerLf2Expect;
                        i += 1;
                    } else {
                        self.state = ChunkState::TrailerCrSearch;
                    }
                }
                ChunkState::TrailerLf2Expect => {
                    if b != b'\n' {
                        debug!("trailer section not terminated by CRLFCRLF");
                        return ParseStatus::Terminate;
                    }
                    return ParseStatus::Proceed;
                }
            }
        }
        ParseStatus::Continue
    }
}

impl Default for BodyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
