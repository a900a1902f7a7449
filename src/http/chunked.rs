//! Incremental decoder for `Transfer-Encoding: chunked` bodies.
//!
//! Grammar: repeat { hex size CRLF, `size` data bytes, CRLF } until a
//! zero-size chunk, then optional trailer lines and a final CRLF.

use crate::error::HttpError;

/// Longest size or trailer line accepted before the body is declared malformed.
const MAX_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data,
    DataEnd,
    Trailer,
    Done,
}

#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
    remaining: usize,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: ChunkState::Size, line: Vec::new(), remaining: 0 }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Decodes as much of `input` as possible into `out` and returns how many
    /// input bytes were consumed. Stops right after the terminating chunk, so
    /// anything past the returned count belongs to the next message.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, HttpError> {
        let mut pos = 0;
        while pos < input.len() && self.state != ChunkState::Done {
            match self.state {
                ChunkState::Size | ChunkState::Trailer => {
                    let Some(line) = self.take_line(input, &mut pos)? else { break };
                    if self.state == ChunkState::Size {
                        self.remaining = parse_size(&line)?;
                        self.state =
                            if self.remaining == 0 { ChunkState::Trailer } else { ChunkState::Data };
                    } else if line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Data => {
                    let take = self.remaining.min(input.len() - pos);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataEnd;
                    }
                }
                ChunkState::DataEnd => {
                    let Some(line) = self.take_line(input, &mut pos)? else { break };
                    if !line.is_empty() {
                        return Err(HttpError::bad_request("bad chunking: data longer than its size"));
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Done => break,
            }
        }
        Ok(pos)
    }

    /// Collects one CRLF-terminated line, possibly across calls.
    fn take_line(&mut self, input: &[u8], pos: &mut usize) -> Result<Option<Vec<u8>>, HttpError> {
        while *pos < input.len() {
            let b = input[*pos];
            *pos += 1;
            self.line.push(b);
            if self.line.ends_with(b"\r\n") {
                let mut line = std::mem::take(&mut self.line);
                line.truncate(line.len() - 2);
                return Ok(Some(line));
            }
            if self.line.len() > MAX_LINE {
                return Err(HttpError::bad_request("bad chunking: line too long"));
            }
        }
        Ok(None)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_size(line: &[u8]) -> Result<usize, HttpError> {
    let text = std::str::from_utf8(line).map_err(|_| HttpError::bad_request("bad chunk size"))?;
    // chunk extensions after ';' are ignored
    let digits = text.split(';').next().unwrap_or("").trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HttpError::bad_request(format!("bad chunk size: {text}")));
    }
    usize::from_str_radix(digits, 16).map_err(|_| HttpError::bad_request(format!("bad chunk size: {text}")))
}

/// Decodes a complete chunked body. Truncated input is malformed.
pub fn decode_chunked(body: &[u8]) -> Result<Vec<u8>, HttpError> {
    let mut decoder = ChunkedDecoder::new();
    let mut out = Vec::new();
    decoder.feed(body, &mut out)?;
    if !decoder.is_done() {
        return Err(HttpError::bad_request("bad chunking: truncated body"));
    }
    Ok(out)
}
