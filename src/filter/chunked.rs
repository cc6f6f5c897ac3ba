//! HTTP/1.1 chunked transfer decoding.
//!
//! Wire format: `hex-size CRLF body CRLF ... 0 CRLF trailer CRLF`. The
//! decoder is a plain byte state machine so chunk boundaries may fall
//! anywhere across spak calls.

use log::trace;

use super::{ByteReader, ByteWriter, Transform};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    /// Reading hex size digits (and tolerating chunk extensions).
    Size,
    /// Saw CR after the size line, expecting LF.
    SizeLf,
    /// Copying `remaining` body bytes through.
    Body,
    /// Expecting CR after the body.
    BodyCr,
    /// Expecting LF after the body CR.
    BodyLf,
    /// Consuming trailer lines; an empty one ends the stream.
    Trailer,
    /// Saw CR inside the trailer.
    TrailerCr,
    /// All chunks and trailers consumed.
    End,
    /// Framing violation; the stream is poisoned.
    Failed,
}

/// Decoder for the chunked transfer coding.
pub struct ChunkedTransform {
    state: State,
    size: u64,
    remaining: u64,
    /// Trailer line currently has content (a final empty line ends all).
    trailer_line: bool,
}

impl ChunkedTransform {
    pub fn new() -> ChunkedTransform {
        ChunkedTransform {
            state: State::Size,
            size: 0,
            remaining: 0,
            trailer_line: false,
        }
    }
}

impl Default for ChunkedTransform {
    fn default() -> ChunkedTransform {
        ChunkedTransform::new()
    }
}

impl ChunkedTransform {
    fn fail(&mut self, produced: isize) -> isize {
        trace!("chunked: malformed framing");
        self.state = State::Failed;
        if produced > 0 {
            produced
        } else {
            -1
        }
    }
}

impl Transform for ChunkedTransform {
    fn clos(&mut self) {
        self.state = State::Size;
        self.size = 0;
        self.remaining = 0;
        self.trailer_line = false;
    }

    fn spak(
        &mut self,
        input: &mut ByteReader<'_>,
        output: &mut ByteWriter<'_>,
        _sync: i32,
    ) -> isize {
        let mut produced = 0isize;

        loop {
            match self.state {
                State::Size => {
                    let byte = match input.peek() {
                        Some(byte) => byte,
                        None => return produced,
                    };
                    match byte {
                        b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                            input.skip(1);
                            let digit = match byte {
                                b'0'..=b'9' => byte - b'0',
                                b'a'..=b'f' => byte - b'a' + 10,
                                _ => byte - b'A' + 10,
                            };
                            self.size = (self.size << 4) | digit as u64;
                        }
                        b'\r' => {
                            input.skip(1);
                            self.state = State::SizeLf;
                        }
                        // Chunk extensions are permitted; ignore them.
                        _ => {
                            input.skip(1);
                        }
                    }
                }
                State::SizeLf => {
                    match input.take() {
                        Some(b'\n') => {}
                        Some(_) => return self.fail(produced),
                        None => return produced,
                    }
                    if self.size == 0 {
                        trace!("chunked: last chunk, reading trailers");
                        self.trailer_line = false;
                        self.state = State::Trailer;
                    } else {
                        self.remaining = self.size;
                        self.state = State::Body;
                    }
                }
                State::Body => {
                    if self.remaining == 0 {
                        self.state = State::BodyCr;
                        continue;
                    }
                    if input.left() == 0 || output.left() == 0 {
                        return produced;
                    }
                    let want = (self.remaining as usize).min(output.left());
                    let bytes = input.take_slice(want);
                    if bytes.is_empty() {
                        return produced;
                    }
                    let n = output.put_slice(bytes);
                    self.remaining -= n as u64;
                    produced += n as isize;
                }
                State::BodyCr => match input.take() {
                    Some(b'\r') => self.state = State::BodyLf,
                    Some(_) => return self.fail(produced),
                    None => return produced,
                },
                State::BodyLf => match input.take() {
                    Some(b'\n') => {
                        self.size = 0;
                        self.state = State::Size;
                    }
                    Some(_) => return self.fail(produced),
                    None => return produced,
                },
                State::Trailer => match input.take() {
                    Some(b'\r') => self.state = State::TrailerCr,
                    Some(_) => {
                        self.trailer_line = true;
                    }
                    None => return produced,
                },
                State::TrailerCr => match input.take() {
                    Some(b'\n') => {
                        if self.trailer_line {
                            // One trailer line done; the next may be empty.
                            self.trailer_line = false;
                            self.state = State::Trailer;
                        } else {
                            self.state = State::End;
                        }
                    }
                    Some(_) => return self.fail(produced),
                    None => return produced,
                },
                State::End | State::Failed => {
                    return if produced > 0 { produced } else { -1 };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, Spak};

    #[test]
    fn decodes_canonical_stream() {
        let mut filter = Filter::chunked();
        assert!(filter.open());
        let out = filter.spak(b"5\r\nhello\r\n0\r\n\r\n", 0, 1);
        assert_eq!(out.data(), b"hello");
        assert!(filter.spak(&[], 0, -1).is_eof());
    }

    #[test]
    fn decodes_split_anywhere() {
        let encoded = b"4\r\nwiki\r\n5\r\npedia\r\nF\r\n in \r\n\r\nchunks.\r\n0\r\n\r\n";
        let expected = b"wikipedia in \r\n\r\nchunks.";

        // Feed a byte at a time; everything must still come out in order.
        let mut filter = Filter::chunked();
        assert!(filter.open());
        let mut decoded = Vec::new();
        let mut eof = false;
        for byte in encoded.iter() {
            match filter.spak(&[*byte], 0, 1) {
                Spak::Data(data) => decoded.extend_from_slice(data),
                Spak::Eof => {
                    eof = true;
                    break;
                }
                Spak::None => {}
            }
        }
        if !eof {
            loop {
                match filter.spak(&[], 0, -1) {
                    Spak::Data(data) => decoded.extend_from_slice(data),
                    Spak::Eof => break,
                    Spak::None => break,
                }
            }
        }
        assert_eq!(decoded, expected);
    }

    #[test]
    fn tolerates_trailers() {
        let mut filter = Filter::chunked();
        assert!(filter.open());
        let out = filter.spak(b"3\r\nabc\r\n0\r\nX-Sum: 1\r\n\r\n", 0, 1);
        assert_eq!(out.data(), b"abc");
        assert!(filter.spak(&[], 0, -1).is_eof());
    }

    #[test]
    fn rejects_malformed_framing() {
        let mut filter = Filter::chunked();
        assert!(filter.open());
        // Body not followed by CRLF.
        match filter.spak(b"3\r\nabcXY", 0, 1) {
            Spak::Data(data) => assert_eq!(data, b"abc"),
            _ => panic!("expected the body first"),
        }
        assert!(filter.spak(b"Z", 0, 1).is_eof());
    }
}
