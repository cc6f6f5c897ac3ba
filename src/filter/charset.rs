//! Charset conversion filter.
//!
//! Converts between two encodings through UTF-8, using the encoding
//! library's incremental coders so multi-byte sequences may split across
//! spak calls. Decoded-but-not-yet-reencoded text is carried in an
//! intermediate buffer between calls.

use encoding_rs::{CoderResult, Decoder, Encoder, Encoding};
use log::trace;

use super::{ByteReader, ByteWriter, Transform};

// Cap on the intermediate text carried between calls.
const PENDING_MAXN: usize = 4096;

/// Converts bytes from one charset to another.
pub struct CharsetTransform {
    from: &'static Encoding,
    to: &'static Encoding,
    decoder: Option<Decoder>,
    encoder: Option<Encoder>,
    // UTF-8 text decoded from the source but not yet encoded to the target.
    pending: String,
    decoder_done: bool,
    finished: bool,
}

impl CharsetTransform {
    /// Builds a converter from two encoding labels (e.g. `"gbk"`,
    /// `"utf-8"`). Returns `None` for an unknown label.
    pub fn new(from: &str, to: &str) -> Option<CharsetTransform> {
        let from = Encoding::for_label(from.as_bytes())?;
        let to = Encoding::for_label(to.as_bytes())?;
        Some(CharsetTransform {
            from,
            to,
            decoder: None,
            encoder: None,
            pending: String::new(),
            decoder_done: false,
            finished: false,
        })
    }

    /// Source charset name.
    pub fn from_charset(&self) -> &'static str {
        self.from.name()
    }

    /// Target charset name.
    pub fn to_charset(&self) -> &'static str {
        self.to.name()
    }
}

impl Transform for CharsetTransform {
    fn open(&mut self) -> bool {
        self.decoder = Some(self.from.new_decoder());
        self.encoder = Some(self.to.new_encoder());
        self.pending.clear();
        self.decoder_done = false;
        self.finished = false;
        true
    }

    fn clos(&mut self) {
        self.decoder = None;
        self.encoder = None;
        self.pending.clear();
    }

    fn spak(
        &mut self,
        input: &mut ByteReader<'_>,
        output: &mut ByteWriter<'_>,
        sync: i32,
    ) -> isize {
        if self.finished {
            return -1;
        }
        let (decoder, encoder) = match (&mut self.decoder, &mut self.encoder) {
            (Some(decoder), Some(encoder)) => (decoder, encoder),
            _ => return -1,
        };
        let last = sync < 0;
        let mut produced = 0usize;

        loop {
            let mut progressed = false;

            // Top up the intermediate text from the source bytes.
            if !self.decoder_done
                && self.pending.len() < PENDING_MAXN
                && (input.left() > 0 || last)
            {
                let data = input.rest();
                let before = self.pending.len();
                let (result, read, _had_errors) =
                    decoder.decode_to_string(data, &mut self.pending, last);
                input.skip(read);
                progressed |= read > 0 || self.pending.len() > before;
                if last && input.left() == 0 && result == CoderResult::InputEmpty {
                    self.decoder_done = true;
                    progressed = true;
                }
            }

            // Re-encode the intermediate text into the output.
            if !self.pending.is_empty() {
                let room = output.room();
                if room.is_empty() {
                    return produced as isize;
                }
                let (result, read, written, _had_errors) =
                    encoder.encode_from_utf8(&self.pending, room, false);
                output.advance(written);
                produced += written;
                self.pending.drain(..read);
                if result == CoderResult::OutputFull {
                    return produced as isize;
                }
                progressed |= read > 0 || written > 0;
            } else if self.decoder_done {
                // Flush the encoder's own state and finish.
                let room = output.room();
                if room.is_empty() {
                    return produced as isize;
                }
                let (result, _read, written, _had_errors) =
                    encoder.encode_from_utf8("", room, true);
                output.advance(written);
                produced += written;
                if result == CoderResult::InputEmpty {
                    self.finished = true;
                    trace!("charset: conversion finished");
                    return if produced > 0 { produced as isize } else { -1 };
                }
                continue;
            }

            if !progressed {
                return produced as isize;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, Spak};

    fn convert(from: &str, to: &str, data: &[u8], chunk: usize) -> Vec<u8> {
        let mut filter = Filter::charset(from, to).expect("known charsets");
        assert!(filter.open());
        let mut out = Vec::new();
        for piece in data.chunks(chunk.max(1)) {
            match filter.spak(piece, 0, 1) {
                Spak::Data(bytes) => out.extend_from_slice(bytes),
                Spak::None => {}
                Spak::Eof => break,
            }
        }
        loop {
            match filter.spak(&[], 0, -1) {
                Spak::Data(bytes) => out.extend_from_slice(bytes),
                _ => break,
            }
        }
        out
    }

    #[test]
    fn utf8_to_gbk_and_back() {
        let text = "中文转换 mixed with ascii";
        let gbk = convert("utf-8", "gbk", text.as_bytes(), 5);
        assert!(!gbk.is_empty());
        assert_ne!(gbk, text.as_bytes());
        let back = convert("gbk", "utf-8", &gbk, 3);
        assert_eq!(back, text.as_bytes());
    }

    #[test]
    fn latin1_to_utf8_split_sequences() {
        let latin1: Vec<u8> = vec![b'c', 0xe9, b'z', 0xe8, b'v', b'e'];
        let utf8 = convert("latin1", "utf-8", &latin1, 1);
        assert_eq!(utf8, "cézève".as_bytes());
    }

    #[test]
    fn unknown_label_is_refused() {
        assert!(Filter::charset("no-such-charset", "utf-8").is_none());
    }
}
