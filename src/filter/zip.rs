//! Zip filter: incremental inflate/deflate over the compression library's
//! streaming API.
//!
//! Raw deflate and zlib wrap the library directly; gzip adds the member
//! header, the CRC trailer, and their incremental parsing/emission here.

use flate2::{Compress, Compression, Crc, Decompress, FlushCompress, FlushDecompress, Status};
use log::trace;

use super::{ByteReader, ByteWriter, Transform};

/// Compression container format.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ZipAlgo {
    /// Raw deflate, no wrapper.
    Raw,
    /// zlib wrapper (RFC 1950).
    Zlib,
    /// gzip member (RFC 1952).
    Gzip,
}

/// Direction of the transform.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ZipAction {
    /// Decompress.
    Inflate,
    /// Compress.
    Deflate,
}

enum Codec {
    None,
    Inflate(Decompress),
    Deflate(Compress),
}

/// The zip transform. Algorithm and action are fixed before open.
pub struct ZipTransform {
    algo: ZipAlgo,
    action: ZipAction,
    codec: Codec,
    crc: Crc,
    // gzip header handling
    header_done: bool,
    hbuf: Vec<u8>,
    // gzip trailer bytes still to emit (deflate) or to swallow (inflate)
    tail: Vec<u8>,
    swallow: usize,
    finished: bool,
}

impl ZipTransform {
    pub fn new(algo: ZipAlgo, action: ZipAction) -> ZipTransform {
        ZipTransform {
            algo,
            action,
            codec: Codec::None,
            crc: Crc::new(),
            header_done: false,
            hbuf: Vec::new(),
            tail: Vec::new(),
            swallow: 0,
            finished: false,
        }
    }

    pub fn algo(&self) -> ZipAlgo {
        self.algo
    }

    pub fn action(&self) -> ZipAction {
        self.action
    }

    // gzip: consume the member header byte by byte until it parses.
    fn eat_header(&mut self, input: &mut ByteReader<'_>) -> Result<bool, ()> {
        loop {
            match gz_header_len(&self.hbuf) {
                Some(len) if self.hbuf.len() >= len => {
                    self.header_done = true;
                    self.hbuf.clear();
                    return Ok(true);
                }
                _ => match input.take() {
                    Some(byte) => {
                        self.hbuf.push(byte);
                        if self.hbuf.len() <= 2 {
                            let magic = [0x1f, 0x8b];
                            if self.hbuf[..] != magic[..self.hbuf.len()] {
                                return Err(());
                            }
                        }
                        if self.hbuf.len() == 3 && self.hbuf[2] != 8 {
                            // Only deflate members exist in practice.
                            return Err(());
                        }
                    }
                    None => return Ok(false),
                },
            }
        }
    }
}

// Returns the total gzip header length once enough bytes are buffered to
// know it.
fn gz_header_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 10 {
        return None;
    }
    let flg = buf[3];
    let mut len = 10;
    if flg & 0x04 != 0 {
        // FEXTRA
        if buf.len() < len + 2 {
            return None;
        }
        let xlen = u16::from_le_bytes([buf[len], buf[len + 1]]) as usize;
        len += 2 + xlen;
    }
    if flg & 0x08 != 0 {
        // FNAME
        match buf[len.min(buf.len())..].iter().position(|b| *b == 0) {
            Some(at) => len += at + 1,
            None => return None,
        }
    }
    if flg & 0x10 != 0 {
        // FCOMMENT
        match buf[len.min(buf.len())..].iter().position(|b| *b == 0) {
            Some(at) => len += at + 1,
            None => return None,
        }
    }
    if flg & 0x02 != 0 {
        // FHCRC
        len += 2;
    }
    Some(len)
}

impl Transform for ZipTransform {
    fn open(&mut self) -> bool {
        self.codec = match self.action {
            ZipAction::Inflate => Codec::Inflate(Decompress::new(self.algo == ZipAlgo::Zlib)),
            ZipAction::Deflate => Codec::Deflate(Compress::new(
                Compression::default(),
                self.algo == ZipAlgo::Zlib,
            )),
        };
        self.crc = Crc::new();
        self.header_done = self.algo != ZipAlgo::Gzip;
        self.hbuf.clear();
        self.tail.clear();
        self.swallow = 0;
        self.finished = false;
        true
    }

    fn clos(&mut self) {
        self.codec = Codec::None;
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
        let mut produced = 0usize;

        // gzip prologue.
        if !self.header_done {
            match self.action {
                ZipAction::Inflate => match self.eat_header(input) {
                    Ok(true) => {}
                    Ok(false) => return 0,
                    Err(()) => {
                        trace!("zip: bad gzip header");
                        return -1;
                    }
                },
                ZipAction::Deflate => {
                    // Minimal member header: deflate, no flags, unknown os.
                    let header = [0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 0xff];
                    if output.left() < header.len() {
                        return produced as isize;
                    }
                    produced += output.put_slice(&header);
                    self.header_done = true;
                }
            }
        }

        // Emit any pending gzip trailer bytes first.
        if !self.tail.is_empty() {
            let n = output.put_slice(&self.tail);
            self.tail.drain(..n);
            produced += n;
            if self.tail.is_empty() {
                self.finished = true;
            }
            return produced as isize;
        }
        // Swallow the gzip trailer on the inflate side.
        if self.swallow > 0 {
            let skip = self.swallow.min(input.left());
            input.skip(skip);
            self.swallow -= skip;
            if self.swallow == 0 {
                self.finished = true;
                return if produced > 0 { produced as isize } else { -1 };
            }
            return produced as isize;
        }

        match &mut self.codec {
            Codec::Inflate(codec) => loop {
                let data = input.rest();
                let before_in = codec.total_in();
                let before_out = codec.total_out();
                let status = {
                    let room = output.room();
                    if room.is_empty() {
                        break;
                    }
                    match codec.decompress(data, room, FlushDecompress::None) {
                        Ok(status) => status,
                        Err(err) => {
                            trace!("zip: inflate error: {}", err);
                            return -1;
                        }
                    }
                };
                let consumed = (codec.total_in() - before_in) as usize;
                let written = (codec.total_out() - before_out) as usize;
                input.skip(consumed);
                output.advance(written);
                produced += written;
                match status {
                    Status::StreamEnd => {
                        if self.algo == ZipAlgo::Gzip {
                            // CRC32 + ISIZE follow the member.
                            self.swallow = 8;
                            let skip = self.swallow.min(input.left());
                            input.skip(skip);
                            self.swallow -= skip;
                            if self.swallow > 0 {
                                return produced as isize;
                            }
                        }
                        self.finished = true;
                        return if produced > 0 { produced as isize } else { -1 };
                    }
                    _ if consumed == 0 && written == 0 => break,
                    _ => {}
                }
            },
            Codec::Deflate(codec) => {
                let flush = match sync {
                    0 => FlushCompress::None,
                    s if s < 0 => FlushCompress::Finish,
                    _ => FlushCompress::Sync,
                };
                loop {
                    let data = input.rest();
                    let before_in = codec.total_in();
                    let before_out = codec.total_out();
                    let status = {
                        let room = output.room();
                        if room.is_empty() {
                            break;
                        }
                        match codec.compress(data, room, flush) {
                            Ok(status) => status,
                            Err(err) => {
                                trace!("zip: deflate error: {}", err);
                                return -1;
                            }
                        }
                    };
                    let consumed = (codec.total_in() - before_in) as usize;
                    let written = (codec.total_out() - before_out) as usize;
                    if self.algo == ZipAlgo::Gzip && consumed > 0 {
                        self.crc.update(&data[..consumed]);
                    }
                    input.skip(consumed);
                    output.advance(written);
                    produced += written;
                    match status {
                        Status::StreamEnd => {
                            if self.algo == ZipAlgo::Gzip {
                                let mut tail = Vec::with_capacity(8);
                                tail.extend_from_slice(&self.crc.sum().to_le_bytes());
                                tail.extend_from_slice(&self.crc.amount().to_le_bytes());
                                let n = output.put_slice(&tail);
                                tail.drain(..n);
                                produced += n;
                                if tail.is_empty() {
                                    self.finished = true;
                                } else {
                                    self.tail = tail;
                                }
                            } else {
                                self.finished = true;
                            }
                            return produced as isize;
                        }
                        _ if consumed == 0 && written == 0 && input.left() == 0 => break,
                        _ => {}
                    }
                }
            }
            Codec::None => return -1,
        }

        produced as isize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, Spak};

    fn pump(filter: &mut Filter, data: &[u8], chunk: usize) -> Vec<u8> {
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

    fn round_trip(algo: ZipAlgo, payload: &[u8], chunk: usize) {
        let mut deflate = Filter::zip(algo, ZipAction::Deflate);
        assert!(deflate.open());
        let packed = pump(&mut deflate, payload, chunk);
        assert!(!packed.is_empty());

        let mut inflate = Filter::zip(algo, ZipAction::Inflate);
        assert!(inflate.open());
        let unpacked = pump(&mut inflate, &packed, chunk);
        assert_eq!(unpacked, payload);
    }

    #[test]
    fn zlib_round_trip() {
        let payload: Vec<u8> = (0..4096u32).flat_map(|i| i.to_le_bytes()).collect();
        round_trip(ZipAlgo::Zlib, &payload, 512);
    }

    #[test]
    fn raw_round_trip_small_chunks() {
        round_trip(ZipAlgo::Raw, b"the quick brown fox jumps over the lazy dog", 3);
    }

    #[test]
    fn gzip_round_trip() {
        let payload = b"gzip adds a header and a crc trailer around raw deflate".repeat(64);
        round_trip(ZipAlgo::Gzip, &payload, 100);
    }

    #[test]
    fn gzip_decodes_reference_bytes() {
        // `echo -n hello | gzip -n` with the mtime bytes zeroed.
        let reference: &[u8] = &[
            0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0xcb, 0x48, 0xcd, 0xc9,
            0xc9, 0x07, 0x00, 0x86, 0xa6, 0x10, 0x36, 0x05, 0x00, 0x00, 0x00,
        ];
        let mut inflate = Filter::zip(ZipAlgo::Gzip, ZipAction::Inflate);
        assert!(inflate.open());
        let out = pump(&mut inflate, reference, reference.len());
        assert_eq!(out, b"hello");
    }
}
