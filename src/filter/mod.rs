//! Incremental byte-stream filters.
//!
//! A [`Filter`] is a push/pull transformer: callers feed it input bytes and
//! pull transformed bytes out through [`Filter::spak`], in any interleaving.
//! Unconsumed input is carried over between calls, transformed output is
//! staged in a bounded ring, and an end-of-stream flag latches once the
//! input limit (when set) is reached or the transform reports completion.
//!
//! Four transforms ship with the engine: HTTP/1.1 chunked decoding, zip
//! inflate/deflate, charset conversion, and an identity transform whose
//! only job is to force a minimum buffering chunk.

mod cache;
mod charset;
mod chunked;
mod zip;

pub use charset::CharsetTransform;
pub use chunked::ChunkedTransform;
pub use zip::{ZipAction, ZipAlgo, ZipTransform};

use log::trace;

/// Default staging capacity of the output ring.
const ODATA_MAXN: usize = 8192;

/// Bounded reader over the input handed to a transform.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> ByteReader<'a> {
        ByteReader { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn left(&self) -> usize {
        self.data.len() - self.pos
    }

    /// The unconsumed tail.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Peeks one byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Consumes one byte.
    pub fn take(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    /// Consumes up to `n` bytes, returning the consumed slice.
    pub fn take_slice(&mut self, n: usize) -> &'a [u8] {
        let n = n.min(self.left());
        let taken = &self.data[self.pos..self.pos + n];
        self.pos += n;
        taken
    }

    /// Skips up to `n` bytes.
    pub fn skip(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }
}

/// Bounded writer over the output ring's tail.
pub struct ByteWriter<'a> {
    data: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    fn new(data: &'a mut [u8]) -> ByteWriter<'a> {
        ByteWriter { data, pos: 0 }
    }

    /// Remaining room.
    pub fn left(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.pos
    }

    /// Writes one byte. Returns false when full.
    pub fn put(&mut self, byte: u8) -> bool {
        if self.pos >= self.data.len() {
            return false;
        }
        self.data[self.pos] = byte;
        self.pos += 1;
        true
    }

    /// Writes as much of `bytes` as fits, returning the count written.
    pub fn put_slice(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.left());
        self.data[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
        self.pos += n;
        n
    }

    /// The writable tail, for transforms that fill buffers directly.
    pub fn room(&mut self) -> &mut [u8] {
        &mut self.data[self.pos..]
    }

    /// Marks `n` bytes of [`ByteWriter::room`] as written.
    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }
}

/// A concrete transform plugged into a [`Filter`].
///
/// `spak` consumes what it can from the reader, produces what fits into the
/// writer, and returns the bytes produced, or negative to signal the end of
/// the transformed stream. `sync` is 1 when the caller requested a flush, 0
/// in steady state, and -1 at end of input.
pub trait Transform: Send {
    fn open(&mut self) -> bool {
        true
    }

    fn clos(&mut self) {}

    fn spak(&mut self, input: &mut ByteReader<'_>, output: &mut ByteWriter<'_>, sync: i32)
        -> isize;
}

/// Result of one [`Filter::spak`] call.
pub enum Spak<'a> {
    /// Transformed bytes, at most `need` of them.
    Data(&'a [u8]),
    /// Nothing to deliver yet; feed more input or sync.
    None,
    /// The transformed stream ended and the ring is drained.
    Eof,
}

impl<'a> Spak<'a> {
    /// The delivered bytes, empty for `None`/`Eof`.
    pub fn data(&self) -> &'a [u8] {
        match self {
            Spak::Data(data) => *data,
            _ => &[],
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Spak::Eof)
    }
}

// Output staging ring: contiguous storage with a read head, compacted
// before each push so the writable tail stays contiguous too.
struct QueueBuf {
    buf: Vec<u8>,
    head: usize,
    maxn: usize,
}

impl QueueBuf {
    fn new(maxn: usize) -> QueueBuf {
        QueueBuf {
            buf: Vec::new(),
            head: 0,
            maxn: maxn.max(64),
        }
    }

    fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    fn maxn(&self) -> usize {
        self.maxn
    }

    fn grow(&mut self, maxn: usize) {
        if maxn > self.maxn {
            self.maxn = maxn;
        }
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.head = 0;
    }

    fn compact(&mut self) {
        if self.head > 0 {
            self.buf.drain(..self.head);
            self.head = 0;
        }
    }

    // Opens the writable tail, returning its start index.
    fn begin_push(&mut self) -> usize {
        self.compact();
        let start = self.buf.len();
        let room = self.maxn.saturating_sub(start);
        self.buf.resize(start + room, 0);
        start
    }

    fn end_push(&mut self, start: usize, written: usize) {
        self.buf.truncate(start + written);
    }

    fn pull(&mut self, n: usize) -> &[u8] {
        let n = n.min(self.len());
        let start = self.head;
        self.head += n;
        &self.buf[start..start + n]
    }
}

/// The filter driver. See the module docs for the contract.
pub struct Filter {
    transform: Box<dyn Transform>,
    opened: bool,
    beof: bool,
    limit: i64,
    offset: u64,
    idata: Vec<u8>,
    odata: QueueBuf,
}

impl Filter {
    /// Wraps a transform with default buffering.
    pub fn new(transform: Box<dyn Transform>) -> Filter {
        Filter {
            transform,
            opened: false,
            beof: false,
            limit: -1,
            offset: 0,
            idata: Vec::new(),
            odata: QueueBuf::new(ODATA_MAXN),
        }
    }

    /// An HTTP/1.1 chunked-transfer decoder.
    pub fn chunked() -> Filter {
        Filter::new(Box::new(ChunkedTransform::new()))
    }

    /// A zip filter; algorithm and direction are fixed at construction.
    pub fn zip(algo: ZipAlgo, action: ZipAction) -> Filter {
        Filter::new(Box::new(ZipTransform::new(algo, action)))
    }

    /// A charset converter between two encoding labels, e.g. `"gbk"` to
    /// `"utf-8"`.
    pub fn charset(from: &str, to: &str) -> Option<Filter> {
        CharsetTransform::new(from, to).map(|t| Filter::new(Box::new(t)))
    }

    /// An identity filter that forces buffering in chunks of at least
    /// `size` bytes.
    pub fn cache(size: usize) -> Filter {
        let mut filter = Filter::new(Box::new(cache::CacheTransform));
        filter.odata = QueueBuf::new(size);
        filter
    }

    /// Opens the filter. Idempotent.
    pub fn open(&mut self) -> bool {
        if self.opened {
            return true;
        }
        self.opened = self.transform.open();
        self.opened
    }

    /// Closes the filter and resets all carried state.
    pub fn clos(&mut self) {
        if !self.opened {
            return;
        }
        self.transform.clos();
        self.beof = false;
        self.limit = -1;
        self.offset = 0;
        self.idata.clear();
        self.odata.clear();
        self.opened = false;
    }

    /// End-of-stream flag.
    pub fn beof(&self) -> bool {
        self.beof
    }

    /// The input byte limit; -1 means unlimited.
    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Marks the total input size so the filter can latch EOF by itself.
    pub fn set_limit(&mut self, limit: i64) {
        self.limit = limit;
    }

    /// Total input bytes accepted so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Appends input without transforming, for callers that batch.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        self.idata.extend_from_slice(data);
        self.offset += data.len() as u64;
        true
    }

    /// One transformer step; see the module docs. `need` of zero asks for
    /// "whatever is buffered".
    pub fn spak(&mut self, data: &[u8], need: usize, sync: i32) -> Spak<'_> {
        let mut sync = sync;

        self.offset += data.len() as u64;
        if self.limit >= 0 && self.offset as i64 >= self.limit {
            self.beof = true;
        }
        if self.beof {
            sync = -1;
        }

        // Pick the input view: append to the carry-over if it holds bytes,
        // use the caller's slice directly otherwise.
        let direct = self.idata.is_empty() && !data.is_empty();
        if !direct && !data.is_empty() {
            self.idata.extend_from_slice(data);
        }
        if data.is_empty() && self.idata.is_empty() && sync == 0 {
            return Spak::None;
        }

        let need = if need == 0 {
            data.len().max(self.odata.maxn())
        } else {
            need
        };
        if need == 0 {
            return Spak::Eof;
        }

        // Short-circuit: enough staged output already.
        if self.odata.len() >= need {
            if direct {
                self.idata.extend_from_slice(data);
            }
            trace!("filter: served {} bytes from the ring", need);
            return Spak::Data(self.odata.pull(need));
        }

        self.odata.grow(need);

        // Run the transform over the chosen input into the ring's tail.
        let start = self.odata.begin_push();
        let input: &[u8] = if direct { data } else { &self.idata };
        let mut reader = ByteReader::new(input);
        let mut osize = {
            let room = &mut self.odata.buf[start..];
            let mut writer = ByteWriter::new(room);
            self.transform.spak(&mut reader, &mut writer, sync)
        };
        if osize < 0 {
            self.beof = true;
        }
        let left = reader.left();
        let consumed = input.len() - left;
        if osize == 0 && left == 0 && self.beof {
            osize = -1;
        }
        if self.beof {
            sync = -1;
        }
        self.odata
            .end_push(start, if osize > 0 { osize as usize } else { 0 });

        // Preserve unconsumed input in the carry-over buffer.
        if left > 0 {
            if direct {
                self.idata.extend_from_slice(&data[consumed..]);
            } else {
                self.idata.drain(..consumed);
            }
        } else {
            self.idata.clear();
        }

        // Deliver: steady state holds back until `need` bytes are staged;
        // a sync drains whatever there is.
        let staged = self.odata.len();
        let out = if sync == 0 {
            if staged >= need {
                need
            } else {
                0
            }
        } else {
            staged.min(need)
        };
        trace!(
            "filter: spak consumed={} staged={} out={} eof={}",
            consumed,
            staged,
            out,
            self.beof
        );
        if out > 0 {
            Spak::Data(self.odata.pull(out))
        } else if osize < 0 || (self.beof && staged == 0) {
            Spak::Eof
        } else {
            Spak::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Doubles every byte, for driver tests.
    struct Doubler;

    impl Transform for Doubler {
        fn spak(
            &mut self,
            input: &mut ByteReader<'_>,
            output: &mut ByteWriter<'_>,
            _sync: i32,
        ) -> isize {
            let mut produced = 0;
            while input.left() > 0 && output.left() >= 2 {
                let byte = match input.take() {
                    Some(byte) => byte,
                    None => break,
                };
                output.put(byte);
                output.put(byte);
                produced += 2;
            }
            produced
        }
    }

    #[test]
    fn sync_drains_everything() {
        let mut filter = Filter::new(Box::new(Doubler));
        assert!(filter.open());
        let out = filter.spak(b"abc", 0, 1);
        assert_eq!(out.data(), b"aabbcc");
    }

    #[test]
    fn steady_state_waits_for_need() {
        let mut filter = Filter::new(Box::new(Doubler));
        assert!(filter.open());
        // 6 transformed bytes staged, but 100 were asked for.
        assert!(matches!(filter.spak(b"abc", 100, 0), Spak::None));
        // The sync call drains the carry.
        let out = filter.spak(&[], 100, 1);
        assert_eq!(out.data(), b"aabbcc");
    }

    #[test]
    fn limit_latches_eof() {
        let mut filter = Filter::new(Box::new(Doubler));
        assert!(filter.open());
        filter.set_limit(3);
        let out = filter.spak(b"abc", 0, 0);
        assert_eq!(out.data(), b"aabbcc");
        assert!(filter.beof());
        assert!(filter.spak(&[], 0, 0).is_eof());
    }

    #[test]
    fn clos_resets_state() {
        let mut filter = Filter::new(Box::new(Doubler));
        assert!(filter.open());
        let _ = filter.spak(b"abc", 100, 0);
        filter.clos();
        assert!(!filter.beof());
        assert_eq!(filter.offset(), 0);
        assert!(filter.open());
        let out = filter.spak(b"xy", 0, 1);
        assert_eq!(out.data(), b"xxyy");
    }
}
