//! Identity transform.
//!
//! Byte-for-byte transparent; its only purpose is to put the filter
//! driver's staging ring in front of a stream so reads and writes happen
//! in chunks of a caller-chosen minimum size. See [`Filter::cache`].
//!
//! [`Filter::cache`]: crate::filter::Filter::cache

use super::{ByteReader, ByteWriter, Transform};

pub(crate) struct CacheTransform;

impl Transform for CacheTransform {
    fn spak(
        &mut self,
        input: &mut ByteReader<'_>,
        output: &mut ByteWriter<'_>,
        sync: i32,
    ) -> isize {
        let n = output.put_slice(input.rest());
        input.skip(n);
        if n == 0 && sync < 0 && input.left() == 0 {
            return -1;
        }
        n as isize
    }
}

#[cfg(test)]
mod tests {
    use crate::filter::{Filter, Spak};

    #[test]
    fn transparent_but_buffered() {
        let mut filter = Filter::cache(8);
        assert!(filter.open());
        // Held back until the chunk size accumulates.
        assert!(matches!(filter.spak(b"abc", 8, 0), Spak::None));
        assert!(matches!(filter.spak(b"de", 8, 0), Spak::None));
        let out = filter.spak(b"fgh", 8, 0);
        assert_eq!(out.data(), b"abcdefgh");
    }

    #[test]
    fn sync_drains_the_partial_chunk() {
        let mut filter = Filter::cache(16);
        assert!(filter.open());
        assert!(matches!(filter.spak(b"xy", 16, 0), Spak::None));
        let out = filter.spak(&[], 16, 1);
        assert_eq!(out.data(), b"xy");
        assert!(filter.spak(&[], 16, -1).is_eof());
    }
}
