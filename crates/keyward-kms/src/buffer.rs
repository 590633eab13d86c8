//! Chunked accumulator for assembling KMS responses.
//!
//! A KMS response arrives across an arbitrary number of socket reads, but the
//! engine consumes it in exact prefix lengths (`bytes_needed`). This queue keeps
//! the received chunks as-is and only copies when a read spans a chunk
//! boundary.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

/// An append-only, consumable queue of received byte chunks.
///
/// # Invariants
///
/// - `len()` always equals the sum of the queued chunk lengths.
/// - `read(n)` and `peek(n)` return exactly `n` bytes or nothing at all; there
///   are no partial reads.
#[derive(Debug, Default)]
pub struct ByteAccumulator {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ByteAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk in O(1). Empty chunks are ignored.
    pub fn append(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Returns the total number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the first `size` bytes without consuming them.
    ///
    /// Returns an empty `Bytes` if fewer than `size` bytes are buffered. A prefix
    /// that fits inside the first chunk is returned without copying.
    pub fn peek(&self, size: usize) -> Bytes {
        if size == 0 || size > self.len {
            return Bytes::new();
        }

        match self.chunks.front() {
            Some(first) if size <= first.len() => first.slice(..size),
            _ => self.concat(size),
        }
    }

    /// Removes and returns the first `size` bytes.
    ///
    /// Returns an empty `Bytes` and leaves the accumulator untouched if fewer
    /// than `size` bytes are buffered; the caller must append more first.
    pub fn read(&mut self, size: usize) -> Bytes {
        let out = self.peek(size);
        if !out.is_empty() {
            self.discard(size);
        }
        out
    }

    /// Copies the first `size` bytes (spanning chunks) into a fresh buffer.
    fn concat(&self, size: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(size);
        let mut remaining = size;
        for chunk in &self.chunks {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
            remaining -= take;
        }
        out.freeze()
    }

    /// Drops `size` bytes from the front, trimming the last touched chunk.
    fn discard(&mut self, size: usize) {
        debug_assert!(size <= self.len);
        let mut remaining = size;
        while remaining > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.chunks.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
        self.len -= size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn accumulator_of(chunks: &[&[u8]]) -> ByteAccumulator {
        let mut acc = ByteAccumulator::new();
        for chunk in chunks {
            acc.append(chunk.to_vec());
        }
        acc
    }

    #[test]
    fn new_accumulator_is_empty() {
        let acc = ByteAccumulator::new();
        assert_eq!(acc.len(), 0);
        assert!(acc.is_empty());
    }

    #[test]
    fn append_tracks_length() {
        let acc = accumulator_of(&[&[0, 1], &[2, 3, 4], &[]]);
        assert_eq!(acc.len(), 5);
    }

    #[test]
    fn read_across_chunk_boundaries() {
        let mut acc = accumulator_of(&[&[0, 1], &[2, 3], &[4, 5]]);

        let data = acc.read(5);
        assert_eq!(&data[..], &[0, 1, 2, 3, 4]);
        assert_eq!(acc.len(), 1);

        let data = acc.read(1);
        assert_eq!(&data[..], &[5]);
        assert!(acc.is_empty());
    }

    #[test]
    fn read_more_than_buffered_returns_empty_and_keeps_state() {
        let mut acc = accumulator_of(&[&[1, 2, 3]]);

        let data = acc.read(4);
        assert!(data.is_empty());
        assert_eq!(acc.len(), 3);
        assert_eq!(&acc.read(3)[..], &[1, 2, 3]);
    }

    #[test]
    fn read_zero_returns_empty() {
        let mut acc = accumulator_of(&[&[1, 2, 3]]);
        assert!(acc.read(0).is_empty());
        assert_eq!(acc.len(), 3);
    }

    #[test]
    fn read_whole_buffer_resets() {
        let mut acc = accumulator_of(&[&[9], &[8, 7], &[6]]);
        assert_eq!(&acc.read(4)[..], &[9, 8, 7, 6]);
        assert!(acc.is_empty());
        assert!(acc.read(1).is_empty());
    }

    #[test]
    fn read_within_first_chunk_trims_it() {
        let mut acc = accumulator_of(&[&[1, 2, 3, 4], &[5]]);
        assert_eq!(&acc.read(2)[..], &[1, 2]);
        assert_eq!(acc.len(), 3);
        assert_eq!(&acc.read(3)[..], &[3, 4, 5]);
    }

    #[test]
    fn peek_does_not_consume() {
        let acc = accumulator_of(&[&[1, 2], &[3]]);
        assert_eq!(&acc.peek(3)[..], &[1, 2, 3]);
        assert_eq!(&acc.peek(1)[..], &[1]);
        assert_eq!(acc.len(), 3);
    }

    proptest! {
        #[test]
        fn prop_read_total_returns_concatenation(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 0..16),
        ) {
            let mut acc = ByteAccumulator::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                expected.extend_from_slice(chunk);
                acc.append(chunk.clone());
            }

            prop_assert_eq!(acc.len(), expected.len());
            let total = acc.len();
            prop_assert_eq!(&acc.read(total)[..], &expected[..]);
            prop_assert_eq!(acc.len(), 0);
        }

        #[test]
        fn prop_peek_never_mutates_length(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..16), 1..8),
            size in 0usize..128,
        ) {
            let mut acc = ByteAccumulator::new();
            for chunk in &chunks {
                acc.append(chunk.clone());
            }
            let before = acc.len();
            let _ = acc.peek(size);
            prop_assert_eq!(acc.len(), before);
        }

        #[test]
        fn prop_split_reads_preserve_order(
            data in prop::collection::vec(any::<u8>(), 1..256),
            chunk_size in 1usize..17,
            read_size in 1usize..33,
        ) {
            let mut acc = ByteAccumulator::new();
            for chunk in data.chunks(chunk_size) {
                acc.append(chunk.to_vec());
            }

            let mut out = Vec::new();
            while acc.len() >= read_size {
                out.extend_from_slice(&acc.read(read_size));
            }
            let rest = acc.len();
            out.extend_from_slice(&acc.read(rest));
            prop_assert_eq!(out, data);
        }
    }
}
