//! Part assembler
//!
//! Translates an arbitrarily-chunked incoming byte stream into storage parts
//! of a fixed size. Storage backends reject parts below a minimum (5MB on S3)
//! except the last, so undersized data is buffered as a pending tail until
//! enough bytes arrive or the upload completes.

use bytes::{Bytes, BytesMut};

/// Minimum part size accepted by S3 for all but the final part
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Maximum parts allowed per multipart upload (S3 limit)
pub const MAX_PARTS: u32 = 10000;

/// A part ready to be sent to the storage backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPayload {
    pub part_number: u32,
    pub bytes: Bytes,
}

/// Result of feeding bytes through the assembler
#[derive(Debug)]
pub struct FeedOutcome {
    /// Full-size parts sliced off the front, in ascending part-number order
    pub parts: Vec<PartPayload>,
    /// Remainder below the part size, to be carried into the next append
    pub pending_tail: Bytes,
}

/// Slices byte streams into fixed-size parts
#[derive(Debug, Clone, Copy)]
pub struct PartAssembler {
    part_size: usize,
}

impl PartAssembler {
    /// Create an assembler emitting parts of exactly `part_size` bytes.
    ///
    /// The caller is responsible for respecting the backend minimum
    /// ([`MIN_PART_SIZE`] for S3); configuration validation floors it there.
    pub fn new(part_size: usize) -> Self {
        debug_assert!(part_size > 0);
        Self { part_size }
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Concatenate the session's pending tail with `incoming` and slice off
    /// as many exact-size parts as the combined buffer yields. Part numbers
    /// start at `first_part_number` and increase by one per emitted part.
    pub fn feed(&self, pending_tail: Bytes, incoming: Bytes, first_part_number: u32) -> FeedOutcome {
        // Short appends that stay below the threshold never need a copy.
        if pending_tail.len() + incoming.len() < self.part_size {
            let tail = if pending_tail.is_empty() {
                incoming
            } else if incoming.is_empty() {
                pending_tail
            } else {
                let mut buf = BytesMut::with_capacity(pending_tail.len() + incoming.len());
                buf.extend_from_slice(&pending_tail);
                buf.extend_from_slice(&incoming);
                buf.freeze()
            };
            return FeedOutcome {
                parts: Vec::new(),
                pending_tail: tail,
            };
        }

        let mut combined = if pending_tail.is_empty() {
            incoming
        } else {
            let mut buf = BytesMut::with_capacity(pending_tail.len() + incoming.len());
            buf.extend_from_slice(&pending_tail);
            buf.extend_from_slice(&incoming);
            buf.freeze()
        };

        let mut parts = Vec::new();
        let mut part_number = first_part_number;
        while combined.len() >= self.part_size {
            parts.push(PartPayload {
                part_number,
                bytes: combined.split_to(self.part_size),
            });
            part_number += 1;
        }

        FeedOutcome {
            parts,
            pending_tail: combined,
        }
    }

    /// Emit the remaining tail as the final part regardless of size.
    ///
    /// Returns `None` when the tail is empty: an upload that landed exactly
    /// on a part boundary completes without a trailing empty part.
    pub fn flush_final(&self, pending_tail: Bytes, part_number: u32) -> Option<PartPayload> {
        if pending_tail.is_empty() {
            return None;
        }
        Some(PartPayload {
            part_number,
            bytes: pending_tail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler(size: usize) -> PartAssembler {
        PartAssembler::new(size)
    }

    #[test]
    fn test_small_chunk_buffers_as_tail() {
        let out = assembler(8).feed(Bytes::new(), Bytes::from_static(b"abc"), 1);
        assert!(out.parts.is_empty());
        assert_eq!(out.pending_tail, Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_tail_absorbed_into_next_feed() {
        let a = assembler(8);
        let first = a.feed(Bytes::new(), Bytes::from_static(b"abcde"), 1);
        let second = a.feed(first.pending_tail, Bytes::from_static(b"fghij"), 1);
        assert_eq!(second.parts.len(), 1);
        assert_eq!(second.parts[0].part_number, 1);
        assert_eq!(second.parts[0].bytes, Bytes::from_static(b"abcdefgh"));
        assert_eq!(second.pending_tail, Bytes::from_static(b"ij"));
    }

    #[test]
    fn test_multiple_parts_from_one_feed() {
        let out = assembler(4).feed(Bytes::new(), Bytes::from(vec![b'x'; 14]), 3);
        assert_eq!(out.parts.len(), 3);
        assert_eq!(
            out.parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert!(out.parts.iter().all(|p| p.bytes.len() == 4));
        assert_eq!(out.pending_tail.len(), 2);
    }

    #[test]
    fn test_exact_boundary_leaves_empty_tail() {
        let out = assembler(4).feed(Bytes::new(), Bytes::from(vec![b'x'; 8]), 1);
        assert_eq!(out.parts.len(), 2);
        assert!(out.pending_tail.is_empty());
    }

    #[test]
    fn test_empty_feed_keeps_tail() {
        let out = assembler(8).feed(Bytes::from_static(b"abc"), Bytes::new(), 1);
        assert!(out.parts.is_empty());
        assert_eq!(out.pending_tail, Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_flush_final_emits_undersized_part() {
        let part = assembler(8)
            .flush_final(Bytes::from_static(b"xy"), 7)
            .unwrap();
        assert_eq!(part.part_number, 7);
        assert_eq!(part.bytes, Bytes::from_static(b"xy"));
    }

    #[test]
    fn test_flush_final_empty_tail_is_noop() {
        assert!(assembler(8).flush_final(Bytes::new(), 2).is_none());
    }

    // Conservation law across arbitrary chunking: every part is exactly M
    // bytes and the leftover tail is in [0, M).
    #[test]
    fn test_arbitrary_chunking_conserves_bytes() {
        let m = 16;
        let a = assembler(m);
        let chunks: Vec<usize> = vec![1, 3, 40, 0, 7, 16, 2, 31, 5];
        let total: usize = chunks.iter().sum();

        let mut tail = Bytes::new();
        let mut next_part = 1u32;
        let mut emitted = 0usize;
        for len in chunks {
            let out = a.feed(tail, Bytes::from(vec![b'z'; len]), next_part);
            for part in &out.parts {
                assert_eq!(part.bytes.len(), m);
                assert_eq!(part.part_number, next_part);
                next_part += 1;
                emitted += m;
            }
            tail = out.pending_tail;
            assert!(tail.len() < m);
        }
        assert_eq!(emitted + tail.len(), total);
    }
}
