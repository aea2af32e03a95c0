use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};


/// An append-only buffer of incoming byte chunks that supports reading exact lengths from the
///  front. Chunks are kept as they arrive, so reads that are satisfied by the first chunk do not
///  copy; only reads that span several chunks assemble a new buffer.
#[derive(Default)]
pub struct ChunkStream {
    chunks: VecDeque<Bytes>,
    total_len: usize,
}
impl ChunkStream {
    pub fn new() -> ChunkStream {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    pub fn accept_chunk(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total_len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Consumes exactly `num_bytes` from the front.
    ///
    /// NB: Reading more than is buffered is a bug in the caller and panics
    pub fn read(&mut self, num_bytes: usize) -> Bytes {
        self._read(num_bytes, true)
    }

    /// Returns exactly `num_bytes` from the front without consuming them.
    ///
    /// NB: Peeking at more than is buffered is a bug in the caller and panics
    pub fn peek(&mut self, num_bytes: usize) -> Bytes {
        self._read(num_bytes, false)
    }

    fn _read(&mut self, num_bytes: usize, advance: bool) -> Bytes {
        if num_bytes == 0 {
            return Bytes::new();
        }
        assert!(num_bytes <= self.total_len, "cannot read {} bytes, only {} buffered", num_bytes, self.total_len);

        // fast path: the first chunk satisfies the request on its own
        let first = &mut self.chunks[0];
        if first.len() >= num_bytes {
            let result = if advance {
                first.split_to(num_bytes)
            }
            else {
                first.slice(..num_bytes)
            };
            if advance {
                self.total_len -= num_bytes;
                if self.chunks[0].is_empty() {
                    self.chunks.pop_front();
                }
            }
            return result;
        }

        let mut result = BytesMut::with_capacity(num_bytes);
        let mut remaining = num_bytes;
        let mut chunk_index = 0;
        while remaining > 0 {
            let chunk = &mut self.chunks[chunk_index];
            if chunk.len() > remaining {
                result.extend_from_slice(&chunk[..remaining]);
                if advance {
                    let _ = chunk.split_to(remaining);
                }
                remaining = 0;
            }
            else {
                result.extend_from_slice(chunk);
                remaining -= chunk.len();
                if advance {
                    self.chunks.pop_front();
                }
                else {
                    chunk_index += 1;
                }
            }
        }

        if advance {
            self.total_len -= num_bytes;
        }
        result.freeze()
    }
}
