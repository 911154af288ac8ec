//! Bump allocation for entry bytes.

#![expect(unsafe_code, reason = "hands out raw pointers into chunk-owned bytes")]

/// Allocations at most this large share pooled chunks; larger ones get a
/// dedicated chunk so the tail of a pooled chunk is not wasted.
const CHUNK_SIZE: usize = 4096;

/// A bump arena over 4 KiB chunks.
///
/// Chunks are only ever added, never freed or reallocated, so a raw pointer
/// into a chunk stays valid until the arena is dropped. (A `Vec<Box<[u8]>>`
/// may move the *boxes* when it grows, but never the chunk bytes they own.)
#[derive(Debug, Default)]
pub struct Arena {
    chunks:          Vec<Box<[u8]>>,
    /// Whether the final chunk is a pooled chunk with usable tail space
    /// (rather than a dedicated oversized chunk).
    pooled_tail:     bool,
    /// Bytes already handed out from the final pooled chunk.
    last_chunk_used: usize,
    allocated:       usize,
}

impl Arena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes reserved by the arena, a close upper bound on the bytes
    /// handed out. Used for memtable flush thresholds.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    /// Hand out a zeroed, exclusively owned byte slice of length `len`.
    ///
    /// The returned pointer stays valid (and the bytes stay untouched by the
    /// arena) until the arena is dropped.
    pub fn allocate(&mut self, len: usize) -> *mut u8 {
        if len > CHUNK_SIZE / 4 {
            // A dedicated chunk; do not disturb the current pooled chunk.
            let mut chunk = vec![0_u8; len].into_boxed_slice();
            let entry = chunk.as_mut_ptr();
            self.allocated += len;
            self.chunks.push(chunk);
            self.pooled_tail = false;
            return entry;
        }

        let remaining = self
            .chunks
            .last()
            .map(|chunk| chunk.len() - self.last_chunk_used)
            .filter(|_| self.pooled_tail)
            .unwrap_or(0);

        if remaining < len {
            self.chunks.push(vec![0_u8; CHUNK_SIZE].into_boxed_slice());
            self.last_chunk_used = 0;
            self.pooled_tail = true;
            self.allocated += CHUNK_SIZE;
        }

        let chunk = self
            .chunks
            .last_mut()
            .expect("a chunk was just ensured to exist");
        let entry = unsafe { chunk.as_mut_ptr().add(self.last_chunk_used) };
        self.last_chunk_used += len;
        entry
    }
}
