use std::fmt::{Debug, Formatter};

use crate::name_of;

/// Usable bytes per chunk.
pub(super) const CHUNK_DATA: usize = 116;

/// Reference to a block of bytes in an [`Arena`]. Only valid for the arena
/// that produced it and until `release_all`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) struct Slot {
    chunk: u16,
    off: u8,
    len: u8,
}

/// Chunked bump allocator for variable-length attribute data. Chunks are
/// allocated on demand up to a fixed ceiling and freed all at once when the
/// discovery data is released.
pub(super) struct Arena {
    chunks: Vec<Box<[u8; CHUNK_DATA]>>,
    /// Bytes used in the last chunk.
    used: usize,
    max_chunks: usize,
}

impl Arena {
    #[must_use]
    pub fn new(max_chunks: usize) -> Self {
        assert!(max_chunks <= usize::from(u16::MAX));
        Self {
            chunks: Vec::new(),
            used: 0,
            max_chunks,
        }
    }

    /// Allocates `len` zeroed bytes aligned to a 4-byte boundary. Fails when
    /// `len` exceeds the chunk capacity or the chunk ceiling is reached.
    pub fn alloc(&mut self, len: usize) -> Option<Slot> {
        let rounded = (len + 3) & !3;
        if !(1..=CHUNK_DATA).contains(&rounded) {
            return None;
        }
        if self.chunks.is_empty() || self.used + rounded > CHUNK_DATA {
            if self.chunks.len() >= self.max_chunks {
                return None;
            }
            self.chunks.push(Box::new([0; CHUNK_DATA]));
            self.used = 0;
        }
        #[allow(clippy::cast_possible_truncation)]
        let s = Slot {
            chunk: (self.chunks.len() - 1) as u16,
            off: self.used as u8,
            len: len as u8,
        };
        self.used += rounded;
        Some(s)
    }

    /// Returns the bytes of `s`.
    #[must_use]
    pub fn get(&self, s: Slot) -> &[u8] {
        let off = usize::from(s.off);
        &self.chunks[usize::from(s.chunk)][off..off + usize::from(s.len)]
    }

    /// Returns the bytes of `s` for writing.
    pub fn get_mut(&mut self, s: Slot) -> &mut [u8] {
        let off = usize::from(s.off);
        &mut self.chunks[usize::from(s.chunk)][off..off + usize::from(s.len)]
    }

    /// Frees every chunk. Outstanding slots become invalid.
    pub fn release_all(&mut self) {
        self.chunks.clear();
        self.used = 0;
    }
}

impl Debug for Arena {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(name_of!(Arena))
            .field("chunks", &self.chunks.len())
            .field("used", &self.used)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_and_zeroed() {
        let mut a = Arena::new(4);
        let x = a.alloc(3).unwrap();
        let y = a.alloc(5).unwrap();
        assert_eq!(usize::from(x.off) % 4, 0);
        assert_eq!(usize::from(y.off) % 4, 0);
        assert_eq!(a.get(x), &[0; 3]);
        assert_eq!(a.get(y), &[0; 5]);
    }

    #[test]
    fn no_aliasing() {
        let mut a = Arena::new(4);
        let x = a.alloc(4).unwrap();
        let y = a.alloc(4).unwrap();
        a.get_mut(x).copy_from_slice(&[1; 4]);
        a.get_mut(y).copy_from_slice(&[2; 4]);
        assert_eq!(a.get(x), &[1; 4]);
        assert_eq!(a.get(y), &[2; 4]);
    }

    #[test]
    fn request_ceiling() {
        let mut a = Arena::new(4);
        assert_eq!(a.alloc(CHUNK_DATA + 1), None);
        assert_eq!(a.alloc(0), None);
        assert!(a.alloc(CHUNK_DATA).is_some());
    }

    #[test]
    fn chunk_ceiling() {
        let mut a = Arena::new(2);
        assert!(a.alloc(CHUNK_DATA).is_some());
        assert!(a.alloc(CHUNK_DATA).is_some());
        assert_eq!(a.alloc(1), None);
        a.release_all();
        a.release_all(); // Idempotent
        assert!(a.alloc(1).is_some());
    }

    #[test]
    fn chunk_spill() {
        let mut a = Arena::new(2);
        let _ = a.alloc(CHUNK_DATA - 4).unwrap();
        // No room left in the first chunk
        let y = a.alloc(8).unwrap();
        assert_eq!(usize::from(y.chunk), 1);
        assert_eq!(usize::from(y.off), 0);
    }
}
