use std::fmt;
use crate::{storage::StorageDescriptor, MAX_BLOCK_LEN};

// A sub-range of one piece, the unit of request and transfer.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockDescriptor {

    pub piece: u32,

    // Offset in bytes of the block within its piece.
    pub offset: u32,

    pub len: u32,

}

impl BlockDescriptor {

    pub fn new(piece: u32, offset: u32, len: u32) -> Self {
        Self { piece, offset, len }
    }

    // A descriptor is acceptable iff it names an existing piece and a
    // non-empty range that stays inside it.
    pub fn is_valid(&self, view: &StorageDescriptor) -> bool {
        self.piece < view.num_pieces()
            && self.len > 0
            && self.len <= MAX_BLOCK_LEN
            && self.offset as u64 + self.len as u64 <= view.piece_length(self.piece) as u64
    }
}

impl fmt::Display for BlockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ piece: {}, offset: {}, len: {} }}", self.piece, self.offset, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;

    #[test]
    fn test_descriptor_validation() {
        // 4 pieces of 32 KiB, last one 10 KiB.
        let view = StorageDescriptor::new(0x8000, 3 * 0x8000 + 10 * 1024);

        assert!(BlockDescriptor::new(0, 0, BLOCK_SIZE).is_valid(&view));
        assert!(BlockDescriptor::new(2, BLOCK_SIZE, BLOCK_SIZE).is_valid(&view));
        assert!(BlockDescriptor::new(3, 0, 10 * 1024).is_valid(&view));

        // Piece index out of range.
        assert!(!BlockDescriptor::new(4, 0, BLOCK_SIZE).is_valid(&view));
        // Empty block.
        assert!(!BlockDescriptor::new(0, 0, 0).is_valid(&view));
        // Too large for a single request.
        assert!(!BlockDescriptor::new(0, 0, MAX_BLOCK_LEN + 1).is_valid(&view));
        // Runs past the end of the piece.
        assert!(!BlockDescriptor::new(0, BLOCK_SIZE, 0x8000).is_valid(&view));
        // Runs past the end of the short last piece.
        assert!(!BlockDescriptor::new(3, 0, BLOCK_SIZE).is_valid(&view));
    }
}
