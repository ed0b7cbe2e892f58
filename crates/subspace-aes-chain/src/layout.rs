//! Conversions between flat byte buffers and blocks/block groups.

use crate::{Block, BlockGroup, BLOCK_SIZE, GROUP_SIZE};

/// Error for byte buffers that do not match expected layout
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LayoutError {
    /// Buffer has unexpected length
    #[error("Invalid length: expected {expected} bytes, got {actual} bytes")]
    InvalidLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },
}

/// Read a single block from 16 bytes
#[inline]
pub fn block_from_bytes(bytes: &[u8]) -> Result<Block, LayoutError> {
    Block::try_from(bytes).map_err(|_error| LayoutError::InvalidLength {
        expected: BLOCK_SIZE,
        actual: bytes.len(),
    })
}

/// Read `GROUPS` consecutive block groups, 64 bytes each in lane order
pub fn groups_from_bytes<const GROUPS: usize>(
    bytes: &[u8],
) -> Result<[BlockGroup; GROUPS], LayoutError> {
    let expected = GROUPS * GROUP_SIZE * BLOCK_SIZE;
    if bytes.len() != expected {
        return Err(LayoutError::InvalidLength {
            expected,
            actual: bytes.len(),
        });
    }

    let mut groups = [[[0u8; BLOCK_SIZE]; GROUP_SIZE]; GROUPS];
    for (block, chunk) in groups
        .as_flattened_mut()
        .iter_mut()
        .zip(bytes.chunks_exact(BLOCK_SIZE))
    {
        block.copy_from_slice(chunk);
    }

    Ok(groups)
}

/// View block groups as their flat byte layout
#[inline]
pub fn groups_as_bytes<const GROUPS: usize>(groups: &[BlockGroup; GROUPS]) -> &[u8] {
    groups.as_flattened().as_flattened()
}

/// Feedback that applies the same block to every lane of a group
#[inline]
pub fn feedback_from_block(block: &Block) -> BlockGroup {
    [*block; GROUP_SIZE]
}
