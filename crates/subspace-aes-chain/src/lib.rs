//! Chained AES-128 core used by proof of time and proof of replication.
//!
//! Blocks are processed in groups of [`GROUP_SIZE`] lanes, with up to three groups per call going
//! through the same round keys in lockstep. Every operation works on caller-owned buffers, keeps
//! no state between calls and performs no allocation.
//!
//! Round keys are an already expanded AES-128 schedule ([`RoundKeys`]); the same schedule is used
//! for encoding, decoding and verification.

#![cfg_attr(not(feature = "std"), no_std)]

mod aes;
mod layout;

pub use crate::aes::AesImplementation;
pub use crate::layout::{
    block_from_bytes, feedback_from_block, groups_as_bytes, groups_from_bytes, LayoutError,
};
use core::fmt;
use core::str::FromStr;
use derive_more::{AsRef, Deref, From};
use tracing::debug;

/// Size of a single AES block in bytes
pub const BLOCK_SIZE: usize = 16;
/// Number of blocks (lanes) in a block group
pub const GROUP_SIZE: usize = 4;
/// Number of round keys in AES-128 schedule
pub const NUM_ROUND_KEYS: usize = 11;

/// Opaque 128-bit cipher block
pub type Block = [u8; BLOCK_SIZE];
/// Group of blocks processed together, lane order is significant
pub type BlockGroup = [Block; GROUP_SIZE];

/// Number of lanes in the widest batch (three groups)
const WIDE_LANES: usize = 3 * GROUP_SIZE;

/// Expanded AES-128 round key schedule.
///
/// Key 0 is the initial whitening key, keys 1 to 9 are used by middle rounds and key 10 by the
/// final round. Values are used as is, derivation of the schedule happens elsewhere.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, From, AsRef, Deref)]
pub struct RoundKeys([Block; NUM_ROUND_KEYS]);

impl fmt::Display for RoundKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.as_flattened() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for RoundKeys {
    type Err = hex::FromHexError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; Self::SIZE];
        hex::decode_to_slice(s, &mut bytes)?;

        Ok(Self::from_bytes(&bytes))
    }
}

impl TryFrom<&[u8]> for RoundKeys {
    type Error = LayoutError;

    #[inline]
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes = <&[u8; Self::SIZE]>::try_from(bytes).map_err(|_error| {
            LayoutError::InvalidLength {
                expected: Self::SIZE,
                actual: bytes.len(),
            }
        })?;

        Ok(Self::from_bytes(bytes))
    }
}

impl RoundKeys {
    /// Size of flat round key schedule in bytes
    pub const SIZE: usize = BLOCK_SIZE * NUM_ROUND_KEYS;

    /// Create schedule from its flat byte layout (11 consecutive blocks)
    #[inline]
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut keys = Self::default();
        for (key, chunk) in keys.0.iter_mut().zip(bytes.chunks_exact(BLOCK_SIZE)) {
            key.copy_from_slice(chunk);
        }
        keys
    }

    /// Flat byte layout of the schedule (11 consecutive blocks)
    #[inline]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes.copy_from_slice(self.0.as_flattened());
        bytes
    }

    /// Round key at `index`.
    ///
    /// Panics if `index` is not smaller than [`NUM_ROUND_KEYS`].
    #[inline]
    pub fn round_key(&self, index: usize) -> &Block {
        &self.0[index]
    }
}

/// Encodes three block groups in place.
///
/// Each lane is XORed with its feedback once, then goes through `iterations` full AES-128
/// encryptions under `keys`. With zero iterations only the feedback is applied.
pub fn encode_chain(
    data: &mut [BlockGroup; 3],
    feedbacks: &[BlockGroup; 3],
    keys: &RoundKeys,
    iterations: u32,
) {
    aes::encode::<WIDE_LANES>(
        AesImplementation::detect(),
        lanes_mut(data.as_flattened_mut()),
        lanes(feedbacks.as_flattened()),
        keys,
        iterations,
    );
}

/// Decodes three block groups in place, reversing [`encode_chain()`].
///
/// Each lane goes through `iterations` full AES-128 decryptions under `keys`, then is XORed with
/// its feedback once.
pub fn decode_chain_wide(
    data: &mut [BlockGroup; 3],
    feedbacks: &[BlockGroup; 3],
    keys: &RoundKeys,
    iterations: u32,
) {
    aes::decode::<WIDE_LANES>(
        AesImplementation::detect(),
        lanes_mut(data.as_flattened_mut()),
        lanes(feedbacks.as_flattened()),
        keys,
        iterations,
    );
}

/// Decodes a single block group in place, same per-group semantics as [`decode_chain_wide()`]
pub fn decode_chain_single(
    data: &mut BlockGroup,
    feedback: &BlockGroup,
    keys: &RoundKeys,
    iterations: u32,
) {
    aes::decode::<GROUP_SIZE>(
        AesImplementation::detect(),
        data,
        feedback,
        keys,
        iterations,
    );
}

/// Verifies that candidate blocks form a chain starting after `expected_first`.
///
/// Every candidate block is decrypted `iterations` times (no feedback is applied) and must be
/// equal to the raw candidate block right before it in the batch, the first block must decrypt to
/// `expected_first`. All lanes are decrypted and compared before the result is produced.
///
/// Links are checked block by block across group boundaries, so the candidate must be a chain
/// where every block is derived from the previous block, not from the previous group.
///
/// Returns [`u8::MAX`] if every block matches and `0` otherwise. Batches of 1, 2 or 3 groups are
/// supported, anything else fails to compile.
pub fn verify_chain<const GROUPS: usize>(
    candidate: &[BlockGroup; GROUPS],
    expected_first: &Block,
    keys: &RoundKeys,
    iterations: u32,
) -> u8 {
    const {
        assert!(
            GROUPS >= 1 && GROUPS <= 3,
            "Verification supports batches of 1, 2 or 3 block groups"
        );
    }

    let implementation = AesImplementation::detect();
    let candidate = candidate.as_flattened();

    let result = match GROUPS {
        1 => aes::verify::<GROUP_SIZE>(
            implementation,
            lanes(candidate),
            expected_first,
            keys,
            iterations,
        ),
        2 => aes::verify::<{ 2 * GROUP_SIZE }>(
            implementation,
            lanes(candidate),
            expected_first,
            keys,
            iterations,
        ),
        _ => aes::verify::<WIDE_LANES>(
            implementation,
            lanes(candidate),
            expected_first,
            keys,
            iterations,
        ),
    };

    if result == 0 {
        debug!(groups = GROUPS, iterations, "Chain verification rejected candidate batch");
    }

    result
}

#[inline(always)]
fn lanes<const LANES: usize>(blocks: &[Block]) -> &[Block; LANES] {
    blocks
        .try_into()
        .expect("Number of blocks matches batch width; qed")
}

#[inline(always)]
fn lanes_mut<const LANES: usize>(blocks: &mut [Block]) -> &mut [Block; LANES] {
    blocks
        .try_into()
        .expect("Number of blocks matches batch width; qed")
}
