//! AES related functionality.
//!
//! Kernels are generic over number of lanes, every batch width is the same code instantiated for
//! 4, 8 or 12 blocks. Accelerated kernels live in architecture-specific modules, the generic one
//! processes one block at a time using round-level primitives of the `aes` crate.

#[cfg(all(feature = "std", target_arch = "aarch64"))]
mod aarch64;
#[cfg(all(feature = "std", target_arch = "x86_64"))]
mod x86_64;

use crate::{Block, RoundKeys, NUM_ROUND_KEYS};
use aes::hazmat::{cipher_round, equiv_inv_cipher_round, inv_mix_columns, mix_columns};
use core::{array, fmt};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};
use tracing::trace;

/// AES implementation used by chain operations
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AesImplementation {
    /// AES-NI instruction set (x86-64)
    AesNi,
    /// ARMv8 cryptography extension (aarch64)
    ArmAes,
    /// Portable implementation, available everywhere
    Generic,
}

impl fmt::Display for AesImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AesNi => f.write_str("AES-NI"),
            Self::ArmAes => f.write_str("ARMv8 AES"),
            Self::Generic => f.write_str("generic"),
        }
    }
}

impl AesImplementation {
    /// Fastest implementation supported by this machine
    #[inline]
    pub fn detect() -> Self {
        Self::available().next().unwrap_or(Self::Generic)
    }

    /// All implementations supported by this machine, fastest first.
    ///
    /// Generic implementation is always included. Without `std` feature hardware support can't be
    /// detected and only generic implementation is returned.
    pub fn available() -> impl Iterator<Item = Self> {
        [Self::AesNi, Self::ArmAes, Self::Generic]
            .into_iter()
            .filter(|implementation| implementation.is_supported())
    }

    /// Whether this implementation can be used on this machine
    #[inline]
    pub fn is_supported(self) -> bool {
        match self {
            #[cfg(all(feature = "std", target_arch = "x86_64"))]
            Self::AesNi => std::is_x86_feature_detected!("aes"),
            #[cfg(all(feature = "std", target_arch = "aarch64"))]
            Self::ArmAes => std::arch::is_aarch64_feature_detected!("aes"),
            Self::Generic => true,
            _ => false,
        }
    }
}

/// Encode lanes in place: feedback first, then `iterations` encryptions
pub(crate) fn encode<const LANES: usize>(
    implementation: AesImplementation,
    blocks: &mut [Block; LANES],
    feedbacks: &[Block; LANES],
    keys: &RoundKeys,
    iterations: u32,
) {
    trace!(%implementation, lanes = LANES, iterations, "Encoding chain");

    match implementation {
        #[cfg(all(feature = "std", target_arch = "x86_64"))]
        AesImplementation::AesNi if implementation.is_supported() => {
            // SAFETY: Checked above that AES-NI is supported by the CPU
            unsafe { x86_64::encode(blocks, feedbacks, keys, iterations) }
        }
        #[cfg(all(feature = "std", target_arch = "aarch64"))]
        AesImplementation::ArmAes if implementation.is_supported() => {
            // SAFETY: Checked above that AES extension is supported by the CPU
            unsafe { aarch64::encode(blocks, feedbacks, keys, iterations) }
        }
        _ => encode_generic(blocks, feedbacks, keys, iterations),
    }
}

/// Decode lanes in place: `iterations` decryptions, then feedback
pub(crate) fn decode<const LANES: usize>(
    implementation: AesImplementation,
    blocks: &mut [Block; LANES],
    feedbacks: &[Block; LANES],
    keys: &RoundKeys,
    iterations: u32,
) {
    trace!(%implementation, lanes = LANES, iterations, "Decoding chain");

    match implementation {
        #[cfg(all(feature = "std", target_arch = "x86_64"))]
        AesImplementation::AesNi if implementation.is_supported() => {
            // SAFETY: Checked above that AES-NI is supported by the CPU
            unsafe { x86_64::decode(blocks, feedbacks, keys, iterations) }
        }
        #[cfg(all(feature = "std", target_arch = "aarch64"))]
        AesImplementation::ArmAes if implementation.is_supported() => {
            // SAFETY: Checked above that AES extension is supported by the CPU
            unsafe { aarch64::decode(blocks, feedbacks, keys, iterations) }
        }
        _ => decode_generic(blocks, feedbacks, keys, iterations),
    }
}

/// Verify that every candidate lane decrypts to the lane before it, the first one to
/// `expected_first`. Returns `u8::MAX` on success and `0` otherwise.
pub(crate) fn verify<const LANES: usize>(
    implementation: AesImplementation,
    candidate: &[Block; LANES],
    expected_first: &Block,
    keys: &RoundKeys,
    iterations: u32,
) -> u8 {
    trace!(%implementation, lanes = LANES, iterations, "Verifying chain");

    let expected = array::from_fn::<_, LANES, _>(|lane| {
        if lane == 0 {
            *expected_first
        } else {
            candidate[lane - 1]
        }
    });

    match implementation {
        #[cfg(all(feature = "std", target_arch = "x86_64"))]
        AesImplementation::AesNi if implementation.is_supported() => {
            // SAFETY: Checked above that AES-NI is supported by the CPU
            unsafe { x86_64::verify(candidate, &expected, keys, iterations) }
        }
        #[cfg(all(feature = "std", target_arch = "aarch64"))]
        AesImplementation::ArmAes if implementation.is_supported() => {
            // SAFETY: Checked above that AES extension is supported by the CPU
            unsafe { aarch64::verify(candidate, &expected, keys, iterations) }
        }
        _ => verify_generic(candidate, &expected, keys, iterations),
    }
}

/// Turns comparison result into all-or-nothing byte without branching
#[inline(always)]
fn result_mask(all_equal: Choice) -> u8 {
    u8::conditional_select(&0, &u8::MAX, all_equal)
}

fn encode_generic<const LANES: usize>(
    blocks: &mut [Block; LANES],
    feedbacks: &[Block; LANES],
    keys: &RoundKeys,
    iterations: u32,
) {
    let keys = broadcast_keys_generic(keys);

    for (block, feedback) in blocks.iter_mut().zip(feedbacks) {
        let mut state = aes::Block::from(*block);
        xor_in_place(&mut state, feedback);
        for _ in 0..iterations {
            encrypt_generic(&mut state, &keys);
        }
        block.copy_from_slice(&state);
    }
}

fn decode_generic<const LANES: usize>(
    blocks: &mut [Block; LANES],
    feedbacks: &[Block; LANES],
    keys: &RoundKeys,
    iterations: u32,
) {
    let inv_keys = broadcast_inverse_keys_generic(keys);

    for (block, feedback) in blocks.iter_mut().zip(feedbacks) {
        let mut state = aes::Block::from(*block);
        for _ in 0..iterations {
            decrypt_generic(&mut state, &inv_keys);
        }
        xor_in_place(&mut state, feedback);
        block.copy_from_slice(&state);
    }
}

fn verify_generic<const LANES: usize>(
    candidate: &[Block; LANES],
    expected: &[Block; LANES],
    keys: &RoundKeys,
    iterations: u32,
) -> u8 {
    let inv_keys = broadcast_inverse_keys_generic(keys);

    let mut all_equal = Choice::from(1);
    for (block, expected) in candidate.iter().zip(expected) {
        let mut state = aes::Block::from(*block);
        for _ in 0..iterations {
            decrypt_generic(&mut state, &inv_keys);
        }
        all_equal &= state.as_slice().ct_eq(expected);
    }

    result_mask(all_equal)
}

fn broadcast_keys_generic(keys: &RoundKeys) -> [aes::Block; NUM_ROUND_KEYS] {
    array::from_fn(|index| aes::Block::from(*keys.round_key(index)))
}

/// Same as [`broadcast_keys_generic()`], but middle keys are prepared for equivalent inverse
/// cipher rounds
fn broadcast_inverse_keys_generic(keys: &RoundKeys) -> [aes::Block; NUM_ROUND_KEYS] {
    let mut inv_keys = broadcast_keys_generic(keys);
    for key in &mut inv_keys[1..NUM_ROUND_KEYS - 1] {
        inv_mix_columns(key);
    }
    inv_keys
}

#[inline]
fn encrypt_generic(state: &mut aes::Block, keys: &[aes::Block; NUM_ROUND_KEYS]) {
    xor_in_place(state, &keys[0]);
    for key in &keys[1..NUM_ROUND_KEYS - 1] {
        cipher_round(state, key);
    }
    // Final round has no MixColumns, hence it is reverted after round with zero key
    cipher_round(state, &aes::Block::default());
    inv_mix_columns(state);
    xor_in_place(state, &keys[NUM_ROUND_KEYS - 1]);
}

#[inline]
fn decrypt_generic(state: &mut aes::Block, inv_keys: &[aes::Block; NUM_ROUND_KEYS]) {
    xor_in_place(state, &inv_keys[NUM_ROUND_KEYS - 1]);
    for key in inv_keys[1..NUM_ROUND_KEYS - 1].iter().rev() {
        equiv_inv_cipher_round(state, key);
    }
    // Final round has no InvMixColumns, hence it is reverted after round with zero key
    equiv_inv_cipher_round(state, &aes::Block::default());
    mix_columns(state);
    xor_in_place(state, &inv_keys[0]);
}

#[inline(always)]
fn xor_in_place(state: &mut [u8], other: &[u8]) {
    for (byte, other_byte) in state.iter_mut().zip(other) {
        *byte ^= other_byte;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
    use aes::Aes128;
    use rand::{thread_rng, Rng};

    // FIPS-197, Appendix A.1
    const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];
    const ROUND_KEYS: [[u8; 16]; NUM_ROUND_KEYS] = [
        [
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
            0x4f, 0x3c,
        ],
        [
            0xa0, 0xfa, 0xfe, 0x17, 0x88, 0x54, 0x2c, 0xb1, 0x23, 0xa3, 0x39, 0x39, 0x2a, 0x6c,
            0x76, 0x05,
        ],
        [
            0xf2, 0xc2, 0x95, 0xf2, 0x7a, 0x96, 0xb9, 0x43, 0x59, 0x35, 0x80, 0x7a, 0x73, 0x59,
            0xf6, 0x7f,
        ],
        [
            0x3d, 0x80, 0x47, 0x7d, 0x47, 0x16, 0xfe, 0x3e, 0x1e, 0x23, 0x7e, 0x44, 0x6d, 0x7a,
            0x88, 0x3b,
        ],
        [
            0xef, 0x44, 0xa5, 0x41, 0xa8, 0x52, 0x5b, 0x7f, 0xb6, 0x71, 0x25, 0x3b, 0xdb, 0x0b,
            0xad, 0x00,
        ],
        [
            0xd4, 0xd1, 0xc6, 0xf8, 0x7c, 0x83, 0x9d, 0x87, 0xca, 0xf2, 0xb8, 0xbc, 0x11, 0xf9,
            0x15, 0xbc,
        ],
        [
            0x6d, 0x88, 0xa3, 0x7a, 0x11, 0x0b, 0x3e, 0xfd, 0xdb, 0xf9, 0x86, 0x41, 0xca, 0x00,
            0x93, 0xfd,
        ],
        [
            0x4e, 0x54, 0xf7, 0x0e, 0x5f, 0x5f, 0xc9, 0xf3, 0x84, 0xa6, 0x4f, 0xb2, 0x4e, 0xa6,
            0xdc, 0x4f,
        ],
        [
            0xea, 0xd2, 0x73, 0x21, 0xb5, 0x8d, 0xba, 0xd2, 0x31, 0x2b, 0xf5, 0x60, 0x7f, 0x8d,
            0x29, 0x2f,
        ],
        [
            0xac, 0x77, 0x66, 0xf3, 0x19, 0xfa, 0xdc, 0x21, 0x28, 0xd1, 0x29, 0x41, 0x57, 0x5c,
            0x00, 0x6e,
        ],
        [
            0xd0, 0x14, 0xf9, 0xa8, 0xc9, 0xee, 0x25, 0x89, 0xe1, 0x3f, 0x0c, 0xc8, 0xb6, 0x63,
            0x0c, 0xa6,
        ],
    ];

    #[test]
    fn generic_rounds_match_reference_cipher() {
        let cipher = Aes128::new(&KEY.into());
        let round_keys = RoundKeys::from(ROUND_KEYS);
        let keys = broadcast_keys_generic(&round_keys);
        let inv_keys = broadcast_inverse_keys_generic(&round_keys);

        for _ in 0..16 {
            let mut block = [0u8; 16];
            thread_rng().fill(&mut block);

            let mut expected = aes::Block::from(block);
            cipher.encrypt_block(&mut expected);
            let mut state = aes::Block::from(block);
            encrypt_generic(&mut state, &keys);
            assert_eq!(state, expected);

            cipher.decrypt_block(&mut expected);
            decrypt_generic(&mut state, &inv_keys);
            assert_eq!(state, expected);
            assert_eq!(state.as_slice(), block.as_slice());
        }
    }

    fn random_blocks<const LANES: usize>() -> [Block; LANES] {
        let mut blocks = [[0u8; 16]; LANES];
        blocks.iter_mut().for_each(|block| thread_rng().fill(block));
        blocks
    }

    fn check_implementations_agree<const LANES: usize>(keys: &RoundKeys, iterations: u32) {
        let blocks = random_blocks::<LANES>();
        let feedbacks = random_blocks::<LANES>();

        let mut generic_encoded = blocks;
        encode_generic(&mut generic_encoded, &feedbacks, keys, iterations);
        let mut generic_decoded = blocks;
        decode_generic(&mut generic_decoded, &feedbacks, keys, iterations);

        for implementation in AesImplementation::available() {
            let mut encoded = blocks;
            encode(implementation, &mut encoded, &feedbacks, keys, iterations);
            assert_eq!(encoded, generic_encoded, "{implementation} x{LANES} {iterations}");

            let mut decoded = blocks;
            decode(implementation, &mut decoded, &feedbacks, keys, iterations);
            assert_eq!(decoded, generic_decoded, "{implementation} x{LANES} {iterations}");

            decode(implementation, &mut encoded, &feedbacks, keys, iterations);
            assert_eq!(encoded, blocks, "{implementation} x{LANES} {iterations}");
        }
    }

    #[test]
    fn implementations_agree() {
        let keys = RoundKeys::from(random_blocks::<NUM_ROUND_KEYS>());

        for iterations in [0, 1, 2, 13] {
            check_implementations_agree::<4>(&keys, iterations);
            check_implementations_agree::<8>(&keys, iterations);
            check_implementations_agree::<12>(&keys, iterations);
        }
    }

    fn check_implementations_agree_on_verification<const LANES: usize>(
        keys: &RoundKeys,
        iterations: u32,
    ) {
        let mut anchor = [0u8; 16];
        thread_rng().fill(&mut anchor);

        let mut chain = [[0u8; 16]; LANES];
        let mut previous = anchor;
        for block in &mut chain {
            let mut lane = [previous];
            encode_generic(&mut lane, &[[0u8; 16]], keys, iterations);
            *block = lane[0];
            previous = lane[0];
        }

        let mut broken_chain = chain;
        broken_chain[LANES - 1][7] ^= 0b100;
        let mut broken_anchor = anchor;
        broken_anchor[0] ^= 1;

        for implementation in AesImplementation::available() {
            assert_eq!(
                verify(implementation, &chain, &anchor, keys, iterations),
                u8::MAX,
                "{implementation} x{LANES} {iterations}"
            );
            assert_eq!(
                verify(implementation, &broken_chain, &anchor, keys, iterations),
                0,
                "{implementation} x{LANES} {iterations}"
            );
            assert_eq!(
                verify(implementation, &chain, &broken_anchor, keys, iterations),
                0,
                "{implementation} x{LANES} {iterations}"
            );
        }
    }

    #[test]
    fn implementations_agree_on_verification() {
        let keys = RoundKeys::from(ROUND_KEYS);

        for iterations in [1, 2, 13] {
            check_implementations_agree_on_verification::<4>(&keys, iterations);
            check_implementations_agree_on_verification::<8>(&keys, iterations);
            check_implementations_agree_on_verification::<12>(&keys, iterations);
        }
    }

    #[test]
    fn generic_is_always_available() {
        assert!(AesImplementation::available().any(|implementation| {
            implementation == AesImplementation::Generic
        }));
        assert!(AesImplementation::detect().is_supported());
        assert_eq!(
            Some(AesImplementation::detect()),
            AesImplementation::available().next()
        );
    }
}
