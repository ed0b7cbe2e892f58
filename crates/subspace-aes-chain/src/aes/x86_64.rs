use super::result_mask;
use crate::{Block, RoundKeys, NUM_ROUND_KEYS};
use core::arch::x86_64::*;
use subtle::ConstantTimeEq;

/// Encode lanes with AES-NI
#[target_feature(enable = "aes")]
#[inline]
pub(super) fn encode<const LANES: usize>(
    blocks: &mut [Block; LANES],
    feedbacks: &[Block; LANES],
    keys: &RoundKeys,
    iterations: u32,
) {
    let keys_reg = load::<NUM_ROUND_KEYS>(keys);
    let feedbacks_reg = load(feedbacks);
    let mut blocks_reg = load(blocks);

    for (block, feedback) in blocks_reg.iter_mut().zip(&feedbacks_reg) {
        *block = _mm_xor_si128(*block, *feedback);
    }

    for _ in 0..iterations {
        for block in blocks_reg.iter_mut() {
            *block = _mm_xor_si128(*block, keys_reg[0]);
        }
        for key in &keys_reg[1..NUM_ROUND_KEYS - 1] {
            for block in blocks_reg.iter_mut() {
                *block = _mm_aesenc_si128(*block, *key);
            }
        }
        for block in blocks_reg.iter_mut() {
            *block = _mm_aesenclast_si128(*block, keys_reg[NUM_ROUND_KEYS - 1]);
        }
    }

    store(blocks, &blocks_reg);
}

/// Decode lanes with AES-NI
#[target_feature(enable = "aes")]
#[inline]
pub(super) fn decode<const LANES: usize>(
    blocks: &mut [Block; LANES],
    feedbacks: &[Block; LANES],
    keys: &RoundKeys,
    iterations: u32,
) {
    let inv_keys_reg = inverse_keys(keys);
    let mut blocks_reg = load(blocks);

    decrypt_rounds(&mut blocks_reg, &inv_keys_reg, iterations);

    let feedbacks_reg = load(feedbacks);
    for (block, feedback) in blocks_reg.iter_mut().zip(&feedbacks_reg) {
        *block = _mm_xor_si128(*block, *feedback);
    }

    store(blocks, &blocks_reg);
}

/// Decrypt every candidate lane and compare against expected lanes, all lanes are always
/// processed.
#[target_feature(enable = "aes")]
#[inline]
pub(super) fn verify<const LANES: usize>(
    candidate: &[Block; LANES],
    expected: &[Block; LANES],
    keys: &RoundKeys,
    iterations: u32,
) -> u8 {
    let inv_keys_reg = inverse_keys(keys);
    let expected_reg = load(expected);
    let mut blocks_reg = load(candidate);

    decrypt_rounds(&mut blocks_reg, &inv_keys_reg, iterations);

    let mut all_equal = _mm_set1_epi8(-1);
    for (block, expected) in blocks_reg.iter().zip(&expected_reg) {
        all_equal = _mm_and_si128(all_equal, _mm_cmpeq_epi8(*block, *expected));
    }

    // Each byte of the register contributes one bit
    let mask = _mm_movemask_epi8(all_equal) as u16;
    result_mask(mask.ct_eq(&u16::MAX))
}

#[target_feature(enable = "aes")]
#[inline]
fn decrypt_rounds<const LANES: usize>(
    blocks_reg: &mut [__m128i; LANES],
    inv_keys_reg: &[__m128i; NUM_ROUND_KEYS],
    iterations: u32,
) {
    for _ in 0..iterations {
        for block in blocks_reg.iter_mut() {
            *block = _mm_xor_si128(*block, inv_keys_reg[NUM_ROUND_KEYS - 1]);
        }
        for key in inv_keys_reg[1..NUM_ROUND_KEYS - 1].iter().rev() {
            for block in blocks_reg.iter_mut() {
                *block = _mm_aesdec_si128(*block, *key);
            }
        }
        for block in blocks_reg.iter_mut() {
            *block = _mm_aesdeclast_si128(*block, inv_keys_reg[0]);
        }
    }
}

/// Round keys with middle keys transformed for `aesdec`.
///
/// The first and last keys are used as is with `xor` and `aesdeclast`.
#[target_feature(enable = "aes")]
#[inline]
fn inverse_keys(keys: &RoundKeys) -> [__m128i; NUM_ROUND_KEYS] {
    let mut inv_keys_reg = load::<NUM_ROUND_KEYS>(keys);
    for key in &mut inv_keys_reg[1..NUM_ROUND_KEYS - 1] {
        *key = _mm_aesimc_si128(*key);
    }
    inv_keys_reg
}

#[target_feature(enable = "aes")]
#[inline]
fn load<const LANES: usize>(blocks: &[Block; LANES]) -> [__m128i; LANES] {
    let mut blocks_reg = [_mm_setzero_si128(); LANES];
    for (block_reg, block) in blocks_reg.iter_mut().zip(blocks) {
        // SAFETY: Unaligned load of 16 bytes from a valid block
        *block_reg = unsafe { _mm_loadu_si128(block.as_ptr().cast()) };
    }
    blocks_reg
}

#[target_feature(enable = "aes")]
#[inline]
fn store<const LANES: usize>(blocks: &mut [Block; LANES], blocks_reg: &[__m128i; LANES]) {
    for (block, block_reg) in blocks.iter_mut().zip(blocks_reg) {
        // SAFETY: Unaligned store of 16 bytes into a valid block
        unsafe { _mm_storeu_si128(block.as_mut_ptr().cast(), *block_reg) };
    }
}
