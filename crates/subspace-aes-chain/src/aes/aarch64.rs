use super::result_mask;
use crate::{Block, RoundKeys, NUM_ROUND_KEYS};
use core::arch::aarch64::*;
use subtle::ConstantTimeEq;

// `aese`/`aesd` start with AddRoundKey while x86 rounds end with it, so here every round consumes
// the key of the previous round and the last key is applied with a plain `xor`.

/// Encode lanes with ARMv8 AES instructions
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
        *block = veorq_u8(*block, *feedback);
    }

    for _ in 0..iterations {
        for key in &keys_reg[..NUM_ROUND_KEYS - 2] {
            for block in blocks_reg.iter_mut() {
                *block = vaesmcq_u8(vaeseq_u8(*block, *key));
            }
        }
        for block in blocks_reg.iter_mut() {
            *block = veorq_u8(
                vaeseq_u8(*block, keys_reg[NUM_ROUND_KEYS - 2]),
                keys_reg[NUM_ROUND_KEYS - 1],
            );
        }
    }

    store(blocks, &blocks_reg);
}

/// Decode lanes with ARMv8 AES instructions
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
        *block = veorq_u8(*block, *feedback);
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

    let mut all_equal = vdupq_n_u8(u8::MAX);
    for (block, expected) in blocks_reg.iter().zip(&expected_reg) {
        all_equal = vandq_u8(all_equal, vceqq_u8(*block, *expected));
    }

    result_mask(vminvq_u8(all_equal).ct_eq(&u8::MAX))
}

#[target_feature(enable = "aes")]
#[inline]
fn decrypt_rounds<const LANES: usize>(
    blocks_reg: &mut [uint8x16_t; LANES],
    inv_keys_reg: &[uint8x16_t; NUM_ROUND_KEYS],
    iterations: u32,
) {
    for _ in 0..iterations {
        for block in blocks_reg.iter_mut() {
            *block = vaesimcq_u8(vaesdq_u8(*block, inv_keys_reg[NUM_ROUND_KEYS - 1]));
        }
        for key in inv_keys_reg[2..NUM_ROUND_KEYS - 1].iter().rev() {
            for block in blocks_reg.iter_mut() {
                *block = vaesimcq_u8(vaesdq_u8(*block, *key));
            }
        }
        for block in blocks_reg.iter_mut() {
            *block = veorq_u8(vaesdq_u8(*block, inv_keys_reg[1]), inv_keys_reg[0]);
        }
    }
}

/// Round keys with middle keys transformed with InvMixColumns for `aesd`
#[target_feature(enable = "aes")]
#[inline]
fn inverse_keys(keys: &RoundKeys) -> [uint8x16_t; NUM_ROUND_KEYS] {
    let mut inv_keys_reg = load::<NUM_ROUND_KEYS>(keys);
    for key in &mut inv_keys_reg[1..NUM_ROUND_KEYS - 1] {
        *key = vaesimcq_u8(*key);
    }
    inv_keys_reg
}

#[target_feature(enable = "aes")]
#[inline]
fn load<const LANES: usize>(blocks: &[Block; LANES]) -> [uint8x16_t; LANES] {
    let mut blocks_reg = [vdupq_n_u8(0); LANES];
    for (block_reg, block) in blocks_reg.iter_mut().zip(blocks) {
        // SAFETY: Load of 16 bytes from a valid block
        *block_reg = unsafe { vld1q_u8(block.as_ptr()) };
    }
    blocks_reg
}

#[target_feature(enable = "aes")]
#[inline]
fn store<const LANES: usize>(blocks: &mut [Block; LANES], blocks_reg: &[uint8x16_t; LANES]) {
    for (block, block_reg) in blocks.iter_mut().zip(blocks_reg) {
        // SAFETY: Store of 16 bytes into a valid block
        unsafe { vst1q_u8(block.as_mut_ptr(), *block_reg) };
    }
}
