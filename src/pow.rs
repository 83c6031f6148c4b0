//! Proof of work and chain work arithmetic

use crate::constants::*;
use crate::error::{ChainError, Result};
use crate::types::{BlockHeader, Hash};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// 256-bit unsigned integer used for difficulty targets and chain work.
///
/// Limbs are little-endian: `self.0[0]` holds the least significant 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct U256([u64; 4]);

impl U256 {
    pub const MAX: U256 = U256([u64::MAX; 4]);

    pub const fn zero() -> Self {
        U256([0; 4])
    }

    pub const fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    pub fn low_u64(&self) -> u64 {
        self.0[0]
    }

    /// Number of significant bits.
    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }

    fn bit(&self, index: u32) -> bool {
        (self.0[(index / 64) as usize] >> (index % 64)) & 1 == 1
    }

    fn set_bit(&mut self, index: u32) {
        self.0[(index / 64) as usize] |= 1 << (index % 64);
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }

        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }

        result
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }

        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in word_shift..4 {
            result.0[i - word_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i > word_shift {
                result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
            }
        }

        result
    }

    pub fn not(&self) -> Self {
        U256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }

    pub fn overflowing_add(&self, other: &U256) -> (U256, bool) {
        let mut result = U256::zero();
        let mut carry = false;
        for i in 0..4 {
            let (sum, c1) = self.0[i].overflowing_add(other.0[i]);
            let (sum, c2) = sum.overflowing_add(carry as u64);
            result.0[i] = sum;
            carry = c1 || c2;
        }
        (result, carry)
    }

    pub fn saturating_add(&self, other: &U256) -> U256 {
        match self.overflowing_add(other) {
            (_, true) => U256::MAX,
            (sum, false) => sum,
        }
    }

    fn wrapping_sub(&self, other: &U256) -> U256 {
        let mut result = U256::zero();
        let mut borrow = false;
        for i in 0..4 {
            let (diff, b1) = self.0[i].overflowing_sub(other.0[i]);
            let (diff, b2) = diff.overflowing_sub(borrow as u64);
            result.0[i] = diff;
            borrow = b1 || b2;
        }
        result
    }

    /// Integer division. Division by zero yields zero.
    pub fn div(&self, divisor: &U256) -> U256 {
        if divisor.is_zero() {
            return U256::zero();
        }

        let mut quotient = U256::zero();
        let mut remainder = U256::zero();
        for i in (0..self.bits()).rev() {
            let carry = remainder.bit(255);
            remainder = remainder.shl(1);
            if self.bit(i) {
                remainder.0[0] |= 1;
            }
            if carry || remainder >= *divisor {
                remainder = remainder.wrapping_sub(divisor);
                quotient.set_bit(i);
            }
        }
        quotient
    }

    /// `floor(self * mul / div)` computed without intermediate overflow.
    /// Returns `None` when the result does not fit in 256 bits or `div` is 0.
    pub fn mul_div_u64(&self, mul: u64, div: u64) -> Option<U256> {
        if div == 0 {
            return None;
        }

        let mut product = [0u64; 5];
        let mut carry: u128 = 0;
        for i in 0..4 {
            let wide = self.0[i] as u128 * mul as u128 + carry;
            product[i] = wide as u64;
            carry = wide >> 64;
        }
        product[4] = carry as u64;

        let mut quotient = [0u64; 5];
        let mut rem: u128 = 0;
        for i in (0..5).rev() {
            let cur = (rem << 64) | product[i] as u128;
            quotient[i] = (cur / div as u128) as u64;
            rem = cur % div as u128;
        }

        if quotient[4] != 0 {
            return None;
        }
        Some(U256([quotient[0], quotient[1], quotient[2], quotient[3]]))
    }

    /// Interpret 32 little-endian bytes, which is how hashes compare against
    /// targets (the display-order hex read as a big-endian number).
    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *word = u64::from_le_bytes(chunk);
        }
        U256(words)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, word) in self.0.iter().rev().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    /// Decode the compact ("nBits") representation.
    ///
    /// The format is `0xEEMMMMMM`: the target is `mantissa * 256^(exponent - 3)`.
    /// Bit 23 of the mantissa is a sign bit; negative and overflowing encodings
    /// are rejected.
    pub fn from_compact(bits: u32) -> Result<U256> {
        let exponent = bits >> 24;
        let mantissa = bits & 0x007fffff;

        if mantissa != 0 && bits & 0x00800000 != 0 {
            return Err(ChainError::violation(format!("Negative target {:#010x}", bits)));
        }

        let overflow = mantissa != 0
            && (exponent > 34
                || (mantissa > 0xff && exponent > 33)
                || (mantissa > 0xffff && exponent > 32));
        if overflow {
            return Err(ChainError::violation(format!("Target {:#010x} overflows", bits)));
        }

        if exponent <= 3 {
            Ok(U256::from_u64((mantissa >> (8 * (3 - exponent))) as u64))
        } else {
            Ok(U256::from_u64(mantissa as u64).shl(8 * (exponent - 3)))
        }
    }

    /// Encode into the compact representation (lossy: keeps 23 mantissa bits).
    pub fn to_compact(&self) -> u32 {
        let mut size = (self.bits() + 7) / 8;
        let mut compact = if size <= 3 {
            (self.low_u64() << (8 * (3 - size))) as u32
        } else {
            self.shr(8 * (size - 3)).low_u64() as u32
        };

        if compact & 0x00800000 != 0 {
            compact >>= 8;
            size += 1;
        }
        compact | (size << 24)
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl std::fmt::Display for U256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.to_be_bytes()))
    }
}

/// CheckProofOfWork
///
/// The block hash, read as a 256-bit number, must not exceed the target
/// encoded in `bits`, and that target must not exceed the network's limit.
pub fn check_proof_of_work(hash: &Hash, bits: u32, pow_limit: &U256) -> Result<()> {
    let target = U256::from_compact(bits)?;

    if target.is_zero() || target > *pow_limit {
        return Err(ChainError::violation(format!(
            "Target {:#010x} outside of proof-of-work range",
            bits
        )));
    }

    if U256::from_le_bytes(hash) > target {
        return Err(ChainError::violation("Difficulty target not met"));
    }

    Ok(())
}

/// Expected number of hashes needed to meet `bits`: `2^256 / (target + 1)`.
///
/// Computed as `!target / (target + 1) + 1` to stay inside 256 bits. Invalid
/// encodings carry no work.
pub fn block_work(bits: u32) -> U256 {
    let target = match U256::from_compact(bits) {
        Ok(target) if !target.is_zero() => target,
        _ => return U256::zero(),
    };

    let (denominator, overflow) = target.overflowing_add(&U256::from_u64(1));
    if overflow {
        return U256::from_u64(1);
    }
    target
        .not()
        .div(&denominator)
        .saturating_add(&U256::from_u64(1))
}

/// Whether the block at `height` starts a new difficulty period.
pub fn is_retarget_height(height: u64) -> bool {
    height % RETARGET_INTERVAL == 0
}

/// GetNextWorkRequired
///
/// `last` is the parent of the block being checked. Outside a retarget
/// boundary the difficulty is unchanged. On a boundary, `period_start` must be
/// the first block of the period ending at `last` (height
/// `last.height - RETARGET_INTERVAL + 1`):
///
/// 1. actual = last.time - period_start.time, clamped to [T/4, 4T]
/// 2. new = old * actual / T, clamped to the proof-of-work limit
pub fn next_work_required(
    last: &BlockHeader,
    last_height: u64,
    period_start: Option<&BlockHeader>,
    pow_limit: &U256,
) -> Result<u32> {
    if !is_retarget_height(last_height + 1) {
        return Ok(last.bits);
    }

    let first = period_start.ok_or_else(|| {
        ChainError::violation("First block of the difficulty period is unavailable")
    })?;

    let actual = (last.timestamp as i64 - first.timestamp as i64)
        .clamp((TARGET_TIMESPAN / 4) as i64, (TARGET_TIMESPAN * 4) as i64) as u64;

    let old_target = U256::from_compact(last.bits)?;
    let new_target = match old_target.mul_div_u64(actual, TARGET_TIMESPAN) {
        Some(target) if target <= *pow_limit => target,
        _ => *pow_limit,
    };

    tracing::debug!(
        target_timespan = TARGET_TIMESPAN,
        actual_timespan = actual,
        before = %old_target,
        after = %new_target,
        "Difficulty retarget"
    );

    Ok(new_target.to_compact())
}

/// Median of the given ancestor timestamps (index `floor(n/2)` after sorting).
pub fn median_time_past(timestamps: &[u32]) -> Option<u32> {
    if timestamps.is_empty() {
        return None;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}
