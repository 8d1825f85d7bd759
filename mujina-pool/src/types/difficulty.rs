//! Conversions between difficulty, 256-bit targets and hash values.

use bitcoin::pow::Target;
use std::fmt;

use crate::u256::U256;

/// Difficulty arithmetic for one coin.
///
/// Difficulty and target have an inverse relationship anchored at the
/// coin's difficulty-1 target:
/// ```text
/// target     = DIFF1 / difficulty
/// difficulty = DIFF1 / target
/// ```
///
/// A hash satisfies a target when its numeric value is less than or equal
/// to the target, so the difficulty a hash "proves" is `DIFF1 / hash`.
/// Pool difficulties are routinely fractional (VarDiff, sub-1 test
/// difficulties), so the conversions accept and return `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DifficultyMath {
    diff1: U256,
}

impl DifficultyMath {
    /// Smallest difficulty we convert; anything below maps to `U256::MAX`.
    const MIN_DIFFICULTY: f64 = 1e-30;

    pub const fn new(diff1: U256) -> Self {
        Self { diff1 }
    }

    /// SHA256d coins: `0x00000000ffff0000...` (Bitcoin's `Target::MAX`).
    pub fn bitcoin() -> Self {
        Self::new(U256::from_le_bytes(Target::MAX.to_le_bytes()))
    }

    pub fn diff1(&self) -> U256 {
        self.diff1
    }

    /// Target for a difficulty.
    ///
    /// Non-positive and non-finite values, as well as difficulties so small
    /// that the target would overflow, saturate at `U256::MAX`.
    pub fn target_for(&self, difficulty: f64) -> U256 {
        if !difficulty.is_finite() || difficulty < Self::MIN_DIFFICULTY {
            return U256::MAX;
        }

        // difficulty = mantissa * 2^exponent with a 53-bit integer mantissa,
        // so the division stays in integer arithmetic.
        let exponent = difficulty.log2().floor() as i32 - 52;
        let mantissa = (difficulty / 2f64.powi(exponent)) as u64;

        let quotient = self.diff1 / mantissa;
        if exponent >= 0 {
            let shift = exponent as usize;
            if shift >= 256 {
                return U256::ZERO;
            }
            quotient >> shift
        } else {
            let shift = (-exponent) as usize;
            if shift > quotient.leading_zeros() {
                return U256::MAX;
            }
            quotient << shift
        }
    }

    /// Difficulty represented by a target. A zero target saturates at
    /// `f64::MAX`.
    pub fn difficulty_for(&self, target: U256) -> f64 {
        if target.is_zero() {
            return f64::MAX;
        }
        self.diff1.to_f64() / target.to_f64()
    }

    /// Difficulty proven by a hash value; the hash is the target it met.
    pub fn difficulty_from_hash(&self, hash: U256) -> f64 {
        self.difficulty_for(hash)
    }
}

/// Human-readable difficulty for logs: SI suffixes above 1000, adaptive
/// precision below 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayDifficulty(pub f64);

impl fmt::Display for DisplayDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;

        if value < 1.0 {
            let s = format!("{:.6}", value);
            let trimmed = s.trim_end_matches('0').trim_end_matches('.');
            return write!(f, "{}", if trimmed.is_empty() { "0" } else { trimmed });
        }

        const UNITS: [(f64, &str); 5] = [(1e15, "P"), (1e12, "T"), (1e9, "G"), (1e6, "M"), (1e3, "K")];
        let (scaled, suffix) = UNITS
            .iter()
            .find(|(scale, _)| value >= *scale)
            .map(|(scale, suffix)| (value / scale, *suffix))
            .unwrap_or((value, ""));

        if scaled >= 100.0 || scaled.fract() == 0.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}
