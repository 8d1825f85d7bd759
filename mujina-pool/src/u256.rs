//! 256-bit unsigned integer arithmetic.
//!
//! Wraps `ruint::aliases::U256` so the rest of the pool sees one stable type
//! for targets and hash values regardless of which coin produced them.

use ruint::aliases::U256 as Ruint256;
use std::fmt;
use std::ops::{Div, Shl, Shr};

/// A 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct U256(Ruint256);

impl U256 {
    /// Zero constant.
    pub const ZERO: Self = Self(Ruint256::ZERO);

    /// Largest representable value.
    pub const MAX: Self = Self(Ruint256::MAX);

    /// Create from little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_le_bytes(bytes))
    }

    /// Create from big-endian bytes.
    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_be_bytes(bytes))
    }

    /// Convert to little-endian bytes.
    pub fn to_le_bytes(self) -> [u8; 32] {
        self.0.to_le_bytes()
    }

    /// Convert to big-endian bytes.
    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    /// Parse a big-endian hex string of at most 64 digits.
    pub fn from_be_hex(hex_str: &str) -> Option<Self> {
        if hex_str.is_empty() || hex_str.len() > 64 {
            return None;
        }
        let padded = format!("{:0>64}", hex_str);
        let bytes: [u8; 32] = hex::decode(padded).ok()?.try_into().ok()?;
        Some(Self::from_be_bytes(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> usize {
        self.0.leading_zeros()
    }

    /// Convert to u64, saturating at u64::MAX.
    pub fn saturating_to_u64(self) -> u64 {
        self.0.saturating_to()
    }

    /// Nearest f64 value. Loses precision beyond 53 significant bits.
    pub fn to_f64(self) -> f64 {
        self.0
            .as_limbs()
            .iter()
            .enumerate()
            .map(|(i, limb)| *limb as f64 * 2f64.powi(64 * i as i32))
            .sum()
    }
}

impl From<u64> for U256 {
    fn from(value: u64) -> Self {
        Self(Ruint256::from(value))
    }
}

impl Div for U256 {
    type Output = Self;

    fn div(self, rhs: Self) -> Self::Output {
        Self(self.0 / rhs.0)
    }
}

impl Div<u64> for U256 {
    type Output = Self;

    fn div(self, rhs: u64) -> Self::Output {
        Self(self.0 / Ruint256::from(rhs))
    }
}

impl Shl<usize> for U256 {
    type Output = Self;

    fn shl(self, rhs: usize) -> Self::Output {
        Self(self.0 << rhs)
    }
}

impl Shr<usize> for U256 {
    type Output = Self;

    fn shr(self, rhs: usize) -> Self::Output {
        Self(self.0 >> rhs)
    }
}

impl fmt::LowerHex for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_be_bytes()))
    }
}
