//! Ring identifiers: fixed-width modular integers.
//!
//! A [`RingId`] is a `bits`-wide unsigned integer embedded in the ring
//! `[0, 2^bits)`. Arithmetic wraps modulo `2^bits`. The value is stored as
//! up to five 32-bit words, least-significant word first; since the width is
//! always a multiple of 32, wrapping is exactly "discard the carry out of
//! the top word".
//!
//! All constructors normalize into the same word layout, so ids built from
//! integers, byte buffers, decimal strings, or a random source compare and
//! hash identically.

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum supported ring width in bits.
pub const MAX_KEY_BITS: u16 = 160;

/// Number of 32-bit words backing the widest supported id.
const MAX_WORDS: usize = MAX_KEY_BITS as usize / 32;

/// Error constructing a [`RingId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdError {
    /// The source type cannot represent a fixed-width id exactly.
    ///
    /// Floats in particular are rejected rather than silently truncated;
    /// continuous positions belong to a different identifier variant.
    #[error("unsupported identifier source: {0}")]
    UnsupportedSource(&'static str),
    /// A decimal string contained a non-digit or was empty.
    #[error("invalid decimal id string")]
    InvalidDecimal,
}

/// A point on the ring: an unsigned integer modulo `2^bits`.
///
/// `bits` is 32..=160 and a multiple of 32; it is validated once by
/// [`RingConfig`](crate::config::RingConfig) and carried in every id so that
/// arithmetic never consults global state. Mixing widths in one operation is
/// a programming defect and is debug-asserted.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingId {
    bits: u16,
    /// Little-word-first; words at or above `bits / 32` are always zero.
    words: [u32; MAX_WORDS],
}

impl RingId {
    /// The zero id of the given width.
    pub fn zero(bits: u16) -> Self {
        debug_assert!(valid_bits(bits));
        Self {
            bits,
            words: [0; MAX_WORDS],
        }
    }

    /// Build an id from the low bits of a `u64`, wrapping modulo `2^bits`.
    pub fn from_u64(bits: u16, value: u64) -> Self {
        let mut id = Self::zero(bits);
        id.words[0] = value as u32;
        if id.word_count() > 1 {
            id.words[1] = (value >> 32) as u32;
        }
        id
    }

    /// Build the id `2^exp` (used for finger-table offsets).
    pub fn pow2(bits: u16, exp: u16) -> Self {
        debug_assert!(exp < bits, "2^{exp} is not representable in {bits} bits");
        let mut id = Self::zero(bits);
        id.words[exp as usize / 32] = 1 << (exp % 32);
        id
    }

    /// Build an id from a big-endian byte buffer.
    ///
    /// Only the trailing `bits / 8` bytes are consumed; shorter buffers are
    /// zero-extended. This matches the layout a big-integer export produces.
    pub fn from_be_bytes(bits: u16, bytes: &[u8]) -> Self {
        let mut id = Self::zero(bits);
        let take = bytes.len().min(bits as usize / 8);
        let tail = &bytes[bytes.len() - take..];
        for (i, &b) in tail.iter().rev().enumerate() {
            id.words[i / 4] |= (b as u32) << ((i % 4) * 8);
        }
        id
    }

    /// Parse a decimal string, wrapping modulo `2^bits`.
    pub fn from_decimal_str(bits: u16, s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::InvalidDecimal);
        }
        let mut id = Self::zero(bits);
        for c in s.chars() {
            let digit = c.to_digit(10).ok_or(IdError::InvalidDecimal)?;
            id = id.mul_small(10);
            id = id.add(&Self::from_u64(bits, digit as u64));
        }
        Ok(id)
    }

    /// Reject float sources outright.
    ///
    /// A double cannot carry 160 bits of key and truncating one silently
    /// would corrupt ring placement, so this fails fast.
    pub fn from_f64(_bits: u16, _value: f64) -> Result<Self, IdError> {
        Err(IdError::UnsupportedSource("f64"))
    }

    /// Draw a uniformly random id of the given width.
    pub fn random<R: Rng + ?Sized>(bits: u16, rng: &mut R) -> Self {
        let mut id = Self::zero(bits);
        for w in id.words.iter_mut().take(bits as usize / 32) {
            *w = rng.random();
        }
        id
    }

    /// Ring width in bits.
    pub fn bits(&self) -> u16 {
        self.bits
    }

    /// Number of active 32-bit words.
    fn word_count(&self) -> usize {
        self.bits as usize / 32
    }

    /// True if this is the zero id.
    pub fn is_zero(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// The low 64 bits of the id (convenient for narrow-ring tests).
    pub fn to_u64(&self) -> u64 {
        let hi = if self.word_count() > 1 {
            self.words[1] as u64
        } else {
            0
        };
        (hi << 32) | self.words[0] as u64
    }

    /// Read bit `i` (0 = least significant).
    fn bit(&self, i: usize) -> bool {
        (self.words[i / 32] >> (i % 32)) & 1 == 1
    }

    /// Modular addition, word by word with explicit carry propagation.
    ///
    /// Carry out of the top word is the `2^bits` overflow and is discarded,
    /// which is exactly the modular wrap.
    pub fn add(&self, other: &Self) -> Self {
        debug_assert_eq!(self.bits, other.bits, "mixed-width ring arithmetic");
        let mut out = Self::zero(self.bits);
        let mut carry = 0u64;
        for i in 0..self.word_count() {
            let sum = self.words[i] as u64 + other.words[i] as u64 + carry;
            out.words[i] = sum as u32;
            carry = sum >> 32;
        }
        out
    }

    /// Modular subtraction, word by word with explicit borrow propagation.
    pub fn sub(&self, other: &Self) -> Self {
        debug_assert_eq!(self.bits, other.bits, "mixed-width ring arithmetic");
        let mut out = Self::zero(self.bits);
        let mut borrow = 0i64;
        for i in 0..self.word_count() {
            let diff = self.words[i] as i64 - other.words[i] as i64 - borrow;
            if diff < 0 {
                out.words[i] = (diff + (1i64 << 32)) as u32;
                borrow = 1;
            } else {
                out.words[i] = diff as u32;
                borrow = 0;
            }
        }
        out
    }

    /// Multiply by a small constant, wrapping modulo `2^bits`.
    fn mul_small(&self, m: u32) -> Self {
        let mut out = Self::zero(self.bits);
        let mut carry = 0u64;
        for i in 0..self.word_count() {
            let prod = self.words[i] as u64 * m as u64 + carry;
            out.words[i] = prod as u32;
            carry = prod >> 32;
        }
        out
    }

    /// True iff this id lies strictly inside the clockwise arc from `ccw`
    /// to `cw`.
    ///
    /// When `ccw == cw` the arc is the full circle and every id qualifies.
    pub fn between(&self, ccw: &Self, cw: &Self) -> bool {
        match ccw.cmp(cw) {
            Ordering::Equal => true,
            Ordering::Less => ccw < self && self < cw,
            Ordering::Greater => self > ccw || self < cw,
        }
    }

    /// Arc membership including both bounds.
    pub fn between_e(&self, ccw: &Self, cw: &Self) -> bool {
        self == ccw || self == cw || self.between(ccw, cw)
    }

    /// True iff the short way around the ring from this id to `other` runs
    /// clockwise.
    ///
    /// Decided by the top bit of `other - self`: a clear top bit means the
    /// clockwise distance is below the half-circle. The exact half-circle
    /// counts as counter-clockwise, and `other == self` is not clockwise.
    pub fn clockwise(&self, other: &Self) -> bool {
        let dist = other.sub(self);
        if dist.is_zero() {
            return false;
        }
        !dist.bit(self.bits as usize - 1)
    }

    /// Shift by a power of two across word boundaries.
    ///
    /// A positive `count` divides by `2^count`; with `round_up` set, a
    /// nonzero discarded remainder rounds the quotient up. A negative
    /// `count` multiplies by `2^-count`, wrapping modulo `2^bits`; with
    /// `round_up` set, the vacated low bits are filled with ones.
    pub fn shift(&self, count: i32, round_up: bool) -> Self {
        match count.cmp(&0) {
            Ordering::Equal => *self,
            Ordering::Greater => self.shift_right(count as usize, round_up),
            Ordering::Less => self.shift_left((-count) as usize, round_up),
        }
    }

    fn shift_right(&self, count: usize, round_up: bool) -> Self {
        let n = self.word_count();
        if count >= self.bits as usize {
            let mut out = Self::zero(self.bits);
            if round_up && !self.is_zero() {
                out.words[0] = 1;
            }
            return out;
        }
        let word_shift = count / 32;
        let bit_shift = count % 32;

        let mut dropped = self.words[..word_shift].iter().any(|&w| w != 0);
        if bit_shift > 0 && self.words[word_shift] & ((1u32 << bit_shift) - 1) != 0 {
            dropped = true;
        }

        let mut out = Self::zero(self.bits);
        for i in 0..n {
            let src = i + word_shift;
            if src >= n {
                break;
            }
            let mut w = self.words[src] >> bit_shift;
            if bit_shift > 0 && src + 1 < n {
                w |= self.words[src + 1] << (32 - bit_shift);
            }
            out.words[i] = w;
        }
        if round_up && dropped {
            out = out.add(&Self::from_u64(self.bits, 1));
        }
        out
    }

    fn shift_left(&self, count: usize, fill_ones: bool) -> Self {
        let mut out = Self::zero(self.bits);
        if count < self.bits as usize {
            let n = self.word_count();
            let word_shift = count / 32;
            let bit_shift = count % 32;
            for i in (0..n).rev() {
                if i < word_shift {
                    break;
                }
                let src = i - word_shift;
                let mut w = self.words[src] << bit_shift;
                if bit_shift > 0 && src > 0 {
                    w |= self.words[src - 1] >> (32 - bit_shift);
                }
                out.words[i] = w;
            }
        }
        if fill_ones {
            let fill = count.min(self.bits as usize);
            for b in 0..fill {
                out.words[b / 32] |= 1 << (b % 32);
            }
        }
        out
    }

    /// Extract the `i`-th base-`2^b` digit (digit 0 is least significant).
    ///
    /// Digits that straddle a word boundary are assembled from both words.
    pub fn digit(&self, i: usize, b: usize) -> u32 {
        debug_assert!(b >= 1 && b <= 32, "digit base must be 2^1..=2^32");
        let pos = i * b;
        if pos >= self.bits as usize {
            return 0;
        }
        let word = pos / 32;
        let offset = pos % 32;
        let mut value = (self.words[word] as u64) >> offset;
        if offset + b > 32 && word + 1 < self.word_count() {
            value |= (self.words[word + 1] as u64) << (32 - offset);
        }
        let mask = if b == 32 { u32::MAX as u64 } else { (1u64 << b) - 1 };
        (value & mask) as u32
    }
}

/// Width validity: positive multiple of 32, at most [`MAX_KEY_BITS`].
pub(crate) fn valid_bits(bits: u16) -> bool {
    bits > 0 && bits % 32 == 0 && bits <= MAX_KEY_BITS
}

impl Ord for RingId {
    /// Numeric comparison, most-significant word first.
    fn cmp(&self, other: &Self) -> Ordering {
        debug_assert_eq!(self.bits, other.bits, "mixed-width ring comparison");
        for i in (0..MAX_WORDS).rev() {
            match self.words[i].cmp(&other.words[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for RingId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for RingId {
    /// Word-XOR hash; cheap and consistent with structural equality.
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut acc = 0u32;
        for &w in &self.words {
            acc ^= w;
        }
        state.write_u32(acc);
    }
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for i in (0..self.word_count()).rev() {
            write!(f, "{:08x}", self.words[i])?;
        }
        Ok(())
    }
}

impl fmt::Debug for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingId({self})")
    }
}
