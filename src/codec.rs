//! Bit-field codec.
//!
//! An operand of a fixed width instruction word is described by an ordered list of
//! `BitRange`s. Decoding walks the list front to back and concatenates the extracted
//! bits, most significant range first. Encoding walks it back to front, peeling the low
//! bits off the value, so split fields like hi/lo immediates or `D:Vd` register numbers
//! land in the right places. The modifiers on the ranges say how the concatenated raw
//! bits relate to the operand value (sign extension, scaling, ARM rotation, or a constant
//! that occupies no bits at all).

use std::fmt::Debug;
use std::hash::Hash;

use thiserror::Error;

/// How the bits of a range contribute to the operand value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    /// Plain bits.
    Verbatim,
    /// Upper part of a split field.
    Hi,
    /// Lower part of a split field.
    Lo,
    /// The concatenated field is two's complement.
    Signed,
    /// The concatenated field is unsigned and counts units of `k`.
    Scaled(i64),
    /// The concatenated field is two's complement and counts units of `k`.
    SignedScaled(i64),
    /// ARM 8-bit value with 4-bit rotation, 12 bits on the wire.
    Rotated,
    /// No bits on the wire, the operand always has this value.
    Force(i64),
}

/// One contiguous run of bits: `width` bits starting at bit `pos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRange {
    pub modifier: Modifier,
    pub width: u32,
    pub pos: u32,
}

impl BitRange {
    pub fn mask(&self) -> u32 {
        low_mask(self.width) << self.pos
    }
}

/// Builds a `&'static [BitRange]` from `(modifier, width, pos)` triples.
macro_rules! ranges {
    ($(($modifier:expr, $width:expr, $pos:expr)),* $(,)?) => {
        &[$($crate::codec::BitRange { modifier: $modifier, width: $width, pos: $pos }),*]
    };
}

/// An operand kind of a word oriented ISA.
pub trait FieldKind: Copy + Eq + Hash + Debug + 'static {
    /// Bit ranges in most-significant-first order.
    fn ranges(self) -> &'static [BitRange];
}

/// A value that does not fit its field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("value {value:#x} out of range for {field}")]
pub struct RangeError {
    pub field: String,
    pub value: i64,
}

/// The bits an encoded operand contributes to a word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub mask: u32,
    pub bits: u32,
    pub pos: u32,
}

fn low_mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    }
}

#[derive(Clone, Copy)]
enum Interp {
    Unsigned,
    Signed,
    Rotated,
    Force(i64),
}

fn interpretation(ranges: &[BitRange]) -> (Interp, i64, u32) {
    let mut interp = Interp::Unsigned;
    let mut scale = 1;
    let mut total = 0;
    for r in ranges {
        match r.modifier {
            Modifier::Verbatim | Modifier::Hi | Modifier::Lo => {}
            Modifier::Signed => interp = Interp::Signed,
            Modifier::Scaled(k) => scale = k,
            Modifier::SignedScaled(k) => {
                interp = Interp::Signed;
                scale = k;
            }
            Modifier::Rotated => interp = Interp::Rotated,
            Modifier::Force(c) => return (Interp::Force(c), 1, 0),
        }
        total += r.width;
    }
    (interp, scale, total)
}

/// Extracts the operand described by `ranges` from `word`.
pub fn decode(ranges: &[BitRange], word: u32) -> i64 {
    let (interp, scale, total) = interpretation(ranges);
    let mut raw: u64 = 0;
    for r in ranges {
        raw = (raw << r.width) | u64::from((word >> r.pos) & low_mask(r.width));
    }
    match interp {
        Interp::Force(c) => c,
        Interp::Rotated => decode_rotated(raw as u32),
        Interp::Unsigned => raw as i64 * scale,
        Interp::Signed => {
            let shift = 64 - total;
            ((raw << shift) as i64 >> shift) * scale
        }
    }
}

/// Splits `value` into the pieces described by `ranges`.
///
/// Fails if the value is out of range, not a multiple of the scale, not
/// representable as a rotated immediate, or differs from a forced constant.
pub fn encode<K: FieldKind>(kind: K, value: i64) -> Result<Vec<Piece>, RangeError> {
    let ranges = kind.ranges();
    let err = || RangeError {
        field: format!("{:?}", kind),
        value,
    };
    let (interp, scale, total) = interpretation(ranges);
    let mut raw: u64 = match interp {
        Interp::Force(c) => {
            return if value == c { Ok(Vec::new()) } else { Err(err()) };
        }
        Interp::Rotated => {
            let v = u32::try_from(value).map_err(|_| err())?;
            u64::from(encode_rotated(v).ok_or_else(err)?)
        }
        Interp::Unsigned => {
            if value % scale != 0 {
                return Err(err());
            }
            let v = value / scale;
            if v < 0 || (total < 63 && v >= 1i64 << total) {
                return Err(err());
            }
            v as u64
        }
        Interp::Signed => {
            if value % scale != 0 {
                return Err(err());
            }
            let v = value / scale;
            let half = 1i64 << (total - 1);
            if v < -half || v >= half {
                return Err(err());
            }
            (v as u64) & ((1u64 << total) - 1)
        }
    };
    let mut pieces = Vec::with_capacity(ranges.len());
    for r in ranges.iter().rev() {
        let m = low_mask(r.width);
        pieces.push(Piece {
            mask: m,
            bits: (raw as u32) & m,
            pos: r.pos,
        });
        raw >>= r.width;
    }
    Ok(pieces)
}

/// ORs pieces into a word; returns the combined mask and bits.
///
/// Overlapping pieces indicate a broken template and yield `None`.
pub fn combine(pieces: impl IntoIterator<Item = Piece>) -> Option<(u32, u32)> {
    let mut mask = 0u32;
    let mut bits = 0u32;
    for p in pieces {
        let m = p.mask << p.pos;
        if mask & m != 0 {
            return None;
        }
        mask |= m;
        bits |= (p.bits & p.mask) << p.pos;
    }
    Some((mask, bits))
}

/// Expands a 12-bit ARM rotated immediate.
pub fn decode_rotated(field: u32) -> i64 {
    let x = u64::from(field & 0xff);
    let x = x | (x << 32);
    let rot = (field & 0xf00) >> 7;
    ((x >> rot) & 0xffff_ffff) as i64
}

/// Finds the 12-bit rotated form of `value`, if there is one.
pub fn encode_rotated(value: u32) -> Option<u32> {
    if value <= 0xff {
        return Some(value);
    }
    let x = u64::from(value) | (u64::from(value) << 32);
    (1..16u32).find_map(|r| {
        let y = (x >> (32 - 2 * r)) & 0xffff_ffff;
        (y <= 0xff).then_some((r << 8) | y as u32)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum F {
        Split,
        Simm,
        Scaled,
        Rot,
        Zero,
        Pair,
    }

    impl FieldKind for F {
        fn ranges(self) -> &'static [BitRange] {
            match self {
                F::Split => ranges![(Modifier::Hi, 4, 16), (Modifier::Lo, 12, 0)],
                F::Simm => ranges![(Modifier::Signed, 24, 0)],
                F::Scaled => ranges![(Modifier::Scaled(4), 8, 0)],
                F::Rot => ranges![(Modifier::Rotated, 12, 0)],
                F::Zero => ranges![(Modifier::Force(0), 0, 0)],
                F::Pair => ranges![(Modifier::Hi, 19, 5), (Modifier::Signed, 2, 29)],
            }
        }
    }

    fn word(kind: F, value: i64) -> u32 {
        combine(encode(kind, value).unwrap()).unwrap().1
    }

    #[test]
    fn split_field_goes_high_then_low() {
        assert_eq!(word(F::Split, 0xabcd), 0x000a_0bcd);
        assert_eq!(decode(F::Split.ranges(), 0x000a_0bcd), 0xabcd);
    }

    #[test]
    fn signed_fields_sign_extend() {
        assert_eq!(word(F::Simm, -2), 0x00ff_fffe);
        assert_eq!(decode(F::Simm.ranges(), 0x00ff_fffe), -2);
        assert!(encode(F::Simm, 1 << 23).is_err());
        assert!(encode(F::Simm, -(1 << 23)).is_ok());
    }

    #[test]
    fn scaled_fields_require_multiples() {
        assert_eq!(word(F::Scaled, 1020), 0xff);
        assert_eq!(decode(F::Scaled.ranges(), 0xff), 1020);
        assert!(encode(F::Scaled, 6).is_err());
        assert!(encode(F::Scaled, 1024).is_err());
    }

    #[test]
    fn adr_style_immediate() {
        // immhi at 5..23, immlo at 29..30
        let w = word(F::Pair, -1);
        assert_eq!(w, 0x60ff_ffe0);
        assert_eq!(decode(F::Pair.ranges(), w), -1);
        assert_eq!(decode(F::Pair.ranges(), word(F::Pair, 0x1235)), 0x1235);
    }

    #[test]
    fn rotated_immediates() {
        assert_eq!(encode_rotated(0xff), Some(0xff));
        assert_eq!(encode_rotated(0xff00_0000), Some(0x4ff));
        assert_eq!(decode_rotated(0x4ff), 0xff00_0000);
        assert_eq!(encode_rotated(0x101), None);
        let err = encode(F::Rot, 0x101).unwrap_err();
        assert_eq!(err.value, 0x101);
        for v in [0u32, 1, 0x3fc, 0xf000_000f, 0x8000_0000] {
            let enc = encode_rotated(v).unwrap();
            assert_eq!(decode_rotated(enc), i64::from(v));
        }
    }

    #[test]
    fn forced_constants_take_no_bits() {
        assert!(encode(F::Zero, 0).unwrap().is_empty());
        assert!(encode(F::Zero, 1).is_err());
        assert_eq!(decode(F::Zero.ranges(), 0xffff_ffff), 0);
    }

    #[test]
    fn combine_rejects_overlap() {
        let a = Piece { mask: 0xf, bits: 1, pos: 0 };
        let b = Piece { mask: 0x3, bits: 1, pos: 2 };
        assert!(combine([a, b]).is_none());
        assert_eq!(combine([a, Piece { mask: 0xf, bits: 2, pos: 4 }]), Some((0xff, 0x21)));
    }
}
