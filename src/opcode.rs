//! Fixed width instruction templates.
//!
//! `Opcode` describes one 32-bit instruction form: the fixed bits that identify it and
//! the ordered operand fields that fill the rest of the word. A32 and A64 both use it;
//! they differ only in their field kinds and where their discriminant sits.

use std::ops::BitOr;

use crate::catalog::Template;
use crate::codec::{self, FieldKind};
use crate::error::{AsmError, CatalogError};

/// Semantic classes of an opcode. Used by later passes, not by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpcodeFlags(pub u32);

impl OpcodeFlags {
    pub const NONE: Self = Self(0);
    pub const LOAD: Self = Self(1 << 0);
    pub const STORE: Self = Self(1 << 1);
    pub const ATOMIC: Self = Self(1 << 2);
    pub const JUMP: Self = Self(1 << 3);
    pub const LINK: Self = Self(1 << 4);
    pub const ALU: Self = Self(1 << 5);
    pub const ALU1: Self = Self(1 << 6);
    pub const MUL: Self = Self(1 << 7);
    pub const MULACC: Self = Self(1 << 8);
    pub const DIV: Self = Self(1 << 9);
    pub const TEST: Self = Self(1 << 10);
    pub const SIGNEXTEND: Self = Self(1 << 11);
    pub const MULTIPLE: Self = Self(1 << 12);
    pub const FLOAT: Self = Self(1 << 13);
    pub const SYSCALL: Self = Self(1 << 14);
    pub const PREFETCH: Self = Self(1 << 15);
    pub const MISC: Self = Self(1 << 16);
    pub const COND_BRANCH: Self = Self(1 << 17);
    pub const ADDR_PRE: Self = Self(1 << 18);
    pub const ADDR_POST: Self = Self(1 << 19);
    pub const ADDR_INC: Self = Self(1 << 20);
    pub const ADDR_DEC: Self = Self(1 << 21);
    pub const ADDR_UPDATE: Self = Self(1 << 22);
    pub const RESULT_64BIT: Self = Self(1 << 23);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpcodeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Status register effect of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SrUpdate {
    #[default]
    None,
    Nz,
    NczPsr,
    Ncz,
    Nczv,
}

/// Where a word ISA keeps its discriminant bits.
#[derive(Debug, Clone, Copy)]
pub struct Discriminant {
    pub shift: u32,
    pub width: u32,
}

impl Discriminant {
    pub fn key(&self, word: u32) -> usize {
        ((word >> self.shift) & ((1 << self.width) - 1)) as usize
    }

    pub fn num_buckets(&self) -> usize {
        1 << self.width
    }
}

/// A 32-bit instruction template.
#[derive(Debug, Clone)]
pub struct Opcode<K: 'static> {
    pub name: String,
    pub mnemonic: String,
    pub variant: String,
    pub mask: u32,
    pub value: u32,
    pub fields: Vec<K>,
    pub flags: OpcodeFlags,
    /// Bytes accessed by a load or store, 0 otherwise.
    pub mem_width: u8,
    pub sr_update: SrUpdate,
    discriminant: Discriminant,
    clash: u32,
}

impl<K: FieldKind> Opcode<K> {
    /// Creates a template from `(mask, value, pos)` triples of fixed bits.
    pub fn new(
        mnemonic: &str,
        variant: &str,
        bits: &[(u32, u32, u32)],
        fields: Vec<K>,
        flags: OpcodeFlags,
        discriminant: Discriminant,
    ) -> Self {
        let mut mask = 0u32;
        let mut value = 0u32;
        let mut clash = 0u32;
        for &(m, v, pos) in bits {
            let m = m << pos;
            clash |= mask & m;
            mask |= m;
            value |= (v << pos) & m;
        }
        let name = if variant.is_empty() {
            mnemonic.to_string()
        } else {
            format!("{}_{}", mnemonic, variant)
        };
        Self {
            name,
            mnemonic: mnemonic.to_string(),
            variant: variant.to_string(),
            mask,
            value,
            fields,
            flags,
            mem_width: 0,
            sr_update: SrUpdate::None,
            discriminant,
            clash,
        }
    }

    pub fn matches(&self, word: u32) -> bool {
        word & self.mask == self.value
    }

    /// Builds the instruction word from one value per field.
    pub fn assemble(&self, operands: &[i64]) -> Result<u32, AsmError> {
        if operands.len() != self.fields.len() {
            return Err(AsmError::syntax(format!(
                "{} expects {} operands, got {}",
                self.name,
                self.fields.len(),
                operands.len()
            )));
        }
        let mut word = self.value;
        for (&kind, &value) in self.fields.iter().zip(operands) {
            let pieces = codec::encode(kind, value).map_err(|source| AsmError::EncodingRange {
                mnemonic: self.name.clone(),
                source,
            })?;
            for p in pieces {
                word |= (p.bits & p.mask) << p.pos;
            }
        }
        Ok(word)
    }

    /// Extracts one value per field from a word this template matches.
    pub fn disassemble(&self, word: u32) -> Vec<i64> {
        self.fields
            .iter()
            .map(|k| codec::decode(k.ranges(), word))
            .collect()
    }
}

impl<K: FieldKind> Template for Opcode<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn bucket_keys(&self) -> Vec<usize> {
        let d = self.discriminant;
        let dmask = ((1u32 << d.width) - 1) << d.shift;
        (0..d.num_buckets())
            .filter(|&k| ((k as u32) << d.shift ^ self.value) & self.mask & dmask == 0)
            .collect()
    }

    fn overlaps(&self, other: &Self) -> bool {
        let m = self.mask & other.mask;
        self.value & m == other.value & m
    }

    fn check_coverage(&self) -> Result<(), CatalogError> {
        let mut covered = self.mask;
        let mut twice = self.clash;
        for kind in &self.fields {
            for r in kind.ranges() {
                let m = r.mask();
                twice |= covered & m;
                covered |= m;
            }
        }
        if twice != 0 {
            return Err(CatalogError::Overlap {
                name: self.name.clone(),
                bits: twice,
            });
        }
        if covered != u32::MAX {
            return Err(CatalogError::Gap {
                name: self.name.clone(),
                bits: !covered,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BitRange, Modifier};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum F {
        Low16,
        High8,
    }

    impl FieldKind for F {
        fn ranges(self) -> &'static [BitRange] {
            match self {
                F::Low16 => ranges![(Modifier::Verbatim, 16, 0)],
                F::High8 => ranges![(Modifier::Signed, 8, 16)],
            }
        }
    }

    const D: Discriminant = Discriminant { shift: 24, width: 8 };

    fn two_fields(name: &str, fixed: &[(u32, u32, u32)], flags: OpcodeFlags) -> Opcode<F> {
        Opcode::new(name, "", fixed, vec![F::High8, F::Low16], flags, D)
    }

    #[test]
    fn assemble_disassemble() {
        let fields = vec![F::High8, F::Low16];
        let op = Opcode::new("op", "x", &[(0xff, 0x12, 24)], fields, OpcodeFlags::ALU, D);
        assert_eq!(op.name, "op_x");
        let w = op.assemble(&[-1, 0xbeef]).unwrap();
        assert_eq!(w, 0x12ff_beef);
        assert!(op.matches(w));
        assert_eq!(op.disassemble(w), vec![-1, 0xbeef]);
        assert_eq!(op.bucket_keys(), vec![0x12]);
        assert!(op.check_coverage().is_ok());
    }

    #[test]
    fn operand_errors() {
        let op = two_fields("op", &[(0xff, 0x12, 24)], OpcodeFlags::ALU);
        assert!(matches!(op.assemble(&[1]), Err(AsmError::Syntax(_))));
        assert!(matches!(
            op.assemble(&[128, 0]),
            Err(AsmError::EncodingRange { .. })
        ));
    }

    #[test]
    fn coverage_errors() {
        let gap = two_fields("gap", &[(0x7f, 0x12, 24)], OpcodeFlags::NONE);
        assert_eq!(
            gap.check_coverage(),
            Err(CatalogError::Gap { name: "gap".into(), bits: 0x8000_0000 })
        );
        let twice = two_fields("twice", &[(0x1ff, 0x12, 23)], OpcodeFlags::NONE);
        assert!(matches!(twice.check_coverage(), Err(CatalogError::Overlap { .. })));
    }

    #[test]
    fn open_discriminant_bits_expand() {
        let fixed = [(0x3f, 0x12, 26), (0x3, 0, 16)];
        let op: Opcode<F> = Opcode::new("op", "", &fixed, vec![], OpcodeFlags::NONE, D);
        assert_eq!(op.bucket_keys(), vec![0x48, 0x49, 0x4a, 0x4b]);
    }
}
