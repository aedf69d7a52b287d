//! Symbolic assembler and disassembler for word oriented ISAs.
//!
//! Converts between the textual form of an instruction, a template name followed by one
//! token per operand, and an `Ins`: a template plus integer operands plus at most one
//! pending relocation. A relocation is written `expr:<kind>:<symbol>[:<addend>]`; a
//! `loc_` prefix on the kind binds the symbol in the function local scope.
//!
//! `WordIsa` bundles a catalog with the operand vocabularies and relocation kinds of an
//! architecture. It also implements the decode, modify, re-encode step of the relocation
//! engine.

use std::collections::HashMap;

use crate::catalog::{Catalog, OverlapRule};
use crate::codec::FieldKind;
use crate::error::{AsmError, CatalogError};
use crate::opcode::{Discriminant, Opcode};
use crate::utils::{parse_int, signed_hex};

/// Textual form of the values of an operand kind.
#[derive(Debug, Clone, Copy)]
pub enum Vocabulary {
    /// `names[v]`, plus extra spellings accepted when parsing.
    Names(&'static [&'static str], &'static [(&'static str, i64)]),
    Unsigned,
    Signed,
    /// Signed value shown in hex.
    SignedHex,
    /// Value shown as `<prefix>0x<hex>`.
    Hex(&'static str),
    /// Value shown as `<prefix><decimal>`.
    Prefixed(&'static str),
    /// Raw value is `(shift << imm_bits) | imm`, shown as `imm` or `imm:lsl<shift*unit>`.
    Shifted { imm_bits: u32, unit: u32 },
}

impl Vocabulary {
    pub fn symbolize(self, value: i64) -> String {
        match self {
            Vocabulary::Names(names, _) => usize::try_from(value)
                .ok()
                .and_then(|i| names.get(i))
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("{}", value)),
            Vocabulary::Unsigned | Vocabulary::Signed => value.to_string(),
            Vocabulary::SignedHex => signed_hex(value),
            Vocabulary::Hex(prefix) => format!("{}0x{:04x}", prefix, value),
            Vocabulary::Prefixed(prefix) => format!("{}{}", prefix, value),
            Vocabulary::Shifted { imm_bits, unit } => {
                let imm = value & ((1 << imm_bits) - 1);
                let shift = value >> imm_bits;
                if shift == 0 {
                    imm.to_string()
                } else {
                    format!("{}:lsl{}", imm, shift * i64::from(unit))
                }
            }
        }
    }

    pub fn unsymbolize(self, token: &str) -> Option<i64> {
        match self {
            Vocabulary::Names(names, aliases) => names
                .iter()
                .position(|n| *n == token)
                .map(|i| i as i64)
                .or_else(|| aliases.iter().find(|(n, _)| *n == token).map(|&(_, v)| v)),
            Vocabulary::Unsigned | Vocabulary::Signed | Vocabulary::SignedHex => parse_int(token),
            Vocabulary::Hex(prefix) | Vocabulary::Prefixed(prefix) => {
                parse_int(token.strip_prefix(prefix).unwrap_or(token))
            }
            Vocabulary::Shifted { imm_bits, unit } => {
                let limit = 1i64 << imm_bits;
                if let Some((imm, amount)) = token.split_once(":lsl") {
                    let imm = parse_int(imm)?;
                    let amount = parse_int(amount)?;
                    if !(0..limit).contains(&imm) || amount < 0 || amount % i64::from(unit) != 0 {
                        return None;
                    }
                    return Some(((amount / i64::from(unit)) << imm_bits) | imm);
                }
                let v = parse_int(token)?;
                if v < 0 {
                    return None;
                }
                // pick the smallest shift that represents the value exactly
                (0..8u32)
                    .map(|shift| (shift, shift * unit))
                    .take_while(|&(_, bits)| bits < 63)
                    .find_map(|(shift, bits)| {
                        let imm = v >> bits;
                        (imm < limit && imm << bits == v)
                            .then_some((i64::from(shift) << imm_bits) | imm)
                    })
            }
        }
    }
}

/// A field kind that also knows its textual form.
pub trait Symbolic: FieldKind {
    fn vocabulary(self) -> Vocabulary;
}

/// A relocation kind accepted in `expr:` operands.
#[derive(Debug, Clone, Copy)]
pub struct RelocKind {
    pub name: &'static str,
    pub r_type: u32,
    /// The symbol is always function local (branches to labels).
    pub implies_local: bool,
    /// An instruction using this kind. The relocated operand of the sample fixes
    /// the field the kind patches. Data-only kinds have none.
    pub sample: Option<&'static str>,
}

/// A relocation attached to one operand of an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsReloc {
    pub r_type: u32,
    pub pos: usize,
    pub symbol: String,
    pub is_local: bool,
    pub addend: i64,
}

/// An instruction: template, operands and an optional pending relocation.
///
/// The operand at the relocation position holds a zero placeholder.
#[derive(Debug, Clone)]
pub struct Ins<'c, K: 'static> {
    pub opcode: &'c Opcode<K>,
    pub operands: Vec<i64>,
    pub reloc: Option<InsReloc>,
}

impl<K: 'static> PartialEq for Ins<'_, K> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.opcode, other.opcode)
            && self.operands == other.operands
            && self.reloc == other.reloc
    }
}

/// Parses `expr:<kind>:<symbol>[:<addend>]` into `(kind, symbol, addend)`.
pub fn parse_expr(token: &str) -> Result<(&str, &str, i64), AsmError> {
    let bad = || AsmError::syntax(format!("malformed relocation expression {}", token));
    let rest = token.strip_prefix("expr:").ok_or_else(bad)?;
    let mut parts = rest.split(':');
    let kind = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;
    let symbol = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;
    let addend = match parts.next() {
        Some(a) => parse_int(a).ok_or_else(bad)?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok((kind, symbol, addend))
}

/// Looks up a relocation kind by name, honoring the `loc_` prefix.
///
/// Returns the kind and whether the symbol is local.
pub fn lookup_reloc<'r>(
    relocs: &'r [RelocKind],
    name: &str,
) -> Result<(&'r RelocKind, bool), AsmError> {
    let (base, forced_local) = match name.strip_prefix("loc_") {
        Some(base) => (base, true),
        None => (name, false),
    };
    let kind = relocs
        .iter()
        .find(|k| k.name == base)
        .ok_or_else(|| AsmError::syntax(format!("unknown relocation kind {}", name)))?;
    Ok((kind, forced_local || kind.implies_local))
}

/// Formats a relocation operand so that `parse_expr` and `lookup_reloc` read it back.
pub fn format_expr(kind: &RelocKind, symbol: &str, is_local: bool, addend: i64) -> String {
    let loc = if is_local && !kind.implies_local { "loc_" } else { "" };
    if addend == 0 {
        format!("expr:{}{}:{}", loc, kind.name, symbol)
    } else {
        format!("expr:{}{}:{}:{}", loc, kind.name, symbol, addend)
    }
}

/// Catalog, vocabularies and relocation kinds of a 32-bit word ISA.
pub struct WordIsa<K: 'static> {
    pub catalog: Catalog<Opcode<K>>,
    discriminant: Discriminant,
    relocs: &'static [RelocKind],
    reloc_fields: HashMap<u32, K>,
    implicit_first: Option<(K, &'static str)>,
}

impl<K: Symbolic> WordIsa<K> {
    /// Builds the catalog and learns the relocated field of each relocation kind
    /// from its sample instruction.
    ///
    /// `implicit_first` names a leading operand that may be left out, along with the
    /// token to supply for it (the A32 "always" predicate).
    pub fn new(
        templates: Vec<Opcode<K>>,
        discriminant: Discriminant,
        rules: &[OverlapRule<Opcode<K>>],
        relocs: &'static [RelocKind],
        implicit_first: Option<(K, &'static str)>,
    ) -> Result<Self, CatalogError> {
        let catalog = Catalog::build(templates, discriminant.num_buckets(), rules)?;
        let mut isa = Self {
            catalog,
            discriminant,
            relocs,
            reloc_fields: HashMap::new(),
            implicit_first,
        };
        for kind in relocs {
            let Some(sample) = kind.sample else { continue };
            let fail = |reason: String| CatalogError::RelocSample {
                kind: kind.name.to_string(),
                reason,
            };
            let tokens: Vec<&str> = sample.split_whitespace().collect();
            let (mnemonic, operands) = tokens
                .split_first()
                .ok_or_else(|| fail("empty sample".to_string()))?;
            let ins = isa
                .parse(mnemonic, operands, false)
                .map_err(|e| fail(e.to_string()))?;
            let reloc = ins
                .reloc
                .as_ref()
                .filter(|r| r.r_type == kind.r_type)
                .ok_or_else(|| fail("sample carries no matching relocation".to_string()))?;
            let field = ins.opcode.fields[reloc.pos];
            isa.assemble(&ins).map_err(|e| fail(e.to_string()))?;
            isa.reloc_fields.insert(kind.r_type, field);
        }
        Ok(isa)
    }

    pub fn relocs(&self) -> &'static [RelocKind] {
        self.relocs
    }

    pub fn reloc_kind(&self, r_type: u32) -> Option<&'static RelocKind> {
        self.relocs.iter().find(|k| k.r_type == r_type)
    }

    /// The field a relocation type patches, if it patches instructions.
    pub fn reloc_field(&self, r_type: u32) -> Option<K> {
        self.reloc_fields.get(&r_type).copied()
    }

    pub fn find_opcode(&self, word: u32) -> Option<&Opcode<K>> {
        self.catalog
            .find(self.discriminant.key(word), |op| op.matches(word))
    }

    pub fn disassemble(&self, word: u32) -> Option<Ins<'_, K>> {
        let opcode = self.find_opcode(word)?;
        Some(Ins {
            opcode,
            operands: opcode.disassemble(word),
            reloc: None,
        })
    }

    /// Encodes an instruction; a relocated operand contributes its placeholder.
    pub fn assemble(&self, ins: &Ins<'_, K>) -> Result<u32, AsmError> {
        ins.opcode.assemble(&ins.operands)
    }

    /// Parses a template name and operand tokens.
    pub fn ins_from_symbolized(
        &self,
        mnemonic: &str,
        tokens: &[&str],
    ) -> Result<Ins<'_, K>, AsmError> {
        self.parse(mnemonic, tokens, true)
    }

    fn parse(
        &self,
        mnemonic: &str,
        tokens: &[&str],
        check_reloc: bool,
    ) -> Result<Ins<'_, K>, AsmError> {
        let opcode = self
            .catalog
            .get(mnemonic)
            .ok_or_else(|| AsmError::syntax(format!("unknown opcode {}", mnemonic)))?;
        let mut all: Vec<&str> = Vec::with_capacity(opcode.fields.len());
        if let Some((kind, token)) = self.implicit_first {
            if opcode.fields.first() == Some(&kind) && tokens.len() + 1 == opcode.fields.len() {
                all.push(token);
            }
        }
        all.extend_from_slice(tokens);
        if all.len() != opcode.fields.len() {
            return Err(AsmError::syntax(format!(
                "{} expects {} operands, got {}",
                opcode.name,
                opcode.fields.len(),
                tokens.len()
            )));
        }
        let mut operands = Vec::with_capacity(all.len());
        let mut reloc = None;
        for (pos, (&token, &kind)) in all.iter().zip(&opcode.fields).enumerate() {
            if token.starts_with("expr:") {
                if reloc.is_some() {
                    return Err(AsmError::syntax("at most one relocation per instruction"));
                }
                let (name, symbol, addend) = parse_expr(token)?;
                let (rk, is_local) = lookup_reloc(self.relocs, name)?;
                if check_reloc && self.reloc_fields.get(&rk.r_type) != Some(&kind) {
                    return Err(AsmError::syntax(format!(
                        "relocation {} cannot patch operand {} of {}",
                        rk.name, pos, opcode.name
                    )));
                }
                reloc = Some(InsReloc {
                    r_type: rk.r_type,
                    pos,
                    symbol: symbol.to_string(),
                    is_local,
                    addend,
                });
                operands.push(0);
                continue;
            }
            let value = kind.vocabulary().unsymbolize(token).ok_or_else(|| {
                AsmError::syntax(format!("bad operand {} for {:?} in {}", token, kind, opcode.name))
            })?;
            operands.push(value);
        }
        Ok(Ins {
            opcode,
            operands,
            reloc,
        })
    }

    /// Renders an instruction as template name and operand tokens.
    pub fn ins_symbolize(&self, ins: &Ins<'_, K>) -> (String, Vec<String>) {
        let ops = ins
            .opcode
            .fields
            .iter()
            .zip(&ins.operands)
            .enumerate()
            .map(|(pos, (&kind, &value))| match &ins.reloc {
                Some(r) if r.pos == pos => match self.reloc_kind(r.r_type) {
                    Some(rk) => format_expr(rk, &r.symbol, r.is_local, r.addend),
                    None => format!("expr:{}:{}", r.r_type, r.symbol),
                },
                _ => kind.vocabulary().symbolize(value),
            })
            .collect();
        (ins.opcode.name.clone(), ops)
    }

    /// Attaches a pending relocation to a decoded instruction, for listings.
    pub fn attach_reloc(&self, ins: &mut Ins<'_, K>, reloc: InsReloc) -> bool {
        let Some(field) = self.reloc_field(reloc.r_type) else {
            return false;
        };
        match ins.opcode.fields.iter().position(|&f| f == field) {
            Some(pos) => {
                ins.reloc = Some(InsReloc { pos, ..reloc });
                true
            }
            None => false,
        }
    }

    /// Decodes `word`, replaces the operand a relocation of type `r_type` patches with
    /// `value` and encodes the result.
    pub fn patch(&self, r_type: u32, word: u32, value: i64) -> Result<u32, AsmError> {
        let field = self
            .reloc_field(r_type)
            .ok_or_else(|| {
                AsmError::syntax(format!(
                    "relocation type {} does not patch instructions",
                    r_type
                ))
            })?;
        let opcode = self
            .find_opcode(word)
            .ok_or_else(|| {
                AsmError::syntax(format!("cannot decode {:#010x} for relocation", word))
            })?;
        let pos = opcode
            .fields
            .iter()
            .position(|&f| f == field)
            .ok_or_else(|| {
                AsmError::syntax(format!("{} has no {:?} operand", opcode.name, field))
            })?;
        let mut operands = opcode.disassemble(word);
        operands[pos] = value;
        opcode.assemble(&operands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifted_immediates_are_lossless() {
        let v = Vocabulary::Shifted { imm_bits: 16, unit: 16 };
        assert_eq!(v.unsymbolize("93"), Some(93));
        assert_eq!(v.unsymbolize("0x12340000"), Some((1 << 16) | 0x1234));
        assert_eq!(v.unsymbolize("0x1234:lsl16"), Some((1 << 16) | 0x1234));
        assert_eq!(v.unsymbolize("0:lsl32"), Some(2 << 16));
        assert_eq!(v.symbolize(2 << 16), "0:lsl32");
        assert_eq!(v.symbolize((1 << 16) | 0x1234), "4660:lsl16");
        assert_eq!(v.unsymbolize("0x12345"), None);
        assert_eq!(v.unsymbolize("-1"), None);
    }

    #[test]
    fn names_and_aliases() {
        let v = Vocabulary::Names(&["r0", "r1", "sp"], &[("r2", 2)]);
        assert_eq!(v.unsymbolize("sp"), Some(2));
        assert_eq!(v.unsymbolize("r2"), Some(2));
        assert_eq!(v.unsymbolize("r3"), None);
        assert_eq!(v.symbolize(2), "sp");
        assert_eq!(Vocabulary::Hex("reglist:").symbolize(0x4010), "reglist:0x4010");
        assert_eq!(Vocabulary::Hex("reglist:").unsymbolize("reglist:0x4010"), Some(0x4010));
        assert_eq!(Vocabulary::Prefixed("regrange:").unsymbolize("regrange:4"), Some(4));
    }

    #[test]
    fn relocation_expressions() {
        assert_eq!(parse_expr("expr:call:main").unwrap(), ("call", "main", 0));
        assert_eq!(parse_expr("expr:movw_abs_nc:tab:-8").unwrap(), ("movw_abs_nc", "tab", -8));
        assert!(parse_expr("expr:call").is_err());
        assert!(parse_expr("expr:call:a:1:2").is_err());
        assert!(parse_expr("expr:call:a:zz").is_err());

        const KINDS: &[RelocKind] = &[
            RelocKind { name: "jump", r_type: 1, implies_local: true, sample: None },
            RelocKind { name: "abs", r_type: 2, implies_local: false, sample: None },
        ];
        let (k, local) = lookup_reloc(KINDS, "jump").unwrap();
        assert_eq!((k.r_type, local), (1, true));
        let (k, local) = lookup_reloc(KINDS, "loc_abs").unwrap();
        assert_eq!((k.r_type, local), (2, true));
        assert!(!lookup_reloc(KINDS, "abs").unwrap().1);
        assert!(lookup_reloc(KINDS, "nope").is_err());
        assert_eq!(format_expr(&KINDS[0], "l1", true, 0), "expr:jump:l1");
        assert_eq!(format_expr(&KINDS[1], "x", true, 4), "expr:loc_abs:x:4");
    }
}
