//! x86_64 Architecture backend.
//!
//! Implements the `Architecture` trait for 64-bit x86 systems (ELF64).
//!
//! x86-64 instructions are variable length, so templates are byte patterns rather than
//! words: an optional legacy prefix (`66`, `f2`, `f3`), an optional REX prefix, then the
//! opcode bytes, ModRM, SIB, displacement and immediate. A template records whether it
//! needs REX.W; the other REX bits are derived from the register operands.
//!
//! Every instruction with a memory operand is expanded into eight templates, one per
//! addressing form, registered most specific first:
//!
//! | suffix       | operands                       | encoding                      |
//! |--------------|--------------------------------|-------------------------------|
//! | `_nobase`    | index scale disp32             | mod=00 rm=100, SIB base=101   |
//! | `_sib`       | base index scale               | mod=00 rm=100                 |
//! | `_rip`       | rip disp32                     | mod=00 rm=101                 |
//! | (none)       | base                           | mod=00                        |
//! | `_sib_off8`  | base index scale disp8         | mod=01 rm=100                 |
//! | `_off8`      | base disp8                     | mod=01                        |
//! | `_sib_off32` | base index scale disp32        | mod=10 rm=100                 |
//! | `_off32`     | base disp32                    | mod=10                        |
//!
//! Decoding only accepts the canonical encoding of an instruction, the one the assembler
//! itself would produce: bytes with a redundant REX prefix do not decode.

use object::elf;

use super::{write_le, Architecture, Decoded, Encoded, PendingReloc};
use crate::catalog::{Catalog, OverlapRule, Template};
use crate::codec::RangeError;
use crate::error::{AsmError, CatalogError};
use crate::opcode::OpcodeFlags;
use crate::symbolic::{format_expr, lookup_reloc, parse_expr, InsReloc, RelocKind, Vocabulary};

/// rexw(1) | prefix(2) | escape(1) | opcode byte(8)
const NUM_BUCKETS: usize = 1 << 12;

/// Longest instruction the decoder looks at.
const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Recommended multi-byte nops, indexed by length.
const NOPS: [&[u8]; 10] = [
    &[],
    &[0x90],
    &[0x66, 0x90],
    &[0x0f, 0x1f, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

const REX_W: u8 = 0x48;
const REX_R: u8 = 0x44;
const REX_X: u8 = 0x42;
const REX_B: u8 = 0x41;

/// Operand kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X64Field {
    /// ModRM.reg
    Reg8,
    Reg16,
    Reg32,
    Reg64,
    Xreg,
    /// ModRM.rm, register direct
    Rm8,
    Rm16,
    Rm32,
    Rm64,
    RmXreg,
    /// Low three bits of the opcode byte
    Op8,
    Op16,
    Op32,
    Op64,
    /// ModRM.rm as base register of a memory operand
    Base,
    /// Implicit base of rip relative operands
    Rip,
    SibBase,
    /// Index register; `noindex` (4) means none
    SibIndex,
    /// Log2 of the index scale
    SibScale,
    Off8,
    Off32,
    Imm8,
    Imm16,
    Imm32,
    Imm64,
    /// Immediates sign extended to a wider operand
    Simm8,
    Simm32,
    Pcrel8,
    Pcrel32,
}

#[derive(Clone, Copy)]
enum Slot {
    ModrmReg,
    ModrmRm,
    OpByte,
    SibBase,
    SibIndex,
    SibScale,
    Offset(usize),
    Imm(usize),
    Implicit,
}

impl X64Field {
    fn slot(self) -> Slot {
        use X64Field::*;
        match self {
            Reg8 | Reg16 | Reg32 | Reg64 | Xreg => Slot::ModrmReg,
            Rm8 | Rm16 | Rm32 | Rm64 | RmXreg | Base => Slot::ModrmRm,
            Op8 | Op16 | Op32 | Op64 => Slot::OpByte,
            Rip => Slot::Implicit,
            SibBase => Slot::SibBase,
            SibIndex => Slot::SibIndex,
            SibScale => Slot::SibScale,
            Off8 => Slot::Offset(1),
            Off32 => Slot::Offset(4),
            Imm8 | Simm8 | Pcrel8 => Slot::Imm(1),
            Imm16 => Slot::Imm(2),
            Imm32 | Simm32 | Pcrel32 => Slot::Imm(4),
            Imm64 => Slot::Imm(8),
        }
    }

    /// Inclusive range of accepted values. Plain immediates take both the signed and
    /// the unsigned reading of their bytes.
    fn range(self) -> (i64, i64) {
        use X64Field::*;
        match self {
            Rip => (0, 0),
            SibScale => (0, 3),
            Off8 | Simm8 | Pcrel8 => (-0x80, 0x7f),
            Off32 | Simm32 | Pcrel32 => (i64::from(i32::MIN), i64::from(i32::MAX)),
            Imm8 => (-0x80, 0xff),
            Imm16 => (-0x8000, 0xffff),
            Imm32 => (i64::from(i32::MIN), i64::from(u32::MAX)),
            Imm64 => (i64::MIN, i64::MAX),
            _ => (0, 15),
        }
    }

    /// Byte registers 4..7 mean spl..dil only with a REX prefix.
    fn is_byte_reg(self) -> bool {
        matches!(self, X64Field::Reg8 | X64Field::Rm8 | X64Field::Op8)
    }

    pub fn vocabulary(self) -> Vocabulary {
        use X64Field::*;
        match self {
            Reg8 | Rm8 | Op8 => Vocabulary::Names(REG8, &[]),
            Reg16 | Rm16 | Op16 => Vocabulary::Names(REG16, &[]),
            Reg32 | Rm32 | Op32 => Vocabulary::Names(REG32, &[]),
            Reg64 | Rm64 | Op64 | Base | SibBase => Vocabulary::Names(REG64, &[]),
            Xreg | RmXreg => Vocabulary::Names(XREGS, &[]),
            SibIndex => Vocabulary::Names(INDEX_REGS, &[]),
            Rip => Vocabulary::Names(&["rip"], &[]),
            SibScale => Vocabulary::Unsigned,
            Off8 | Off32 | Pcrel8 | Pcrel32 => Vocabulary::Signed,
            Imm8 | Imm16 | Imm32 | Imm64 | Simm8 | Simm32 => Vocabulary::SignedHex,
        }
    }
}

const REG8: &[&str] = &[
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];

const REG16: &[&str] = &[
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];

const REG32: &[&str] = &[
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];

const REG64: &[&str] = &[
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

const INDEX_REGS: &[&str] = &[
    "rax", "rcx", "rdx", "rbx", "noindex", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

const XREGS: &[&str] = &[
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

/// Addressing form of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemForm {
    NoBase,
    Sib,
    Rip,
    Plain,
    SibOff8,
    Off8,
    SibOff32,
    Off32,
}

impl MemForm {
    /// Registration order, most specific first.
    const ALL: [MemForm; 8] = [
        MemForm::NoBase,
        MemForm::Sib,
        MemForm::Rip,
        MemForm::Plain,
        MemForm::SibOff8,
        MemForm::Off8,
        MemForm::SibOff32,
        MemForm::Off32,
    ];

    fn suffix(self) -> &'static str {
        match self {
            MemForm::NoBase => "_nobase",
            MemForm::Sib => "_sib",
            MemForm::Rip => "_rip",
            MemForm::Plain => "",
            MemForm::SibOff8 => "_sib_off8",
            MemForm::Off8 => "_off8",
            MemForm::SibOff32 => "_sib_off32",
            MemForm::Off32 => "_off32",
        }
    }

    fn modrm_mod(self) -> u8 {
        match self {
            MemForm::NoBase | MemForm::Sib | MemForm::Rip | MemForm::Plain => 0,
            MemForm::SibOff8 | MemForm::Off8 => 1,
            MemForm::SibOff32 | MemForm::Off32 => 2,
        }
    }

    fn has_sib(self) -> bool {
        matches!(self, MemForm::NoBase | MemForm::Sib | MemForm::SibOff8 | MemForm::SibOff32)
    }

    fn fields(self) -> &'static [X64Field] {
        use X64Field::*;
        match self {
            MemForm::NoBase => &[SibIndex, SibScale, Off32],
            MemForm::Sib => &[SibBase, SibIndex, SibScale],
            MemForm::Rip => &[Rip, Off32],
            MemForm::Plain => &[Base],
            MemForm::SibOff8 => &[SibBase, SibIndex, SibScale, Off8],
            MemForm::Off8 => &[Base, Off8],
            MemForm::SibOff32 => &[SibBase, SibIndex, SibScale, Off32],
            MemForm::Off32 => &[Base, Off32],
        }
    }

    fn displacement(self) -> usize {
        match self {
            MemForm::Sib | MemForm::Plain => 0,
            MemForm::SibOff8 | MemForm::Off8 => 1,
            MemForm::NoBase | MemForm::Rip | MemForm::SibOff32 | MemForm::Off32 => 4,
        }
    }
}

/// Operand roles used while building templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arg {
    Reg(X64Field),
    Rm(X64Field),
    Mem,
    OpReg(X64Field),
    Imm(X64Field),
    Rel(X64Field),
}

/// Prefixes and opcode bytes of a template under construction.
#[derive(Debug, Clone, Copy)]
struct Enc {
    prefix: Option<u8>,
    rexw: bool,
    opcode: [u8; 3],
    len: usize,
    ext: Option<u8>,
}

impl Enc {
    fn new(opcode: &[u8]) -> Self {
        let mut bytes = [0u8; 3];
        bytes[..opcode.len()].copy_from_slice(opcode);
        Self {
            prefix: None,
            rexw: false,
            opcode: bytes,
            len: opcode.len(),
            ext: None,
        }
    }

    fn width(mut self, w: &Width) -> Self {
        self.prefix = w.prefix;
        self.rexw = w.rexw;
        self
    }

    fn prefix(mut self, prefix: u8) -> Self {
        self.prefix = Some(prefix);
        self
    }

    fn rexw(mut self, rexw: bool) -> Self {
        self.rexw = rexw;
        self
    }

    /// ModRM.reg holds an opcode extension.
    fn ext(mut self, ext: u8) -> Self {
        self.ext = Some(ext);
        self
    }
}

/// An x86-64 instruction template.
#[derive(Debug, Clone)]
pub struct X64Opcode {
    pub name: String,
    pub mnemonic: String,
    /// Operand width and shape, e.g. `32_rm`.
    pub form: String,
    pub mem: Option<MemForm>,
    pub prefix: Option<u8>,
    pub rexw: bool,
    pub fields: Vec<X64Field>,
    pub flags: OpcodeFlags,
    pub mem_width: u8,
    /// Bytes following the prefixes.
    bytes: Vec<u8>,
    mask: Vec<u8>,
    modrm: Option<usize>,
    sib: Option<usize>,
    opbyte: Option<usize>,
    offset: Option<usize>,
    imm: Option<usize>,
}

fn prefix_index(prefix: Option<u8>) -> usize {
    match prefix {
        None => 0,
        Some(0x66) => 1,
        Some(0xf2) => 2,
        _ => 3,
    }
}

impl X64Opcode {
    fn build(
        mnemonic: &str,
        form: &str,
        enc: Enc,
        args: &[Arg],
        mem: Option<MemForm>,
        flags: OpcodeFlags,
        mem_width: u8,
    ) -> Self {
        let mut bytes = Vec::with_capacity(MAX_INSTRUCTION_LENGTH);
        let mut mask = Vec::with_capacity(MAX_INSTRUCTION_LENGTH);
        let opreg = args.iter().any(|a| matches!(a, Arg::OpReg(_)));
        for (i, &b) in enc.opcode[..enc.len].iter().enumerate() {
            bytes.push(b);
            mask.push(if opreg && i + 1 == enc.len { 0xf8 } else { 0xff });
        }
        let opbyte = opreg.then(|| enc.len - 1);

        let (mut modrm, mut sib, mut offset, mut imm) = (None, None, None, None);
        let wants_modrm = enc.ext.is_some()
            || args.iter().any(|a| matches!(a, Arg::Reg(_) | Arg::Rm(_) | Arg::Mem));
        if wants_modrm {
            let (mut m, mut v) = (0xc0u8, 0xc0u8);
            if let Some(ext) = enc.ext {
                m |= 0x38;
                v |= ext << 3;
            }
            if let Some(f) = mem {
                v = (v & 0x3f) | f.modrm_mod() << 6;
                if f.has_sib() {
                    m |= 0x07;
                    v |= 0x04;
                } else if f == MemForm::Rip {
                    m |= 0x07;
                    v |= 0x05;
                }
            }
            modrm = Some(bytes.len());
            bytes.push(v);
            mask.push(m);
            if let Some(f) = mem {
                if f.has_sib() {
                    sib = Some(bytes.len());
                    if f == MemForm::NoBase {
                        bytes.push(0x05);
                        mask.push(0x07);
                    } else {
                        bytes.push(0);
                        mask.push(0);
                    }
                }
                if f.displacement() > 0 {
                    offset = Some(bytes.len());
                    bytes.extend(std::iter::repeat(0).take(f.displacement()));
                    mask.extend(std::iter::repeat(0).take(f.displacement()));
                }
            }
        }

        let mut fields = Vec::with_capacity(args.len() + 3);
        for &arg in args {
            match arg {
                Arg::Reg(k) | Arg::Rm(k) | Arg::OpReg(k) => fields.push(k),
                Arg::Imm(k) | Arg::Rel(k) => {
                    if let Slot::Imm(n) = k.slot() {
                        imm = Some(bytes.len());
                        bytes.extend(std::iter::repeat(0).take(n));
                        mask.extend(std::iter::repeat(0).take(n));
                    }
                    fields.push(k);
                }
                Arg::Mem => {
                    if let Some(f) = mem {
                        fields.extend_from_slice(f.fields());
                    }
                }
            }
        }

        let suffix = mem.map_or("", MemForm::suffix);
        let name = if form.is_empty() {
            format!("{}{}", mnemonic, suffix)
        } else {
            format!("{}_{}{}", mnemonic, form, suffix)
        };
        Self {
            name,
            mnemonic: mnemonic.to_string(),
            form: form.to_string(),
            mem,
            prefix: enc.prefix,
            rexw: enc.rexw,
            fields,
            flags,
            mem_width: if mem.is_some() { mem_width } else { 0 },
            bytes,
            mask,
            modrm,
            sib,
            opbyte,
            offset,
            imm,
        }
    }

    /// Length in bytes, excluding prefixes.
    pub fn body_len(&self) -> usize {
        self.bytes.len()
    }

    fn matches(&self, body: &[u8]) -> bool {
        body.len() >= self.bytes.len()
            && self
                .bytes
                .iter()
                .zip(&self.mask)
                .zip(body)
                .all(|((&b, &m), &d)| d & m == b)
    }

    /// Byte position within the body and the bits a field occupies there.
    fn field_bits(&self, kind: X64Field) -> Option<Vec<(usize, u8)>> {
        let bytes =
            |pos: Option<usize>, n: usize| pos.map(|p| (p..p + n).map(|i| (i, 0xff)).collect());
        match kind.slot() {
            Slot::ModrmReg => self.modrm.map(|p| vec![(p, 0x38)]),
            Slot::ModrmRm => self.modrm.map(|p| vec![(p, 0x07)]),
            Slot::OpByte => self.opbyte.map(|p| vec![(p, 0x07)]),
            Slot::SibBase => self.sib.map(|p| vec![(p, 0x07)]),
            Slot::SibIndex => self.sib.map(|p| vec![(p, 0x38)]),
            Slot::SibScale => self.sib.map(|p| vec![(p, 0xc0)]),
            Slot::Offset(n) => bytes(self.offset, n),
            Slot::Imm(n) => bytes(self.imm, n),
            Slot::Implicit => Some(Vec::new()),
        }
    }

    /// Position within the body of a displacement or immediate operand.
    fn byte_field_pos(&self, kind: X64Field) -> Option<usize> {
        match kind.slot() {
            Slot::Offset(_) => self.offset,
            Slot::Imm(_) => self.imm,
            _ => None,
        }
    }

    /// Encodes operands into prefixes and body.
    pub fn assemble(&self, operands: &[i64]) -> Result<Vec<u8>, AsmError> {
        if operands.len() != self.fields.len() {
            return Err(AsmError::syntax(format!(
                "{} expects {} operands, got {}",
                self.name,
                self.fields.len(),
                operands.len()
            )));
        }
        let mut body = self.bytes.clone();
        let mut rex = if self.rexw { REX_W } else { 0 };
        let mut force_rex = false;
        for (&kind, &value) in self.fields.iter().zip(operands) {
            let (lo, hi) = kind.range();
            if value < lo || value > hi {
                return Err(AsmError::EncodingRange {
                    mnemonic: self.name.clone(),
                    source: RangeError {
                        field: format!("{:?}", kind),
                        value,
                    },
                });
            }
            let low = (value & 7) as u8;
            let high = value & 8 != 0;
            let mut put = |pos: Option<usize>, bits: u8| {
                if let Some(b) = pos.and_then(|p| body.get_mut(p)) {
                    *b |= bits;
                }
            };
            match kind.slot() {
                Slot::ModrmReg => {
                    put(self.modrm, low << 3);
                    if high {
                        rex |= REX_R;
                    }
                }
                Slot::ModrmRm => {
                    put(self.modrm, low);
                    if high {
                        rex |= REX_B;
                    }
                }
                Slot::OpByte => {
                    put(self.opbyte, low);
                    if high {
                        rex |= REX_B;
                    }
                }
                Slot::SibBase => {
                    put(self.sib, low);
                    if high {
                        rex |= REX_B;
                    }
                }
                Slot::SibIndex => {
                    put(self.sib, low << 3);
                    if high {
                        rex |= REX_X;
                    }
                }
                Slot::SibScale => put(self.sib, (value as u8) << 6),
                Slot::Offset(n) | Slot::Imm(n) => {
                    if let Some(p) = self.byte_field_pos(kind) {
                        if let Some(dst) = body.get_mut(p..p + n) {
                            dst.copy_from_slice(&value.to_le_bytes()[..n]);
                        }
                    }
                }
                Slot::Implicit => {}
            }
            if kind.is_byte_reg() && (4..8).contains(&value) {
                force_rex = true;
            }
        }
        let mut out = Vec::with_capacity(body.len() + 2);
        out.extend(self.prefix);
        if rex != 0 || force_rex {
            out.push(rex | 0x40);
        }
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Extracts operands from a body this template matches.
    fn disassemble(&self, body: &[u8], rex: u8) -> Vec<i64> {
        let at = |pos: Option<usize>| pos.and_then(|p| body.get(p)).copied().unwrap_or(0);
        let ext = |bit: u8| i64::from(rex & bit & 0x0f != 0) << 3;
        self.fields
            .iter()
            .map(|&kind| match kind.slot() {
                Slot::ModrmReg => i64::from(at(self.modrm) >> 3 & 7) | ext(REX_R),
                Slot::ModrmRm => i64::from(at(self.modrm) & 7) | ext(REX_B),
                Slot::OpByte => i64::from(at(self.opbyte) & 7) | ext(REX_B),
                Slot::SibBase => i64::from(at(self.sib) & 7) | ext(REX_B),
                Slot::SibIndex => i64::from(at(self.sib) >> 3 & 7) | ext(REX_X),
                Slot::SibScale => i64::from(at(self.sib) >> 6),
                Slot::Offset(n) | Slot::Imm(n) => {
                    let mut raw = [0u8; 8];
                    if let Some(src) = self.byte_field_pos(kind).and_then(|p| body.get(p..p + n)) {
                        raw[..n].copy_from_slice(src);
                    }
                    let shift = 64 - 8 * n as u32;
                    (i64::from_le_bytes(raw) << shift) >> shift
                }
                Slot::Implicit => 0,
            })
            .collect()
    }
}

impl Template for X64Opcode {
    fn name(&self) -> &str {
        &self.name
    }

    fn bucket_keys(&self) -> Vec<usize> {
        let esc = self.bytes.first() == Some(&0x0f);
        let i = usize::from(esc);
        let (Some(&b), Some(&m)) = (self.bytes.get(i), self.mask.get(i)) else {
            return Vec::new();
        };
        let base =
            usize::from(self.rexw) << 11 | prefix_index(self.prefix) << 9 | usize::from(esc) << 8;
        (0..=255u8)
            .filter(|k| (k ^ b) & m == 0)
            .map(|k| base | usize::from(k))
            .collect()
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.rexw == other.rexw
            && self.prefix == other.prefix
            && self
                .bytes
                .iter()
                .zip(&self.mask)
                .zip(other.bytes.iter().zip(&other.mask))
                .all(|((a, ma), (b, mb))| (a ^ b) & ma & mb == 0)
    }

    fn check_coverage(&self) -> Result<(), CatalogError> {
        let mut covered = self.mask.clone();
        for &kind in &self.fields {
            let bits = self.field_bits(kind).ok_or_else(|| CatalogError::Gap {
                name: format!("{} ({:?} has no slot)", self.name, kind),
                bits: 0,
            })?;
            for (pos, m) in bits {
                let Some(c) = covered.get_mut(pos) else {
                    return Err(CatalogError::Gap {
                        name: format!("{} byte {}", self.name, pos),
                        bits: u32::from(m),
                    });
                };
                if *c & m != 0 {
                    return Err(CatalogError::Overlap {
                        name: format!("{} byte {}", self.name, pos),
                        bits: u32::from(*c & m),
                    });
                }
                *c |= m;
            }
        }
        match covered.iter().position(|&c| c != 0xff) {
            Some(pos) => Err(CatalogError::Gap {
                name: format!("{} byte {}", self.name, pos),
                bits: u32::from(!covered[pos]),
            }),
            None => Ok(()),
        }
    }
}

/// Register operands of one integer width.
struct Width {
    tag: &'static str,
    bytes: u8,
    prefix: Option<u8>,
    rexw: bool,
    reg: X64Field,
    rm: X64Field,
    op: X64Field,
    /// Full width immediate; 64-bit operations take a sign extended imm32.
    imm: X64Field,
}

const W8: Width = Width {
    tag: "8",
    bytes: 1,
    prefix: None,
    rexw: false,
    reg: X64Field::Reg8,
    rm: X64Field::Rm8,
    op: X64Field::Op8,
    imm: X64Field::Imm8,
};

const W16: Width = Width {
    tag: "16",
    bytes: 2,
    prefix: Some(0x66),
    rexw: false,
    reg: X64Field::Reg16,
    rm: X64Field::Rm16,
    op: X64Field::Op16,
    imm: X64Field::Imm16,
};

const W32: Width = Width {
    tag: "32",
    bytes: 4,
    prefix: None,
    rexw: false,
    reg: X64Field::Reg32,
    rm: X64Field::Rm32,
    op: X64Field::Op32,
    imm: X64Field::Imm32,
};

const W64: Width = Width {
    tag: "64",
    bytes: 8,
    prefix: None,
    rexw: true,
    reg: X64Field::Reg64,
    rm: X64Field::Rm64,
    op: X64Field::Op64,
    imm: X64Field::Simm32,
};

const WIDTHS: [&Width; 4] = [&W8, &W16, &W32, &W64];

const CONDS: [&str; 16] = [
    "o", "no", "b", "ae", "e", "ne", "be", "a", "s", "ns", "p", "np", "l", "ge", "le", "g",
];

/// `(mnemonic, base opcode, ModRM.reg extension of the immediate forms, flags)`
const ALU_OPS: [(&str, u8, u8, OpcodeFlags); 6] = [
    ("add", 0x00, 0, OpcodeFlags::ALU),
    ("or", 0x08, 1, OpcodeFlags::ALU),
    ("and", 0x20, 4, OpcodeFlags::ALU),
    ("sub", 0x28, 5, OpcodeFlags::ALU),
    ("xor", 0x30, 6, OpcodeFlags::ALU),
    ("cmp", 0x38, 7, OpcodeFlags::TEST),
];

fn form(w: &Width, shape: &str) -> String {
    format!("{}_{}", w.tag, shape)
}

struct Table {
    ops: Vec<X64Opcode>,
}

impl Table {
    /// Registers a template, or one per addressing form if it has a memory operand.
    fn add(
        &mut self,
        mnemonic: &str,
        form: &str,
        enc: Enc,
        args: &[Arg],
        flags: OpcodeFlags,
        mem_width: u8,
    ) {
        if args.contains(&Arg::Mem) {
            for mem in MemForm::ALL {
                self.ops
                    .push(X64Opcode::build(mnemonic, form, enc, args, Some(mem), flags, mem_width));
            }
        } else {
            self.ops
                .push(X64Opcode::build(mnemonic, form, enc, args, None, flags, mem_width));
        }
    }
}

#[rustfmt::skip]
fn opcodes() -> Vec<X64Opcode> {
    use Arg::*;
    use X64Field::*;
    let load = OpcodeFlags::LOAD;
    let store = OpcodeFlags::STORE;
    let mut t = Table { ops: Vec::new() };

    for (m, base, ext, flags) in ALU_OPS {
        for w in WIDTHS {
            let wide = u8::from(w.bytes > 1);
            let mr = Enc::new(&[base | wide]).width(w);
            let rm = Enc::new(&[base | 2 | wide]).width(w);
            let mi = Enc::new(&[0x80 | wide]).width(w).ext(ext);
            t.add(m, &form(w, "rr"), mr, &[Rm(w.rm), Reg(w.reg)], flags, 0);
            t.add(m, &form(w, "mr"), mr, &[Mem, Reg(w.reg)], flags | load | store, w.bytes);
            t.add(m, &form(w, "rm"), rm, &[Reg(w.reg), Mem], flags | load, w.bytes);
            t.add(m, &form(w, "ri"), mi, &[Rm(w.rm), Imm(w.imm)], flags, 0);
            t.add(m, &form(w, "mi"), mi, &[Mem, Imm(w.imm)], flags | load | store, w.bytes);
            if w.bytes > 1 {
                let mi8 = Enc::new(&[0x83]).width(w).ext(ext);
                t.add(m, &form(w, "ri8"), mi8, &[Rm(w.rm), Imm(Simm8)], flags, 0);
                t.add(m, &form(w, "mi8"), mi8, &[Mem, Imm(Simm8)], flags | load | store, w.bytes);
            }
        }
    }

    for w in WIDTHS {
        let wide = u8::from(w.bytes > 1);
        let mr = Enc::new(&[0x88 | wide]).width(w);
        let rm = Enc::new(&[0x8a | wide]).width(w);
        let mi = Enc::new(&[0xc6 | wide]).width(w).ext(0);
        t.add("mov", &form(w, "rr"), mr, &[Rm(w.rm), Reg(w.reg)], OpcodeFlags::ALU1, 0);
        t.add("mov", &form(w, "mr"), mr, &[Mem, Reg(w.reg)], store, w.bytes);
        t.add("mov", &form(w, "rm"), rm, &[Reg(w.reg), Mem], load, w.bytes);
        t.add("mov", &form(w, "mi"), mi, &[Mem, Imm(w.imm)], store, w.bytes);
        if w.rexw {
            t.add("mov", &form(w, "ri"), mi, &[Rm(w.rm), Imm(w.imm)], OpcodeFlags::ALU1, 0);
        } else {
            let ri = Enc::new(&[0xb0 | wide << 3]).width(w);
            t.add("mov", &form(w, "ri"), ri, &[OpReg(w.op), Imm(w.imm)], OpcodeFlags::ALU1, 0);
        }
    }
    t.add("movabs", "64_ri", Enc::new(&[0xb8]).rexw(true), &[OpReg(Op64), Imm(Imm64)], OpcodeFlags::ALU1, 0);

    for w in [&W32, &W64] {
        t.add("lea", &form(w, "rm"), Enc::new(&[0x8d]).width(w), &[Reg(w.reg), Mem], OpcodeFlags::ALU1, 0);
    }

    for (m, op, src, src_rm, extend) in [
        ("movzx", 0xb6, 1, Rm8, OpcodeFlags::NONE),
        ("movzx", 0xb7, 2, Rm16, OpcodeFlags::NONE),
        ("movsx", 0xbe, 1, Rm8, OpcodeFlags::SIGNEXTEND),
        ("movsx", 0xbf, 2, Rm16, OpcodeFlags::SIGNEXTEND),
    ] {
        for w in [&W32, &W64] {
            let enc = Enc::new(&[0x0f, op]).width(w);
            let shape = format!("{}_{}", w.tag, src * 8);
            t.add(m, &format!("{}_rr", shape), enc, &[Reg(w.reg), Rm(src_rm)], OpcodeFlags::ALU1 | extend, 0);
            t.add(m, &format!("{}_rm", shape), enc, &[Reg(w.reg), Mem], load | extend, src);
        }
    }
    let movsxd = Enc::new(&[0x63]).rexw(true);
    t.add("movsxd", "64_32_rr", movsxd, &[Reg(Reg64), Rm(Rm32)], OpcodeFlags::ALU1 | OpcodeFlags::SIGNEXTEND, 0);
    t.add("movsxd", "64_32_rm", movsxd, &[Reg(Reg64), Mem], load | OpcodeFlags::SIGNEXTEND, 4);

    t.add("push", "64_r", Enc::new(&[0x50]), &[OpReg(Op64)], store, 0);
    t.add("pop", "64_r", Enc::new(&[0x58]), &[OpReg(Op64)], load, 0);
    t.add("push", "64_i8", Enc::new(&[0x6a]), &[Imm(Simm8)], store, 0);
    t.add("push", "64_i", Enc::new(&[0x68]), &[Imm(Simm32)], store, 0);
    t.add("push", "64_m", Enc::new(&[0xff]).ext(6), &[Mem], load | store, 8);
    t.add("pop", "64_m", Enc::new(&[0x8f]).ext(0), &[Mem], load | store, 8);

    for w in [&W16, &W32, &W64] {
        let rm = Enc::new(&[0x0f, 0xaf]).width(w);
        let mul = OpcodeFlags::MUL;
        t.add("imul", &form(w, "rr"), rm, &[Reg(w.reg), Rm(w.rm)], mul, 0);
        t.add("imul", &form(w, "rm"), rm, &[Reg(w.reg), Mem], mul | load, w.bytes);
        t.add("imul", &form(w, "rri"), Enc::new(&[0x69]).width(w), &[Reg(w.reg), Rm(w.rm), Imm(w.imm)], mul, 0);
        t.add("imul", &form(w, "rri8"), Enc::new(&[0x6b]).width(w), &[Reg(w.reg), Rm(w.rm), Imm(Simm8)], mul, 0);
    }

    for (m, ext, flags) in [
        ("not", 2, OpcodeFlags::ALU1),
        ("neg", 3, OpcodeFlags::ALU1),
        ("mul", 4, OpcodeFlags::MUL),
        ("div", 6, OpcodeFlags::DIV),
        ("idiv", 7, OpcodeFlags::DIV),
    ] {
        for w in WIDTHS {
            let enc = Enc::new(&[0xf6 | u8::from(w.bytes > 1)]).width(w).ext(ext);
            t.add(m, &form(w, "r"), enc, &[Rm(w.rm)], flags, 0);
            t.add(m, &form(w, "m"), enc, &[Mem], flags | load, w.bytes);
        }
    }

    for w in WIDTHS {
        let wide = u8::from(w.bytes > 1);
        let mr = Enc::new(&[0x84 | wide]).width(w);
        let mi = Enc::new(&[0xf6 | wide]).width(w).ext(0);
        let test = OpcodeFlags::TEST;
        t.add("test", &form(w, "rr"), mr, &[Rm(w.rm), Reg(w.reg)], test, 0);
        t.add("test", &form(w, "mr"), mr, &[Mem, Reg(w.reg)], test | load, w.bytes);
        t.add("test", &form(w, "ri"), mi, &[Rm(w.rm), Imm(w.imm)], test, 0);
        t.add("test", &form(w, "mi"), mi, &[Mem, Imm(w.imm)], test | load, w.bytes);
    }

    for (m, ext) in [("rol", 0), ("ror", 1), ("shl", 4), ("shr", 5), ("sar", 7)] {
        for w in WIDTHS {
            let wide = u8::from(w.bytes > 1);
            let by_imm = Enc::new(&[0xc0 | wide]).width(w).ext(ext);
            let by_cl = Enc::new(&[0xd2 | wide]).width(w).ext(ext);
            let alu = OpcodeFlags::ALU;
            t.add(m, &form(w, "ri"), by_imm, &[Rm(w.rm), Imm(Imm8)], alu, 0);
            t.add(m, &form(w, "mi"), by_imm, &[Mem, Imm(Imm8)], alu | load | store, w.bytes);
            t.add(m, &form(w, "r_cl"), by_cl, &[Rm(w.rm)], alu, 0);
            t.add(m, &form(w, "m_cl"), by_cl, &[Mem], alu | load | store, w.bytes);
        }
    }

    for (cc, name) in CONDS.iter().enumerate() {
        let cc = cc as u8;
        for w in [&W32, &W64] {
            let enc = Enc::new(&[0x0f, 0x40 | cc]).width(w);
            let cmov = format!("cmov{}", name);
            t.add(&cmov, &form(w, "rr"), enc, &[Reg(w.reg), Rm(w.rm)], OpcodeFlags::ALU1, 0);
            t.add(&cmov, &form(w, "rm"), enc, &[Reg(w.reg), Mem], load, w.bytes);
        }
        let set = format!("set{}", name);
        let enc = Enc::new(&[0x0f, 0x90 | cc]).ext(0);
        t.add(&set, "8_r", enc, &[Rm(Rm8)], OpcodeFlags::ALU1, 0);
        t.add(&set, "8_m", enc, &[Mem], store, 1);
        let jump = format!("j{}", name);
        t.add(&jump, "8", Enc::new(&[0x70 | cc]), &[Rel(Pcrel8)], OpcodeFlags::COND_BRANCH, 0);
        t.add(&jump, "32", Enc::new(&[0x0f, 0x80 | cc]), &[Rel(Pcrel32)], OpcodeFlags::COND_BRANCH, 0);
    }

    let jump = OpcodeFlags::JUMP;
    let call = OpcodeFlags::JUMP | OpcodeFlags::LINK;
    t.add("jmp", "8", Enc::new(&[0xeb]), &[Rel(Pcrel8)], jump, 0);
    t.add("jmp", "32", Enc::new(&[0xe9]), &[Rel(Pcrel32)], jump, 0);
    t.add("jmp", "64_r", Enc::new(&[0xff]).ext(4), &[Rm(Rm64)], jump, 0);
    t.add("jmp", "64_m", Enc::new(&[0xff]).ext(4), &[Mem], jump | load, 8);
    t.add("call", "32", Enc::new(&[0xe8]), &[Rel(Pcrel32)], call, 0);
    t.add("call", "64_r", Enc::new(&[0xff]).ext(2), &[Rm(Rm64)], call, 0);
    t.add("call", "64_m", Enc::new(&[0xff]).ext(2), &[Mem], call | load, 8);
    t.add("ret", "", Enc::new(&[0xc3]), &[], jump, 0);
    t.add("syscall", "", Enc::new(&[0x0f, 0x05]), &[], OpcodeFlags::SYSCALL, 0);

    let misc = OpcodeFlags::MISC;
    t.add("nop", "", Enc::new(&[0x90]), &[], misc, 0);
    t.add("nop", "16", Enc::new(&[0x90]).prefix(0x66), &[], misc, 0);
    t.add("nop", "32_m", Enc::new(&[0x0f, 0x1f]).ext(0), &[Mem], misc, 0);
    t.add("nop", "16_m", Enc::new(&[0x0f, 0x1f]).prefix(0x66).ext(0), &[Mem], misc, 0);
    t.add("ud2", "", Enc::new(&[0x0f, 0x0b]), &[], misc, 0);
    t.add("endbr64", "", Enc::new(&[0x0f, 0x1e, 0xfa]).prefix(0xf3), &[], misc, 0);
    t.add("int3", "", Enc::new(&[0xcc]), &[], misc, 0);
    t.add("cdq", "", Enc::new(&[0x99]), &[], OpcodeFlags::SIGNEXTEND, 0);
    t.add("cqo", "", Enc::new(&[0x99]).rexw(true), &[], OpcodeFlags::SIGNEXTEND, 0);

    // scalar sse
    let float = OpcodeFlags::FLOAT;
    for (suffix, prefix, width) in [("sd", 0xf2, 8), ("ss", 0xf3, 4)] {
        for (m, op) in [
            ("add", 0x58),
            ("mul", 0x59),
            ("sub", 0x5c),
            ("min", 0x5d),
            ("div", 0x5e),
            ("max", 0x5f),
            ("sqrt", 0x51),
        ] {
            let name = format!("{}{}", m, suffix);
            let enc = Enc::new(&[0x0f, op]).prefix(prefix);
            t.add(&name, "rr", enc, &[Reg(Xreg), Rm(RmXreg)], float | OpcodeFlags::ALU, 0);
            t.add(&name, "rm", enc, &[Reg(Xreg), Mem], float | OpcodeFlags::ALU | load, width);
        }
        let mov = format!("mov{}", suffix);
        let to_reg = Enc::new(&[0x0f, 0x10]).prefix(prefix);
        t.add(&mov, "rr", to_reg, &[Reg(Xreg), Rm(RmXreg)], float, 0);
        t.add(&mov, "rm", to_reg, &[Reg(Xreg), Mem], float | load, width);
        t.add(&mov, "mr", Enc::new(&[0x0f, 0x11]).prefix(prefix), &[Mem, Reg(Xreg)], float | store, width);
        for w in [&W32, &W64] {
            let from_int = format!("cvtsi2{}", suffix);
            let enc = Enc::new(&[0x0f, 0x2a]).prefix(prefix).rexw(w.rexw);
            t.add(&from_int, &form(w, "rr"), enc, &[Reg(Xreg), Rm(w.rm)], float, 0);
            t.add(&from_int, &form(w, "rm"), enc, &[Reg(Xreg), Mem], float | load, w.bytes);
            let to_int = format!("cvtt{}2si", suffix);
            let enc = Enc::new(&[0x0f, 0x2c]).prefix(prefix).rexw(w.rexw);
            t.add(&to_int, &form(w, "rr"), enc, &[Reg(w.reg), Rm(RmXreg)], float, 0);
            t.add(&to_int, &form(w, "rm"), enc, &[Reg(w.reg), Mem], float | load, width);
        }
    }
    for (m, prefix, width) in [("cvtsd2ss", 0xf2, 8), ("cvtss2sd", 0xf3, 4)] {
        let enc = Enc::new(&[0x0f, 0x5a]).prefix(prefix);
        t.add(m, "rr", enc, &[Reg(Xreg), Rm(RmXreg)], float, 0);
        t.add(m, "rm", enc, &[Reg(Xreg), Mem], float | load, width);
    }
    for (m, prefix, op, width) in [
        ("ucomisd", Some(0x66), 0x2e, 8),
        ("ucomiss", None, 0x2e, 4),
        ("comisd", Some(0x66), 0x2f, 8),
        ("comiss", None, 0x2f, 4),
    ] {
        let mut enc = Enc::new(&[0x0f, op]);
        enc.prefix = prefix;
        t.add(m, "rr", enc, &[Reg(Xreg), Rm(RmXreg)], float | OpcodeFlags::TEST, 0);
        t.add(m, "rm", enc, &[Reg(Xreg), Mem], float | OpcodeFlags::TEST | load, width);
    }
    for (m, prefix, op) in [("xorpd", Some(0x66), 0x57), ("xorps", None, 0x57), ("pxor", Some(0x66), 0xef)] {
        let mut enc = Enc::new(&[0x0f, op]);
        enc.prefix = prefix;
        t.add(m, "rr", enc, &[Reg(Xreg), Rm(RmXreg)], float | OpcodeFlags::ALU, 0);
    }
    for (m, w) in [("movd", &W32), ("movq", &W64)] {
        let to_xmm = Enc::new(&[0x0f, 0x6e]).prefix(0x66).rexw(w.rexw);
        let from_xmm = Enc::new(&[0x0f, 0x7e]).prefix(0x66).rexw(w.rexw);
        t.add(m, "xr", to_xmm, &[Reg(Xreg), Rm(w.rm)], float, 0);
        t.add(m, "rx", from_xmm, &[Rm(w.rm), Reg(Xreg)], float, 0);
    }

    t.ops
}

fn same_shape(earlier: &X64Opcode, later: &X64Opcode) -> bool {
    earlier.mnemonic == later.mnemonic && earlier.form == later.form
}

/// ModRM.rm=100 selects a SIB byte in every mode.
fn sib_before_plain(earlier: &X64Opcode, later: &X64Opcode) -> bool {
    same_shape(earlier, later)
        && matches!(
            (earlier.mem, later.mem),
            (Some(MemForm::Sib), Some(MemForm::Plain))
                | (Some(MemForm::SibOff8), Some(MemForm::Off8))
                | (Some(MemForm::SibOff32), Some(MemForm::Off32))
        )
}

/// SIB.base=101 with mod=00 means no base and a disp32.
fn nobase_before_sib(earlier: &X64Opcode, later: &X64Opcode) -> bool {
    same_shape(earlier, later)
        && earlier.mem == Some(MemForm::NoBase)
        && later.mem == Some(MemForm::Sib)
}

fn nobase_before_plain(earlier: &X64Opcode, later: &X64Opcode) -> bool {
    same_shape(earlier, later)
        && earlier.mem == Some(MemForm::NoBase)
        && later.mem == Some(MemForm::Plain)
}

/// ModRM.rm=101 with mod=00 is rip relative.
fn rip_before_plain(earlier: &X64Opcode, later: &X64Opcode) -> bool {
    same_shape(earlier, later)
        && earlier.mem == Some(MemForm::Rip)
        && later.mem == Some(MemForm::Plain)
}

fn rules() -> [OverlapRule<X64Opcode>; 4] {
    [
        OverlapRule {
            name: "sib before plain",
            allows: sib_before_plain,
        },
        OverlapRule {
            name: "nobase before sib",
            allows: nobase_before_sib,
        },
        OverlapRule {
            name: "nobase before plain",
            allows: nobase_before_plain,
        },
        OverlapRule {
            name: "rip before plain",
            allows: rip_before_plain,
        },
    ]
}

const RELOCS: &[RelocKind] = &[
    RelocKind {
        name: "pcrel8",
        r_type: elf::R_X86_64_PC8,
        implies_local: false,
        sample: None,
    },
    RelocKind {
        name: "pcrel32",
        r_type: elf::R_X86_64_PC32,
        implies_local: false,
        sample: None,
    },
    RelocKind {
        name: "abs32",
        r_type: elf::R_X86_64_32,
        implies_local: false,
        sample: None,
    },
    RelocKind {
        name: "abs32s",
        r_type: elf::R_X86_64_32S,
        implies_local: false,
        sample: None,
    },
    RelocKind {
        name: "abs64",
        r_type: elf::R_X86_64_64,
        implies_local: false,
        sample: None,
    },
];

/// Operand kinds a relocation type may patch.
fn relocatable(r_type: u32, kind: X64Field) -> bool {
    use X64Field::*;
    match r_type {
        elf::R_X86_64_PC8 => kind == Pcrel8,
        elf::R_X86_64_PC32 => matches!(kind, Pcrel32 | Off32),
        elf::R_X86_64_32 => kind == Imm32,
        // the cpu sign extends these fields
        elf::R_X86_64_32S => matches!(kind, Simm32 | Off32),
        elf::R_X86_64_64 => kind == Imm64,
        _ => false,
    }
}

fn is_pc_relative(r_type: u32) -> bool {
    matches!(r_type, elf::R_X86_64_PC8 | elf::R_X86_64_PC32)
}

/// An instruction: template, operands and an optional pending relocation.
#[derive(Debug, Clone)]
pub struct X64Ins<'c> {
    pub opcode: &'c X64Opcode,
    pub operands: Vec<i64>,
    pub reloc: Option<InsReloc>,
}

impl PartialEq for X64Ins<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.opcode, other.opcode)
            && self.operands == other.operands
            && self.reloc == other.reloc
    }
}

fn split_prefixes(data: &[u8]) -> Option<(Option<u8>, u8, usize)> {
    let mut start = 0;
    let prefix = match *data.first()? {
        p @ (0x66 | 0xf2 | 0xf3) => {
            start = 1;
            Some(p)
        }
        _ => None,
    };
    let rex = match *data.get(start)? {
        r if r & 0xf0 == 0x40 => {
            start += 1;
            r
        }
        _ => 0,
    };
    Some((prefix, rex, start))
}

/// The x86_64 architecture backend.
pub struct X86_64 {
    catalog: Catalog<X64Opcode>,
}

impl X86_64 {
    /// Builds the catalog.
    ///
    /// # Panics
    /// If the opcode table is inconsistent.
    pub fn new() -> Self {
        match Catalog::build(opcodes(), NUM_BUCKETS, &rules()) {
            Ok(catalog) => Self { catalog },
            Err(e) => panic!("x86-64 opcode catalog is inconsistent: {}", e),
        }
    }

    pub fn catalog(&self) -> &Catalog<X64Opcode> {
        &self.catalog
    }

    /// Finds the template for the instruction at the start of `data`. Returns it with
    /// the REX byte (0 if absent) and the offset of the body.
    pub fn find_opcode(&self, data: &[u8]) -> Option<(&X64Opcode, u8, usize)> {
        let (prefix, rex, start) = split_prefixes(data)?;
        let body = &data[start..];
        let esc = *body.first()? == 0x0f;
        let byte = *body.get(usize::from(esc))?;
        let key = usize::from(rex & 0x08 != 0) << 11
            | prefix_index(prefix) << 9
            | usize::from(esc) << 8
            | usize::from(byte);
        self.catalog
            .find(key, |op| op.prefix == prefix && op.matches(body))
            .map(|op| (op, rex, start))
    }

    /// Decodes the instruction at the start of `data` and its length. Non-canonical
    /// encodings yield `None`.
    pub fn decode(&self, data: &[u8]) -> Option<(X64Ins<'_>, usize)> {
        let (opcode, rex, start) = self.find_opcode(data)?;
        let len = start + opcode.body_len();
        let operands = opcode.disassemble(&data[start..], rex);
        let again = opcode.assemble(&operands).ok()?;
        if data.get(..len)? != again.as_slice() {
            return None;
        }
        Some((
            X64Ins {
                opcode,
                operands,
                reloc: None,
            },
            len,
        ))
    }

    /// Encodes an instruction, rejecting operands that would make the bytes decode as
    /// a different addressing form (e.g. a plain `rsp` base).
    pub fn encode(&self, ins: &X64Ins<'_>) -> Result<Vec<u8>, AsmError> {
        let bytes = ins.opcode.assemble(&ins.operands)?;
        let mut padded = bytes.clone();
        padded.resize(bytes.len() + MAX_INSTRUCTION_LENGTH, 0);
        match self.find_opcode(&padded) {
            Some((op, ..)) if std::ptr::eq(op, ins.opcode) => Ok(bytes),
            Some((op, ..)) => Err(AsmError::syntax(format!(
                "operands of {} encode as {}",
                ins.opcode.name, op.name
            ))),
            None => Err(AsmError::syntax(format!("operands of {} do not encode", ins.opcode.name))),
        }
    }

    /// Parses a template name and operand tokens.
    pub fn ins_from_symbolized(
        &self,
        mnemonic: &str,
        tokens: &[&str],
    ) -> Result<X64Ins<'_>, AsmError> {
        let opcode = self
            .catalog
            .get(mnemonic)
            .ok_or_else(|| AsmError::syntax(format!("unknown opcode {}", mnemonic)))?;
        if tokens.len() != opcode.fields.len() {
            return Err(AsmError::syntax(format!(
                "{} expects {} operands, got {}",
                opcode.name,
                opcode.fields.len(),
                tokens.len()
            )));
        }
        let mut operands = Vec::with_capacity(tokens.len());
        let mut reloc = None;
        for (pos, (&token, &kind)) in tokens.iter().zip(&opcode.fields).enumerate() {
            if token.starts_with("expr:") {
                if reloc.is_some() {
                    return Err(AsmError::syntax("at most one relocation per instruction"));
                }
                let (name, symbol, addend) = parse_expr(token)?;
                let (rk, is_local) = lookup_reloc(RELOCS, name)?;
                if !relocatable(rk.r_type, kind) {
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
        Ok(X64Ins {
            opcode,
            operands,
            reloc,
        })
    }

    /// Renders an instruction as template name and operand tokens.
    pub fn ins_symbolize(&self, ins: &X64Ins<'_>) -> (String, Vec<String>) {
        let ops = ins
            .opcode
            .fields
            .iter()
            .zip(&ins.operands)
            .enumerate()
            .map(|(pos, (&kind, &value))| match &ins.reloc {
                Some(r) if r.pos == pos => match RELOCS.iter().find(|k| k.r_type == r.r_type) {
                    Some(rk) => format_expr(rk, &r.symbol, r.is_local, r.addend),
                    None => format!("expr:{}:{}", r.r_type, r.symbol),
                },
                _ => kind.vocabulary().symbolize(value),
            })
            .collect();
        (ins.opcode.name.clone(), ops)
    }
}

impl Default for X86_64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Architecture for X86_64 {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn elf_machine(&self) -> u16 {
        elf::EM_X86_64
    }

    fn is_64bit(&self) -> bool {
        true
    }

    fn base_address(&self) -> u64 {
        0x40_0000
    }

    fn segment_alignment(&self) -> u64 {
        0x1000
    }

    fn code_padding(&self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let n = (len - out.len()).min(NOPS.len() - 1);
            out.extend_from_slice(NOPS[n]);
        }
        out
    }

    fn data_reloc(&self, width: usize) -> Result<u32, AsmError> {
        match width {
            4 => Ok(elf::R_X86_64_32),
            8 => Ok(elf::R_X86_64_64),
            _ => Err(AsmError::syntax(format!("x86-64 addresses are 4 or 8 bytes, not {}", width))),
        }
    }

    fn assemble(&self, mnemonic: &str, tokens: &[&str]) -> Result<Encoded, AsmError> {
        let ins = self.ins_from_symbolized(mnemonic, tokens)?;
        let bytes = self.encode(&ins)?;
        let reloc = match ins.reloc {
            None => None,
            Some(r) => {
                let kind = ins.opcode.fields[r.pos];
                let pos = ins
                    .opcode
                    .byte_field_pos(kind)
                    .ok_or_else(|| {
                        AsmError::syntax(format!("{} cannot carry a relocation", ins.opcode.name))
                    })?;
                // measured from the end: prefixes vary, the body does not
                let distance_to_end = ins.opcode.body_len() - pos;
                let addend = if is_pc_relative(r.r_type) {
                    r.addend - distance_to_end as i64
                } else {
                    r.addend
                };
                Some(PendingReloc {
                    r_type: r.r_type,
                    offset: bytes.len() - distance_to_end,
                    symbol: r.symbol,
                    is_local: r.is_local,
                    addend,
                })
            }
        };
        Ok(Encoded { bytes, reloc })
    }

    fn disassemble(&self, data: &[u8], pending: Option<&PendingReloc>) -> Option<Decoded> {
        let (mut ins, len) = self.decode(data)?;
        if let Some(p) = pending {
            let body_start = len - ins.opcode.body_len();
            let pos = ins.opcode.fields.iter().position(|&k| {
                ins.opcode.byte_field_pos(k).map(|b| body_start + b) == Some(p.offset)
            });
            if let Some(pos) = pos {
                let addend = if is_pc_relative(p.r_type) {
                    p.addend + (len - p.offset) as i64
                } else {
                    p.addend
                };
                ins.reloc = Some(InsReloc {
                    r_type: p.r_type,
                    pos,
                    symbol: p.symbol.clone(),
                    is_local: p.is_local,
                    addend,
                });
            }
        }
        let (mnemonic, operands) = self.ins_symbolize(&ins);
        Some(Decoded {
            len,
            mnemonic,
            operands,
        })
    }

    fn apply_relocation(
        &self,
        offset: u64,
        r_type: u32,
        p: u64,
        s: u64,
        a: i64,
        data: &mut [u8],
    ) -> Result<(), AsmError> {
        let target = (s as i64).wrapping_add(a);
        match r_type {
            // R_X86_64_PC8 / R_X86_64_PC32: S + A - P
            elf::R_X86_64_PC8 => write_le::<1>(data, offset, p, target - p as i64, true),
            elf::R_X86_64_PC32 => write_le::<4>(data, offset, p, target - p as i64, true),
            // R_X86_64_32: S + A, zero extended
            elf::R_X86_64_32 => write_le::<4>(data, offset, p, target, false),
            // R_X86_64_32S: S + A, sign extended
            elf::R_X86_64_32S => write_le::<4>(data, offset, p, target, true),
            // R_X86_64_64: S + A
            elf::R_X86_64_64 => write_le::<8>(data, offset, p, target, false),
            _ => Err(AsmError::syntax(format!("unsupported x86-64 relocation type {}", r_type))),
        }
    }

    fn reloc_name(&self, r_type: u32) -> &'static str {
        match r_type {
            elf::R_X86_64_PC8 => "R_X86_64_PC8",
            elf::R_X86_64_PC32 => "R_X86_64_PC32",
            elf::R_X86_64_32 => "R_X86_64_32",
            elf::R_X86_64_32S => "R_X86_64_32S",
            elf::R_X86_64_64 => "R_X86_64_64",
            _ => "R_X86_64_UNKNOWN",
        }
    }

    fn startup_code(&self) -> &'static str {
        STARTUP
    }

    fn instruction_alignment(&self) -> usize {
        1
    }
}

const STARTUP: &str = "
.fun _start 16
    mov_64_rm_sib rdi rsp noindex 0
    lea_64_rm_sib_off8 rsi rsp noindex 0 8
    call_32 expr:pcrel32:main
    mov_32_rr edi eax
    mov_32_ri eax 0x3c
    syscall
    int3
.endfun
";

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(x: &X86_64, text: &str) -> Vec<u8> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        x.assemble(tokens[0], &tokens[1..]).unwrap().bytes
    }

    fn text(x: &X86_64, data: &[u8]) -> String {
        x.disassemble(data, None).unwrap().to_string()
    }

    /// A value every operand kind accepts and that keeps the addressing form.
    fn sample(kind: X64Field, high: bool) -> i64 {
        use X64Field::*;
        match kind {
            Rip => 0,
            SibScale => 3,
            SibIndex if high => 10,
            SibIndex => 2,
            Off8 => -8,
            Off32 => 0x1000,
            Imm8 => 0x7f,
            Imm16 => 0x1234,
            Imm32 => 0x1234_5678,
            Imm64 => 0x1234_5678_9abc_def0,
            Simm8 => -2,
            Simm32 => -0x1000,
            Pcrel8 => -2,
            Pcrel32 => 0x100,
            // low bits 011 avoid the rsp/rbp special cases
            _ if high => 11,
            _ => 3,
        }
    }

    #[test]
    fn known_encodings() {
        let x = X86_64::new();
        assert_eq!(bytes(&x, "mov_32_rr edi eax"), [0x89, 0xc7]);
        assert_eq!(bytes(&x, "mov_64_rm_sib rdi rsp noindex 0"), [0x48, 0x8b, 0x3c, 0x24]);
        assert_eq!(
            bytes(&x, "lea_64_rm_sib_off8 rsi rsp noindex 0 8"),
            [0x48, 0x8d, 0x74, 0x24, 0x08]
        );
        assert_eq!(bytes(&x, "mov_32_ri eax 0x3c"), [0xb8, 0x3c, 0, 0, 0]);
        assert_eq!(bytes(&x, "add_64_ri8 rsp 8"), [0x48, 0x83, 0xc4, 0x08]);
        assert_eq!(bytes(&x, "add_64_rr r8 rax"), [0x49, 0x01, 0xc0]);
        assert_eq!(bytes(&x, "push_64_r r12"), [0x41, 0x54]);
        assert_eq!(bytes(&x, "mov_8_rr sil al"), [0x40, 0x88, 0xc6]);
        assert_eq!(bytes(&x, "addsd_rr xmm0 xmm9"), [0xf2, 0x41, 0x0f, 0x58, 0xc1]);
        assert_eq!(bytes(&x, "movq_xr xmm1 rax"), [0x66, 0x48, 0x0f, 0x6e, 0xc8]);
        assert_eq!(bytes(&x, "mov_64_rm_rip rax rip 16"), [0x48, 0x8b, 0x05, 0x10, 0, 0, 0]);
        assert_eq!(bytes(&x, "syscall"), [0x0f, 0x05]);
        assert_eq!(bytes(&x, "endbr64"), [0xf3, 0x0f, 0x1e, 0xfa]);
    }

    #[test]
    fn every_template_round_trips() {
        let x = X86_64::new();
        for op in x.catalog().iter() {
            for high in [false, true] {
                let operands: Vec<i64> = op.fields.iter().map(|&k| sample(k, high)).collect();
                let ins = X64Ins {
                    opcode: op,
                    operands,
                    reloc: None,
                };
                let data = x.encode(&ins).unwrap_or_else(|e| panic!("{}: {}", op.name, e));
                let (again, len) = x
                    .decode(&data)
                    .unwrap_or_else(|| panic!("{} {:02x?}", op.name, data));
                assert_eq!(len, data.len());
                assert_eq!(again, ins, "{} {:02x?}", op.name, data);
                let (name, ops) = x.ins_symbolize(&again);
                let tokens: Vec<&str> = ops.iter().map(String::as_str).collect();
                let parsed = x.ins_from_symbolized(&name, &tokens).unwrap();
                assert_eq!(parsed, ins, "{} {:?}", name, ops);
            }
        }
        assert!(x.catalog().len() > 1000);
    }

    #[test]
    fn special_bases_need_their_own_form() {
        let x = X86_64::new();
        assert!(x.assemble("mov_32_rm", &["eax", "rsp"]).is_err());
        assert!(x.assemble("mov_32_rm", &["eax", "r13"]).is_err());
        assert!(x.assemble("mov_32_rm_sib", &["eax", "rbp", "noindex", "0"]).is_err());
        assert!(x.assemble("mov_32_rm_off8", &["eax", "rbp", "0"]).is_ok());
        let data = bytes(&x, "mov_32_rm_nobase eax rcx 2 0x40");
        assert_eq!(text(&x, &data), "mov_32_rm_nobase eax rcx 2 64");
    }

    #[test]
    fn only_canonical_bytes_decode() {
        let x = X86_64::new();
        // redundant REX
        assert!(x.disassemble(&[0x40, 0x89, 0xc7], None).is_none());
        // ah is not a register this assembler produces
        assert!(x.disassemble(&[0x88, 0xe0], None).is_none());
        // the non-canonical direction of a register move
        assert!(x.disassemble(&[0x8b, 0xf8], None).is_none());
        assert_eq!(text(&x, &[0x89, 0xc7]), "mov_32_rr edi eax");
        assert_eq!(text(&x, &[0x41, 0x54]), "push_64_r r12");
    }

    #[test]
    fn padding_is_made_of_nops() {
        let x = X86_64::new();
        for len in 0..=24 {
            let pad = x.code_padding(len);
            assert_eq!(pad.len(), len);
            let mut at = 0;
            while at < pad.len() {
                let d = x.disassemble(&pad[at..], None).unwrap();
                assert!(d.mnemonic.starts_with("nop"), "{}", d);
                at += d.len;
            }
        }
    }

    #[test]
    fn pcrel32_addend_is_measured_from_the_field() {
        let x = X86_64::new();
        let enc = x.assemble("call_32", &["expr:pcrel32:main"]).unwrap();
        let reloc = enc.reloc.clone().unwrap();
        assert_eq!(enc.bytes.len(), 5);
        assert_eq!((reloc.r_type, reloc.offset, reloc.addend), (elf::R_X86_64_PC32, 1, -4));

        // the field sits at 0x400000, main at 0x401000
        let mut data = enc.bytes.clone();
        let at = reloc.offset as u64;
        x.apply_relocation(at, reloc.r_type, 0x40_0000, 0x40_1000, reloc.addend, &mut data)
            .unwrap();
        assert_eq!(&data[1..], 0xffci32.to_le_bytes());

        let listing = x.disassemble(&enc.bytes, Some(&reloc)).unwrap().to_string();
        assert_eq!(listing, "call_32 expr:pcrel32:main");
    }

    #[test]
    fn relocation_fields_are_checked() {
        let x = X86_64::new();
        assert!(x.assemble("call_32", &["expr:abs64:f"]).is_err());
        let enc = x.assemble("movabs_64_ri", &["rax", "expr:abs64:table:8"]).unwrap();
        let reloc = enc.reloc.unwrap();
        assert_eq!((reloc.offset, reloc.addend), (2, 8));
        let enc = x.assemble("lea_64_rm_rip", &["rdi", "rip", "expr:pcrel32:msg"]).unwrap();
        assert_eq!(enc.bytes.len(), 7);
        assert_eq!(enc.reloc.unwrap().offset, 3);
        let enc = x.assemble("jne_8", &["expr:loc_pcrel8:loop"]).unwrap();
        let reloc = enc.reloc.unwrap();
        assert!(reloc.is_local);
        assert_eq!((reloc.offset, reloc.addend), (1, -1));

        let mut short = vec![0x75, 0];
        let err = x
            .apply_relocation(1, elf::R_X86_64_PC8, 0x40_0001, 0x40_0200, -1, &mut short)
            .unwrap_err();
        assert!(matches!(err, AsmError::RelocationOverflow { bits: 8, .. }), "{}", err);
    }

    #[test]
    fn sign_extended_fields_need_abs32s() {
        let x = X86_64::new();
        assert!(x.assemble("mov_64_ri", &["rax", "expr:abs32:table"]).is_err());
        let enc = x.assemble("mov_32_ri", &["eax", "expr:abs32:table"]).unwrap();
        assert_eq!(enc.reloc.unwrap().r_type, elf::R_X86_64_32);

        let enc = x.assemble("mov_64_ri", &["rax", "expr:abs32s:table"]).unwrap();
        let reloc = enc.reloc.unwrap();
        assert_eq!(reloc.r_type, elf::R_X86_64_32S);
        let at = reloc.offset as u64;
        let mut data = enc.bytes.clone();
        x.apply_relocation(at, reloc.r_type, 0x40_0000, 0x40_3000, reloc.addend, &mut data)
            .unwrap();
        assert_eq!(&data[reloc.offset..reloc.offset + 4], 0x40_3000i32.to_le_bytes());

        // would load 0xffffffff80000000
        let mut data = enc.bytes.clone();
        let err = x
            .apply_relocation(at, reloc.r_type, 0x40_0000, 0x8000_0000, reloc.addend, &mut data)
            .unwrap_err();
        assert!(matches!(err, AsmError::RelocationOverflow { bits: 32, .. }), "{}", err);
    }
}
