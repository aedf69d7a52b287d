//! Text section listing.
//!
//! Disassembles the text section of a unit that has not been relocated yet. Each
//! instruction is printed with its offset and bytes; an instruction carrying a pending
//! relocation is shown with its `expr:` operand, so the symbolic column can be fed back
//! to the assembler.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::arch::{Architecture, PendingReloc};
use crate::unit::{SectionId, Unit};

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

fn escaped(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\x{:02x}", b)).collect()
}

/// Renders the text section of `unit`.
pub fn text_listing<A: Architecture + ?Sized>(arch: &A, unit: &Unit) -> String {
    let data = &unit.section(SectionId::Text).data;
    let mut labels: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for sym in unit.symbols() {
        if sym.section == Some(SectionId::Text) {
            let label = if sym.is_local {
                format!(".bbl {}", sym.name)
            } else {
                format!(".fun {}", sym.name)
            };
            labels.entry(sym.offset).or_default().push(label);
        }
    }
    let relocs: BTreeMap<u64, PendingReloc> = unit
        .relocs()
        .iter()
        .filter(|r| r.section == SectionId::Text)
        .map(|r| {
            let sym = unit.symbol(r.symbol);
            (
                r.offset,
                PendingReloc {
                    r_type: r.r_type,
                    offset: 0,
                    symbol: sym.name.clone(),
                    is_local: sym.is_local,
                    addend: r.addend,
                },
            )
        })
        .collect();

    let mut out = String::new();
    let mut at = 0usize;
    while at < data.len() {
        let mut next_label = None;
        for (&offset, names) in labels.range(at as u64..) {
            if offset == at as u64 {
                for name in names {
                    let _ = writeln!(out, "{}", name);
                }
            } else {
                next_label = Some(offset as usize);
                break;
            }
        }
        let end = next_label.unwrap_or(data.len());
        let window = &data[at..end];

        let decoded = arch.disassemble(window, None).and_then(|plain| {
            let in_range = relocs.range(at as u64..(at + plain.len) as u64).next();
            match in_range {
                Some((&offset, pending)) => {
                    let pending = PendingReloc {
                        offset: offset as usize - at,
                        ..pending.clone()
                    };
                    arch.disassemble(window, Some(&pending))
                }
                None => Some(plain),
            }
        });
        match decoded {
            Some(ins) => {
                let _ = writeln!(out, "{:6x}:  {:<24} {}", at, hex_bytes(&window[..ins.len]), ins);
                at += ins.len;
            }
            None => {
                let len = arch.instruction_alignment().min(window.len());
                let bytes = &window[..len];
                let _ = writeln!(
                    out,
                    "{:6x}:  {:<24} .data 1 \"{}\"",
                    at,
                    hex_bytes(bytes),
                    escaped(bytes)
                );
                at += len;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;
    use crate::assembler::unit_parse;

    #[test]
    fn shows_labels_and_relocations() {
        let arch = X86_64::new();
        let src = "
.fun main 16
    ret
.endfun
";
        let unit = unit_parse(&arch, src, true).unwrap();
        let listing = text_listing(&arch, &unit);
        assert!(listing.contains(".fun main"), "{listing}");
        assert!(listing.contains(".fun _start"), "{listing}");
        assert!(listing.contains("call_32 expr:pcrel32:main"), "{listing}");
        assert!(listing.contains("c3"), "{listing}");
    }
}
