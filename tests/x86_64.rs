use object::elf;

use uasm::arch::x86_64::X86_64;
use uasm::arch::Architecture;
use uasm::assembler::unit_parse;
use uasm::error::AsmError;
use uasm::listing::text_listing;
use uasm::unit::SectionId;

/// Reassembles every instruction line of a listing and compares it with the text bytes.
fn reassemble_listing<A: Architecture>(arch: &A, listing: &str, text: &[u8]) -> usize {
    let mut count = 0;
    for line in listing.lines().filter(|l| !l.starts_with('.')) {
        let (offset, rest) = line.split_once(':').unwrap();
        let offset = usize::from_str_radix(offset.trim(), 16).unwrap();
        let tokens: Vec<&str> = rest
            .split_whitespace()
            .skip_while(|t| t.len() == 2 && t.chars().all(|c| c.is_ascii_hexdigit()))
            .collect();
        let enc = arch.assemble(tokens[0], &tokens[1..]).unwrap_or_else(|e| panic!("{line}: {e}"));
        assert_eq!(enc.bytes, text[offset..offset + enc.bytes.len()], "{line}");
        count += 1;
    }
    count
}

#[test]
fn call_relocation_is_recorded_at_the_field() {
    let x = X86_64::new();
    let src = ".fun main 16\n  call_32 expr:pcrel32:main\n.endfun\n";
    let unit = unit_parse(&x, src, false).unwrap();
    let reloc = &unit.relocs()[0];
    assert_eq!(reloc.r_type, elf::R_X86_64_PC32);
    // five byte instruction, four byte field at its end
    assert_eq!(reloc.offset, 5 - 4);
    assert_eq!(reloc.addend, -4);

    // instruction at 0x400000, main at 0x401000
    let mut text = unit.section(SectionId::Text).data.clone();
    let place = 0x40_0000 + reloc.offset;
    x.apply_relocation(reloc.offset, reloc.r_type, place, 0x40_1000, reloc.addend, &mut text)
        .unwrap();
    assert_eq!(text[1..5], (0x40_1000i32 - 0x40_0000 - 5).to_le_bytes());
}

#[test]
fn listing_reassembles() {
    let x = X86_64::new();
    let src = "
.fun main 16
    push_64_r r12
    lea_64_rm_rip rdi rip expr:pcrel32:msg
    call_32 expr:pcrel32:helper
.bbl again 4
    add_64_ri8 rsp 8
    jne_8 expr:loc_pcrel8:again
    ret
.endfun
.fun helper 16
    mov_32_ri eax 0x3c
    ret
.endfun
.mem msg 1 rodata
    .data 1 \"x\"
.endmem
";
    let unit = unit_parse(&x, src, true).unwrap();
    let listing = text_listing(&x, &unit);
    assert!(listing.contains(".bbl again"), "{listing}");
    assert!(listing.contains("jne_8 expr:loc_pcrel8:again"), "{listing}");
    assert!(listing.contains("lea_64_rm_rip rdi rip expr:pcrel32:msg"), "{listing}");
    let count = reassemble_listing(&x, &listing, &unit.section(SectionId::Text).data);
    assert!(count >= 14, "{listing}");
}

#[test]
fn operand_errors() {
    let x = X86_64::new();
    assert!(matches!(x.assemble("mov_32_ri", &["eax"]), Err(AsmError::Syntax(_))));
    assert!(matches!(
        x.assemble("add_64_ri8", &["rax", "200"]),
        Err(AsmError::EncodingRange { .. })
    ));
    assert!(x.assemble("mov_64_rr", &["eax", "rbx"]).is_err());
    assert!(x.assemble("no_such_op", &[]).is_err());
}
