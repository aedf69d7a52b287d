use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SectionKind};

use uasm::arch::a32::A32;
use uasm::arch::a64::A64;
use uasm::arch::x86_64::X86_64;
use uasm::arch::Architecture;
use uasm::assembler::unit_parse;
use uasm::linker::Linker;

fn output_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("uasm-{}-{}", name, std::process::id()))
}

/// Assembles, links and writes `source`, returning the file contents.
fn build<A: Architecture>(arch: A, name: &str, source: &str) -> Vec<u8> {
    let unit = unit_parse(&arch, source, true).unwrap();
    let mut linker = Linker::new(arch, unit);
    linker.verify_unresolved().unwrap();
    linker.layout().unwrap();
    linker.relocate().unwrap();
    let path = output_path(name);
    linker.write(&path, true).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
    let data = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    data
}

fn symbol_address(file: &object::File, name: &str) -> u64 {
    file.symbols()
        .find(|s| s.name() == Ok(name))
        .unwrap_or_else(|| panic!("no symbol {name}"))
        .address()
}

fn section_bytes<'a>(file: &object::File<'a>, name: &str) -> (u64, &'a [u8]) {
    let section = file.section_by_name(name).unwrap();
    (section.address(), section.data().unwrap())
}

const X86_64_PROGRAM: &str = r#"
# copies nothing, just references everything
.fun main 16
    lea_64_rm_rip rdi rip expr:pcrel32:msg
    mov_32_ri eax 0
    add_64_ri8 rdi 1
    jne_8 expr:loc_pcrel8:done
    mov_32_ri eax 1
.bbl done 1
    ret
.endfun

.mem msg 1 rodata
    .data 1 "hello\n"
.endmem

.mem table 8 data
    .addr.fun 8 main
    .addr.mem 8 msg 2
.endmem

.mem buf 16 bss
    .data 32 "\x00"
.endmem
"#;

#[test]
fn x86_64_executable() {
    let data = build(X86_64::new(), "x86_64", X86_64_PROGRAM);
    let file = object::File::parse(data.as_slice()).unwrap();
    assert_eq!(file.architecture(), object::Architecture::X86_64);
    assert!(file.is_64());

    let main = symbol_address(&file, "main");
    let msg = symbol_address(&file, "msg");
    assert_eq!(main, 0x401000);
    assert_eq!(msg, 0x402000);
    assert_eq!(file.entry(), symbol_address(&file, "_start"));
    assert_eq!(file.entry(), 0x401020);

    let (text_addr, text) = section_bytes(&file, ".text");
    assert_eq!(text_addr, main);
    let disp = i32::from_le_bytes(text[3..7].try_into().unwrap());
    assert_eq!(i64::from(disp), msg as i64 - (main as i64 + 7));
    // jne over a five byte mov
    assert_eq!(text[17], 5);

    let (_, table) = section_bytes(&file, ".data");
    assert_eq!(u64::from_le_bytes(table[..8].try_into().unwrap()), main);
    assert_eq!(u64::from_le_bytes(table[8..16].try_into().unwrap()), msg + 2);

    let bss = file.section_by_name(".bss").unwrap();
    assert_eq!(bss.kind(), SectionKind::UninitializedData);
    assert_eq!(bss.address(), 0x403010);
    assert_eq!(symbol_address(&file, "$$rw_data_end"), 0x403030);

    let done = file.symbols().find(|s| s.name() == Ok("done")).unwrap();
    assert!(done.is_local());
    assert_eq!(done.address(), main + 23);

    let segments: Vec<_> = file.segments().collect();
    assert_eq!(segments.len(), 3);
    assert_eq!(segments[0].address(), 0x401000);
    assert_eq!(segments[2].size(), 0x30);
}

const A64_PROGRAM: &str = r#"
.fun main 16
    adrp x0 expr:adr_prel_pg_hi21:msg
    add_x_imm x0 x0 expr:add_abs_lo12_nc:msg
    movz_x_imm x0 42
    ret x30
.endfun

.mem msg 8 rodata
    .data 1 "hi\n"
.endmem

.mem table 8 data
    .addr.fun 8 main
    .addr.mem 8 msg 1
.endmem
"#;

#[test]
fn a64_executable() {
    let data = build(A64::new(), "a64", A64_PROGRAM);
    let file = object::File::parse(data.as_slice()).unwrap();
    assert_eq!(file.architecture(), object::Architecture::Aarch64);
    assert!(file.is_64());

    let main = symbol_address(&file, "main");
    let msg = symbol_address(&file, "msg");
    assert_eq!((main, msg), (0x410000, 0x420000));
    assert_eq!(file.entry(), 0x410010);

    let (_, text) = section_bytes(&file, ".text");
    let word = |i: usize| u32::from_le_bytes(text[i * 4..i * 4 + 4].try_into().unwrap());
    // sixteen pages forward
    assert_eq!(word(0), 0x9000_0080);
    assert_eq!(word(1), 0x9100_0000);
    // bl main from _start + 8, six words back
    assert_eq!(word(6), 0x97ff_fffa);

    let (data_addr, table) = section_bytes(&file, ".data");
    assert_eq!(data_addr, 0x430000);
    assert_eq!(u64::from_le_bytes(table[..8].try_into().unwrap()), main);
    assert_eq!(u64::from_le_bytes(table[8..16].try_into().unwrap()), msg + 1);
    assert_eq!(symbol_address(&file, "$$rw_data_end"), 0x430010);
    assert!(file.section_by_name(".bss").is_none());
}

const A32_PROGRAM: &str = r#"
.fun main 16
    movw al r0 expr:movw_abs_nc:msg
    movt al r0 expr:movt_abs:msg
    bl al lr expr:call:helper
    bx al lr
.endfun

.fun helper 4
    mov_imm al r0 7
    bx al lr
.endfun

.mem msg 4 rodata
    .data 1 "hi"
.endmem

.mem ptrs 4 data
    .addr.fun 4 helper
.endmem
"#;

#[test]
fn a32_executable() {
    let data = build(A32::new(), "a32", A32_PROGRAM);
    let file = object::File::parse(data.as_slice()).unwrap();
    assert_eq!(file.architecture(), object::Architecture::Arm);
    assert!(!file.is_64());
    match file.flags() {
        object::FileFlags::Elf { e_flags, .. } => assert_eq!(e_flags, 0x0500_0000),
        other => panic!("unexpected flags {other:?}"),
    }
    assert!(file.section_by_name(".ARM.attributes").is_some());

    let main = symbol_address(&file, "main");
    let helper = symbol_address(&file, "helper");
    assert_eq!((main, helper), (0x30000, 0x30010));
    assert_eq!(symbol_address(&file, "msg"), 0x40000);
    assert_eq!(file.entry(), 0x30020);

    let (_, text) = section_bytes(&file, ".text");
    let word = |i: usize| u32::from_le_bytes(text[i * 4..i * 4 + 4].try_into().unwrap());
    assert_eq!(word(0), 0xe300_0000);
    assert_eq!(word(1), 0xe340_0004);
    // helper is the instruction right after the pc
    assert_eq!(word(2), 0xeb00_0000);
    assert_eq!(word(3), 0xe12f_ff1e);

    let (_, ptrs) = section_bytes(&file, ".data");
    assert_eq!(u32::from_le_bytes(ptrs[..4].try_into().unwrap()) as u64, helper);
}

#[test]
fn missing_main_is_an_undefined_symbol() {
    let arch = X86_64::new();
    let unit = unit_parse(&arch, ".fun other 16\n  ret\n.endfun\n", true).unwrap();
    let mut linker = Linker::new(arch, unit);
    linker.layout().unwrap();
    let err = linker.relocate().unwrap_err();
    assert!(err.to_string().contains("undefined symbol: main"), "{err}");
}

#[test]
fn no_startup_requires_an_entry_point() {
    let arch = X86_64::new();
    let unit = unit_parse(&arch, ".fun main 16\n  ret\n.endfun\n", false).unwrap();
    let mut linker = Linker::new(arch, unit);
    linker.layout().unwrap();
    linker.relocate().unwrap();
    assert!(linker.write(&output_path("no-entry"), false).is_err());
}
