//! Assembly source parser.
//!
//! Turns line oriented assembly text into a `Unit`. Lines starting with `.` are
//! directives; every other non-empty line is an instruction given as a template name
//! followed by operand tokens. Errors are tagged with the 1-based line number.

use tracing::debug;

use crate::arch::Architecture;
use crate::error::AsmError;
use crate::unit::{Directive, SectionId, Unit};
use crate::utils::{parse_int, tokenize, unquote};

fn expect_args(name: &str, args: &[&str], count: usize) -> Result<(), AsmError> {
    if args.len() == count {
        Ok(())
    } else {
        Err(AsmError::syntax(format!(
            "{} takes {} arguments, got {}",
            name,
            count,
            args.len()
        )))
    }
}

fn number(token: &str) -> Result<i64, AsmError> {
    parse_int(token).ok_or_else(|| AsmError::syntax(format!("expected a number, got {}", token)))
}

fn count(token: &str) -> Result<u64, AsmError> {
    let v = number(token)?;
    u64::try_from(v).map_err(|_| {
        AsmError::syntax(format!("expected a non-negative number, got {}", token))
    })
}

fn alignment(token: &str) -> Result<u64, AsmError> {
    let v = count(token)?;
    if v == 0 || v.is_power_of_two() {
        Ok(v.max(1))
    } else {
        Err(AsmError::syntax(format!("alignment {} is not a power of two", v)))
    }
}

fn width(token: &str) -> Result<usize, AsmError> {
    count(token).map(|w| w as usize)
}

/// Parses a directive given its name (with the leading dot) and arguments.
pub fn parse_directive<'a>(name: &str, args: &[&'a str]) -> Result<Directive<'a>, AsmError> {
    let directive = match name {
        ".fun" => {
            expect_args(name, args, 2)?;
            Directive::Fun {
                name: args[0],
                alignment: alignment(args[1])?,
            }
        }
        ".endfun" => {
            expect_args(name, args, 0)?;
            Directive::EndFun
        }
        ".mem" | ".localmem" => {
            expect_args(name, args, 3)?;
            Directive::Mem {
                name: args[0],
                alignment: alignment(args[1])?,
                section: SectionId::from_mem_kind(args[2])
                    .ok_or_else(|| AsmError::syntax(format!("unknown memory kind {}", args[2])))?,
                is_local: name == ".localmem",
            }
        }
        ".endmem" => {
            expect_args(name, args, 0)?;
            Directive::EndMem
        }
        ".data" => {
            expect_args(name, args, 2)?;
            Directive::Data {
                repeats: count(args[0])? as usize,
                bytes: unquote(args[1])?,
            }
        }
        ".addr.fun" => {
            expect_args(name, args, 2)?;
            Directive::AddrFun {
                width: width(args[0])?,
                name: args[1],
            }
        }
        ".addr.bbl" => {
            expect_args(name, args, 2)?;
            Directive::AddrBbl {
                width: width(args[0])?,
                name: args[1],
            }
        }
        ".addr.mem" => {
            expect_args(name, args, 3)?;
            Directive::AddrMem {
                width: width(args[0])?,
                name: args[1],
                addend: number(args[2])?,
            }
        }
        ".bbl" => {
            expect_args(name, args, 2)?;
            Directive::Bbl {
                name: args[0],
                alignment: alignment(args[1])?,
            }
        }
        _ => return Err(AsmError::syntax(format!("unknown directive {}", name))),
    };
    Ok(directive)
}

/// Handles one source line.
fn parse_line<A: Architecture + ?Sized>(
    arch: &A,
    unit: &mut Unit,
    line: &str,
) -> Result<(), AsmError> {
    let tokens = tokenize(line)?;
    let Some((&head, rest)) = tokens.split_first() else {
        return Ok(());
    };
    if head.starts_with('.') {
        let directive = parse_directive(head, rest)?;
        unit.apply(arch, directive)
    } else {
        let ins = arch.assemble(head, rest)?;
        unit.add_ins(ins)
    }
}

/// Feeds `source` into `unit`.
pub fn unit_add_source<A: Architecture + ?Sized>(
    arch: &A,
    unit: &mut Unit,
    source: &str,
) -> Result<(), AsmError> {
    for (index, line) in source.lines().enumerate() {
        parse_line(arch, unit, line).map_err(|e| e.at_line(index + 1, line.trim()))?;
    }
    unit.check_closed()
}

/// Assembles a complete unit. The end-of-writable-data marker is added after the
/// source, followed by the `_start` stub when `add_startup` is set.
pub fn unit_parse<A: Architecture + ?Sized>(
    arch: &A,
    source: &str,
    add_startup: bool,
) -> Result<Unit, AsmError> {
    let mut unit = Unit::new();
    unit_add_source(arch, &mut unit, source)?;
    unit.add_linker_defs()?;
    if add_startup {
        unit_add_source(arch, &mut unit, arch.startup_code())?;
    }
    debug!(
        "assembled {} bytes of {} code, {} symbols, {} relocations",
        unit.section(SectionId::Text).len(),
        arch.name(),
        unit.symbols().len(),
        unit.relocs().len()
    );
    Ok(unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;

    #[test]
    fn directives() {
        assert_eq!(
            parse_directive(".fun", &["main", "16"]).unwrap(),
            Directive::Fun { name: "main", alignment: 16 }
        );
        assert_eq!(
            parse_directive(".localmem", &["tab", "8", "rodata"]).unwrap(),
            Directive::Mem {
                name: "tab",
                alignment: 8,
                section: SectionId::Rodata,
                is_local: true
            }
        );
        assert_eq!(
            parse_directive(".data", &["3", "\"a\\x00\""]).unwrap(),
            Directive::Data { repeats: 3, bytes: vec![b'a', 0] }
        );
        assert_eq!(
            parse_directive(".addr.mem", &["8", "tab", "-0x10"]).unwrap(),
            Directive::AddrMem { width: 8, name: "tab", addend: -16 }
        );
        assert!(parse_directive(".fun", &["main"]).is_err());
        assert!(parse_directive(".fun", &["main", "3"]).is_err());
        assert!(parse_directive(".mem", &["m", "4", "text"]).is_err());
        assert!(parse_directive(".section", &[]).is_err());
    }

    #[test]
    fn errors_carry_line_numbers() {
        let x = X86_64::new();
        let src = ".fun main 16\n    # fine\n    bogus_op rax\n.endfun\n";
        match unit_parse(&x, src, false).unwrap_err() {
            AsmError::Parse { line, text, .. } => {
                assert_eq!(line, 3);
                assert_eq!(text, "bogus_op rax");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn unterminated_blocks_are_rejected() {
        let x = X86_64::new();
        assert!(unit_parse(&x, ".fun main 16\n  ret\n", false).is_err());
        assert!(unit_parse(&x, ".mem m 4 data\n.data 1 \"x\"\n", false).is_err());
    }

    #[test]
    fn startup_follows_user_code() {
        let x = X86_64::new();
        let unit = unit_parse(&x, ".fun main 16\n  ret\n.endfun\n", true).unwrap();
        let main = unit.symbol(unit.global("main").unwrap()).clone();
        let start = unit.symbol(unit.global("_start").unwrap()).clone();
        assert_eq!(main.offset, 0);
        assert_eq!(start.offset, 16);
        assert_eq!(unit.relocs().len(), 1);
    }
}
