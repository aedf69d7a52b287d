//! Entry point for the uasm assembler.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap` and set up `tracing`.
//! 2. Map the source file into memory.
//! 3. Pick the backend for the requested target.
//! 4. Assemble, then lay out, relocate and write the executable.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::File;
use tracing_subscriber::EnvFilter;

use uasm::arch::a32::A32;
use uasm::arch::a64::A64;
use uasm::arch::x86_64::X86_64;
use uasm::arch::{Architecture, Target};
use uasm::assembler::unit_parse;
use uasm::config::Config;
use uasm::linker::Linker;
use uasm::listing::text_listing;

fn run<A: Architecture>(arch: A, config: &Config, source: &str) -> Result<()> {
    let unit = unit_parse(&arch, source, !config.no_startup)
        .with_context(|| format!("failed to assemble {}", config.input.display()))?;

    if config.listing {
        print!("{}", text_listing(&arch, &unit));
    }

    let mut linker = Linker::new(arch, unit);

    // 1. Verify all symbols are resolved
    linker.verify_unresolved()?;

    // 2. Layout sections in memory
    linker.layout()?;

    // 3. Apply relocations
    linker.relocate()?;

    // 4. Write final executable
    linker.write(&config.output, config.symtab)?;
    Ok(())
}

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Map the input file into memory
    let file = File::open(&config.input)
        .with_context(|| format!("failed to open {}", config.input.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };
    let source = std::str::from_utf8(&mmap)
        .with_context(|| format!("{} is not valid UTF-8", config.input.display()))?;

    match config.arch {
        Target::A32 => run(A32::new(), &config, source),
        Target::A64 => run(A64::new(), &config, source),
        Target::X86_64 => run(X86_64::new(), &config, source),
    }
}
