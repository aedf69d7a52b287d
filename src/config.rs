//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the assembler using `clap`.
//! It handles parsing arguments like the input file, the target and the output path.

use clap::Parser;
use std::path::PathBuf;

use crate::arch::Target;

/// A small assembler producing static ELF executables.
///
/// The input is a single assembly source in the directive format shared by all targets.
/// The result is a self-contained Linux executable; no separate link step is needed.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Assembly source file
    pub input: PathBuf,

    /// Output file
    #[arg(short, long, default_value = "a.out", help = "Path to the output executable")]
    pub output: PathBuf,

    /// Target instruction set
    #[arg(short, long, value_enum, default_value = "x86-64")]
    pub arch: Target,

    /// Do not emit the `_start` stub that calls `main`
    #[arg(long)]
    pub no_startup: bool,

    /// Include `.symtab` and `.strtab` in the executable
    #[arg(long)]
    pub symtab: bool,

    /// Print a disassembly listing of the text section
    #[arg(long)]
    pub listing: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}
