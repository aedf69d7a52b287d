//! Retargetable Assembler Library.
//!
//! This library provides the core components for the `uasm` assembler.
//! It is organized into several modules:
//! - `codec`, `catalog`, `opcode`: instruction encodings and the tables holding them.
//! - `symbolic`: textual operands and relocation expressions.
//! - `arch`: Architecture-specific backends (A32, A64, x86-64).
//! - `unit`, `assembler`: building a unit from source text.
//! - `layout`, `linker`, `writer`: turning a unit into an executable.
//! - `listing`: disassembly of assembled code.
//! - `config`: CLI configuration.

#[macro_use]
pub mod codec;

pub mod arch;
pub mod assembler;
pub mod catalog;
pub mod config;
pub mod error;
pub mod layout;
pub mod linker;
pub mod listing;
pub mod opcode;
pub mod symbolic;
pub mod unit;
pub mod utils;
pub mod writer;
