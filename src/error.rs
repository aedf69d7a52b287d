//! Error types.
//!
//! Assembly errors are split in two channels. `AsmError` covers everything a user can
//! trigger with bad input and is returned as a `Result`. `CatalogError` reports a broken
//! instruction table; it is produced while a backend builds its catalog and the backend
//! aborts on it, so it never reaches a user with a shipped catalog.

use thiserror::Error;

use crate::codec::RangeError;

/// Errors raised while assembling, laying out or relocating a unit.
#[derive(Debug, Error)]
pub enum AsmError {
    /// Malformed directive or instruction text.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// An operand value does not fit its field.
    #[error("cannot encode {mnemonic}: {source}")]
    EncodingRange {
        mnemonic: String,
        source: RangeError,
    },

    /// A relocation refers to a symbol that was never defined.
    #[error("undefined symbol: {0}")]
    UndefinedSymbol(String),

    /// A symbol was defined a second time.
    #[error("symbol already defined: {0}")]
    Redefinition(String),

    /// A resolved relocation value does not fit the patched field.
    #[error("Relocation overflow at VA 0x{place:x}: value 0x{value:x} exceeds {bits}-bit range")]
    RelocationOverflow { place: u64, value: i64, bits: u32 },

    /// Any of the above, tagged with the source line that caused it.
    #[error("line {line}: {source}\n    {text}")]
    Parse {
        line: usize,
        text: String,
        source: Box<AsmError>,
    },
}

impl AsmError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        AsmError::Syntax(msg.into())
    }

    /// Attaches a line number and the offending text.
    pub fn at_line(self, line: usize, text: &str) -> Self {
        AsmError::Parse {
            line,
            text: text.to_string(),
            source: Box::new(self),
        }
    }

    /// The underlying error with any line information peeled off.
    pub fn root(&self) -> &AsmError {
        match self {
            AsmError::Parse { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Inconsistencies in an instruction catalog detected while building it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("{name}: bits {bits:#010x} are not covered by fixed bits or fields")]
    Gap { name: String, bits: u32 },

    #[error("{name}: bits {bits:#010x} are claimed twice")]
    Overlap { name: String, bits: u32 },

    #[error("{first} and {second} cannot be told apart")]
    Ambiguous { first: String, second: String },

    #[error("duplicate template name {0}")]
    Duplicate(String),

    #[error("relocation {kind}: bad sample instruction: {reason}")]
    RelocSample { kind: String, reason: String },
}
