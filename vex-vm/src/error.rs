//! Engine error types.

use vex_asm::Fault;
use vex_types::{SymtabError, TlvError};

/// Compile-phase failures: the expression never became a program.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// An expression referenced a name outside the symbol table and the
    /// context requires it to resolve.
    #[error("unknown symbol `{0}`")]
    UnknownSymbol(String),
    /// Operand types cannot be reconciled.
    #[error("type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Operation being typed.
        context: &'static str,
        /// Expected type description.
        expected: &'static str,
        /// Type actually found.
        found: &'static str,
    },
    /// The expression shape has no lowering.
    #[error("unsupported expression: {0}")]
    Unsupported(&'static str),
    /// The program needs more value-stack slots than the slot width allows.
    #[error("value stack exhausted")]
    SlotExhausted,
}

/// Runtime and close-path failures of a query.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// The VM aborted with a categorical fault code.
    #[error("vm fault: {0}")]
    Fault(#[from] Fault),
    /// Symbol tables of adjacent chunks could not be reconciled.
    #[error("symbol table error: {0}")]
    Symtab(#[from] SymtabError),
    /// Record bytes failed to decode.
    #[error("record codec error: {0}")]
    Tlv(#[from] TlvError),
    /// The expression failed to compile.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// A worker thread panicked; its partial results were discarded.
    #[error("worker panicked")]
    WorkerPanic,
    /// The query observed its cancellation token.
    #[error("query cancelled")]
    Cancelled,
}

impl VmError {
    /// The underlying fault code, if this error carries one.
    pub fn fault(&self) -> Option<Fault> {
        match self {
            Self::Fault(f) => Some(*f),
            Self::Tlv(_) => Some(Fault::CorruptInput),
            Self::Symtab(SymtabError::Incompatible) => Some(Fault::SymbolTableIncompatible),
            Self::Symtab(SymtabError::Exhausted) => Some(Fault::Oversized),
            _ => None,
        }
    }

    /// `true` when retrying the chunk with more scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fault(f) if f.is_retryable())
    }
}

/// Result alias used across the engine.
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_projection() {
        assert_eq!(VmError::from(Fault::MoreScratch).fault(), Some(Fault::MoreScratch));
        assert_eq!(VmError::from(TlvError::Truncated).fault(), Some(Fault::CorruptInput));
        assert_eq!(
            VmError::from(SymtabError::Incompatible).fault(),
            Some(Fault::SymbolTableIncompatible)
        );
        assert_eq!(
            VmError::from(SymtabError::Exhausted).fault(),
            Some(Fault::Oversized)
        );
        assert_eq!(VmError::Cancelled.fault(), None);
        assert!(VmError::from(Fault::MoreScratch).is_retryable());
        assert!(!VmError::from(Fault::TreeCorrupt).is_retryable());
    }
}
