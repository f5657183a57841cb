//! Ordered symbol tables mapping field names to interned identifiers.

use core::fmt;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::{SymbolId, FIRST_USER_SYMBOL, MAX_SYMBOL_ID};

/// Failure while combining or extending symbol tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymtabError {
    /// The table cannot accept more symbols.
    Exhausted,
    /// A symbol reference falls outside the table that produced it: the
    /// record and its table disagree, so no remapping can reconcile them.
    Incompatible,
}

impl fmt::Display for SymtabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "symbol identifier space exhausted"),
            Self::Incompatible => write!(f, "symbol tables are incompatible"),
        }
    }
}

impl std::error::Error for SymtabError {}

/// Remapping of symbol identifiers produced by [`Symtab::merge`].
///
/// Index `i` holds the id in the merged table for the other table's
/// user symbol `FIRST_USER_SYMBOL + i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolMapping {
    map: Vec<SymbolId>,
}

impl SymbolMapping {
    /// Translate an id assigned by the merged-in table.
    ///
    /// Reserved identifiers pass through unchanged. An id the merged-in
    /// table never assigned is an incompatibility: the record referencing
    /// it was not encoded under that table.
    pub fn translate(&self, sym: SymbolId) -> Result<SymbolId, SymtabError> {
        if sym.get() < FIRST_USER_SYMBOL {
            return Ok(sym);
        }
        self.map
            .get((sym.get() - FIRST_USER_SYMBOL) as usize)
            .copied()
            .ok_or(SymtabError::Incompatible)
    }

    /// `true` when every id maps to itself.
    pub fn is_identity(&self) -> bool {
        self.map
            .iter()
            .enumerate()
            .all(|(i, s)| s.get() == FIRST_USER_SYMBOL + i as u32)
    }
}

/// Ordered string-to-identifier mapping for one record stream.
///
/// The first interned name receives [`FIRST_USER_SYMBOL`]; identifiers are
/// dense from there. Interning is append-only, so a table extended by new
/// chunks never invalidates ids handed out earlier.
#[derive(Debug, Default, Clone)]
pub struct Symtab {
    names: Vec<String>,
    by_name: HashMap<String, SymbolId>,
}

impl Symtab {
    /// New empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of user symbols interned.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// `true` when no user symbol has been interned.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Intern `name`, appending it if new.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&sym) = self.by_name.get(name) {
            return sym;
        }
        let raw = FIRST_USER_SYMBOL + self.names.len() as u32;
        assert!(raw <= MAX_SYMBOL_ID, "symbol identifier space exhausted");
        let sym = SymbolId::new(raw).expect("checked against MAX_SYMBOL_ID");
        self.names.push(name.to_owned());
        self.by_name.insert(name.to_owned(), sym);
        sym
    }

    /// Look up an already-interned name.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    /// The name behind an identifier, if assigned.
    pub fn symbol(&self, sym: SymbolId) -> Option<&str> {
        let idx = sym.get().checked_sub(FIRST_USER_SYMBOL)? as usize;
        self.names.get(idx).map(String::as_str)
    }

    /// Iterate `(id, name)` pairs in interning order.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &str)> {
        self.names.iter().enumerate().map(|(i, name)| {
            let sym = SymbolId::new(FIRST_USER_SYMBOL + i as u32).expect("dense id in range");
            (sym, name.as_str())
        })
    }

    /// Extend this table with `other`'s names, returning a remapping from
    /// `other`'s ids into the merged table.
    ///
    /// The mapping is the identity exactly when `other` is a prefix of
    /// `self` (or equal to it), which lets callers skip re-symbolizing.
    pub fn merge(&mut self, other: &Symtab) -> Result<SymbolMapping, SymtabError> {
        if self.names.len() + other.names.len() > (MAX_SYMBOL_ID - FIRST_USER_SYMBOL) as usize {
            return Err(SymtabError::Exhausted);
        }
        let map = other.names.iter().map(|name| self.intern(name)).collect();
        Ok(SymbolMapping { map })
    }

    /// Order-sensitive fingerprint used for program staleness checks.
    ///
    /// Two tables with the same fingerprint assign every name the same id
    /// within this process.
    pub fn signature(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.names.len().hash(&mut h);
        for name in &self.names {
            name.hash(&mut h);
        }
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_dense_and_stable() {
        let mut st = Symtab::new();
        let a = st.intern("a");
        let b = st.intern("b");
        assert_eq!(a.get(), FIRST_USER_SYMBOL);
        assert_eq!(b.get(), FIRST_USER_SYMBOL + 1);
        assert_eq!(st.intern("a"), a);
        assert_eq!(st.lookup("b"), Some(b));
        assert_eq!(st.symbol(a), Some("a"));
        assert_eq!(st.symbol(SymbolId::new(99).unwrap()), None);
    }

    #[test]
    fn merge_of_prefix_is_identity() {
        let mut parent = Symtab::new();
        parent.intern("x");
        parent.intern("y");

        let mut child = Symtab::new();
        child.intern("x");

        let mapping = parent.merge(&child).unwrap();
        assert!(mapping.is_identity());
        assert_eq!(parent.len(), 2);
    }

    #[test]
    fn merge_remaps_conflicting_ids() {
        let mut parent = Symtab::new();
        parent.intern("x");
        parent.intern("y");

        let mut child = Symtab::new();
        let cz = child.intern("z");
        let cx = child.intern("x");

        let mapping = parent.merge(&child).unwrap();
        assert!(!mapping.is_identity());
        assert_eq!(mapping.translate(cx).unwrap(), parent.lookup("x").unwrap());
        assert_eq!(mapping.translate(cz).unwrap(), parent.lookup("z").unwrap());
        assert_eq!(parent.len(), 3);
    }

    #[test]
    fn translate_rejects_unassigned_ids() {
        let mut parent = Symtab::new();
        let mut child = Symtab::new();
        child.intern("only");
        let mapping = parent.merge(&child).unwrap();

        // Reserved ids pass through; the child's one assignment maps; an id
        // the child never handed out is incompatible.
        let reserved = SymbolId::new(3).unwrap();
        assert_eq!(mapping.translate(reserved), Ok(reserved));
        assert!(mapping.translate(SymbolId::new(FIRST_USER_SYMBOL).unwrap()).is_ok());
        assert_eq!(
            mapping.translate(SymbolId::new(FIRST_USER_SYMBOL + 1).unwrap()),
            Err(SymtabError::Incompatible)
        );
    }

    #[test]
    fn signature_tracks_assignments() {
        let mut a = Symtab::new();
        a.intern("m");
        a.intern("n");

        let mut b = Symtab::new();
        b.intern("m");
        assert_ne!(a.signature(), b.signature());
        b.intern("n");
        assert_eq!(a.signature(), b.signature());

        // Same names, different order: different assignments.
        let mut c = Symtab::new();
        c.intern("n");
        c.intern("m");
        assert_ne!(a.signature(), c.signature());
    }
}
