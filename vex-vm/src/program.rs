//! Executable bytecode programs.

use std::sync::Arc;

use vex_asm::unpack;
use vex_types::lane_round_up;

use crate::error::{VmError, VmResult};

bitflags::bitflags! {
    /// Static properties of a program the runtime needs at entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProgFlags: u8 {
        /// The program reads the row-base register.
        const USES_BASE = 1;
        /// The program writes aggregation slots.
        const USES_AGG = 1 << 1;
        /// The program resolves group slots through a bound group table.
        const USES_GROUPS = 1 << 2;
        /// The program writes auxiliary outputs.
        const USES_AUX = 1 << 3;
    }
}

/// What the program hands back through its `ret` epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputContract {
    /// Pure sink (aggregates): no outputs.
    Sink,
    /// A lane mask (filters).
    Mask,
    /// A value register and its mask (projections, key extraction).
    Value,
}

/// Wildcard token of a compiled `LIKE` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LikeTok {
    /// `%`: any run of bytes, including empty.
    Any,
    /// `_`: exactly one byte.
    One,
    /// A literal byte run.
    Lit(Vec<u8>),
}

/// A `LIKE` pattern compiled to a token list at program build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikePattern {
    toks: Vec<LikeTok>,
    ci: bool,
}

impl LikePattern {
    /// Compile a pattern with `%` and `_` wildcards.
    pub fn compile(pattern: &str, ci: bool) -> Self {
        let mut toks = Vec::new();
        let mut lit = Vec::new();
        for &b in pattern.as_bytes() {
            match b {
                b'%' | b'_' => {
                    if !lit.is_empty() {
                        toks.push(LikeTok::Lit(std::mem::take(&mut lit)));
                    }
                    if b == b'%' {
                        // Collapse runs of `%`.
                        if !matches!(toks.last(), Some(LikeTok::Any)) {
                            toks.push(LikeTok::Any);
                        }
                    } else {
                        toks.push(LikeTok::One);
                    }
                }
                _ => lit.push(if ci { b.to_ascii_lowercase() } else { b }),
            }
        }
        if !lit.is_empty() {
            toks.push(LikeTok::Lit(lit));
        }
        Self { toks, ci }
    }

    /// Match the pattern against a byte string.
    pub fn matches(&self, s: &[u8]) -> bool {
        let folded;
        let s = if self.ci {
            folded = s.to_ascii_lowercase();
            &folded[..]
        } else {
            s
        };
        Self::match_at(&self.toks, s)
    }

    fn match_at(toks: &[LikeTok], s: &[u8]) -> bool {
        match toks.split_first() {
            None => s.is_empty(),
            Some((LikeTok::One, rest)) => !s.is_empty() && Self::match_at(rest, &s[1..]),
            Some((LikeTok::Lit(lit), rest)) => {
                s.starts_with(lit) && Self::match_at(rest, &s[lit.len()..])
            }
            Some((LikeTok::Any, rest)) => {
                if rest.is_empty() {
                    return true;
                }
                (0..=s.len()).any(|skip| Self::match_at(rest, &s[skip..]))
            }
        }
    }
}

/// Read-only payloads an instruction can reference by dictionary index.
#[derive(Debug, Clone)]
pub enum DictPayload {
    /// A compiled wildcard pattern.
    Pattern(LikePattern),
    /// A case-folded needle for unicode case-insensitive equality.
    Needle(String),
    /// A membership set of 128-bit value hashes.
    HashSet(hashbrown::HashSet<u128>),
    /// A hash-to-value mapping; values are literal references
    /// (window offset, length) into the program's literal arena.
    Lookup(hashbrown::HashMap<u128, (u32, u32)>),
}

/// A compiled, symbolized bytecode program.
///
/// The immutable parts are shared; cloning a program for another worker is
/// cheap and the clones never interfere (each worker owns its own machine,
/// stack and scratch).
#[derive(Debug, Clone)]
pub struct Program {
    code: Arc<Vec<u8>>,
    dict: Arc<Vec<DictPayload>>,
    literals: Arc<Vec<u8>>,
    stack_size: usize,
    hash_size: usize,
    scratch_reserve: usize,
    scratch_demand: usize,
    aux_count: usize,
    flags: ProgFlags,
    contract: OutputContract,
}

impl Program {
    /// Assemble a program from its compiled parts, validating the bytecode.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        code: Vec<u8>,
        dict: Vec<DictPayload>,
        literals: Vec<u8>,
        stack_size: usize,
        hash_size: usize,
        scratch_reserve: usize,
        aux_count: usize,
        flags: ProgFlags,
        contract: OutputContract,
    ) -> VmResult<Self> {
        let stats = unpack::scan(&code).map_err(|_| VmError::from(vex_asm::Fault::InvalidOpcode))?;
        if !stats.terminated {
            return Err(vex_asm::Fault::InvalidOpcode.into());
        }
        let scratch_demand = scratch_reserve + lane_round_up(stats.scratch);
        Ok(Self {
            code: Arc::new(code),
            dict: Arc::new(dict),
            literals: Arc::new(literals),
            stack_size,
            hash_size,
            scratch_reserve,
            scratch_demand,
            aux_count,
            flags,
            contract,
        })
    }

    /// Raw bytecode.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Shared handle to the bytecode, for the dispatch loop.
    pub(crate) fn code_arc(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.code)
    }

    /// Shared handle to the dictionary payloads.
    pub(crate) fn dict_arc(&self) -> Arc<Vec<DictPayload>> {
        Arc::clone(&self.dict)
    }

    /// Shared handle to the literal bytes.
    pub(crate) fn literals_arc(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.literals)
    }

    /// Dictionary payloads.
    pub fn dict(&self) -> &[DictPayload] {
        &self.dict
    }

    /// The literal segment's backing bytes.
    pub fn literals(&self) -> &[u8] {
        &self.literals
    }

    /// Bytes of general value stack an execution needs.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Bytes of hash stack an execution needs.
    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    /// Inviolate scratch prefix, preserved across entries.
    pub fn scratch_reserve(&self) -> usize {
        self.scratch_reserve
    }

    /// Scratch bytes one 16-lane entry may consume, reserve included.
    ///
    /// Variable-length producers check remaining capacity themselves, so
    /// this is a floor, not a ceiling.
    pub fn scratch_demand(&self) -> usize {
        self.scratch_demand
    }

    /// Number of auxiliary output bindings.
    pub fn aux_count(&self) -> usize {
        self.aux_count
    }

    /// Static entry properties.
    pub fn flags(&self) -> ProgFlags {
        self.flags
    }

    /// The program's output contract.
    pub fn contract(&self) -> OutputContract {
        self.contract
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("%NO%", false, b"NO PARKING", true; "contains")]
    #[test_case("%NO%", false, b"PARKING", false; "absent")]
    #[test_case("_O%", false, b"NO PARKING", true; "one then any")]
    #[test_case("_O%", false, b"N PARKING", false; "second byte mismatch")]
    #[test_case("", false, b"", true; "empty pattern empty input")]
    #[test_case("%", false, b"", true; "any matches empty")]
    #[test_case("a_c", false, b"abc", true; "single wildcard")]
    #[test_case("a_c", false, b"ac", false; "one requires a byte")]
    #[test_case("AbC", true, b"aBc", true; "case folded")]
    #[test_case("AbC", false, b"aBc", false; "case sensitive")]
    #[test_case("%a%b%", false, b"xxaxxbxx", true; "interleaved")]
    #[test_case("_O%_DENCE%R_G", false, b"NO EVIDENCE OF REG", true; "spec shaped")]
    fn like_patterns(pattern: &str, ci: bool, input: &[u8], want: bool) {
        assert_eq!(LikePattern::compile(pattern, ci).matches(input), want);
    }

    #[test]
    fn percent_runs_collapse() {
        let p = LikePattern::compile("%%%a%%", false);
        assert_eq!(
            p.toks,
            vec![LikeTok::Any, LikeTok::Lit(b"a".to_vec()), LikeTok::Any]
        );
    }
}
