//! # The `impl_opcodes!` macro
//!
//! The opcode table is generated from a single declarative invocation so the
//! enum, the operand metadata, the scratch reservations and the `u16`
//! conversions can never drift apart.
//!
//! Each row holds:
//!
//! - a short docstring,
//! - the opcode's `u16` value,
//! - an uppercase identifier (the enum variant),
//! - a lowercase mnemonic (for diagnostics and listings),
//! - the operand classes in encoding order,
//! - the output shape (destination slots emitted before the operands),
//! - the scratch-arena reservation in bytes per 16-lane group.

macro_rules! impl_opcodes {
    (
        $(
            $doc:literal
            $code:literal $Op:ident $mn:ident [$($arg:ident)*] $out:ident $scratch:literal
        )*
    ) => {
        /// Opcode identifiers for the bytecode virtual machine.
        ///
        /// Operand layout and scratch usage are table lookups on this type;
        /// see [`Op::args`], [`Op::out`] and [`Op::scratch`].
        #[allow(non_camel_case_types)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[repr(u16)]
        pub enum Op {
            $(
                #[doc = $doc]
                $Op = $code,
            )*
        }

        impl Op {
            /// Lowercase mnemonic for diagnostics.
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$Op => stringify!($mn),)*
                }
            }

            /// Operand classes in encoding order (destinations excluded).
            pub const fn args(self) -> &'static [ArgClass] {
                match self {
                    $(Self::$Op => &[$(ArgClass::$arg),*],)*
                }
            }

            /// Output shape; destination slots precede the operands.
            pub const fn out(self) -> OutKind {
                match self {
                    $(Self::$Op => OutKind::$out,)*
                }
            }

            /// Scratch-arena bytes the op may write per 16-lane group.
            ///
            /// Zero either means no scratch use or that the handler checks
            /// remaining capacity itself (variable-length producers).
            pub const fn scratch(self) -> usize {
                match self {
                    $(Self::$Op => $scratch,)*
                }
            }
        }

        impl From<Op> for u16 {
            fn from(op: Op) -> u16 {
                op as u16
            }
        }

        impl core::convert::TryFrom<u16> for Op {
            type Error = InvalidOpcode;

            fn try_from(value: u16) -> Result<Self, Self::Error> {
                match value {
                    $($code => Ok(Self::$Op),)*
                    _ => Err(InvalidOpcode),
                }
            }
        }
    };
}
