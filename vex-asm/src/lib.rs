//! Bytecode instruction set and opcode metadata for the vex query engine.
//!
//! The [`Op`] enum, its operand classes and its scratch reservations are all
//! generated from one declarative table, so the compiler's emission and the
//! interpreter's operand decoding can never disagree.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

#[macro_use]
mod macros;

mod args;
mod fault;
mod opcode;
pub mod pack;
pub mod unpack;


pub use args::{ArgClass, OutKind, RegClass};
pub use fault::Fault;
pub use opcode::{InvalidOpcode, Op};
pub use pack::Assembler;
