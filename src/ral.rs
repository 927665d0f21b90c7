//! Register access macros
//!
//! Transfer descriptors are described like peripheral register blocks:
//! a struct of volatile words, plus a module per word that lists each
//! field's `offset` and `mask`. The `ral-registers` macros then work on
//! descriptors the same way they work on memory-mapped registers.

pub use ral_registers::{read_reg, write_reg};
