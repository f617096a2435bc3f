#![allow(clippy::upper_case_acronyms)]

extern crate log;

pub mod analysis;
pub mod arch;
pub mod insn;
pub mod module;
pub mod register;
pub mod util;

// helpers that are useful during tests.
#[cfg(any(test, feature = "test"))]
pub mod test;

pub type VA = u64;
