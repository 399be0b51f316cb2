//! memreach — attach to a running process, enumerate its mapped pages,
//! scan them for byte patterns, and read or write its memory.
//!
//! This crate is the engine behind the `memreach` cdylib; everything here
//! is also callable directly from Rust.

pub mod memory;
pub mod process;
