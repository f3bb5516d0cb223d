//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod compiler;
pub mod decision;
pub mod gate;
pub mod lanes;
pub mod machine;
pub mod payload;
pub mod types;
pub mod world;
