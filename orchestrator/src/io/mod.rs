//! I/O adapters for the orchestration engine.

pub mod checkpoint;
pub mod config;
pub mod in_flight;
pub mod lanes;
pub mod paths;
pub mod planner;
pub mod process;
pub mod prompt;
pub mod tools;
pub mod world_store;
