//! Test doubles and fixtures shared by the capsule crates.

pub mod fixtures;
pub mod tools;

pub use fixtures::*;
pub use tools::{ProbeTool, ScriptedTool};
